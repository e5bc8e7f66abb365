// Checkpoint (spec §4.6, component C6): the pending-bit handshake
// between client threads and the checkpointer.
//
// `begin_checkpoint`/`end_checkpoint` are externally serialized (at most
// one active, spec §4.6) -- enforced here by `active` holding the
// in-progress checkpoint's cachefile set, `None` when idle.

use crate::cachefile::{BackgroundJobManager, Cachefile, CachefileList};
use crate::error::{fatal_invariant, CacheError, Result};
use crate::evictor::Evictor;
use crate::pair::callbacks::{FlushContext, PairValue};
use crate::pair::Pair;
use crate::pair_list::PairList;
use crate::status::{Counter, StatusSink};
use crate::worker_pool::WorkerPool;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

pub struct Checkpointer {
    pair_list: Arc<PairList>,
    cachefile_list: Arc<CachefileList>,
    evictor: Arc<Evictor>,
    pool: Arc<WorkerPool>,
    status: Arc<dyn StatusSink>,
    active: Mutex<Option<Vec<Arc<Cachefile>>>>,
    clone_jobs: Mutex<Arc<BackgroundJobManager>>,
}

impl Checkpointer {
    pub fn new(
        pair_list: Arc<PairList>,
        cachefile_list: Arc<CachefileList>,
        evictor: Arc<Evictor>,
        pool: Arc<WorkerPool>,
        status: Arc<dyn StatusSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pair_list,
            cachefile_list,
            evictor,
            pool,
            status,
            active: Mutex::new(None),
            clone_jobs: Mutex::new(Arc::new(BackgroundJobManager::new())),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Spec §4.6 `begin_checkpoint`.
    pub fn begin_checkpoint(&self) -> Result<()> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(CacheError::InvalidArgument(
                "a checkpoint is already in progress".into(),
            ));
        }

        let cachefiles = self.cachefile_list.active_snapshot();
        for cf in &cachefiles {
            cf.for_checkpoint.store(true, std::sync::atomic::Ordering::Release);
            cf.callbacks.note_pin_by_checkpoint();
        }

        // Step 2 (logger record fixing the checkpoint LSN) is out of
        // scope -- the logger is an external collaborator (spec §1) --
        // so a synthetic LSN of 0 stands in wherever one is threaded
        // through below.
        let lsn_of_checkpoint_in_progress = 0u64;

        // Lock order per spec §5: pending-expensive write, list read,
        // cachefile-list read, pending-cheap write. The cachefile-list
        // read is folded into the `active_snapshot()` call above rather
        // than held for the duration -- see DESIGN.md.
        {
            let _pending_expensive = self.pair_list.pending_expensive_write();
            let _list_read = self.pair_list.list_read();
            let _pending_cheap = self.pair_list.pending_cheap_write();

            for pair in self.pair_list.checkpoint_sweep() {
                if !pair.cachefile().for_checkpoint.load(std::sync::atomic::Ordering::Acquire) {
                    continue;
                }
                if pair.checkpoint_pending() {
                    fatal_invariant("pair already checkpoint_pending at begin_checkpoint");
                }
                pair.set_checkpoint_pending(true);
                self.pair_list.add_pending(pair.clone());
            }

            for cf in &cachefiles {
                if cf.for_checkpoint.load(std::sync::atomic::Ordering::Acquire) {
                    cf.callbacks.log_fassociate_during_checkpoint();
                    cf.callbacks.begin_checkpoint_userdata(lsn_of_checkpoint_in_progress);
                }
            }
        }

        self.status.incr(Counter::ChecksBegunTotal);
        info!(num_files = cachefiles.len(), "begin_checkpoint");
        *self.clone_jobs.lock() = Arc::new(BackgroundJobManager::new());
        *active = Some(cachefiles);
        Ok(())
    }

    /// Spec §4.6 `end_checkpoint`.
    pub fn end_checkpoint(&self) -> Result<()> {
        let cachefiles = self
            .active
            .lock()
            .take()
            .ok_or_else(|| CacheError::InvalidArgument("no checkpoint in progress".into()))?;

        // Drain the pending list (spec step 2).
        while let Some(pair) = self.pair_list.pop_pending() {
            // Writing out a checkpoint-pending pair may clone or flush,
            // either of which can block on I/O, so the hold is always
            // tagged expensive (spec §4.6: "expensive only if necessary"
            // -- conservatively, that's every pair reaching this drain).
            let write_guard = pair.value().write_lock(true);
            self.resolve_pending(&pair, &**write_guard);
        }

        let clone_jobs = self.clone_jobs.lock().clone();
        clone_jobs.begin_closing_and_wait_for_drain();

        for cf in &cachefiles {
            if let Err(err) = cf.callbacks.checkpoint_userdata() {
                cf.set_error(err.to_string());
            }
        }

        // Step 4 (logger end-checkpoint record + fsync) is out of scope.

        for cf in &cachefiles {
            if let Err(err) = cf.callbacks.end_checkpoint_userdata() {
                cf.set_error(err.to_string());
            }
        }

        for cf in &cachefiles {
            cf.callbacks.note_unpin_by_checkpoint();
            cf.for_checkpoint.store(false, std::sync::atomic::Ordering::Release);
        }

        self.status.incr(Counter::ChecksEndedTotal);
        info!(num_files = cachefiles.len(), "end_checkpoint");
        Ok(())
    }

    /// Client-side pending resolution (spec §4.6 "Client-side pending
    /// resolution"), shared by `get_and_pin`/`put`/`unpin_and_remove`
    /// (cachetable.rs), the cleaner (cleaner.rs), and `end_checkpoint`'s
    /// drain above. `value` must come from a pair whose value lock the
    /// caller already holds write-locked (a live `PairWriteGuard`'s
    /// deref, or the value behind a lock a caller-supplied dependent
    /// pair already holds).
    pub fn resolve_pending(&self, pair: &Arc<Pair>, value: &dyn PairValue) {
        let was_pending = {
            let _pending_cheap = self.pair_list.pending_cheap_read();
            pair.checkpoint_pending()
        };
        if !was_pending {
            return;
        }
        // Clearing requires the value lock (held via `write_guard`) or
        // the pending-cheap write lock (spec §4.6 pending-bit rule).
        pair.set_checkpoint_pending(false);

        if !pair.is_dirty() {
            return;
        }

        value.checkpoint_complete();

        if let Some((clone_value, clone_size)) = value.clone_for_checkpoint() {
            let _disk = pair.disk_lock.write();
            pair.stash_clone(clone_value, clone_size);
            pair.set_dirty(false);
            self.evictor.apply_cloned_size_delta(clone_size);
            self.status.incr(Counter::ClonesTotal);
            self.dispatch_clone_flush(Arc::clone(pair));
        } else {
            let ctx = FlushContext {
                filenum: pair.filenum(),
                key: pair.key,
                old_attr: pair.attr(),
                do_write: true,
                keep: true,
                for_checkpoint: true,
                is_clone: false,
            };
            match value.flush(&ctx) {
                Ok(new_attr) => {
                    if new_attr.is_valid {
                        pair.set_attr(new_attr);
                    }
                    pair.set_dirty(false);
                }
                Err(err) => {
                    pair.cachefile().set_error(err.to_string());
                    debug!(error = %err, key = pair.key, "inline checkpoint flush failed");
                }
            }
        }
    }

    fn dispatch_clone_flush(&self, pair: Arc<Pair>) {
        let clone_jobs = self.clone_jobs.lock().clone();
        if clone_jobs.add_background_job().is_err() {
            return;
        }
        self.pool.submit(move || {
            if let Some((value, size)) = pair.take_clone() {
                let ctx = FlushContext {
                    filenum: pair.filenum(),
                    key: pair.key,
                    old_attr: pair.attr(),
                    do_write: true,
                    keep: false,
                    for_checkpoint: true,
                    is_clone: true,
                };
                if let Err(err) = value.flush(&ctx) {
                    pair.cachefile().set_error(err.to_string());
                }
                let _ = size;
            }
            clone_jobs.remove_background_job();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cachefile::{fullhash_of, CachefileCallbacks};
    use crate::config::CacheTableConfig;
    use crate::pair::attr::PairAttr;
    use crate::status::AtomicStatusSink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NoopCallbacks;
    impl CachefileCallbacks for NoopCallbacks {}

    struct CloneableValue {
        inline_flushes: Arc<AtomicUsize>,
        clone_flushes: Arc<AtomicUsize>,
    }
    impl PairValue for CloneableValue {
        fn flush(&self, ctx: &FlushContext) -> Result<PairAttr> {
            if ctx.is_clone {
                self.clone_flushes.fetch_add(1, Ordering::SeqCst);
            } else {
                self.inline_flushes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(PairAttr::new(10))
        }
        fn clone_for_checkpoint(&self) -> Option<(Box<dyn PairValue>, i64)> {
            Some((
                Box::new(CloneableValue {
                    inline_flushes: self.inline_flushes.clone(),
                    clone_flushes: self.clone_flushes.clone(),
                }),
                10,
            ))
        }
    }

    fn setup() -> (Arc<Checkpointer>, Arc<PairList>, Arc<Cachefile>) {
        let pair_list = Arc::new(PairList::new(16, 16));
        let cf_list = Arc::new(CachefileList::new());
        let cf = Cachefile::new(1, 1, "t.db".into(), 1, Box::new(NoopCallbacks));
        cf_list.insert_active(cf.clone());
        let config = CacheTableConfig::new(1_000_000);
        let pool = Arc::new(WorkerPool::new("test-checkpoint-pool", 2));
        let evictor = Evictor::new(pair_list.clone(), cf_list.clone(), config, AtomicStatusSink::new(), pool.clone());
        let checkpointer = Checkpointer::new(pair_list.clone(), cf_list, evictor, pool, AtomicStatusSink::new());
        (checkpointer, pair_list, cf)
    }

    #[test]
    fn begin_checkpoint_marks_pending_on_dirty_pairs() {
        let (checkpointer, pair_list, cf) = setup();
        let inline = Arc::new(AtomicUsize::new(0));
        let cloned = Arc::new(AtomicUsize::new(0));
        let pair = Arc::new(Pair::new(
            &cf,
            1,
            fullhash_of(cf.hash_id(), 1),
            Box::new(CloneableValue {
                inline_flushes: inline.clone(),
                clone_flushes: cloned.clone(),
            }),
            PairAttr::new(10),
            true,
        ));
        {
            let mut guard = pair_list.list_write();
            pair_list.put(&mut guard, pair.clone());
        }

        checkpointer.begin_checkpoint().unwrap();
        assert!(pair.checkpoint_pending());
        assert!(!pair_list.pending_is_empty());
    }

    #[test]
    fn end_checkpoint_clones_dirty_pairs_exactly_once() {
        let (checkpointer, pair_list, cf) = setup();
        let inline = Arc::new(AtomicUsize::new(0));
        let cloned = Arc::new(AtomicUsize::new(0));
        let pair = Arc::new(Pair::new(
            &cf,
            1,
            fullhash_of(cf.hash_id(), 1),
            Box::new(CloneableValue {
                inline_flushes: inline.clone(),
                clone_flushes: cloned.clone(),
            }),
            PairAttr::new(10),
            true,
        ));
        {
            let mut guard = pair_list.list_write();
            pair_list.put(&mut guard, pair.clone());
        }

        checkpointer.begin_checkpoint().unwrap();
        checkpointer.end_checkpoint().unwrap();

        assert_eq!(cloned.load(Ordering::SeqCst), 1);
        assert_eq!(inline.load(Ordering::SeqCst), 0);
        assert!(!pair.checkpoint_pending());
    }

    #[test]
    fn second_concurrent_begin_is_rejected() {
        let (checkpointer, _pair_list, _cf) = setup();
        checkpointer.begin_checkpoint().unwrap();
        assert!(checkpointer.begin_checkpoint().is_err());
        checkpointer.end_checkpoint().unwrap();
    }

    #[test]
    fn quiescent_checkpoint_flushes_nothing() {
        let (checkpointer, pair_list, cf) = setup();
        let inline = Arc::new(AtomicUsize::new(0));
        let cloned = Arc::new(AtomicUsize::new(0));
        let pair = Arc::new(Pair::new(
            &cf,
            1,
            fullhash_of(cf.hash_id(), 1),
            Box::new(CloneableValue {
                inline_flushes: inline.clone(),
                clone_flushes: cloned.clone(),
            }),
            PairAttr::new(10),
            false,
        ));
        {
            let mut guard = pair_list.list_write();
            pair_list.put(&mut guard, pair);
        }

        checkpointer.begin_checkpoint().unwrap();
        checkpointer.end_checkpoint().unwrap();
        assert_eq!(inline.load(Ordering::SeqCst) + cloned.load(Ordering::SeqCst), 0);
        let _ = Duration::ZERO;
    }
}
