// Cleaner (spec §4.5, component C5): periodic sweep that picks the
// pair with the highest `cache_pressure_size` among a small window and
// invokes its cleaner callback.

use crate::checkpoint::Checkpointer;
use crate::config::CacheTableConfig;
use crate::pair::Pair;
use crate::pair_list::PairList;
use crate::status::{Counter, StatusSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use parking_lot::Mutex;
use tracing::debug;

pub struct Cleaner {
    pair_list: Arc<PairList>,
    checkpointer: Arc<Checkpointer>,
    config: CacheTableConfig,
    status: Arc<dyn StatusSink>,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Cleaner {
    pub fn new(
        pair_list: Arc<PairList>,
        checkpointer: Arc<Checkpointer>,
        config: CacheTableConfig,
        status: Arc<dyn StatusSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pair_list,
            checkpointer,
            config,
            status,
            running: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        if self.config.cleaner_iterations == 0 {
            // Spec §8 boundary: `cleaner_iterations = 0` disables the
            // cleaner outright but the cache remains correct.
            return;
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let me = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("cachetable-cleaner".into())
            .spawn(move || {
                while me.running.load(Ordering::Acquire) {
                    me.run_once();
                    std::thread::sleep(me.config.cleaner_period);
                }
            })
            .expect("failed to spawn cleaner thread");
        *self.thread.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// One run: up to `cleaner_iterations` picks (spec §4.5).
    pub fn run_once(&self) {
        for _ in 0..self.config.cleaner_iterations {
            if !self.pick_and_clean() {
                break;
            }
        }
    }

    /// Returns `true` if a pair was picked this iteration (whether or
    /// not the cleaner callback ultimately ran).
    fn pick_and_clean(&self) -> bool {
        let window = self.pair_list.cleaner_window();
        if window.is_empty() {
            return false;
        }
        self.pair_list.advance_cleaner(window.len());

        let winner = window
            .iter()
            .filter(|p| p.value().users() == 0)
            .max_by_key(|p| p.attr().cache_pressure_size)
            .filter(|p| p.attr().cache_pressure_size > 0)
            .cloned();

        let Some(pair) = winner else {
            return false;
        };

        self.clean_one(&pair);
        self.status.incr(Counter::CleanerIterationsTotal);
        true
    }

    fn clean_one(&self, pair: &Arc<Pair>) {
        let cachefile = pair.cachefile();
        if cachefile.bjm.add_background_job().is_err() {
            debug!(filenum = cachefile.filenum, "cleaner skipping, cachefile closing");
            return;
        }

        {
            let write_guard = pair.value().write_lock(true);
            self.checkpointer.resolve_pending(pair, &**write_guard);

            if pair.attr().cache_pressure_size > 0 {
                if let Err(err) = write_guard.cleaner() {
                    debug!(error = %err, key = pair.key, "cleaner callback failed");
                }
            }
            // `write_guard` drops here; the callback contract ("must
            // release the value lock before returning") is enforced by
            // RAII rather than by the callback itself.
        }

        cachefile.bjm.remove_background_job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cachefile::{Cachefile, CachefileCallbacks, CachefileList};
    use crate::evictor::Evictor;
    use crate::pair::attr::PairAttr;
    use crate::pair::callbacks::{FlushContext, PairValue};
    use crate::status::AtomicStatusSink;
    use crate::worker_pool::WorkerPool;
    use crate::Result;
    use std::sync::atomic::AtomicUsize;

    struct NoopCallbacks;
    impl CachefileCallbacks for NoopCallbacks {}

    fn make_checkpointer(pair_list: Arc<PairList>, config: &CacheTableConfig) -> Arc<Checkpointer> {
        let cf_list = Arc::new(CachefileList::new());
        let pool = Arc::new(WorkerPool::new("test-cleaner-ckpt-pool", 1));
        let evictor = Evictor::new(
            pair_list.clone(),
            cf_list.clone(),
            config.clone(),
            AtomicStatusSink::new(),
            pool.clone(),
        );
        Checkpointer::new(pair_list, cf_list, evictor, pool, AtomicStatusSink::new())
    }

    struct CountingValue {
        cleaned: Arc<AtomicUsize>,
    }
    impl PairValue for CountingValue {
        fn flush(&self, _ctx: &FlushContext) -> Result<PairAttr> {
            Ok(PairAttr::default())
        }
        fn cleaner(&self) -> Result<()> {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn picks_highest_pressure_pair_with_no_users() {
        let pair_list = Arc::new(PairList::new(16, 16));
        let cf = Cachefile::new(1, 1, "t.db".into(), 1, Box::new(NoopCallbacks));
        let cleaned = Arc::new(AtomicUsize::new(0));

        let mut attr_low = PairAttr::new(5);
        attr_low.cache_pressure_size = 5;
        let mut attr_high = PairAttr::new(5);
        attr_high.cache_pressure_size = 50;

        let low = Arc::new(Pair::new(
            &cf,
            1,
            crate::cachefile::fullhash_of(cf.hash_id(), 1),
            Box::new(CountingValue { cleaned: cleaned.clone() }),
            attr_low,
            false,
        ));
        let high = Arc::new(Pair::new(
            &cf,
            2,
            crate::cachefile::fullhash_of(cf.hash_id(), 2),
            Box::new(CountingValue { cleaned: cleaned.clone() }),
            attr_high,
            false,
        ));
        {
            let mut guard = pair_list.list_write();
            pair_list.put(&mut guard, low);
            pair_list.put(&mut guard, high);
        }

        let config = CacheTableConfig::new(1_000_000);
        let checkpointer = make_checkpointer(pair_list.clone(), &config);
        let cleaner = Cleaner::new(pair_list, checkpointer, config, AtomicStatusSink::new());
        assert!(cleaner.pick_and_clean());
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_pressure_pairs_are_never_picked() {
        let pair_list = Arc::new(PairList::new(16, 16));
        let cf = Cachefile::new(1, 1, "t.db".into(), 1, Box::new(NoopCallbacks));
        let cleaned = Arc::new(AtomicUsize::new(0));
        let pair = Arc::new(Pair::new(
            &cf,
            1,
            crate::cachefile::fullhash_of(cf.hash_id(), 1),
            Box::new(CountingValue { cleaned: cleaned.clone() }),
            PairAttr::default(),
            false,
        ));
        {
            let mut guard = pair_list.list_write();
            pair_list.put(&mut guard, pair);
        }

        let config = CacheTableConfig::new(1_000_000);
        let checkpointer = make_checkpointer(pair_list.clone(), &config);
        let cleaner = Cleaner::new(pair_list, checkpointer, config, AtomicStatusSink::new());
        assert!(!cleaner.pick_and_clean());
        assert_eq!(cleaned.load(Ordering::SeqCst), 0);
    }
}
