// Public API surface (spec §4.3, component C7): `get_and_pin` in its
// blocking/non-blocking/"maybe" variants, `put_with_dep_pairs`, `unpin`,
// `unpin_and_remove`, `prefetch`, the checkpoint boundary, and
// `openfd`/`openfd_with_filenum`/`close` (spec supplement).
//
// Pinning and unpinning are two separate calls rather than one RAII
// scope (spec §4.3's contract hands the caller a bare `Arc<Pair>`, not a
// guard). `get_and_pin` therefore takes the typed lock guard just long
// enough to resolve checkpoint-pending status and run any partial fetch,
// then `mem::forget`s it; `unpin`/`unpin_and_remove` release the hold
// later via `PairLock::release_held`, which reads the lock's own state
// rather than needing the original guard back. See `sync.rs`.

use crate::cachefile::{
    fresh_hash_id, fullhash_of, Cachefile, CachefileCallbacks, CachefileList,
};
use crate::checkpoint::Checkpointer;
use crate::cleaner::Cleaner;
use crate::config::CacheTableConfig;
use crate::error::{CacheError, Result};
use crate::evictor::Evictor;
use crate::pair::attr::PairAttr;
use crate::pair::callbacks::{FetchCallback, FlushContext, PairValue};
use crate::pair::Pair;
use crate::pair_list::PairList;
use crate::status::{AtomicStatusSink, Counter, StatusSink};
use crate::sync::PairWriteGuard;
use crate::worker_pool::{cachetable_pool_size, checkpoint_pool_size, WorkerPool};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

/// The three modes a pin can request (spec §4.1/§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Read,
    WriteCheap,
    WriteExpensive,
}

impl LockType {
    fn is_write(self) -> bool {
        !matches!(self, LockType::Read)
    }

    fn is_expensive(self) -> bool {
        matches!(self, LockType::WriteExpensive)
    }
}

/// The result of a non-blocking pin attempt (spec §7: "`TRY_AGAIN` ... is
/// not an error", hence a distinct outcome type rather than a
/// `CacheError` variant).
pub enum PinOutcome {
    Pinned(Arc<Pair>),
    TryAgain,
}

/// One of the caller's already-held locks to drop before the cache does
/// its slow work (spec §4.3 "unlocker pattern").
pub type Unlocker = Box<dyn FnOnce() + Send>;

/// The cachetable core: pair storage, cachefile bookkeeping, and the
/// three background subsystems (evictor, cleaner, checkpointer), wired
/// together behind the public operations client threads call.
pub struct CacheTable {
    pair_list: Arc<PairList>,
    cachefile_list: Arc<CachefileList>,
    evictor: Arc<Evictor>,
    cleaner: Arc<Cleaner>,
    checkpointer: Arc<Checkpointer>,
    pool: Arc<WorkerPool>,
    config: CacheTableConfig,
    status: Arc<dyn StatusSink>,
}

impl CacheTable {
    pub fn new(config: CacheTableConfig) -> Arc<Self> {
        Self::with_status_sink(config, AtomicStatusSink::new())
    }

    /// Install a caller-supplied status sink instead of the default
    /// atomics-only one (spec §9 "Global mutable state" -- "allow a test
    /// configuration that installs a stub sink for determinism").
    pub fn with_status_sink(config: CacheTableConfig, status: Arc<dyn StatusSink>) -> Arc<Self> {
        let pair_list = Arc::new(PairList::new(config.n_buckets, config.n_mutexes));
        let cachefile_list = Arc::new(CachefileList::new());
        let pool = Arc::new(WorkerPool::new("cachetable-pool", cachetable_pool_size()));
        let checkpoint_pool = Arc::new(WorkerPool::new("checkpoint-pool", checkpoint_pool_size()));

        let evictor = Evictor::new(
            pair_list.clone(),
            cachefile_list.clone(),
            config.clone(),
            status.clone(),
            pool.clone(),
        );
        let checkpointer = Checkpointer::new(
            pair_list.clone(),
            cachefile_list.clone(),
            evictor.clone(),
            checkpoint_pool,
            status.clone(),
        );
        let cleaner = Cleaner::new(pair_list.clone(), checkpointer.clone(), config.clone(), status.clone());

        Arc::new(Self {
            pair_list,
            cachefile_list,
            evictor,
            cleaner,
            checkpointer,
            pool,
            config,
            status,
        })
    }

    /// Start the evictor and cleaner timer threads. Idempotent. The
    /// checkpointer has no timer thread of its own in this crate -- it
    /// runs only when `begin_checkpoint`/`end_checkpoint` are called.
    pub fn start_background_threads(&self) {
        self.evictor.start();
        self.cleaner.start();
    }

    /// Cancellation is shutdown-only (spec §5): stop both timer threads
    /// cleanly. Callers must `close` every cachefile afterwards.
    pub fn stop_background_threads(&self) {
        self.cleaner.stop();
        self.evictor.stop();
    }

    pub fn status(&self) -> &Arc<dyn StatusSink> {
        &self.status
    }

    pub fn config(&self) -> &CacheTableConfig {
        &self.config
    }

    pub fn size_current(&self) -> i64 {
        self.evictor.size_current()
    }

    pub fn num_pairs(&self) -> usize {
        self.pair_list.num_pairs()
    }

    // ------------------------------------------------------------------
    // get_and_pin (blocking, with dependent pairs)
    // ------------------------------------------------------------------

    pub fn get_and_pin<F>(
        &self,
        cachefile: &Arc<Cachefile>,
        key: u64,
        lock_type: LockType,
        fetch: F,
        dep_pairs: &[Arc<Pair>],
    ) -> Result<Arc<Pair>>
    where
        F: FetchCallback + 'static,
    {
        let fullhash = fullhash_of(cachefile.hash_id(), key);
        let pair = self.find_or_fetch(cachefile, key, fullhash, fetch)?;
        self.pin_blocking(&pair, lock_type, dep_pairs);
        pair.touch();
        self.maybe_sleep_on_pressure();
        Ok(pair)
    }

    fn find_or_fetch<F>(
        &self,
        cachefile: &Arc<Cachefile>,
        key: u64,
        fullhash: u32,
        fetch: F,
    ) -> Result<Arc<Pair>>
    where
        F: FetchCallback + 'static,
    {
        if let Some(pair) = self.pair_list.find_pair(cachefile, key, fullhash) {
            return Ok(pair);
        }

        let (value, attr) = Box::new(fetch).fetch(cachefile.filenum, key)?;
        let pair = Arc::new(Pair::new(cachefile, key, fullhash, value, attr, false));

        let mut ring_guard = self.pair_list.list_write();
        // Re-check under the bucket mutex: another thread may have raced
        // us to the same miss. The loser's freshly-fetched value is
        // simply dropped; its caller gets the winner's pair instead.
        if let Some(existing) = self.pair_list.find_pair(cachefile, key, fullhash) {
            return Ok(existing);
        }
        self.pair_list.put(&mut ring_guard, pair.clone());
        drop(ring_guard);

        self.evictor.apply_size_delta(attr.size);
        self.status.incr(Counter::PairsTotal);
        Ok(pair)
    }

    /// Acquire the requested lock, blocking as needed, then run the
    /// write-mode-only steps (checkpoint-pending resolution, partial
    /// fetch) before forgetting the guard.
    fn pin_blocking(&self, pair: &Arc<Pair>, lock_type: LockType, dep_pairs: &[Arc<Pair>]) {
        if !lock_type.is_write() {
            let guard = pair.value().read_lock();
            std::mem::forget(guard);
            return;
        }
        let mut guard = pair.value().write_lock(lock_type.is_expensive());
        self.resolve_checkpoint_pending(pair, &guard, dep_pairs);
        self.run_partial_fetch_if_needed(pair, &mut guard, lock_type.is_expensive());
        std::mem::forget(guard);
    }

    /// Resolve checkpoint-pending status on `pair` (already write-locked
    /// via `guard`) and on every dependent pair. A dependent pair arrives
    /// already pinned via an earlier call whose guard was forgotten, so
    /// there is no live guard object for it -- only the unsafe
    /// assume-locked accessor can produce a `&dyn PairValue` for it,
    /// which is sound exactly because the caller's contract guarantees it
    /// is currently write-locked (spec §4.3 "dependent pairs").
    fn resolve_checkpoint_pending(
        &self,
        pair: &Arc<Pair>,
        guard: &PairWriteGuard<'_, Box<dyn PairValue>>,
        dep_pairs: &[Arc<Pair>],
    ) {
        self.checkpointer.resolve_pending(pair, &**guard);
        for dep in dep_pairs {
            let value = unsafe { dep.value().assume_write_locked() };
            self.checkpointer.resolve_pending(dep, &**value);
        }
    }

    /// Spec §4.3: if a partial fetch is required, upgrade to expensive,
    /// run it under the disk lock, and re-check -- the callback's
    /// earlier work may now be stale -- before downgrading back to the
    /// lock type the caller actually asked for.
    fn run_partial_fetch_if_needed(
        &self,
        pair: &Arc<Pair>,
        guard: &mut PairWriteGuard<'_, Box<dyn PairValue>>,
        wanted_expensive: bool,
    ) {
        if !guard.partial_fetch_required() {
            return;
        }
        guard.mark_expensive();
        while guard.partial_fetch_required() {
            let _disk = pair.disk_lock.write();
            let ctx = FlushContext {
                filenum: pair.filenum(),
                key: pair.key,
                old_attr: pair.attr(),
                do_write: false,
                keep: true,
                for_checkpoint: false,
                is_clone: false,
            };
            match guard.partial_fetch(&ctx) {
                Ok(new_attr) => {
                    if new_attr.is_valid {
                        let old = pair.attr();
                        self.evictor.apply_size_delta(new_attr.size - old.size);
                        pair.set_attr(new_attr);
                    }
                }
                Err(err) => {
                    pair.cachefile().set_error(err.to_string());
                    debug!(error = %err, key = pair.key, "partial fetch failed");
                    break;
                }
            }
        }
        if !wanted_expensive {
            guard.mark_cheap();
        }
    }

    fn maybe_sleep_on_pressure(&self) {
        if self.evictor.is_over_high_watermark() {
            self.evictor.wait_for_cache_pressure_to_subside();
        }
    }

    // ------------------------------------------------------------------
    // get_and_pin_nonblocking (unlocker pattern)
    // ------------------------------------------------------------------

    pub fn get_and_pin_nonblocking<F>(
        &self,
        cachefile: &Arc<Cachefile>,
        key: u64,
        lock_type: LockType,
        fetch: F,
        dep_pairs: &[Arc<Pair>],
        unlockers: Vec<Unlocker>,
    ) -> Result<PinOutcome>
    where
        F: FetchCallback + 'static,
    {
        let fullhash = fullhash_of(cachefile.hash_id(), key);

        let pair = match self.pair_list.find_pair(cachefile, key, fullhash) {
            Some(pair) => pair,
            None => {
                debug!(key, "get_and_pin_nonblocking miss, running unlockers");
                self.status.incr(Counter::NonblockingRetriesTotal);
                for unlocker in unlockers {
                    unlocker();
                }
                self.find_or_fetch(cachefile, key, fullhash, fetch)?;
                return Ok(PinOutcome::TryAgain);
            }
        };

        if self.try_pin_nonblocking(&pair, lock_type, dep_pairs) {
            pair.touch();
            return Ok(PinOutcome::Pinned(pair));
        }

        // Would block: pin by refcount so the pair survives eviction
        // while unlocked, run the caller's unlockers, do the slow work
        // without any of the caller's own locks held, then unpin and
        // signal retry (spec §4.3).
        pair.incr_refcount();
        debug!(key, "get_and_pin_nonblocking would block, running unlockers");
        self.status.incr(Counter::NonblockingRetriesTotal);
        for unlocker in unlockers {
            unlocker();
        }
        self.pin_blocking(&pair, lock_type, dep_pairs);
        self.unpin(&pair, None, None);
        pair.decr_refcount();
        Ok(PinOutcome::TryAgain)
    }

    /// Try to acquire `lock_type` without waiting. On success, runs the
    /// write-mode steps and forgets the guard exactly like the blocking
    /// path.
    fn try_pin_nonblocking(&self, pair: &Arc<Pair>, lock_type: LockType, dep_pairs: &[Arc<Pair>]) -> bool {
        if !lock_type.is_write() {
            return match pair.value().try_read_lock() {
                Some(guard) => {
                    std::mem::forget(guard);
                    true
                }
                None => false,
            };
        }
        match pair.value().try_write_lock(lock_type.is_expensive()) {
            Some(mut guard) => {
                self.resolve_checkpoint_pending(pair, &guard, dep_pairs);
                self.run_partial_fetch_if_needed(pair, &mut guard, lock_type.is_expensive());
                std::mem::forget(guard);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // put_with_dep_pairs
    // ------------------------------------------------------------------

    /// Create a new pair marked DIRTY. `get_key` is invoked under the
    /// list write lock so the caller can choose a not-in-use key (e.g.
    /// allocate a block number) as part of insertion atomicity (spec
    /// §4.3). Returns the pair write-locked (expensive), matching
    /// `get_and_pin`'s contract -- the caller must `unpin` it.
    pub fn put_with_dep_pairs<G>(
        &self,
        cachefile: &Arc<Cachefile>,
        value: Box<dyn PairValue>,
        attr: PairAttr,
        get_key: G,
        dep_pairs: &[Arc<Pair>],
    ) -> Result<Arc<Pair>>
    where
        G: FnOnce() -> u64,
    {
        let pair = {
            let mut ring_guard = self.pair_list.list_write();
            let key = get_key();
            let fullhash = fullhash_of(cachefile.hash_id(), key);
            if self.pair_list.find_pair(cachefile, key, fullhash).is_some() {
                return Err(CacheError::AlreadyExists(format!(
                    "key {key} already cached for filenum {}",
                    cachefile.filenum
                )));
            }
            let pair = Arc::new(Pair::new(cachefile, key, fullhash, value, attr, true));
            self.pair_list.put(&mut ring_guard, pair.clone());
            pair
        };

        self.evictor.apply_size_delta(attr.size);
        self.status.incr(Counter::PairsTotal);

        let guard = pair.value().write_lock(true);
        self.resolve_checkpoint_pending(&pair, &guard, dep_pairs);
        std::mem::forget(guard);
        Ok(pair)
    }

    // ------------------------------------------------------------------
    // maybe_get_and_pin / maybe_get_and_pin_clean
    // ------------------------------------------------------------------

    /// Pin only if the pair exists, is dirty, the lock is free, and (for
    /// write modes) it is not checkpoint-pending (spec §4.3).
    pub fn maybe_get_and_pin(&self, cachefile: &Arc<Cachefile>, key: u64, lock_type: LockType) -> Option<Arc<Pair>> {
        let fullhash = fullhash_of(cachefile.hash_id(), key);
        let pair = self.pair_list.find_pair(cachefile, key, fullhash)?;
        if !pair.is_dirty() {
            return None;
        }
        if lock_type.is_write() && pair.checkpoint_pending() {
            return None;
        }
        self.try_bare_nowait(&pair, lock_type)
    }

    /// Same, but succeeds on clean pairs too, and tolerates a hold that
    /// would block as long as the current holder's writes are cheap
    /// (spec §4.3: "as long as waiting is cheap").
    pub fn maybe_get_and_pin_clean(&self, cachefile: &Arc<Cachefile>, key: u64, lock_type: LockType) -> Option<Arc<Pair>> {
        let fullhash = fullhash_of(cachefile.hash_id(), key);
        let pair = self.pair_list.find_pair(cachefile, key, fullhash)?;

        if pair.value().write_lock_is_expensive() {
            return None;
        }

        match lock_type {
            LockType::Read => std::mem::forget(pair.value().read_lock()),
            LockType::WriteCheap => std::mem::forget(pair.value().write_lock(false)),
            LockType::WriteExpensive => std::mem::forget(pair.value().write_lock(true)),
        }
        pair.touch();
        Some(pair)
    }

    fn try_bare_nowait(&self, pair: &Arc<Pair>, lock_type: LockType) -> Option<Arc<Pair>> {
        let acquired = match lock_type {
            LockType::Read => pair.value().try_read_lock().map(|g| std::mem::forget(g)),
            LockType::WriteCheap => pair.value().try_write_lock(false).map(|g| std::mem::forget(g)),
            LockType::WriteExpensive => pair.value().try_write_lock(true).map(|g| std::mem::forget(g)),
        };
        acquired?;
        pair.touch();
        Some(Arc::clone(pair))
    }

    // ------------------------------------------------------------------
    // unpin / unpin_and_remove
    // ------------------------------------------------------------------

    /// Release a pin taken via `get_and_pin`/`put_with_dep_pairs`/etc.
    /// `new_dirty`/`new_attr` are applied first (spec §4.3).
    pub fn unpin(&self, pair: &Arc<Pair>, new_dirty: Option<bool>, new_attr: Option<PairAttr>) {
        if let Some(dirty) = new_dirty {
            pair.set_dirty(dirty);
        }
        if let Some(attr) = new_attr {
            let old = pair.attr();
            self.evictor.apply_size_delta(attr.size - old.size);
            pair.set_attr(attr);
        }
        pair.value().release_held();
        self.maybe_sleep_on_pressure();
    }

    /// Pair must be write-locked on entry (spec §4.3). Waits for disk I/O
    /// in flight, snapshots and clears the pending bit under the proper
    /// locks, lets the caller release its key reservation via
    /// `remove_key_cb`, unlinks the pair, then waits for every other
    /// reference to drop away before the pair itself is freed (which
    /// happens here simply by `Arc` refcount reaching zero once this
    /// function's own local clone goes out of scope).
    pub fn unpin_and_remove<R>(&self, pair: Arc<Pair>, remove_key_cb: R)
    where
        R: FnOnce(u64, bool),
    {
        {
            let _disk = pair.disk_lock.write();
            pair.set_dirty(false);
            let attr = pair.attr();
            pair.set_attr(attr.zeroed_for_removal());
        }

        {
            let mut ring_guard = self.pair_list.list_write();
            let _pending_cheap = self.pair_list.pending_cheap_read();
            let was_pending = pair.checkpoint_pending();
            pair.set_checkpoint_pending(false);
            remove_key_cb(pair.key, was_pending);
            self.pair_list.evict_completely(&mut ring_guard, &pair);
        }

        pair.value().release_held();
        pair.wait_for_refcount_zero();
    }

    // ------------------------------------------------------------------
    // prefetch
    // ------------------------------------------------------------------

    /// Best-effort, never sleeps on cache pressure (spec §4.3). On a
    /// miss, inserts a placeholder under an expensive write lock and
    /// enqueues the real fetch on the worker pool; on a hit, enqueues a
    /// partial fetch if the value reports it needs one.
    pub fn prefetch<F>(&self, cachefile: &Arc<Cachefile>, key: u64, fetch: F)
    where
        F: FetchCallback + 'static,
    {
        let fullhash = fullhash_of(cachefile.hash_id(), key);
        match self.pair_list.find_pair(cachefile, key, fullhash) {
            None => self.prefetch_miss(cachefile, key, fullhash, fetch),
            Some(pair) => self.prefetch_partial(pair),
        }
    }

    fn prefetch_miss<F>(&self, cachefile: &Arc<Cachefile>, key: u64, fullhash: u32, fetch: F)
    where
        F: FetchCallback + 'static,
    {
        let pair = Arc::new(Pair::new(
            cachefile,
            key,
            fullhash,
            Box::new(PlaceholderValue),
            PairAttr::default(),
            false,
        ));
        let guard = pair.value().write_lock(true);
        {
            let mut ring_guard = self.pair_list.list_write();
            if self.pair_list.find_pair(cachefile, key, fullhash).is_some() {
                return; // lost the race; our placeholder is simply dropped.
            }
            self.pair_list.put(&mut ring_guard, pair.clone());
        }
        std::mem::forget(guard);
        self.status.incr(Counter::PairsTotal);

        let cachefile = Arc::clone(cachefile);
        let pair = Arc::clone(&pair);
        let evictor = Arc::clone(&self.evictor);
        self.pool.submit(move || match Box::new(fetch).fetch(cachefile.filenum, key) {
            Ok((value, attr)) => {
                unsafe {
                    *pair.value().assume_write_locked_mut() = value;
                }
                pair.set_attr(attr);
                evictor.apply_size_delta(attr.size);
                pair.value().release_held();
            }
            Err(err) => {
                cachefile.set_error(err.to_string());
                pair.value().release_held();
            }
        });
    }

    fn prefetch_partial(&self, pair: Arc<Pair>) {
        let Some(guard) = pair.value().try_write_lock(false) else {
            return;
        };
        if !guard.partial_fetch_required() {
            return; // guard drops here, releasing immediately.
        }
        std::mem::forget(guard);

        let evictor = Arc::clone(&self.evictor);
        self.pool.submit(move || {
            let _disk = pair.disk_lock.write();
            let ctx = FlushContext {
                filenum: pair.filenum(),
                key: pair.key,
                old_attr: pair.attr(),
                do_write: false,
                keep: true,
                for_checkpoint: false,
                is_clone: false,
            };
            let value = unsafe { pair.value().assume_write_locked() };
            match value.partial_fetch(&ctx) {
                Ok(new_attr) if new_attr.is_valid => {
                    let old = pair.attr();
                    evictor.apply_size_delta(new_attr.size - old.size);
                    pair.set_attr(new_attr);
                }
                Ok(_) => {}
                Err(err) => pair.cachefile().set_error(err.to_string()),
            }
            pair.value().release_held();
        });
    }

    // ------------------------------------------------------------------
    // checkpoint boundary
    // ------------------------------------------------------------------

    pub fn begin_checkpoint(&self) -> Result<()> {
        self.checkpointer.begin_checkpoint()
    }

    pub fn end_checkpoint(&self) -> Result<()> {
        self.checkpointer.end_checkpoint()
    }

    pub fn checkpoint_in_progress(&self) -> bool {
        self.checkpointer.is_active()
    }

    // ------------------------------------------------------------------
    // openfd / openfd_with_filenum / close (spec supplement)
    // ------------------------------------------------------------------

    pub fn openfd(
        &self,
        fileid: u64,
        path: impl Into<String>,
        callbacks: Box<dyn CachefileCallbacks>,
    ) -> Result<Arc<Cachefile>> {
        if let Some(cf) = self.cachefile_list.find_active_by_fileid(fileid) {
            return Ok(cf);
        }
        if let Some(cf) = self.cachefile_list.reactivate(fileid) {
            self.rehash_after_reopen(&cf);
            info!(filenum = cf.filenum, fileid, "cachefile reopened from stale set");
            return Ok(cf);
        }
        let filenum = self.cachefile_list.reserve_filenum();
        let cf = Cachefile::new(filenum, fileid, path.into(), fresh_hash_id(), callbacks);
        self.cachefile_list.insert_active(cf.clone());
        info!(filenum, fileid, "cachefile opened");
        Ok(cf)
    }

    /// As `openfd`, but the caller supplies `filenum` (used on recovery,
    /// where it must match what the logger already recorded).
    pub fn openfd_with_filenum(
        &self,
        fileid: u64,
        path: impl Into<String>,
        filenum: u32,
        callbacks: Box<dyn CachefileCallbacks>,
    ) -> Result<Arc<Cachefile>> {
        if let Some(cf) = self.cachefile_list.find_active_by_fileid(fileid) {
            return Ok(cf);
        }
        if let Some(existing) = self.cachefile_list.find_active_by_filenum(filenum) {
            if existing.fileid != fileid {
                return Err(CacheError::AlreadyExists(format!(
                    "filenum {filenum} is already active for a different fileid"
                )));
            }
            return Ok(existing);
        }
        if let Some(cf) = self.cachefile_list.reactivate(fileid) {
            self.rehash_after_reopen(&cf);
            return Ok(cf);
        }
        let cf = Cachefile::new(filenum, fileid, path.into(), fresh_hash_id(), callbacks);
        self.cachefile_list.insert_active(cf.clone());
        info!(filenum, fileid, "cachefile opened with caller-supplied filenum");
        Ok(cf)
    }

    fn rehash_after_reopen(&self, cf: &Arc<Cachefile>) {
        let new_hash_id = fresh_hash_id();
        cf.reissue_hash_id(new_hash_id);
        for pair in cf.pairs_snapshot() {
            let new_fullhash = fullhash_of(new_hash_id, pair.key);
            self.pair_list.rehash_pair(&pair, new_fullhash);
        }
    }

    pub fn close(&self, cf: &Arc<Cachefile>, oplsn_valid: bool, oplsn: u64) -> Result<()> {
        cf.bjm.begin_closing_and_wait_for_drain();

        for pair in cf.pairs_snapshot() {
            self.write_locked_pair_out(&pair)?;
        }

        cf.callbacks.close_userdata(oplsn_valid, oplsn)?;

        if cf.unlink_on_close.load(Ordering::Acquire) {
            let mut ring_guard = self.pair_list.list_write();
            for pair in cf.pairs_snapshot() {
                self.pair_list.evict_completely(&mut ring_guard, &pair);
            }
            drop(ring_guard);
            self.cachefile_list.remove_active(cf.filenum);
            info!(filenum = cf.filenum, "cachefile closed and unlinked");
        } else {
            self.cachefile_list.mark_stale(cf.filenum);
            info!(filenum = cf.filenum, "cachefile closed, pairs kept on stale list");
        }
        Ok(())
    }

    /// Spec §4.7: write a locked pair out synchronously, used by `close`.
    fn write_locked_pair_out(&self, pair: &Arc<Pair>) -> Result<()> {
        let write_guard = pair.value().write_lock(true);
        let _disk = pair.disk_lock.write();
        if !pair.is_dirty() {
            return Ok(());
        }
        let ctx = FlushContext {
            filenum: pair.filenum(),
            key: pair.key,
            old_attr: pair.attr(),
            do_write: true,
            keep: true,
            for_checkpoint: false,
            is_clone: false,
        };
        match write_guard.flush(&ctx) {
            Ok(new_attr) => {
                if new_attr.is_valid {
                    pair.set_attr(new_attr);
                }
                pair.set_dirty(false);
                Ok(())
            }
            Err(err) => Err(CacheError::FlushFailed {
                filenum: pair.filenum(),
                source: Box::new(err),
            }),
        }
    }
}

/// The value stored for a `prefetch` miss until the background fetch
/// replaces it. Never observed by a caller -- the pair is write-locked
/// (expensive) for the entire time it holds this.
struct PlaceholderValue;

impl PairValue for PlaceholderValue {
    fn flush(&self, _ctx: &FlushContext) -> Result<PairAttr> {
        Ok(PairAttr::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pair::attr::EvictionCost;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex as StdMutex;

    struct NoopCallbacks;
    impl CachefileCallbacks for NoopCallbacks {}

    #[derive(Clone)]
    struct StringValue {
        data: Arc<StdMutex<String>>,
        flushes: Arc<AtomicUsize>,
    }

    impl StringValue {
        fn new(data: &str) -> Self {
            Self {
                data: Arc::new(StdMutex::new(data.to_string())),
                flushes: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl PairValue for StringValue {
        fn flush(&self, _ctx: &FlushContext) -> Result<PairAttr> {
            self.flushes.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(PairAttr::new(self.data.lock().unwrap().len() as i64))
        }
    }

    struct MissingFetch;
    impl FetchCallback for MissingFetch {
        fn fetch(self: Box<Self>, _filenum: u32, _key: u64) -> Result<(Box<dyn PairValue>, PairAttr)> {
            Err(CacheError::NotFound("no such pair".into()))
        }
    }

    fn new_table(size_limit: u64) -> (Arc<CacheTable>, Arc<Cachefile>) {
        let mut config = CacheTableConfig::new(size_limit);
        config.n_buckets = 16;
        config.n_mutexes = 16;
        let table = CacheTable::new(config);
        let cf = table
            .openfd(crate::cachefile::fresh_fileid(), "t.db", Box::new(NoopCallbacks))
            .unwrap();
        (table, cf)
    }

    #[test]
    fn single_threaded_put_then_get() {
        let (table, cf) = new_table(1024 * 1024);
        let value = StringValue::new("abc");

        let pair = table
            .put_with_dep_pairs(&cf, Box::new(value.clone()), PairAttr::new(3), || 7, &[])
            .unwrap();
        table.unpin(&pair, Some(true), None);

        let pair = table
            .get_and_pin(&cf, 7, LockType::Read, MissingFetch, &[])
            .unwrap();
        assert_eq!(pair.key, 7);
        table.unpin(&pair, None, None);

        assert_eq!(table.num_pairs(), 1);
    }

    #[test]
    fn put_rejects_colliding_key() {
        let (table, cf) = new_table(1024 * 1024);
        let pair = table
            .put_with_dep_pairs(&cf, Box::new(StringValue::new("a")), PairAttr::new(1), || 1, &[])
            .unwrap();
        table.unpin(&pair, None, None);

        let err = table.put_with_dep_pairs(&cf, Box::new(StringValue::new("b")), PairAttr::new(1), || 1, &[]);
        assert!(err.is_err());
    }

    #[test]
    fn unpin_and_remove_drops_the_pair_from_the_table() {
        let (table, cf) = new_table(1024 * 1024);
        let pair = table
            .put_with_dep_pairs(&cf, Box::new(StringValue::new("a")), PairAttr::new(1), || 9, &[])
            .unwrap();

        let mut removed_with_pending = None;
        table.unpin_and_remove(pair, |key, was_pending| {
            assert_eq!(key, 9);
            removed_with_pending = Some(was_pending);
        });

        assert_eq!(removed_with_pending, Some(false));
        assert_eq!(table.num_pairs(), 0);
    }

    #[test]
    fn maybe_get_and_pin_declines_clean_pairs() {
        let (table, cf) = new_table(1024 * 1024);
        let pair = table
            .put_with_dep_pairs(&cf, Box::new(StringValue::new("a")), PairAttr::new(1), || 3, &[])
            .unwrap();
        table.unpin(&pair, Some(false), None);

        assert!(table.maybe_get_and_pin(&cf, 3, LockType::Read).is_none());
        let got = table.maybe_get_and_pin_clean(&cf, 3, LockType::Read).unwrap();
        table.unpin(&got, None, None);
    }

    #[test]
    fn reopen_reuses_cachefile_and_rehashes_pairs() {
        let (table, cf) = new_table(1024 * 1024);
        let fileid = cf.fileid;
        let old_hash_id = cf.hash_id();

        let pair = table
            .put_with_dep_pairs(&cf, Box::new(StringValue::new("a")), PairAttr::new(1), || 5, &[])
            .unwrap();
        table.unpin(&pair, None, None);

        table.close(&cf, false, 0).unwrap();
        let reopened = table.openfd(fileid, "t.db", Box::new(NoopCallbacks)).unwrap();

        assert_ne!(reopened.hash_id(), old_hash_id);
        let found = table.pair_list.find_pair(&reopened, 5, fullhash_of(reopened.hash_id(), 5));
        assert!(found.is_some());
    }

    #[test]
    fn close_flushes_dirty_pairs() {
        let (table, cf) = new_table(1024 * 1024);
        let value = StringValue::new("a");
        let pair = table
            .put_with_dep_pairs(&cf, Box::new(value.clone()), PairAttr::new(1), || 1, &[])
            .unwrap();
        table.unpin(&pair, Some(true), None);

        table.close(&cf, false, 0).unwrap();
        assert_eq!(value.flushes.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn prefetch_miss_inserts_a_pair_asynchronously() {
        let (table, cf) = new_table(1024 * 1024);
        struct SlowFetch;
        impl FetchCallback for SlowFetch {
            fn fetch(self: Box<Self>, _filenum: u32, _key: u64) -> Result<(Box<dyn PairValue>, PairAttr)> {
                Ok((Box::new(StringValue::new("x")), PairAttr::new(1)))
            }
        }

        table.prefetch(&cf, 42, SlowFetch);

        let mut waited = std::time::Duration::ZERO;
        while table.num_pairs() == 0 && waited < std::time::Duration::from_secs(2) {
            std::thread::sleep(std::time::Duration::from_millis(10));
            waited += std::time::Duration::from_millis(10);
        }
        assert_eq!(table.num_pairs(), 1);
        let _ = EvictionCost::Cheap;
    }
}
