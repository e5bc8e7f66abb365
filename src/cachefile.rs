// Cachefile & Cachefile List (spec §3 component C3), plus the
// Background Job Manager (spec §3 "BJM").

use crate::error::{CacheError, Result};
use crate::pair::Pair;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Cachefile-level user-data callbacks (spec §6.2). `free_userdata` has no
/// method here -- it is simply `Drop` on the boxed trait object, which is
/// the idiomatic Rust replacement for an explicit teardown callback.
pub trait CachefileCallbacks: Send + Sync {
    fn log_fassociate_during_checkpoint(&self) {}
    fn begin_checkpoint_userdata(&self, _lsn_of_checkpoint_in_progress: u64) {}
    fn checkpoint_userdata(&self) -> Result<()> {
        Ok(())
    }
    fn end_checkpoint_userdata(&self) -> Result<()> {
        Ok(())
    }
    fn note_pin_by_checkpoint(&self) {}
    fn note_unpin_by_checkpoint(&self) {}
    fn close_userdata(&self, _oplsn_valid: bool, _oplsn: u64) -> Result<()> {
        Ok(())
    }
}

/// Per-cachefile counter of in-flight background jobs with a
/// wait-for-zero primitive (spec §3 "BJM"). Clients increment before
/// enqueueing async work that touches the file; the evictor, cleaner and
/// checkpointer decrement on completion. `close` waits for this to drain.
pub struct BackgroundJobManager {
    count: AtomicU32,
    closing: AtomicBool,
    gate: Mutex<()>,
    drained: Condvar,
}

impl BackgroundJobManager {
    pub fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
            closing: AtomicBool::new(false),
            gate: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    /// Register a job. Fails if the cachefile is closing (spec §4.5: "the
    /// cachefile is closing; skip").
    pub fn add_background_job(&self) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(CacheError::Closing("cachefile is closing".into()));
        }
        self.count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn remove_background_job(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            crate::error::fatal_invariant("background job count went negative");
        }
        if prev == 1 {
            let _g = self.gate.lock();
            self.drained.notify_all();
        }
    }

    /// `close(cf)` calls this before doing anything else observable, so no
    /// further jobs can be registered while it drains (spec §8 property 7).
    pub fn begin_closing_and_wait_for_drain(&self) {
        self.closing.store(true, Ordering::Release);
        let mut guard = self.gate.lock();
        while self.count.load(Ordering::Acquire) != 0 {
            self.drained.wait(&mut guard);
        }
    }

    pub fn outstanding(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}

pub struct Cachefile {
    pub filenum: u32,
    /// OS-level file identity; two opens of the same inode compare equal
    /// by this field (spec §3: "Cachefile equality is by OS `fileid`").
    pub fileid: u64,
    pub path: String,

    hash_id: AtomicU32,
    pub bjm: BackgroundJobManager,
    pub callbacks: Box<dyn CachefileCallbacks>,

    /// This cachefile's chain of pairs -- an index, not ownership
    /// (spec §9); the pair list holds the owning `Arc<Pair>`.
    pairs: Mutex<Vec<Arc<Pair>>>,

    pub for_checkpoint: AtomicBool,
    pub unlink_on_close: AtomicBool,

    /// Sticky resource-error state (spec §7: "I/O errors inside background
    /// workers mark the cachefile ... the error surfaces on the next
    /// foreground operation").
    error: Mutex<Option<String>>,
}

impl Cachefile {
    pub fn new(
        filenum: u32,
        fileid: u64,
        path: String,
        hash_id: u32,
        callbacks: Box<dyn CachefileCallbacks>,
    ) -> Arc<Self> {
        Arc::new(Self {
            filenum,
            fileid,
            path,
            hash_id: AtomicU32::new(hash_id),
            bjm: BackgroundJobManager::new(),
            callbacks,
            pairs: Mutex::new(Vec::new()),
            for_checkpoint: AtomicBool::new(false),
            unlink_on_close: AtomicBool::new(false),
            error: Mutex::new(None),
        })
    }

    pub fn hash_id(&self) -> u32 {
        self.hash_id.load(Ordering::Acquire)
    }

    /// A fresh `hash_id` is issued per successful open (spec §3); existing
    /// pairs must be rehashed by the caller after this (spec supplement).
    pub fn reissue_hash_id(&self, hash_id: u32) {
        self.hash_id.store(hash_id, Ordering::Release);
    }

    pub fn num_pairs(&self) -> usize {
        self.pairs.lock().len()
    }

    /// Prepend to the cachefile's pair chain (spec §4.2 `add_to_cf_list`).
    pub fn add_pair(&self, pair: Arc<Pair>) {
        self.pairs.lock().insert(0, pair);
    }

    pub fn remove_pair(&self, pair: &Arc<Pair>) {
        let mut pairs = self.pairs.lock();
        if let Some(idx) = pairs.iter().position(|p| Arc::ptr_eq(p, pair)) {
            pairs.remove(idx);
        }
    }

    pub fn pairs_snapshot(&self) -> Vec<Arc<Pair>> {
        self.pairs.lock().clone()
    }

    pub fn take_one_pair(&self) -> Option<Arc<Pair>> {
        self.pairs.lock().pop()
    }

    pub fn set_error(&self, message: impl Into<String>) {
        *self.error.lock() = Some(message.into());
    }

    pub fn take_error(&self) -> Option<String> {
        self.error.lock().take()
    }

    pub fn has_error(&self) -> bool {
        self.error.lock().is_some()
    }
}

/// Derives `fullhash` from `(hash_id, key)` via a bit-mixing function
/// (spec §3). Stable across `close`/`reopen` only as far as `hash_id` is
/// (it isn't -- a fresh one is issued per open).
pub fn fullhash_of(hash_id: u32, key: u64) -> u32 {
    let mut h = (hash_id as u64) ^ key.wrapping_mul(0x9E3779B97F4A7C15);
    h ^= h >> 33;
    h = h.wrapping_mul(0xFF51AFD7ED558CCD);
    h ^= h >> 33;
    (h as u32) ^ ((h >> 32) as u32)
}

/// Three sorted collections (spec §3 C3): active-by-filenum,
/// active-by-fileid, stale-by-fileid, plus the filenum counter.
/// Implemented as insertion-ordered `Vec`s kept sorted by key, matching
/// the spec's own description rather than reaching for a `BTreeMap` --
/// lookups are by linear scan, which is fine at the cachefile-count
/// scales this subsystem deals with (tens to low thousands of open
/// files, not billions).
pub struct CachefileList {
    inner: RwLock<CachefileListInner>,
}

#[derive(Default)]
struct CachefileListInner {
    active_by_filenum: Vec<Arc<Cachefile>>,
    stale_by_fileid: Vec<Arc<Cachefile>>,
    next_filenum: u32,
}

impl Default for CachefileList {
    fn default() -> Self {
        Self::new()
    }
}

impl CachefileList {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CachefileListInner {
                active_by_filenum: Vec::new(),
                stale_by_fileid: Vec::new(),
                next_filenum: 1,
            }),
        }
    }

    pub fn reserve_filenum(&self) -> u32 {
        let mut inner = self.inner.write();
        let n = inner.next_filenum;
        inner.next_filenum += 1;
        n
    }

    pub fn find_active_by_fileid(&self, fileid: u64) -> Option<Arc<Cachefile>> {
        self.inner
            .read()
            .active_by_filenum
            .iter()
            .find(|cf| cf.fileid == fileid)
            .cloned()
    }

    pub fn find_active_by_filenum(&self, filenum: u32) -> Option<Arc<Cachefile>> {
        self.inner
            .read()
            .active_by_filenum
            .iter()
            .find(|cf| cf.filenum == filenum)
            .cloned()
    }

    pub fn find_stale_by_fileid(&self, fileid: u64) -> Option<Arc<Cachefile>> {
        self.inner
            .read()
            .stale_by_fileid
            .iter()
            .find(|cf| cf.fileid == fileid)
            .cloned()
    }

    pub fn insert_active(&self, cf: Arc<Cachefile>) {
        self.inner.write().active_by_filenum.push(cf);
    }

    /// Move a cachefile from stale back into active (reopen, spec
    /// supplement).
    pub fn reactivate(&self, fileid: u64) -> Option<Arc<Cachefile>> {
        let mut inner = self.inner.write();
        let idx = inner.stale_by_fileid.iter().position(|cf| cf.fileid == fileid)?;
        let cf = inner.stale_by_fileid.remove(idx);
        inner.active_by_filenum.push(cf.clone());
        Some(cf)
    }

    /// Move a cachefile from active to stale (`close` without
    /// `unlink_on_close`, spec supplement).
    pub fn mark_stale(&self, filenum: u32) -> Option<Arc<Cachefile>> {
        let mut inner = self.inner.write();
        let idx = inner
            .active_by_filenum
            .iter()
            .position(|cf| cf.filenum == filenum)?;
        let cf = inner.active_by_filenum.remove(idx);
        inner.stale_by_fileid.push(cf.clone());
        Some(cf)
    }

    pub fn remove_active(&self, filenum: u32) -> Option<Arc<Cachefile>> {
        let mut inner = self.inner.write();
        let idx = inner
            .active_by_filenum
            .iter()
            .position(|cf| cf.filenum == filenum)?;
        Some(inner.active_by_filenum.remove(idx))
    }

    pub fn remove_stale(&self, filenum: u32) -> Option<Arc<Cachefile>> {
        let mut inner = self.inner.write();
        let idx = inner
            .stale_by_fileid
            .iter()
            .position(|cf| cf.filenum == filenum)?;
        Some(inner.stale_by_fileid.remove(idx))
    }

    pub fn active_snapshot(&self) -> Vec<Arc<Cachefile>> {
        self.inner.read().active_by_filenum.clone()
    }

    pub fn stale_snapshot(&self) -> Vec<Arc<Cachefile>> {
        self.inner.read().stale_by_fileid.clone()
    }

    /// Offer the evictor one pair from any stale cachefile (spec
    /// supplement: "Stale-pair preference"). If that empties the
    /// cachefile's chain, the cachefile itself is dropped from the stale
    /// set, which is where `free_userdata` fires via `Drop`.
    pub fn evict_one_stale_pair(&self) -> Option<Arc<Pair>> {
        let inner = self.inner.read();
        let cf = inner.stale_by_fileid.iter().find(|cf| cf.num_pairs() > 0)?.clone();
        drop(inner);
        let pair = cf.take_one_pair();
        if cf.num_pairs() == 0 {
            self.remove_stale(cf.filenum);
        }
        pair
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CachefileListCounters {
    pub active: usize,
    pub stale: usize,
}

impl CachefileList {
    pub fn counters(&self) -> CachefileListCounters {
        let inner = self.inner.read();
        CachefileListCounters {
            active: inner.active_by_filenum.len(),
            stale: inner.stale_by_fileid.len(),
        }
    }
}

static NEXT_FILEID: AtomicU64 = AtomicU64::new(1);

/// Synthesizes an OS-level file identity. A real engine would stat() the
/// open fd; this crate treats file I/O as an external collaborator (spec
/// §1), so the identity is whatever the caller supplies, or a freshly
/// minted one if the caller wants a brand new file.
pub fn fresh_fileid() -> u64 {
    NEXT_FILEID.fetch_add(1, Ordering::Relaxed)
}

static NEXT_HASH_ID: AtomicU32 = AtomicU32::new(1);

/// A fresh `hash_id`, issued on every successful open (spec §3) and again
/// whenever a stale cachefile is reactivated by `openfd` (spec supplement).
pub fn fresh_hash_id() -> u32 {
    NEXT_HASH_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopCallbacks;
    impl CachefileCallbacks for NoopCallbacks {}

    #[test]
    fn bjm_drains_and_blocks_new_jobs_once_closing() {
        let bjm = BackgroundJobManager::new();
        bjm.add_background_job().unwrap();
        bjm.add_background_job().unwrap();
        assert_eq!(bjm.outstanding(), 2);

        let bjm = Arc::new(bjm);
        let bjm2 = Arc::clone(&bjm);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            bjm2.remove_background_job();
            bjm2.remove_background_job();
        });

        bjm.begin_closing_and_wait_for_drain();
        handle.join().unwrap();
        assert_eq!(bjm.outstanding(), 0);
        assert!(bjm.add_background_job().is_err());
    }

    #[test]
    fn reopen_moves_cachefile_between_active_and_stale() {
        let list = CachefileList::new();
        let filenum = list.reserve_filenum();
        let cf = Cachefile::new(filenum, 42, "a.db".into(), 1, Box::new(NoopCallbacks));
        list.insert_active(cf.clone());
        assert!(list.find_active_by_fileid(42).is_some());

        list.mark_stale(filenum);
        assert!(list.find_active_by_fileid(42).is_none());
        assert!(list.find_stale_by_fileid(42).is_some());

        let reactivated = list.reactivate(42).unwrap();
        assert_eq!(reactivated.filenum, filenum);
        assert!(list.find_active_by_fileid(42).is_some());
    }

    #[test]
    fn fullhash_changes_with_hash_id() {
        let h1 = fullhash_of(1, 7);
        let h2 = fullhash_of(2, 7);
        assert_ne!(h1, h2);
    }
}
