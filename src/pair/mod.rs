pub mod attr;
pub mod callbacks;

use crate::cachefile::Cachefile;
use crate::sync::{PairLock, WriterPreferringRwLock};
use attr::PairAttr;
use callbacks::PairValue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Clock-counter ceiling (spec §3: "`count ∈ [0..15]`, initial 3, saturating").
pub const CLOCK_INITIAL_COUNT: u8 = 3;
pub const CLOCK_MAX_COUNT: u8 = 15;

/// A clone of a pair's value, produced for a non-blocking checkpoint write
/// (spec §3, §4.6). Its presence is the sole witness that a background
/// cloner task currently holds the pair's disk lock for write.
struct ClonedValue {
    value: Box<dyn PairValue>,
    size: i64,
}

/// The unit of caching (spec §3, component C1).
///
/// Ring/chain membership (clock, cleaner and checkpoint cursors, the
/// pending list, the per-cachefile chain, the hash bucket chain) all live
/// in `PairList`/`Cachefile` as `Vec<Arc<Pair>>`, addressed by identity
/// (`Arc::ptr_eq`) rather than as raw intrusive pointers stored on `Pair`
/// itself -- see DESIGN.md for why an arena-of-pointers design was traded
/// for this one.
pub struct Pair {
    /// Non-owning: the pair list owns the pair, the cachefile list owns
    /// the cachefile, and a pair's per-cachefile chain membership is
    /// "merely an index, not ownership" (spec §9) -- an owning `Arc` back
    /// here would also cycle with the cachefile's own `Arc<Pair>` chain.
    cachefile: Weak<Cachefile>,
    pub key: u64,
    fullhash: AtomicU32,

    value: PairLock<Box<dyn PairValue>>,
    cloned: Mutex<Option<ClonedValue>>,
    pub disk_lock: WriterPreferringRwLock<()>,

    attr: Mutex<PairAttr>,
    dirty: AtomicBool,
    count: AtomicU8,
    checkpoint_pending: AtomicBool,

    refcount: AtomicU32,
    num_waiting_on_refs: AtomicU32,
    refcount_gate: Mutex<()>,
    refcount_cond: Condvar,

    /// Set while a full or expensive partial eviction is pending for this
    /// pair, so the evictor's size accounting reflects memory it has
    /// already committed to reclaiming (spec §3).
    size_evicting_estimate: AtomicI64,
}

impl Pair {
    pub fn new(
        cachefile: &Arc<Cachefile>,
        key: u64,
        fullhash: u32,
        value: Box<dyn PairValue>,
        attr: PairAttr,
        dirty: bool,
    ) -> Self {
        Self {
            cachefile: Arc::downgrade(cachefile),
            key,
            fullhash: AtomicU32::new(fullhash),
            value: PairLock::new(value),
            cloned: Mutex::new(None),
            disk_lock: WriterPreferringRwLock::new(()),
            attr: Mutex::new(attr),
            dirty: AtomicBool::new(dirty),
            count: AtomicU8::new(CLOCK_INITIAL_COUNT),
            checkpoint_pending: AtomicBool::new(false),
            refcount: AtomicU32::new(0),
            num_waiting_on_refs: AtomicU32::new(0),
            refcount_gate: Mutex::new(()),
            refcount_cond: Condvar::new(),
            size_evicting_estimate: AtomicI64::new(0),
        }
    }

    /// The owning cachefile. Panics if it has been dropped -- it never
    /// should be while this pair is reachable, since `close` either
    /// evicts every one of a cachefile's pairs before freeing it or
    /// parks the cachefile on the stale list (keeping it alive) instead.
    pub fn cachefile(&self) -> Arc<Cachefile> {
        self.cachefile
            .upgrade()
            .unwrap_or_else(|| crate::error::fatal_invariant("pair outlived its cachefile"))
    }

    pub fn filenum(&self) -> u32 {
        self.cachefile().filenum
    }

    pub fn fullhash(&self) -> u32 {
        self.fullhash.load(Ordering::Acquire)
    }

    /// Only called while rehashing a cachefile's pairs after a reopen
    /// issues a fresh `hash_id` (spec supplement, §4: `openfd`), under the
    /// pair list's write lock.
    pub fn set_fullhash(&self, fullhash: u32) {
        self.fullhash.store(fullhash, Ordering::Release);
    }

    pub fn value(&self) -> &PairLock<Box<dyn PairValue>> {
        &self.value
    }

    pub fn attr(&self) -> PairAttr {
        *self.attr.lock()
    }

    pub fn set_attr(&self, attr: PairAttr) {
        *self.attr.lock() = attr;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    pub fn checkpoint_pending(&self) -> bool {
        self.checkpoint_pending.load(Ordering::Acquire)
    }

    /// Raw bit flip. Callers must hold the pair's value lock or the
    /// pending-cheap write lock to clear it, and either the
    /// pending-expensive read lock or the value lock to read it
    /// meaningfully (spec §4.6, the pending-bit rule) -- that discipline
    /// is enforced by callers (`checkpoint`, `cachetable`), not by this
    /// accessor.
    pub fn set_checkpoint_pending(&self, pending: bool) {
        self.checkpoint_pending.store(pending, Ordering::Release);
    }

    pub fn count(&self) -> u8 {
        self.count.load(Ordering::Relaxed)
    }

    /// Bump the clock counter on a successful pin, saturating at
    /// `CLOCK_MAX_COUNT` (spec §3).
    pub fn touch(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some(c.saturating_add(1).min(CLOCK_MAX_COUNT))
            });
    }

    /// Decrement the clock counter by one, saturating at zero.
    pub fn decay(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some(c.saturating_sub(1))
            });
    }

    pub fn size_evicting_estimate(&self) -> i64 {
        self.size_evicting_estimate.load(Ordering::Relaxed)
    }

    pub fn set_size_evicting_estimate(&self, n: i64) {
        self.size_evicting_estimate.store(n, Ordering::Relaxed);
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn incr_refcount(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decr_refcount(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            crate::error::fatal_invariant("pair refcount went negative");
        }
        if prev == 1 {
            let _g = self.refcount_gate.lock();
            self.refcount_cond.notify_all();
        }
    }

    /// Block until `refcount` reaches zero (spec §3, used by
    /// `unpin_and_remove`).
    pub fn wait_for_refcount_zero(&self) {
        if self.refcount() == 0 {
            return;
        }
        self.num_waiting_on_refs.fetch_add(1, Ordering::AcqRel);
        let mut guard = self.refcount_gate.lock();
        while self.refcount() != 0 {
            self.refcount_cond.wait(&mut guard);
        }
        self.num_waiting_on_refs.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn stash_clone(&self, value: Box<dyn PairValue>, size: i64) {
        *self.cloned.lock() = Some(ClonedValue { value, size });
    }

    pub fn take_clone(&self) -> Option<(Box<dyn PairValue>, i64)> {
        self.cloned.lock().take().map(|c| (c.value, c.size))
    }

    pub fn has_clone_in_flight(&self) -> bool {
        self.cloned.lock().is_some()
    }
}

impl std::fmt::Debug for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pair")
            .field("filenum", &self.filenum())
            .field("key", &self.key)
            .field("fullhash", &self.fullhash)
            .field("dirty", &self.is_dirty())
            .field("checkpoint_pending", &self.checkpoint_pending())
            .field("count", &self.count())
            .finish()
    }
}
