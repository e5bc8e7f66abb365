// Owner-supplied pair callbacks (spec §6.1).
//
// Per spec §9 "Inheritance / polymorphism": the original models these as a
// borrowed record of function pointers plus an opaque `extraargs` pointer.
// A Rust trait object already *is* that pairing -- the vtable is the
// function-pointer record, the boxed concrete type is `extraargs` -- so
// `Box<dyn PairValue>` plays both roles the original splits into `value`
// and `write_callback`. The cache is parametric over the trait, never over
// a concrete value type.

use crate::pair::attr::{EvictionCost, PairAttr};
use crate::Result;

/// Everything the cache needs to hand a callback enough context to act
/// like `flush`/`partial_fetch` in the original without a raw `fd`.
pub struct FlushContext {
    pub filenum: u32,
    pub key: u64,
    pub old_attr: PairAttr,
    pub do_write: bool,
    pub keep: bool,
    pub for_checkpoint: bool,
    pub is_clone: bool,
}

pub trait PairValue: Send + Sync {
    /// Write this pair out. The only legal writer of `dirty -> CLEAN`
    /// (spec §3 invariant); `ctx.keep == false` means the cache is
    /// evicting and this call may be the value's last use.
    fn flush(&self, ctx: &FlushContext) -> Result<PairAttr>;

    /// Advisory: how much would a partial eviction reclaim, and would it
    /// be cheap enough to run inline on the evictor thread? Default: "not
    /// partially evictable" (nothing reclaimed, cheap to determine that).
    fn partial_eviction_est(&self) -> (i64, EvictionCost) {
        (0, EvictionCost::Cheap)
    }

    /// Actually perform a partial eviction, returning the new attr. Called
    /// synchronously for `Cheap` estimates, or from a worker-pool task for
    /// `Expensive` ones with a positive estimate (spec §4.4).
    fn partial_eviction(&self, old_attr: PairAttr) -> PairAttr {
        old_attr
    }

    /// Must be safe to call under the value read-lock (spec §6.1).
    fn partial_fetch_required(&self) -> bool {
        false
    }

    /// Called with the value write-lock and disk lock held (spec §6.1).
    fn partial_fetch(&self, _ctx: &FlushContext) -> Result<PairAttr> {
        Ok(PairAttr::default())
    }

    /// Run by the cleaner (spec §4.5) while the pair is write-locked. In
    /// the original this callback must itself release the value lock
    /// before returning; here the cache's RAII guard is what releases it,
    /// dropped by the cleaner the instant this call returns, so the
    /// contract ("the pair is unlocked once the cleaner is done, not
    /// before") holds without the callback touching the lock itself.
    fn cleaner(&self) -> Result<()> {
        Ok(())
    }

    /// Produce a checkpoint clone: a value that can be flushed by a
    /// background job while this pair keeps being mutated. `None` means
    /// not cloneable -- the checkpoint pending-resolution path writes the
    /// pair inline instead (spec §4.6).
    fn clone_for_checkpoint(&self) -> Option<(Box<dyn PairValue>, i64)> {
        None
    }

    /// Optional hook invoked just before pending-bit resolution performs
    /// the write (spec §6.1).
    fn checkpoint_complete(&self) {}
}

/// Supplied per `get_and_pin`/`put` call (not stored on the pair): how to
/// fetch a missing pair from disk on a miss.
pub trait FetchCallback: Send {
    fn fetch(self: Box<Self>, filenum: u32, key: u64) -> Result<(Box<dyn PairValue>, PairAttr)>;
}

impl<F> FetchCallback for F
where
    F: FnOnce(u32, u64) -> Result<(Box<dyn PairValue>, PairAttr)> + Send,
{
    fn fetch(self: Box<Self>, filenum: u32, key: u64) -> Result<(Box<dyn PairValue>, PairAttr)> {
        (*self)(filenum, key)
    }
}
