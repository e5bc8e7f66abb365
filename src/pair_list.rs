// Pair List (spec §3, §4.2, component C2): sharded hash table, the three
// clock/cleaner/checkpoint ring cursors, the pending list, and the three
// rwlocks (list, pending-expensive, pending-cheap).
//
// The original threads the ring through intrusive `clock_next/prev`
// pointers stored on each pair, addressed via an arena of slots (spec §9:
// "implement via an arena of pair slots and three cursor indices"). This
// crate takes that suggestion literally but swaps the arena for a single
// `Vec<Arc<Pair>>` in ring order, with `clock_head`/`cleaner_head`/
// `checkpoint_head` as `Option<usize>` indices into it -- see DESIGN.md
// for the index-adjustment rules this relies on.

use crate::cachefile::Cachefile;
use crate::pair::Pair;
use crate::sync::{WpWriteGuard, WriterPreferringRwLock};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The ring: all cached pairs in clock order, plus three independent
/// cursors into it. All three are null together iff the ring is empty
/// (spec §3 invariant).
#[derive(Default)]
struct Ring {
    items: Vec<Arc<Pair>>,
    clock_head: Option<usize>,
    cleaner_head: Option<usize>,
    checkpoint_head: Option<usize>,
}

impl Ring {
    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Insert at the tail, i.e. just before `clock_head` (spec §4.2).
    /// Any cursor sitting at or past the insertion point shifts forward
    /// by one so it keeps pointing at the same logical pair.
    fn insert_at_tail(&mut self, pair: Arc<Pair>) {
        match self.clock_head {
            None => {
                self.items.push(pair);
                self.clock_head = Some(0);
                self.cleaner_head = Some(0);
                self.checkpoint_head = Some(0);
            }
            Some(head) => {
                self.items.insert(head, pair);
                for cursor in [
                    &mut self.clock_head,
                    &mut self.cleaner_head,
                    &mut self.checkpoint_head,
                ] {
                    if let Some(c) = cursor {
                        if *c >= head {
                            *c += 1;
                        }
                    }
                }
            }
        }
    }

    /// Remove a pair by identity. If a cursor pointed at the removed
    /// pair, it advances to what is now the next pair in clock order
    /// (spec §4.2: "whenever a head points at a pair being removed, it
    /// advances to `clock_next` first"). If the ring empties, all three
    /// cursors become `None` together.
    fn remove(&mut self, pair: &Arc<Pair>) -> bool {
        let Some(idx) = self.items.iter().position(|p| Arc::ptr_eq(p, pair)) else {
            return false;
        };
        self.items.remove(idx);

        if self.items.is_empty() {
            self.clock_head = None;
            self.cleaner_head = None;
            self.checkpoint_head = None;
            return true;
        }

        for cursor in [
            &mut self.clock_head,
            &mut self.cleaner_head,
            &mut self.checkpoint_head,
        ] {
            if let Some(c) = cursor {
                if *c == idx {
                    *cursor = Some(if idx >= self.items.len() { 0 } else { idx });
                } else if *c > idx {
                    *cursor -= 1;
                }
            }
        }
        true
    }

    fn clock_current(&self) -> Option<Arc<Pair>> {
        self.clock_head.map(|i| self.items[i].clone())
    }

    fn advance_clock(&mut self) {
        if let Some(h) = self.clock_head {
            self.clock_head = Some((h + 1) % self.items.len());
        }
    }

    /// Up to `n` pairs starting at `cleaner_head`, without advancing.
    /// The caller advances explicitly once it has decided how many it
    /// actually examined.
    fn cleaner_window(&self, n: usize) -> Vec<Arc<Pair>> {
        let Some(head) = self.cleaner_head else {
            return Vec::new();
        };
        let len = self.items.len();
        (0..n.min(len))
            .map(|i| self.items[(head + i) % len].clone())
            .collect()
    }

    fn advance_cleaner(&mut self, n: usize) {
        if let Some(h) = self.cleaner_head {
            let len = self.items.len();
            self.cleaner_head = Some((h + n.min(len)) % len);
        }
    }

    /// A full lap starting at `checkpoint_head`, used once per
    /// `begin_checkpoint` (spec §4.6). Leaves the cursor where it
    /// started; a fresh full sweep each checkpoint is simpler to reason
    /// about than a rotating partial one and matches the spec's "walk
    /// the clock ring via `checkpoint_head`" without over-specifying
    /// where each checkpoint's lap begins relative to the last.
    fn full_lap_from_checkpoint_head(&self) -> Vec<Arc<Pair>> {
        let Some(head) = self.checkpoint_head else {
            return Vec::new();
        };
        let len = self.items.len();
        (0..len).map(|i| self.items[(head + i) % len].clone()).collect()
    }
}

pub struct PairList {
    buckets: Vec<Mutex<Vec<Arc<Pair>>>>,
    ring: WriterPreferringRwLock<Ring>,
    pending_expensive: WriterPreferringRwLock<()>,
    pending_cheap: WriterPreferringRwLock<()>,
    pending_list: Mutex<Vec<Arc<Pair>>>,
    num_pairs: AtomicUsize,
}

impl PairList {
    /// `n_mutexes` is accepted for API fidelity with spec §3's
    /// independent bucket/mutex ratio but this implementation uses one
    /// mutex per bucket (see DESIGN.md); `n_buckets` must be a power of
    /// two, enforced by the caller (`CacheTableConfig`).
    pub fn new(n_buckets: usize, _n_mutexes: usize) -> Self {
        let buckets = (0..n_buckets).map(|_| Mutex::new(Vec::new())).collect();
        Self {
            buckets,
            ring: WriterPreferringRwLock::new(Ring::default()),
            pending_expensive: WriterPreferringRwLock::new(()),
            pending_cheap: WriterPreferringRwLock::new(()),
            pending_list: Mutex::new(Vec::new()),
            num_pairs: AtomicUsize::new(0),
        }
    }

    fn bucket_index(&self, fullhash: u32) -> usize {
        (fullhash as usize) & (self.buckets.len() - 1)
    }

    /// Bucket mutex may be taken without the list lock (spec §4.2 rule 1).
    pub fn find_pair(&self, cf: &Arc<Cachefile>, key: u64, fullhash: u32) -> Option<Arc<Pair>> {
        let idx = self.bucket_index(fullhash);
        let bucket = self.buckets[idx].lock();
        bucket
            .iter()
            .find(|p| p.key == key && Arc::ptr_eq(&p.cachefile(), cf))
            .cloned()
    }

    /// `add_to_cachetable_only` + `add_to_cf_list` (spec §4.2 `put`).
    /// Requires the caller to already hold the list write lock (obtained
    /// via [`PairList::list_write`]).
    pub fn put(&self, ring_guard: &mut WpWriteGuard<'_, Ring>, pair: Arc<Pair>) {
        self.add_to_cachetable_only(ring_guard, pair.clone());
        self.add_to_cf_list(&pair);
    }

    pub fn add_to_cachetable_only(&self, ring_guard: &mut WpWriteGuard<'_, Ring>, pair: Arc<Pair>) {
        let idx = self.bucket_index(pair.fullhash());
        self.buckets[idx].lock().insert(0, pair.clone());
        ring_guard.insert_at_tail(pair);
        self.num_pairs.fetch_add(1, Ordering::AcqRel);
    }

    pub fn add_to_cf_list(&self, pair: &Arc<Pair>) {
        pair.cachefile().add_pair(pair.clone());
    }

    pub fn evict_from_cachetable(&self, ring_guard: &mut WpWriteGuard<'_, Ring>, pair: &Arc<Pair>) {
        let idx = self.bucket_index(pair.fullhash());
        self.buckets[idx].lock().retain(|p| !Arc::ptr_eq(p, pair));
        ring_guard.remove(pair);
        self.pending_list.lock().retain(|p| !Arc::ptr_eq(p, pair));
        pair.decay();
        self.num_pairs.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn evict_from_cachefile(&self, pair: &Arc<Pair>) {
        pair.cachefile().remove_pair(pair);
    }

    pub fn evict_completely(&self, ring_guard: &mut WpWriteGuard<'_, Ring>, pair: &Arc<Pair>) {
        self.evict_from_cachetable(ring_guard, pair);
        self.evict_from_cachefile(pair);
    }

    pub fn num_pairs(&self) -> usize {
        self.num_pairs.load(Ordering::Acquire)
    }

    /// Take the list write lock (spec §4.2 rule 2/3: never take it while
    /// holding a bucket mutex).
    pub fn list_write(&self) -> WpWriteGuard<'_, Ring> {
        self.ring.write()
    }

    pub fn list_read(&self) -> crate::sync::WpReadGuard<'_, Ring> {
        self.ring.read()
    }

    pub fn pending_expensive_write(&self) -> crate::sync::WpWriteGuard<'_, ()> {
        self.pending_expensive.write()
    }

    pub fn pending_expensive_read(&self) -> crate::sync::WpReadGuard<'_, ()> {
        self.pending_expensive.read()
    }

    pub fn pending_cheap_write(&self) -> crate::sync::WpWriteGuard<'_, ()> {
        self.pending_cheap.write()
    }

    pub fn pending_cheap_read(&self) -> crate::sync::WpReadGuard<'_, ()> {
        self.pending_cheap.read()
    }

    /// Current clock-head pair, without advancing (spec §4.4).
    pub fn clock_current(&self) -> Option<Arc<Pair>> {
        self.ring.read().clock_current()
    }

    pub fn advance_clock(&self, ring_guard: &mut WpWriteGuard<'_, Ring>) {
        ring_guard.advance_clock();
    }

    /// Up to 8 pairs starting at `cleaner_head` (spec §4.5).
    pub fn cleaner_window(&self) -> Vec<Arc<Pair>> {
        self.ring.read().cleaner_window(8)
    }

    pub fn advance_cleaner(&self, n: usize) {
        self.ring.write().advance_cleaner(n);
    }

    /// One full lap for `begin_checkpoint`'s pending-bit sweep (spec
    /// §4.6 step 3).
    pub fn checkpoint_sweep(&self) -> Vec<Arc<Pair>> {
        self.ring.read().full_lap_from_checkpoint_head()
    }

    pub fn add_pending(&self, pair: Arc<Pair>) {
        self.pending_list.lock().push(pair);
    }

    pub fn pop_pending(&self) -> Option<Arc<Pair>> {
        self.pending_list.lock().pop()
    }

    pub fn pending_is_empty(&self) -> bool {
        self.pending_list.lock().is_empty()
    }

    /// Move `pair` to the bucket `new_fullhash` maps to, and update its
    /// stored fullhash to match. Used by `openfd`'s reopen path once a
    /// reactivated cachefile is issued a fresh `hash_id` (spec supplement
    /// §4: every pair on that cachefile's chain must be rehashed since
    /// `fullhash` is derived from `hash_id`). Never takes the list lock
    /// (rule 2: bucket mutex and list lock are never held together by the
    /// same thread in a way that would require the reverse order) -- it
    /// only ever holds one bucket mutex at a time.
    pub fn rehash_pair(&self, pair: &Arc<Pair>, new_fullhash: u32) {
        let old_idx = self.bucket_index(pair.fullhash());
        let new_idx = self.bucket_index(new_fullhash);
        if old_idx == new_idx {
            pair.set_fullhash(new_fullhash);
            return;
        }
        let mut old_bucket = self.buckets[old_idx].lock();
        if let Some(pos) = old_bucket.iter().position(|p| Arc::ptr_eq(p, pair)) {
            old_bucket.remove(pos);
        }
        drop(old_bucket);
        pair.set_fullhash(new_fullhash);
        self.buckets[new_idx].lock().insert(0, pair.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cachefile::{Cachefile, CachefileCallbacks};
    use crate::pair::attr::PairAttr;
    use crate::pair::callbacks::{FlushContext, PairValue};
    use crate::Result;

    struct NoopCallbacks;
    impl CachefileCallbacks for NoopCallbacks {}

    struct TestValue(i64);
    impl PairValue for TestValue {
        fn flush(&self, _ctx: &FlushContext) -> Result<PairAttr> {
            Ok(PairAttr::new(self.0))
        }
    }

    fn make_cachefile() -> Arc<Cachefile> {
        Cachefile::new(1, 1, "t.db".into(), 1, Box::new(NoopCallbacks))
    }

    #[test]
    fn put_then_find_then_evict() {
        let list = PairList::new(16, 16);
        let cf = make_cachefile();
        let pair = Arc::new(Pair::new(
            &cf,
            7,
            crate::cachefile::fullhash_of(cf.hash_id(), 7),
            Box::new(TestValue(3)),
            PairAttr::new(3),
            true,
        ));

        {
            let mut guard = list.list_write();
            list.put(&mut guard, pair.clone());
        }
        assert_eq!(list.num_pairs(), 1);
        assert!(Arc::ptr_eq(&list.find_pair(&cf, 7, pair.fullhash()).unwrap(), &pair));

        {
            let mut guard = list.list_write();
            list.evict_completely(&mut guard, &pair);
        }
        assert_eq!(list.num_pairs(), 0);
        assert!(list.find_pair(&cf, 7, pair.fullhash()).is_none());
    }

    #[test]
    fn ring_cursors_stay_consistent_across_many_removes() {
        let list = PairList::new(16, 16);
        let cf = make_cachefile();
        let mut pairs = Vec::new();
        {
            let mut guard = list.list_write();
            for key in 0..20u64 {
                let pair = Arc::new(Pair::new(
                    &cf,
                    key,
                    crate::cachefile::fullhash_of(cf.hash_id(), key),
                    Box::new(TestValue(10)),
                    PairAttr::new(10),
                    false,
                ));
                list.put(&mut guard, pair.clone());
                pairs.push(pair);
            }
        }
        assert_eq!(list.num_pairs(), 20);

        // Remove every third pair and make sure the clock cursor never
        // dangles (i.e. clock_current always resolves or the ring is
        // legitimately empty).
        {
            let mut guard = list.list_write();
            for pair in pairs.iter().step_by(3) {
                list.evict_completely(&mut guard, pair);
            }
        }
        assert!(list.num_pairs() > 0);
        assert!(list.clock_current().is_some());
    }

    #[test]
    fn cleaner_window_never_exceeds_eight() {
        let list = PairList::new(16, 16);
        let cf = make_cachefile();
        {
            let mut guard = list.list_write();
            for key in 0..20u64 {
                let pair = Arc::new(Pair::new(
                    &cf,
                    key,
                    crate::cachefile::fullhash_of(cf.hash_id(), key),
                    Box::new(TestValue(1)),
                    PairAttr::new(1),
                    false,
                ));
                list.put(&mut guard, pair);
            }
        }
        assert_eq!(list.cleaner_window().len(), 8);
    }
}
