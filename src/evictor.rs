// Evictor (spec §4.4, component C4): background thread + worker pool
// dispatch, size accounting, watermark enforcement, CLOCK replacement
// with partial eviction, cache-pressure cooperation with client threads.

use crate::cachefile::CachefileList;
use crate::config::CacheTableConfig;
use crate::pair::attr::EvictionCost;
use crate::pair::callbacks::FlushContext;
use crate::pair::Pair;
use crate::pair_list::PairList;
use crate::status::{Counter, StatusSink};
use crate::worker_pool::WorkerPool;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace};

/// Everything serialized by the single `ev_thread_lock` (spec §4.4: "the
/// evictor thread and client-triggered evictions share a single
/// `ev_thread_lock` that serializes updates to `size_evicting`, the
/// pressure cond-var, and the number of sleepers").
struct EvictorState {
    size_current: i64,
    size_evicting: i64,
    size_cloned_data: i64,
    size_reserved: i64,
    num_sleepers: u32,
}

pub struct Evictor {
    pair_list: Arc<PairList>,
    cachefile_list: Arc<CachefileList>,
    config: CacheTableConfig,
    status: Arc<dyn StatusSink>,
    pool: Arc<WorkerPool>,
    state: Mutex<EvictorState>,
    pressure_cond: Condvar,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    self_weak: Weak<Evictor>,
}

impl Evictor {
    pub fn new(
        pair_list: Arc<PairList>,
        cachefile_list: Arc<CachefileList>,
        config: CacheTableConfig,
        status: Arc<dyn StatusSink>,
        pool: Arc<WorkerPool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            pair_list,
            cachefile_list,
            config,
            status,
            pool,
            state: Mutex::new(EvictorState {
                size_current: 0,
                size_evicting: 0,
                size_cloned_data: 0,
                size_reserved: 0,
                num_sleepers: 0,
            }),
            pressure_cond: Condvar::new(),
            running: AtomicBool::new(false),
            thread: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    pub fn size_current(&self) -> i64 {
        self.state.lock().size_current
    }

    pub fn size_evicting(&self) -> i64 {
        self.state.lock().size_evicting
    }

    pub fn size_cloned_data(&self) -> i64 {
        self.state.lock().size_cloned_data
    }

    /// Applied by `put`/`unpin`/clone bookkeeping whenever a pair's
    /// accounted size changes (spec §3: "`size_current` best-effort sum
    /// of all `attr.size` plus clone sizes and any reserved memory").
    pub fn apply_size_delta(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        let mut s = self.state.lock();
        s.size_current += delta;
    }

    pub fn apply_cloned_size_delta(&self, delta: i64) {
        let mut s = self.state.lock();
        s.size_cloned_data += delta;
        s.size_current += delta;
    }

    pub fn reserve_memory(&self, fraction: f64, upper_bound: i64) -> i64 {
        let mut s = self.state.lock();
        let low = self.config.low_size_watermark() as i64;
        let available = (low - s.size_reserved).max(0);
        let amount = ((fraction * available as f64) as i64).min(upper_bound).max(0);
        s.size_reserved += amount;
        s.size_current += amount;
        amount
    }

    pub fn release_reserved_memory(&self, amount: i64) {
        let mut s = self.state.lock();
        s.size_reserved -= amount;
        s.size_current -= amount;
        drop(s);
        self.pressure_cond.notify_all();
    }

    /// Spin up the background eviction thread. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let me = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("cachetable-evictor".into())
            .spawn(move || {
                while me.running.load(Ordering::Acquire) {
                    me.tick();
                    std::thread::sleep(me.config.eviction_period);
                }
            })
            .expect("failed to spawn evictor thread");
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

    /// One pass of the eviction algorithm (spec §4.4). Runs on the
    /// evictor's own thread, but is also exposed for client threads that
    /// just pushed the table over watermark to drive inline progress.
    pub fn tick(&self) {
        if let Some(pair) = self.cachefile_list.evict_one_stale_pair() {
            self.finish_eviction_accounting(&pair);
            self.status.incr(Counter::EvictionsTotal);
        }

        let low_watermark = self.config.low_size_watermark() as i64;
        let mut examined_without_eviction = 0usize;
        let table_population = self.pair_list.num_pairs().max(1);

        loop {
            let over_watermark = {
                let s = self.state.lock();
                s.size_current - s.size_evicting > low_watermark
            };
            if !over_watermark {
                break;
            }
            if examined_without_eviction > table_population {
                // Anti-livelock (spec §4.4): tolerate overflow this tick
                // rather than spin forever.
                trace!("evictor anti-livelock triggered, ending tick early");
                break;
            }

            let Some(candidate) = self.pair_list.clock_current() else {
                break;
            };
            let evicted = self.try_evict_or_decay(&candidate);
            {
                let mut guard = self.pair_list.list_write();
                self.pair_list.advance_clock(&mut guard);
            }
            if evicted {
                examined_without_eviction = 0;
            } else {
                examined_without_eviction += 1;
            }
        }

        self.broadcast_if_pressure_subsided();
    }

    /// Per-pair clock-replacement decision (spec §4.4). Returns `true`
    /// if the pair was evicted (fully or had a synchronous partial
    /// eviction) this call.
    fn try_evict_or_decay(&self, pair: &Arc<Pair>) -> bool {
        if pair.value().users() > 0 || pair.refcount() > 0 || !pair.disk_lock.has_no_users() {
            return false;
        }

        if pair.count() > 0 {
            let curr_size = pair.attr().size;
            let n_pairs = self.pair_list.num_pairs().max(1) as i64;
            let avg_size = (self.size_current() / n_pairs).max(1);
            let is_big = curr_size.saturating_mul(n_pairs) >= self.size_current();
            let should_decay = if is_big {
                true
            } else {
                let threshold = ((curr_size.max(0) as u128 * u16::MAX as u128) / avg_size.max(1) as u128)
                    .min(u16::MAX as u128) as u16;
                let roll: u16 = rand::rng().random();
                roll < threshold
            };
            if should_decay {
                pair.decay();
            }

            let Some(mut write_guard) = pair.value().try_write_lock(false) else {
                return false;
            };
            let (est, cost) = write_guard.partial_eviction_est();
            match cost {
                EvictionCost::Cheap => {
                    let old_attr = pair.attr();
                    let new_attr = write_guard.partial_eviction(old_attr);
                    drop(write_guard);
                    self.apply_size_delta((new_attr.size - old_attr.size).max(i64::MIN));
                    pair.set_attr(new_attr);
                    self.status.incr(Counter::PartialEvictionsTotal);
                    true
                }
                EvictionCost::Expensive if est > 0 => {
                    self.state.lock().size_evicting += est;
                    let pool_pair = Arc::clone(pair);
                    let evictor = self.self_weak.clone();
                    drop(write_guard);
                    self.pool.submit(move || {
                        let Some(mut write_guard) = pool_pair.value().try_write_lock(true) else {
                            return;
                        };
                        let old_attr = pool_pair.attr();
                        let new_attr = write_guard.partial_eviction(old_attr);
                        drop(write_guard);
                        pool_pair.set_attr(new_attr);
                        if let Some(evictor) = evictor.upgrade() {
                            let mut s = evictor.state.lock();
                            s.size_current += new_attr.size - old_attr.size;
                            s.size_evicting = s.size_evicting.saturating_sub(est);
                            drop(s);
                            evictor.status.incr(Counter::PartialEvictionsTotal);
                        }
                    });
                    false
                }
                EvictionCost::Expensive => false,
            }
        } else {
            self.evict_count_zero_pair(pair)
        }
    }

    fn evict_count_zero_pair(&self, pair: &Arc<Pair>) -> bool {
        let Some(write_guard) = pair.value().try_write_lock(false) else {
            return false;
        };

        if !pair.is_dirty() && pair.disk_lock.has_no_users() {
            drop(write_guard);
            let mut ring_guard = self.pair_list.list_write();
            self.pair_list.evict_completely(&mut ring_guard, pair);
            drop(ring_guard);
            self.finish_eviction_accounting(pair);
            self.status.incr(Counter::EvictionsTotal);
            return true;
        }

        drop(write_guard);
        let size = pair.attr().size;
        self.state.lock().size_evicting += size;
        let pair = Arc::clone(pair);
        self.dispatch_full_eviction(pair);
        false
    }

    fn dispatch_full_eviction(&self, pair: Arc<Pair>) {
        let pair_list = Arc::clone(&self.pair_list);
        let evictor = self.self_weak.clone();
        self.pool.submit(move || {
            let mut write_guard = pair.value().write_lock(true);
            if pair.is_dirty() {
                let _disk = pair.disk_lock.write();
                let ctx = FlushContext {
                    filenum: pair.filenum(),
                    key: pair.key,
                    old_attr: pair.attr(),
                    do_write: true,
                    keep: false,
                    for_checkpoint: false,
                    is_clone: false,
                };
                if let Ok(new_attr) = write_guard.flush(&ctx) {
                    if new_attr.is_valid {
                        pair.set_attr(new_attr);
                    }
                }
                pair.set_dirty(false);
            }
            drop(write_guard);
            let mut ring_guard = pair_list.list_write();
            pair_list.evict_completely(&mut ring_guard, &pair);
            drop(ring_guard);
            if let Some(evictor) = evictor.upgrade() {
                evictor.finish_eviction_accounting(&pair);
                evictor.status.incr(Counter::EvictionsTotal);
            }
        });
    }

    fn finish_eviction_accounting(&self, pair: &Arc<Pair>) {
        let size = pair.attr().size;
        let mut s = self.state.lock();
        s.size_current -= size;
        if s.size_evicting >= size {
            s.size_evicting -= size;
        } else {
            s.size_evicting = 0;
        }
    }

    fn broadcast_if_pressure_subsided(&self) {
        let high_hysteresis = self.config.high_size_hysteresis() as i64;
        let s = self.state.lock();
        let should_wake = s.size_current <= high_hysteresis || s.num_sleepers > 0;
        drop(s);
        if should_wake {
            self.pressure_cond.notify_all();
        }
    }

    /// Client-path cooperation (spec §4.4: "a client call that pushes
    /// `size_current` above `high_size_watermark` calls
    /// `wait_for_cache_pressure_to_subside`"). Sleeps at most until the
    /// evictor broadcasts, per `get_and_pin`'s "at most once per call"
    /// contract enforced by the caller.
    pub fn wait_for_cache_pressure_to_subside(&self) {
        let high_watermark = self.config.high_size_watermark() as i64;
        let mut s = self.state.lock();
        if s.size_current <= high_watermark {
            return;
        }
        s.num_sleepers += 1;
        self.status.incr(Counter::CachePressureWaitsTotal);
        debug!("client thread sleeping on cache pressure");
        let high_hysteresis = self.config.high_size_hysteresis() as i64;
        self.pressure_cond.wait_for(&mut s, Duration::from_millis(250));
        if s.size_current > high_hysteresis {
            self.status.incr(Counter::LongWaitPressureTotal);
        }
        s.num_sleepers -= 1;
    }

    pub fn is_over_high_watermark(&self) -> bool {
        self.size_current() > self.config.high_size_watermark() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cachefile::{Cachefile, CachefileCallbacks};
    use crate::pair::attr::PairAttr;
    use crate::pair::callbacks::PairValue;
    use crate::status::AtomicStatusSink;
    use crate::Result;

    struct NoopCallbacks;
    impl CachefileCallbacks for NoopCallbacks {}

    struct TestValue(i64);
    impl PairValue for TestValue {
        fn flush(&self, _ctx: &FlushContext) -> Result<PairAttr> {
            Ok(PairAttr::new(self.0))
        }
    }

    fn new_evictor(size_limit: u64) -> (Arc<Evictor>, Arc<PairList>, Arc<Cachefile>) {
        let config = CacheTableConfig::new(size_limit);
        let pair_list = Arc::new(PairList::new(16, 16));
        let cf_list = Arc::new(CachefileList::new());
        let cf = Cachefile::new(1, 1, "t.db".into(), 1, Box::new(NoopCallbacks));
        cf_list.insert_active(cf.clone());
        let pool = Arc::new(WorkerPool::new("test-evictor-pool", 2));
        let evictor = Evictor::new(pair_list.clone(), cf_list, config, AtomicStatusSink::new(), pool);
        (evictor, pair_list, cf)
    }

    #[test]
    fn clean_count_zero_pair_evicts_inline() {
        let (evictor, pair_list, cf) = new_evictor(100);
        let pair = Arc::new(Pair::new(
            &cf,
            1,
            crate::cachefile::fullhash_of(cf.hash_id(), 1),
            Box::new(TestValue(10)),
            PairAttr::new(10),
            false,
        ));
        for _ in 0..20 {
            pair.decay();
        }
        {
            let mut guard = pair_list.list_write();
            pair_list.put(&mut guard, pair.clone());
        }
        evictor.apply_size_delta(10);

        assert!(evictor.try_evict_or_decay(&pair));
        assert_eq!(pair_list.num_pairs(), 0);
    }

    #[test]
    fn pair_with_users_is_skipped() {
        let (evictor, pair_list, cf) = new_evictor(100);
        let pair = Arc::new(Pair::new(
            &cf,
            1,
            crate::cachefile::fullhash_of(cf.hash_id(), 1),
            Box::new(TestValue(10)),
            PairAttr::new(10),
            false,
        ));
        {
            let mut guard = pair_list.list_write();
            pair_list.put(&mut guard, pair.clone());
        }
        let _held = pair.value().read_lock();
        assert!(!evictor.try_evict_or_decay(&pair));
        assert_eq!(pair_list.num_pairs(), 1);
    }

    #[test]
    fn reserve_and_release_memory_round_trips() {
        let (evictor, _pair_list, _cf) = new_evictor(1_000_000);
        let before = evictor.size_current();
        let reserved = evictor.reserve_memory(0.5, 1_000);
        assert!(reserved > 0);
        assert_eq!(evictor.size_current(), before + reserved);
        evictor.release_reserved_memory(reserved);
        assert_eq!(evictor.size_current(), before);
    }
}
