// Kibbutz: a fixed-size worker pool draining a lock-free FIFO queue,
// grounded on the teacher's `core::WorkerPool` (`SegQueue<Task>` +
// a small thread-per-worker loop). Two instances of this exist in a
// running `CacheTable`: the cachetable pool (sized `2 * hw_threads`) and
// the checkpoint pool (sized `max(hw_threads / 4, 1)`), per spec §5.

use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
pub struct WorkerPoolStats {
    pub tasks_queued: AtomicU64,
    pub tasks_executed: AtomicU64,
}

pub struct WorkerPool {
    queue: Arc<SegQueue<Task>>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<std::thread::JoinHandle<()>>,
    stats: Arc<WorkerPoolStats>,
}

impl WorkerPool {
    pub fn new(name: &str, num_workers: usize) -> Self {
        let num_workers = num_workers.max(1);
        let queue: Arc<SegQueue<Task>> = Arc::new(SegQueue::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(WorkerPoolStats::default());

        let handles = (0..num_workers)
            .map(|idx| {
                let queue = Arc::clone(&queue);
                let shutdown = Arc::clone(&shutdown);
                let stats = Arc::clone(&stats);
                std::thread::Builder::new()
                    .name(format!("{name}-{idx}"))
                    .spawn(move || {
                        while !shutdown.load(Ordering::Relaxed) {
                            match queue.pop() {
                                Some(task) => {
                                    task();
                                    stats.tasks_executed.fetch_add(1, Ordering::Relaxed);
                                }
                                None => std::thread::sleep(Duration::from_micros(100)),
                            }
                        }
                        // Drain whatever is left so in-flight work still
                        // completes before the pool is torn down.
                        while let Some(task) = queue.pop() {
                            task();
                            stats.tasks_executed.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            queue,
            shutdown,
            handles,
            stats,
        }
    }

    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.push(Box::new(task));
        self.stats.tasks_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> Arc<WorkerPoolStats> {
        Arc::clone(&self.stats)
    }

    /// Stop accepting new ticks and join every worker thread. Any tasks
    /// already queued are drained first (see the worker loop above).
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// `hw_threads = num_cpus::get()`, per spec §5. `num_cpus::get()` walks
/// `/proc` or calls into the OS on every invocation, and both pool sizes
/// below are read once per `CacheTable` construction and never change
/// afterward, so it's memoized the way the teacher memoizes its own
/// process-wide constant tables.
static HW_THREADS: once_cell::sync::Lazy<usize> = once_cell::sync::Lazy::new(|| num_cpus::get().max(1));

pub fn hw_threads() -> usize {
    *HW_THREADS
}

pub fn cachetable_pool_size() -> usize {
    2 * hw_threads()
}

pub fn checkpoint_pool_size() -> usize {
    (hw_threads() / 4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn submitted_tasks_all_run() {
        let pool = WorkerPool::new("test-pool", 4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        let mut waited = Duration::ZERO;
        while counter.load(Ordering::SeqCst) < 100 && waited < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }
}
