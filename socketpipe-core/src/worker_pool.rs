//! Dedicated worker scheduler (C4)
//!
//! A fixed pool of OS threads servicing one FIFO queue of boxed closures,
//! with bounded overflow spillover to the ambient `compio` runtime (spec
//! §4.4). Used by [`crate::scheduler::Scheduler::Dedicated`] to run I/O
//! callbacks off the reactor thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<std::collections::VecDeque<Job>>,
    not_empty: Condvar,
    disposed: AtomicBool,
    overflow_threshold: usize,
    serviced_by_queue: AtomicU64,
    overflowed_to_system: AtomicU64,
}

/// Fixed-size worker thread pool with FIFO scheduling and overflow
/// spillover.
pub struct WorkerPool {
    pool_id: usize,
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

thread_local! {
    static CURRENT_POOL_ID: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

fn next_pool_id() -> usize {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed) as usize
}

impl WorkerPool {
    /// Spawn `worker_count` threads (minimum 1). `overflow_threshold`
    /// caps the queue depth before new work spills to the system
    /// scheduler instead of being enqueued here.
    #[must_use]
    pub fn new(worker_count: usize, overflow_threshold: usize) -> Arc<Self> {
        let pool_id = next_pool_id();
        let shared = Arc::new(Shared {
            queue: Mutex::new(std::collections::VecDeque::new()),
            not_empty: Condvar::new(),
            disposed: AtomicBool::new(false),
            overflow_threshold,
            serviced_by_queue: AtomicU64::new(0),
            overflowed_to_system: AtomicU64::new(0),
        });

        let worker_count = worker_count.max(1);
        let mut handles = Vec::with_capacity(worker_count);
        for idx in 0..worker_count {
            let shared = Arc::clone(&shared);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("socketpipe-worker-{pool_id}-{idx}"))
                    .spawn(move || Self::worker_loop(&shared, pool_id))
                    .expect("failed to spawn worker thread"),
            );
        }

        Arc::new(Self {
            pool_id,
            shared,
            handles: Mutex::new(handles),
        })
    }

    fn worker_loop(shared: &Shared, pool_id: usize) {
        CURRENT_POOL_ID.with(|c| c.set(Some(pool_id)));
        loop {
            let job = {
                let mut queue = shared.queue.lock();
                loop {
                    if let Some(job) = queue.pop_front() {
                        break Some(job);
                    }
                    if shared.disposed.load(Ordering::Acquire) {
                        break None;
                    }
                    shared.not_empty.wait(&mut queue);
                }
            };
            match job {
                Some(job) => {
                    shared.serviced_by_queue.fetch_add(1, Ordering::Relaxed);
                    job();
                }
                None => break,
            }
        }
    }

    /// Enqueue `job` on this pool, or spill it to the system scheduler if
    /// the pool is disposed or its queue is at/over the overflow
    /// threshold.
    pub fn schedule(&self, job: impl FnOnce() + Send + 'static) {
        if self.shared.disposed.load(Ordering::Acquire) {
            self.spill(job);
            return;
        }
        let mut queue = self.shared.queue.lock();
        if queue.len() >= self.shared.overflow_threshold {
            drop(queue);
            self.spill(job);
            return;
        }
        queue.push_back(Box::new(job));
        drop(queue);
        self.shared.not_empty.notify_one();
    }

    fn spill(&self, job: impl FnOnce() + Send + 'static) {
        self.shared
            .overflowed_to_system
            .fetch_add(1, Ordering::Relaxed);
        compio::runtime::spawn(async move { job() }).detach();
    }

    /// Flag the pool as disposed and wake every waiting worker; workers
    /// exit once the queue drains (or immediately, if already empty).
    pub fn dispose(&self) {
        self.shared.disposed.store(true, Ordering::Release);
        self.shared.not_empty.notify_all();
    }

    /// Join every worker thread. Intended for graceful shutdown paths in
    /// tests; does not itself call [`Self::dispose`].
    pub fn join(&self) {
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }

    /// `true` iff the current thread is one of this pool's workers.
    #[must_use]
    pub fn is_current_thread_worker(&self) -> bool {
        CURRENT_POOL_ID.with(|c| c.get()) == Some(self.pool_id)
    }

    /// Total jobs serviced directly by a worker thread (not spilled).
    #[must_use]
    pub fn serviced_by_queue(&self) -> u64 {
        self.shared.serviced_by_queue.load(Ordering::Relaxed)
    }

    /// Total jobs spilled to the system scheduler.
    #[must_use]
    pub fn overflowed_to_system(&self) -> u64 {
        self.shared.overflowed_to_system.load(Ordering::Relaxed)
    }

    /// Approximate current queue depth.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn jobs_run_on_worker_threads() {
        let pool = WorkerPool::new(2, 1024);
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            pool.schedule(move || tx.send(i).unwrap());
        }
        drop(tx);
        let mut got: Vec<_> = rx.iter().collect();
        got.sort_unstable();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
        assert_eq!(pool.serviced_by_queue(), 8);
    }

    #[test]
    fn dispose_drains_then_stops() {
        let pool = WorkerPool::new(1, 1024);
        pool.dispose();
        assert_eq!(pool.queue_depth(), 0);
    }
}
