//! Bounded worker pool for background jobs and query fan-out

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Queued submissions beyond the worker count
const SUBMIT_QUEUE_DEPTH: usize = 128;

/// Workers exit after this long without work and are respawned on demand
const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    name: String,
    receiver: Receiver<Task>,
    live_workers: AtomicUsize,
    shutdown: AtomicBool,
}

/// Fixed-capacity worker pool
///
/// Submissions beyond the queue depth are rejected and counted rather than
/// blocking the caller; a panicking task kills only its own run, not the
/// worker.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    sender: Sender<Task>,
    capacity: usize,
    rejected: AtomicU64,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Pool with `capacity` workers
    pub fn new(name: &str, capacity: usize) -> Self {
        let (sender, receiver) = bounded::<Task>(SUBMIT_QUEUE_DEPTH);
        let shared = Arc::new(PoolShared {
            name: name.to_string(),
            receiver,
            live_workers: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });
        Self {
            shared,
            sender,
            capacity,
            rejected: AtomicU64::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Submit a task; returns whether it was accepted
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.shutdown.load(Ordering::Acquire) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.ensure_worker();
        match self.sender.try_send(Box::new(task)) {
            Ok(()) => true,
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Submissions rejected because the queue was full or the pool shut down
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Workers currently alive
    pub fn live_workers(&self) -> usize {
        self.shared.live_workers.load(Ordering::Acquire)
    }

    /// Stop accepting work and wait for running tasks to finish
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
    }

    /// Spawn a worker if the pool is below capacity
    fn ensure_worker(&self) {
        let live = self.shared.live_workers.load(Ordering::Acquire);
        if live >= self.capacity {
            return;
        }
        if self
            .shared
            .live_workers
            .compare_exchange(live, live + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name(shared.name.clone())
            .spawn(move || {
                loop {
                    if shared.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    match shared.receiver.recv_timeout(WORKER_IDLE_TIMEOUT) {
                        Ok(task) => {
                            // panic isolation is per task
                            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(task))
                                .is_err()
                            {
                                warn!(pool = %shared.name, "worker task panicked");
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                shared.live_workers.fetch_sub(1, Ordering::AcqRel);
            });
        match spawned {
            Ok(handle) => self.handles.lock().push(handle),
            Err(e) => {
                self.shared.live_workers.fetch_sub(1, Ordering::AcqRel);
                warn!(pool = %self.shared.name, error = %e, "spawn worker failure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_tasks_run() {
        let pool = WorkerPool::new("test", 2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            assert!(pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 10 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_panic_does_not_poison_pool() {
        let pool = WorkerPool::new("test", 1);
        assert!(pool.submit(|| panic!("boom")));
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        assert!(pool.submit(move || {
            flag.store(1, Ordering::SeqCst);
        }));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rejects_after_shutdown() {
        let pool = WorkerPool::new("test", 1);
        pool.shutdown();
        assert!(!pool.submit(|| {}));
        assert_eq!(pool.rejected(), 1);
    }
}
