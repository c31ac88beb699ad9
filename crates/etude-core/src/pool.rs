// src/pool.rs
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Queue {
    tasks: VecDeque<Task>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    ready: Condvar,
}

/// Fixed set of named threads draining a FIFO of boxed tasks.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let mut workers = Vec::with_capacity(threads);

        for i in 0..threads {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("etude-worker-{}", i))
                .spawn(move || worker_loop(&shared))?;
            workers.push(handle);
        }
        debug!(threads, "worker pool started");

        Ok(Self { shared, workers })
    }

    /// Queue a task and wake one idle worker. Tasks submitted after
    /// [`shutdown`](Self::shutdown) are dropped.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.lock();
            if queue.closed {
                return;
            }
            queue.tasks.push_back(Box::new(task));
        }
        self.shared.ready.notify_one();
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Tasks waiting for a worker.
    pub fn pending(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Stop accepting work, let the workers drain the queue, then join them.
    pub fn shutdown(&mut self) {
        self.lock().closed = true;
        self.shared.ready.notify_all();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread exited abnormally");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let task = {
            let mut queue = shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                if queue.closed {
                    return;
                }
                queue = shared
                    .ready
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!(
                thread = thread::current().name().unwrap_or("?"),
                "task panicked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_runs_every_task() {
        let mut pool = WorkerPool::new(4).unwrap();
        assert_eq!(pool.threads(), 4);

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let count = Arc::clone(&count);
            pool.submit(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_worker_names() {
        let pool = WorkerPool::new(1).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.submit(move || {
            let _ = tx.send(thread::current().name().map(str::to_owned));
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("etude-worker-0"));
    }

    #[test]
    fn test_survives_panicking_task() {
        let pool = WorkerPool::new(1).unwrap();
        pool.submit(|| panic!("boom"));

        let (tx, rx) = mpsc::channel();
        pool.submit(move || {
            let _ = tx.send(7);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn test_submit_after_shutdown_is_dropped() {
        let mut pool = WorkerPool::new(2).unwrap();
        pool.shutdown();
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        pool.submit(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(pool.pending(), 0);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
