//! Fixed-size worker pool draining a shared task queue.
//!
//! Workers never unwind out of a task: a panic is logged and the worker
//! moves on to the next item. Closing the pool refuses new submissions
//! while queued work keeps draining; `join` then waits for the workers.

use crate::lock;
use crate::queue::{SafeQueue, Task};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

/// Pool of worker threads fed from a [`SafeQueue`] of tasks.
pub struct ThreadPool {
    queue: Arc<SafeQueue<Task>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ThreadPool {
    /// Spawn `workers` threads. `queue_capacity` of 0 leaves the task
    /// queue unbounded.
    pub fn new(workers: usize, queue_capacity: usize) -> io::Result<Self> {
        let workers = workers.max(1);
        let queue = Arc::new(SafeQueue::new(queue_capacity));
        let mut threads = Vec::with_capacity(workers);
        for i in 0..workers {
            let queue = Arc::clone(&queue);
            let handle = std::thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || worker_loop(&queue))?;
            threads.push(handle);
        }
        debug!(workers, "worker pool started");
        Ok(Self {
            queue,
            threads: Mutex::new(threads),
            closed: AtomicBool::new(false),
        })
    }

    /// Queue a task for execution. Returns `false` when the pool is
    /// closed or the queue is full.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.queue.push(Box::new(task))
    }

    /// Stop accepting tasks and wake idle workers. Queued tasks still
    /// run. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.close();
    }

    /// Wait for every worker to finish. Must follow [`close`](Self::close);
    /// joining an open pool would never return, so it is closed first.
    pub fn join(&self) {
        if !self.closed.load(Ordering::SeqCst) {
            warn!("join called on an open pool; closing it first");
            self.close();
        }
        let mut threads = lock(&self.threads);
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }

    /// Number of tasks waiting to be picked up.
    pub fn pending(&self) -> usize {
        self.queue.size()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.close();
        self.join();
        let remaining = self.queue.size();
        if remaining > 0 {
            warn!(remaining, "worker pool dropped with unprocessed tasks");
        }
    }
}

fn worker_loop(queue: &SafeQueue<Task>) {
    while let Some(task) = queue.pop_wait(None) {
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("worker task panicked");
        }
    }
}
