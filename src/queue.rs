//! Bounded multi-producer multi-consumer task queue.
//!
//! Backs both the event loop's cross-thread task injection and the worker
//! pool. Closing the queue refuses new work but never drops what is
//! already queued; consumers keep draining until empty.

use crate::lock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Opaque unit of deferred work. Both the loop's injection queue and the
/// worker pool move these across threads.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Thread-safe FIFO queue with an optional capacity bound.
pub struct SafeQueue<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
    closed: AtomicBool,
    capacity: usize,
}

impl<T> SafeQueue<T> {
    /// Create a queue. `capacity` of 0 means unbounded.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
            capacity,
        }
    }

    /// Append an item and wake one waiter. Returns `false` when the queue
    /// is closed or full.
    pub fn push(&self, item: T) -> bool {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return false;
        }
        if self.capacity > 0 && inner.items.len() >= self.capacity {
            return false;
        }
        inner.items.push_back(item);
        self.ready.notify_one();
        true
    }

    /// Pop the head item, waiting if the queue is empty.
    ///
    /// `None` as the timeout waits until an item arrives or the queue
    /// closes. `Some(Duration::ZERO)` is a non-blocking poll. Any wait
    /// returns promptly when [`close`](Self::close) is called; items
    /// still queued at close time are returned before `None`.
    pub fn pop_wait(&self, timeout: Option<Duration>) -> Option<T> {
        let mut inner = lock(&self.inner);
        match timeout {
            None => {
                while inner.items.is_empty() && !inner.closed {
                    inner = self
                        .ready
                        .wait(inner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
            Some(wait) if !wait.is_zero() => {
                let deadline = Instant::now() + wait;
                while inner.items.is_empty() && !inner.closed {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    inner = self
                        .ready
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
            Some(_) => {}
        }
        inner.items.pop_front()
    }

    /// Close the queue: no further pushes succeed, all waiters wake.
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut inner = lock(&self.inner);
        inner.closed = true;
        self.ready.notify_all();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current number of queued items.
    pub fn size(&self) -> usize {
        lock(&self.inner).items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let q = SafeQueue::new(0);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(q.push(3));
        assert_eq!(q.pop_wait(Some(Duration::ZERO)), Some(1));
        assert_eq!(q.pop_wait(Some(Duration::ZERO)), Some(2));
        assert_eq!(q.pop_wait(Some(Duration::ZERO)), Some(3));
        assert_eq!(q.pop_wait(Some(Duration::ZERO)), None);
    }

    #[test]
    fn test_capacity_bound() {
        let q = SafeQueue::new(2);
        assert!(q.push('a'));
        assert!(q.push('b'));
        assert!(!q.push('c'));
        assert_eq!(q.size(), 2);
        q.pop_wait(Some(Duration::ZERO));
        assert!(q.push('c'));
    }

    #[test]
    fn test_nonblocking_pop_on_empty() {
        let q: SafeQueue<u8> = SafeQueue::new(0);
        let start = Instant::now();
        assert_eq!(q.pop_wait(Some(Duration::ZERO)), None);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_bounded_wait_times_out() {
        let q: SafeQueue<u8> = SafeQueue::new(0);
        let start = Instant::now();
        assert_eq!(q.pop_wait(Some(Duration::from_millis(50))), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_infinite_wait_unblocked_by_push() {
        let q = Arc::new(SafeQueue::new(0));
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                q.push(99u32);
            })
        };
        assert_eq!(q.pop_wait(None), Some(99));
        producer.join().unwrap();
    }

    #[test]
    fn test_close_wakes_infinite_wait() {
        let q: Arc<SafeQueue<u8>> = Arc::new(SafeQueue::new(0));
        let closer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                q.close();
            })
        };
        let start = Instant::now();
        assert_eq!(q.pop_wait(None), None);
        assert!(start.elapsed() < Duration::from_secs(5));
        closer.join().unwrap();
    }

    #[test]
    fn test_close_drains_pending() {
        let q = SafeQueue::new(0);
        q.push(1);
        q.push(2);
        q.close();
        assert!(!q.push(3));
        assert_eq!(q.pop_wait(None), Some(1));
        assert_eq!(q.pop_wait(None), Some(2));
        assert_eq!(q.pop_wait(None), None);
    }

    #[test]
    fn test_close_idempotent() {
        let q: SafeQueue<u8> = SafeQueue::new(0);
        q.close();
        q.close();
        assert!(q.is_closed());
    }
}
