//! The reactor: one poller, one timer store, one idle manager, and one
//! cross-thread task queue per loop.
//!
//! Each loop runs on exactly one thread. Handlers and timer tasks run to
//! completion on that thread and must not block; the only suspension
//! point is the poll wait. Work arrives from other threads through
//! [`EventLoop::safe_call`], which enqueues a task and kicks the waker
//! registered with the poll.

use crate::clock::{now_ms, now_s};
use crate::config::NetConfig;
use crate::conn::ConnRef;
use crate::lock;
use crate::queue::{SafeQueue, Task};
use crate::reactor::channel::{Channel, Sock};
use crate::reactor::idle::{IdleCallback, IdleHandle, IdleManager};
use crate::reactor::poller::{Poller, Ready};
use crate::reactor::timer::{TimerId, TimerSlot, TimerStore};
use mio::{Registry, Token, Waker};
use slab::Slab;
use std::collections::HashMap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Token reserved for the loop's waker. Channel tokens are slab keys and
/// can never reach it.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// Longest a single poll wait may last, so an idle loop still comes up
/// for air periodically.
const MAX_POLL_WAIT_MS: i64 = 10_000;

struct LoopInner {
    poller: Mutex<Poller>,
    registry: Registry,
    waker: Waker,
    channels: Mutex<Slab<Arc<Channel>>>,
    timers: Mutex<TimerStore>,
    idle: Mutex<IdleManager>,
    idle_sweep_started: AtomicBool,
    tasks: SafeQueue<Task>,
    exited: AtomicBool,
    loop_thread: Mutex<Option<ThreadId>>,
    reconnects: Mutex<HashMap<i64, ConnRef>>,
}

/// Handle to a reactor loop. Clones share the same loop; every method is
/// callable from any thread unless noted.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        Self::with_config(&NetConfig::default())
    }

    pub fn with_config(config: &NetConfig) -> io::Result<Self> {
        let poller = Poller::new(config.max_poll_events)?;
        let registry = poller.registry()?;
        let waker = Waker::new(&registry, WAKER_TOKEN)?;
        Ok(Self {
            inner: Arc::new(LoopInner {
                poller: Mutex::new(poller),
                registry,
                waker,
                channels: Mutex::new(Slab::new()),
                timers: Mutex::new(TimerStore::new()),
                idle: Mutex::new(IdleManager::new()),
                idle_sweep_started: AtomicBool::new(false),
                tasks: SafeQueue::new(config.task_queue_capacity),
                exited: AtomicBool::new(false),
                loop_thread: Mutex::new(None),
                reconnects: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Drive the reactor until [`exit`](Self::exit). After the exit flag
    /// is observed one extra zero-timeout cycle drains tasks injected up
    /// to that point, then loop state is torn down and `run` returns.
    pub fn run(&self) {
        *lock(&self.inner.loop_thread) = Some(thread::current().id());
        debug!("event loop running");
        while !self.exited() {
            let delay = lock(&self.inner.timers).next_delay_ms(now_ms());
            if let Err(e) = self.run_once(delay.min(MAX_POLL_WAIT_MS)) {
                error!(error = %e, "poll wait failed");
            }
        }
        if let Err(e) = self.run_once(0) {
            error!(error = %e, "final drain failed");
        }
        self.teardown();
        debug!("event loop stopped");
    }

    /// One reactor cycle: wait for readiness (bounded by `max_wait_ms`
    /// and the earliest timer), dispatch handlers, then fire due timers.
    pub fn run_once(&self, max_wait_ms: i64) -> io::Result<()> {
        let delay = lock(&self.inner.timers).next_delay_ms(now_ms());
        let wait = delay.min(max_wait_ms).max(0);

        let mut ready: Vec<Ready> = Vec::new();
        {
            let mut poller = lock(&self.inner.poller);
            poller.wait(Duration::from_millis(wait as u64), &mut ready)?;
        }

        for ev in &ready {
            if ev.token == WAKER_TOKEN {
                self.drain_tasks();
                continue;
            }
            // The channel may have been closed by an earlier handler in
            // this same batch.
            let channel = lock(&self.inner.channels).get(ev.token.0).cloned();
            let Some(channel) = channel else { continue };
            if !ev.readable && !ev.writable {
                debug_assert!(false, "ready event with no readable/writable bits");
                error!(token = ev.token.0, "unexpected poll event");
                continue;
            }
            if ev.readable {
                channel.handle_read();
            }
            if ev.writable {
                // Readiness is edge-triggered: a combined edge must reach
                // both handlers or the write side stalls. The read
                // handler may have closed the channel meanwhile.
                let live = lock(&self.inner.channels)
                    .get(ev.token.0)
                    .map(|c| c.id() == channel.id())
                    .unwrap_or(false);
                if live {
                    channel.handle_write();
                }
            }
        }

        self.fire_timers();
        Ok(())
    }

    /// Schedule `task` at the absolute loop time `at_ms`. With
    /// `interval_ms > 0` the task repeats and the returned id carries a
    /// negated deadline. Returns [`TimerId::NONE`] once the loop has
    /// exited.
    pub fn run_at(
        &self,
        at_ms: i64,
        task: impl FnMut() + Send + 'static,
        interval_ms: i64,
    ) -> TimerId {
        if self.exited() {
            return TimerId::NONE;
        }
        let id = {
            let mut timers = lock(&self.inner.timers);
            if interval_ms > 0 {
                timers.schedule_repeating(at_ms, interval_ms, Box::new(task))
            } else {
                timers.schedule_once(at_ms, Box::new(task))
            }
        };
        // A foreign thread may have shortened the next deadline; re-arm
        // the in-progress wait.
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
        id
    }

    /// Schedule `task` after `delay_ms` milliseconds.
    pub fn run_after(
        &self,
        delay_ms: i64,
        task: impl FnMut() + Send + 'static,
        interval_ms: i64,
    ) -> TimerId {
        self.run_at(now_ms() + delay_ms.max(0), task, interval_ms)
    }

    /// Cancel a timer. True only when a live entry was removed; a timer
    /// whose task is currently executing is not cancellable.
    pub fn cancel(&self, id: TimerId) -> bool {
        lock(&self.inner.timers).cancel(id)
    }

    /// Run `task` on the loop thread, exactly once, in submission order.
    /// Safe from any thread.
    pub fn safe_call(&self, task: impl FnOnce() + Send + 'static) {
        if self.inner.tasks.push(Box::new(task)) {
            self.wakeup();
        } else {
            warn!("loop is not accepting tasks; dropping");
        }
    }

    /// Ask the loop to stop. Idempotent; safe from any thread.
    pub fn exit(&self) {
        if !self.inner.exited.swap(true, Ordering::SeqCst) {
            self.wakeup();
        }
    }

    pub fn exited(&self) -> bool {
        self.inner.exited.load(Ordering::SeqCst)
    }

    /// Break an in-progress poll wait.
    pub fn wakeup(&self) {
        if let Err(e) = self.inner.waker.wake() {
            error!(error = %e, "waker failed");
        }
    }

    /// Whether the caller is the thread driving [`run`](Self::run).
    pub fn is_in_loop_thread(&self) -> bool {
        *lock(&self.inner.loop_thread) == Some(thread::current().id())
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Create a channel for `sock` in this loop's table. The channel is
    /// not yet registered with the poll: install handlers first, then
    /// arm interest with `enable_read`/`enable_write`.
    pub(crate) fn add_channel(&self, sock: Sock) -> Arc<Channel> {
        let mut channels = lock(&self.inner.channels);
        let token = Token(channels.vacant_key());
        let channel = Arc::new(Channel::new(self.clone(), sock, token));
        let key = channels.insert(Arc::clone(&channel));
        debug_assert_eq!(key, token.0);
        channel
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        let mut channels = lock(&self.inner.channels);
        let token = channel.token().0;
        if let Some(existing) = channels.get(token) {
            if existing.id() == channel.id() {
                channels.remove(token);
            }
        }
    }

    pub(crate) fn register_idle(
        &self,
        timeout_s: u64,
        conn: &ConnRef,
        callback: IdleCallback,
    ) -> IdleHandle {
        let handle = lock(&self.inner.idle).register(timeout_s, conn, callback);
        self.ensure_idle_sweep();
        handle
    }

    pub(crate) fn update_idle(&self, handle: IdleHandle) {
        lock(&self.inner.idle).update(handle);
    }

    pub(crate) fn unregister_idle(&self, handle: IdleHandle) {
        lock(&self.inner.idle).unregister(handle);
    }

    /// Keep `conn` alive between reconnect attempts.
    pub(crate) fn hold_for_reconnect(&self, conn_id: i64, conn: ConnRef) {
        lock(&self.inner.reconnects).insert(conn_id, conn);
    }

    pub(crate) fn take_reconnect(&self, conn_id: i64) -> Option<ConnRef> {
        lock(&self.inner.reconnects).remove(&conn_id)
    }

    fn ensure_idle_sweep(&self) {
        if self.inner.idle_sweep_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        self.run_after(
            1000,
            move || {
                if let Some(inner) = weak.upgrade() {
                    EventLoop { inner }.sweep_idle();
                }
            },
            1000,
        );
    }

    fn sweep_idle(&self) {
        let fired = lock(&self.inner.idle).sweep(now_s());
        for (conn, callback) in fired {
            if let Some(conn) = conn.upgrade() {
                callback(&conn);
            }
        }
    }

    fn drain_tasks(&self) {
        while let Some(task) = self.inner.tasks.pop_wait(Some(Duration::ZERO)) {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("injected task panicked");
            }
        }
    }

    fn fire_timers(&self) {
        let due = lock(&self.inner.timers).take_due(now_ms());
        for (id, slot) in due {
            match slot {
                TimerSlot::Once(mut task) => {
                    if catch_unwind(AssertUnwindSafe(|| task())).is_err() {
                        error!("timer task panicked");
                    }
                }
                TimerSlot::Repeat(public) => {
                    // Reschedule off the previous deadline before running,
                    // with the task held out of the store meanwhile.
                    let task = lock(&self.inner.timers).begin_repeat_fire(public, id);
                    if let Some(mut task) = task {
                        if catch_unwind(AssertUnwindSafe(|| task())).is_err() {
                            error!("timer task panicked");
                        }
                        lock(&self.inner.timers).end_repeat_fire(public, task);
                    }
                }
            }
        }
    }

    /// Runs after the loop stops: pending tasks are dropped unrun, timer
    /// and idle state is cleared, reconnecting connections are released
    /// and remaining channels closed.
    fn teardown(&self) {
        self.inner.tasks.close();
        let mut dropped = 0usize;
        while self.inner.tasks.pop_wait(Some(Duration::ZERO)).is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "tasks dropped at loop teardown");
        }
        lock(&self.inner.timers).clear();
        lock(&self.inner.idle).clear();
        lock(&self.inner.reconnects).clear();
        let channels: Vec<Arc<Channel>> = {
            let mut table = lock(&self.inner.channels);
            let all = table.drain().collect();
            all
        };
        for channel in channels {
            channel.close();
        }
    }
}

/// Placement policy for new connections: anything that can hand out a
/// loop. A single [`EventLoop`] serves itself; a [`LoopGroup`] rotates.
pub trait LoopPool: Send + Sync {
    fn alloc_loop(&self) -> EventLoop;
}

impl LoopPool for EventLoop {
    fn alloc_loop(&self) -> EventLoop {
        self.clone()
    }
}

/// Fixed set of loops, one OS thread each (the last runs on the caller of
/// [`run`](LoopGroup::run)).
pub struct LoopGroup {
    loops: Vec<EventLoop>,
    next: AtomicUsize,
}

impl LoopGroup {
    pub fn new(size: usize) -> io::Result<Self> {
        Self::with_config(size, &NetConfig::default())
    }

    pub fn with_config(size: usize, config: &NetConfig) -> io::Result<Self> {
        let size = size.max(1);
        let mut loops = Vec::with_capacity(size);
        for _ in 0..size {
            loops.push(EventLoop::with_config(config)?);
        }
        Ok(Self {
            loops,
            next: AtomicUsize::new(0),
        })
    }

    /// Run every loop: `size - 1` background threads plus the caller's
    /// thread. Returns once all loops have exited.
    pub fn run(&self) -> io::Result<()> {
        let n = self.loops.len();
        let mut handles = Vec::with_capacity(n - 1);
        for (i, event_loop) in self.loops[..n - 1].iter().enumerate() {
            let event_loop = event_loop.clone();
            let handle = thread::Builder::new()
                .name(format!("loop-{i}"))
                .spawn(move || event_loop.run())?;
            handles.push(handle);
        }
        self.loops[n - 1].run();
        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Stop every loop.
    pub fn exit(&self) {
        for event_loop in &self.loops {
            event_loop.exit();
        }
    }

    /// Round-robin loop selection.
    pub fn alloc_loop(&self) -> EventLoop {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[i].clone()
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }
}

impl LoopPool for LoopGroup {
    fn alloc_loop(&self) -> EventLoop {
        LoopGroup::alloc_loop(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread::JoinHandle;

    fn spawn_loop() -> (EventLoop, JoinHandle<()>) {
        let event_loop = EventLoop::new().unwrap();
        let handle = {
            let event_loop = event_loop.clone();
            thread::spawn(move || event_loop.run())
        };
        (event_loop, handle)
    }

    #[test]
    fn test_exit_stops_run() {
        let (event_loop, handle) = spawn_loop();
        thread::sleep(Duration::from_millis(20));
        event_loop.exit();
        handle.join().unwrap();
        assert!(event_loop.exited());
    }

    #[test]
    fn test_timer_fires() {
        let (event_loop, handle) = spawn_loop();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            event_loop.run_after(
                20,
                move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                },
                0,
            );
        }
        thread::sleep(Duration::from_millis(150));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        event_loop.exit();
        handle.join().unwrap();
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let (event_loop, handle) = spawn_loop();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = {
            let hits = Arc::clone(&hits);
            event_loop.run_after(
                100,
                move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                },
                0,
            )
        };
        assert!(event_loop.cancel(id));
        assert!(!event_loop.cancel(id));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        event_loop.exit();
        handle.join().unwrap();
    }

    #[test]
    fn test_repeating_timer_fires_on_schedule() {
        let (event_loop, handle) = spawn_loop();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = {
            let hits = Arc::clone(&hits);
            event_loop.run_after(
                50,
                move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                },
                50,
            )
        };
        assert!(id.0 < 0);
        thread::sleep(Duration::from_millis(240));
        let count = hits.load(Ordering::SeqCst);
        assert!((3..=5).contains(&count), "fired {count} times");
        assert!(event_loop.cancel(id));
        thread::sleep(Duration::from_millis(120));
        assert_eq!(hits.load(Ordering::SeqCst), count);
        event_loop.exit();
        handle.join().unwrap();
    }

    #[test]
    fn test_safe_call_runs_on_loop_thread() {
        let (event_loop, handle) = spawn_loop();
        let (tx, rx) = std::sync::mpsc::channel();
        {
            let event_loop = event_loop.clone();
            event_loop.clone().safe_call(move || {
                let _ = tx.send(event_loop.is_in_loop_thread());
            });
        }
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        event_loop.exit();
        handle.join().unwrap();
    }

    #[test]
    fn test_safe_call_from_many_threads() {
        let (event_loop, handle) = spawn_loop();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut producers = Vec::new();
        for _ in 0..4 {
            let event_loop = event_loop.clone();
            let counter = Arc::clone(&counter);
            producers.push(thread::spawn(move || {
                for _ in 0..250 {
                    let counter = Arc::clone(&counter);
                    event_loop.safe_call(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }));
        }
        for p in producers {
            p.join().unwrap();
        }
        // Give the loop time to drain, then stop it.
        thread::sleep(Duration::from_millis(200));
        event_loop.exit();
        handle.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn test_timer_panic_is_contained() {
        let (event_loop, handle) = spawn_loop();
        let hits = Arc::new(AtomicUsize::new(0));
        event_loop.run_after(10, || panic!("boom"), 0);
        {
            let hits = Arc::clone(&hits);
            event_loop.run_after(
                30,
                move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                },
                0,
            );
        }
        thread::sleep(Duration::from_millis(150));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        event_loop.exit();
        handle.join().unwrap();
    }

    #[test]
    fn test_run_at_after_exit_is_refused() {
        let (event_loop, handle) = spawn_loop();
        event_loop.exit();
        handle.join().unwrap();
        let id = event_loop.run_after(10, || {}, 0);
        assert!(id.is_none());
    }

    #[test]
    fn test_group_round_robin() {
        let group = LoopGroup::new(3).unwrap();
        let a = group.alloc_loop();
        let b = group.alloc_loop();
        let c = group.alloc_loop();
        let d = group.alloc_loop();
        assert!(!Arc::ptr_eq(&a.inner, &b.inner));
        assert!(!Arc::ptr_eq(&b.inner, &c.inner));
        assert!(Arc::ptr_eq(&a.inner, &d.inner));
        group.exit();
    }

    #[test]
    fn test_group_run_and_exit() {
        let group = Arc::new(LoopGroup::new(2).unwrap());
        let runner = {
            let group = Arc::clone(&group);
            thread::spawn(move || group.run().unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        group.exit();
        runner.join().unwrap();
    }
}
