//! Ordered timer storage for the event loop.
//!
//! Timers are keyed by `(deadline_ms, seq)`; the sequence number comes
//! from an atomic counter so colliding deadlines stay totally ordered.
//! A repeating timer is published under a negated deadline: the sign
//! tells [`cancel`](TimerStore::cancel) whether it is looking at a
//! one-shot entry or at a repeat descriptor whose current firing is a
//! separate one-shot entry.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

/// Timer identifier: `(deadline_ms, seq)`. A repeating registration
/// returns an id with a negative first field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub i64, pub i64);

impl TimerId {
    /// Sentinel for "no timer". Sequence numbers start at 1, so no live
    /// timer ever compares equal to this.
    pub const NONE: TimerId = TimerId(0, 0);

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

/// Returned by the loop's wait computation when no timer is pending.
pub(crate) const NO_TIMER_DELAY_MS: i64 = 1 << 30;

static NEXT_SEQ: AtomicI64 = AtomicI64::new(1);

fn next_seq() -> i64 {
    NEXT_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// A closure the loop runs when a timer fires. Repeating timers are
/// invoked many times, so the callable is `FnMut`.
pub(crate) type TimerTask = Box<dyn FnMut() + Send>;

pub(crate) enum TimerSlot {
    Once(TimerTask),
    /// Current firing of a repeat descriptor, identified by its public id.
    Repeat(TimerId),
}

struct Repeating {
    interval_ms: i64,
    /// Key of the one-shot entry representing the next firing.
    current: TimerId,
    /// Taken out while the task runs so firing holds no store lock.
    task: Option<TimerTask>,
}

/// The loop's timer state. All methods are called under the loop's timer
/// mutex; tasks are always invoked after being moved out.
pub(crate) struct TimerStore {
    queue: BTreeMap<TimerId, TimerSlot>,
    repeats: HashMap<TimerId, Repeating>,
}

impl TimerStore {
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            repeats: HashMap::new(),
        }
    }

    /// Register a one-shot timer.
    pub fn schedule_once(&mut self, at_ms: i64, task: TimerTask) -> TimerId {
        let id = TimerId(at_ms, next_seq());
        self.queue.insert(id, TimerSlot::Once(task));
        id
    }

    /// Register a repeating timer. The returned public id carries a
    /// negated deadline; the first firing is scheduled at `at_ms`.
    pub fn schedule_repeating(&mut self, at_ms: i64, interval_ms: i64, task: TimerTask) -> TimerId {
        let seq = next_seq();
        let public = TimerId(-at_ms, seq);
        let current = TimerId(at_ms, seq);
        self.repeats.insert(
            public,
            Repeating {
                interval_ms,
                current,
                task: Some(task),
            },
        );
        self.queue.insert(current, TimerSlot::Repeat(public));
        public
    }

    /// Remove a timer. A negative first field removes the repeat
    /// descriptor and its currently scheduled firing; otherwise just the
    /// one-shot entry. Idempotent; true only when something live was
    /// removed.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        if id.is_none() {
            return false;
        }
        if id.0 < 0 {
            match self.repeats.remove(&id) {
                Some(rep) => {
                    self.queue.remove(&rep.current);
                    true
                }
                None => false,
            }
        } else {
            self.queue.remove(&id).is_some()
        }
    }

    /// Milliseconds until the earliest deadline, clamped at zero;
    /// [`NO_TIMER_DELAY_MS`] when nothing is scheduled.
    pub fn next_delay_ms(&self, now_ms: i64) -> i64 {
        match self.queue.keys().next() {
            Some(id) => (id.0 - now_ms).max(0),
            None => NO_TIMER_DELAY_MS,
        }
    }

    /// Remove and return every entry due at or before `now_ms`. Entries
    /// are erased before the caller invokes them, so a task never
    /// observes itself still registered.
    pub fn take_due(&mut self, now_ms: i64) -> Vec<(TimerId, TimerSlot)> {
        let rest = self.queue.split_off(&TimerId(now_ms + 1, i64::MIN));
        let due = std::mem::replace(&mut self.queue, rest);
        due.into_iter().collect()
    }

    /// Start firing a repeat: schedule the next one-shot off the previous
    /// deadline (missed intervals are never coalesced) and hand the task
    /// out for invocation. `None` when the descriptor was cancelled.
    pub fn begin_repeat_fire(&mut self, public: TimerId, fired: TimerId) -> Option<TimerTask> {
        let rep = self.repeats.get_mut(&public)?;
        let next = TimerId(fired.0 + rep.interval_ms, next_seq());
        rep.current = next;
        self.queue.insert(next, TimerSlot::Repeat(public));
        rep.task.take()
    }

    /// Return a repeat task after invocation. Dropped silently when the
    /// descriptor was cancelled mid-flight.
    pub fn end_repeat_fire(&mut self, public: TimerId, task: TimerTask) {
        if let Some(rep) = self.repeats.get_mut(&public) {
            rep.task = Some(task);
        }
    }

    /// Drop every timer without running anything.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.repeats.clear();
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerTask {
        Box::new(|| {})
    }

    #[test]
    fn test_due_entries_are_erased_before_invocation() {
        let mut store = TimerStore::new();
        store.schedule_once(100, noop());
        store.schedule_once(200, noop());
        store.schedule_once(300, noop());

        let due = store.take_due(200);
        assert_eq!(due.len(), 2);
        assert_eq!(store.pending(), 1);
        // Order follows (deadline, seq).
        assert_eq!(due[0].0 .0, 100);
        assert_eq!(due[1].0 .0, 200);
    }

    #[test]
    fn test_colliding_deadlines_stay_ordered_by_seq() {
        let mut store = TimerStore::new();
        let a = store.schedule_once(50, noop());
        let b = store.schedule_once(50, noop());
        assert!(a.1 < b.1);

        let due = store.take_due(50);
        assert_eq!(due[0].0, a);
        assert_eq!(due[1].0, b);
    }

    #[test]
    fn test_cancel_one_shot() {
        let mut store = TimerStore::new();
        let id = store.schedule_once(100, noop());
        assert!(store.cancel(id));
        assert!(!store.cancel(id));
        assert!(store.take_due(1000).is_empty());
    }

    #[test]
    fn test_repeating_id_carries_negated_deadline() {
        let mut store = TimerStore::new();
        let id = store.schedule_repeating(100, 25, noop());
        assert_eq!(id.0, -100);
        assert_eq!(store.pending(), 1);
    }

    #[test]
    fn test_cancel_repeating_removes_scheduled_firing() {
        let mut store = TimerStore::new();
        let id = store.schedule_repeating(100, 25, noop());
        assert!(store.cancel(id));
        assert_eq!(store.pending(), 0);
        assert!(!store.cancel(id));
    }

    #[test]
    fn test_repeat_reschedules_from_previous_deadline() {
        let mut store = TimerStore::new();
        let public = store.schedule_repeating(100, 40, noop());

        let due = store.take_due(100);
        let (fired, slot) = &due[0];
        assert!(matches!(slot, TimerSlot::Repeat(p) if *p == public));

        let task = store.begin_repeat_fire(public, *fired).unwrap();
        store.end_repeat_fire(public, task);

        // Next deadline is 100 + 40, not now + 40.
        assert_eq!(store.next_delay_ms(100), 40);
        assert_eq!(store.next_delay_ms(130), 10);
    }

    #[test]
    fn test_begin_repeat_fire_after_cancel_yields_nothing() {
        let mut store = TimerStore::new();
        let public = store.schedule_repeating(10, 5, noop());
        let due = store.take_due(10);
        store.cancel(public);
        assert!(store.begin_repeat_fire(public, due[0].0).is_none());
    }

    #[test]
    fn test_next_delay() {
        let mut store = TimerStore::new();
        assert_eq!(store.next_delay_ms(0), NO_TIMER_DELAY_MS);
        store.schedule_once(250, noop());
        assert_eq!(store.next_delay_ms(100), 150);
        // Past-due clamps to zero.
        assert_eq!(store.next_delay_ms(400), 0);
    }
}
