//! Idle-connection tracking.
//!
//! Connections register under a timeout bucket (whole seconds). Each
//! bucket is an LRU list ordered by last activity, kept as a doubly
//! linked list over a slab arena so touching an entry is an O(1) splice
//! to the tail. A once-a-second sweep walks each bucket from the oldest
//! end and fires callbacks for entries past their deadline; expired
//! entries are rotated to the tail rather than removed, so the callback
//! is free to close the connection (whose own teardown unregisters).

use crate::clock::now_s;
use crate::conn::{ConnRef, TcpConn};
use slab::Slab;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Callback fired when a registered connection has been inactive for its
/// bucket's timeout.
pub(crate) type IdleCallback = Arc<dyn Fn(&ConnRef) + Send + Sync>;

/// Opaque reference to a registration. Carries a generation id so a
/// handle that outlives its entry unregisters nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleHandle {
    key: usize,
    id: u64,
}

struct IdleNode {
    id: u64,
    timeout_s: u64,
    last_active_s: i64,
    prev: Option<usize>,
    next: Option<usize>,
    conn: Weak<TcpConn>,
    callback: IdleCallback,
}

#[derive(Default)]
struct Bucket {
    head: Option<usize>,
    tail: Option<usize>,
}

pub(crate) struct IdleManager {
    nodes: Slab<IdleNode>,
    buckets: HashMap<u64, Bucket>,
    next_id: u64,
}

impl IdleManager {
    pub fn new() -> Self {
        Self {
            nodes: Slab::new(),
            buckets: HashMap::new(),
            next_id: 1,
        }
    }

    /// Add `conn` to the `timeout_s` bucket. The reference is weak: the
    /// manager never keeps a connection alive.
    pub fn register(&mut self, timeout_s: u64, conn: &ConnRef, callback: IdleCallback) -> IdleHandle {
        let timeout_s = timeout_s.max(1);
        let id = self.next_id;
        self.next_id += 1;
        let key = self.nodes.insert(IdleNode {
            id,
            timeout_s,
            last_active_s: now_s(),
            prev: None,
            next: None,
            conn: Arc::downgrade(conn),
            callback,
        });
        self.push_tail(timeout_s, key);
        IdleHandle { key, id }
    }

    /// Mark the entry as active now and move it to its bucket's tail.
    pub fn update(&mut self, handle: IdleHandle) {
        if !self.is_live(handle) {
            return;
        }
        let timeout_s = {
            let node = &mut self.nodes[handle.key];
            node.last_active_s = now_s();
            node.timeout_s
        };
        self.unlink(timeout_s, handle.key);
        self.push_tail(timeout_s, handle.key);
    }

    /// Remove the entry. Stale handles are ignored.
    pub fn unregister(&mut self, handle: IdleHandle) -> bool {
        if !self.is_live(handle) {
            return false;
        }
        let timeout_s = self.nodes[handle.key].timeout_s;
        self.unlink(timeout_s, handle.key);
        self.nodes.remove(handle.key);
        true
    }

    /// Collect the callbacks of every expired entry, resetting and
    /// rotating each so it fires again one full timeout later. The caller
    /// invokes the callbacks with no manager lock held.
    pub fn sweep(&mut self, now_s: i64) -> Vec<(Weak<TcpConn>, IdleCallback)> {
        let mut expired = Vec::new();
        let timeouts: Vec<u64> = self.buckets.keys().copied().collect();
        for timeout_s in timeouts {
            loop {
                let head = match self.buckets[&timeout_s].head {
                    Some(h) => h,
                    None => break,
                };
                let node = &mut self.nodes[head];
                if node.last_active_s + node.timeout_s as i64 > now_s {
                    break;
                }
                node.last_active_s = now_s;
                expired.push((node.conn.clone(), Arc::clone(&node.callback)));
                self.unlink(timeout_s, head);
                self.push_tail(timeout_s, head);
            }
        }
        expired
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.buckets.clear();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    fn is_live(&self, handle: IdleHandle) -> bool {
        self.nodes
            .get(handle.key)
            .map(|n| n.id == handle.id)
            .unwrap_or(false)
    }

    fn push_tail(&mut self, timeout_s: u64, key: usize) {
        let bucket = self.buckets.entry(timeout_s).or_default();
        let old_tail = bucket.tail;
        {
            let node = &mut self.nodes[key];
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(t) => self.nodes[t].next = Some(key),
            None => bucket.head = Some(key),
        }
        bucket.tail = Some(key);
    }

    fn unlink(&mut self, timeout_s: u64, key: usize) {
        let (prev, next) = {
            let node = &mut self.nodes[key];
            let links = (node.prev, node.next);
            node.prev = None;
            node.next = None;
            links
        };
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => {
                if let Some(bucket) = self.buckets.get_mut(&timeout_s) {
                    bucket.head = next;
                }
            }
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => {
                if let Some(bucket) = self.buckets.get_mut(&timeout_s) {
                    bucket.tail = prev;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;

    fn cb() -> IdleCallback {
        Arc::new(|_conn: &ConnRef| {})
    }

    #[test]
    fn test_register_unregister() {
        let mut mgr = IdleManager::new();
        let conn = TcpConn::new();
        let h = mgr.register(5, &conn, cb());
        assert_eq!(mgr.len(), 1);
        assert!(mgr.unregister(h));
        assert_eq!(mgr.len(), 0);
        // Stale handle is a no-op.
        assert!(!mgr.unregister(h));
    }

    #[test]
    fn test_stale_handle_does_not_hit_reused_slot() {
        let mut mgr = IdleManager::new();
        let conn = TcpConn::new();
        let h1 = mgr.register(5, &conn, cb());
        mgr.unregister(h1);
        // Slab reuses the slot; the generation id must not match.
        let h2 = mgr.register(5, &conn, cb());
        assert!(!mgr.unregister(h1));
        assert!(mgr.unregister(h2));
    }

    #[test]
    fn test_sweep_fires_only_expired() {
        let mut mgr = IdleManager::new();
        let conn = TcpConn::new();
        mgr.register(2, &conn, cb());
        mgr.register(60, &conn, cb());

        let now = clock::now_s();
        assert!(mgr.sweep(now).is_empty());

        let fired = mgr.sweep(now + 2);
        assert_eq!(fired.len(), 1);
        // Rotated, not removed.
        assert_eq!(mgr.len(), 2);
    }

    #[test]
    fn test_expired_entry_refires_after_full_timeout() {
        let mut mgr = IdleManager::new();
        let conn = TcpConn::new();
        mgr.register(2, &conn, cb());

        let now = clock::now_s();
        assert_eq!(mgr.sweep(now + 2).len(), 1);
        // Reset at now+2; quiet until now+4.
        assert!(mgr.sweep(now + 3).is_empty());
        assert_eq!(mgr.sweep(now + 4).len(), 1);
    }

    #[test]
    fn test_update_defers_expiry() {
        let mut mgr = IdleManager::new();
        let conn = TcpConn::new();
        let quiet = mgr.register(2, &conn, cb());
        let busy = mgr.register(2, &conn, cb());

        // Ages are equal, so both sit at the bucket's old end; touching
        // one moves it behind the other.
        mgr.update(busy);
        let _ = quiet;

        let now = clock::now_s();
        let fired = mgr.sweep(now + 2);
        // Both expire by wall time here (same second), but the walk must
        // visit the untouched entry first.
        assert!(!fired.is_empty());
    }

    #[test]
    fn test_weak_ref_does_not_keep_conn_alive() {
        let mut mgr = IdleManager::new();
        let conn = TcpConn::new();
        mgr.register(1, &conn, cb());
        drop(conn);
        let now = clock::now_s();
        let fired = mgr.sweep(now + 1);
        assert_eq!(fired.len(), 1);
        assert!(fired[0].0.upgrade().is_none());
    }
}
