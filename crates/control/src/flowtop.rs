//! Bounded top-N flows by traffic.
//!
//! A soft heuristic for the ops surface, not an accounting ledger:
//! fixed capacity, insertion replaces the minimum when full, ties
//! broken by most-recent update. Updates are O(log K).

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

/// Default capacity of the flow top.
pub const DEFAULT_FLOW_TOP_SIZE: usize = 100;

#[derive(Debug, Clone, Copy)]
struct Totals {
    bytes: i64,
    messages: i64,
    seq: u64,
}

/// One entry in a [`FlowTop`] snapshot.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FlowEntry {
    pub flow_id: String,
    pub bytes: i64,
    pub messages: i64,
}

#[derive(Default)]
struct Inner {
    seq: u64,
    totals: HashMap<String, Totals>,
    // Ordered by (bytes, seq): the first element is the eviction
    // candidate, and among equal traffic the stalest entry goes first.
    ordered: BTreeSet<(i64, u64, String)>,
}

/// Bounded top-N flows, internally synchronized.
pub struct FlowTop {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl FlowTop {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Fold one stream observation into the structure.
    pub fn add(&self, flow_id: &str, messages: i64, bytes: i64) {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let seq = inner.seq;

        let updated = match inner.totals.get(flow_id).copied() {
            Some(prev) => {
                inner.ordered.remove(&(prev.bytes, prev.seq, flow_id.to_string()));
                Totals {
                    bytes: prev.bytes + bytes,
                    messages: prev.messages + messages,
                    seq,
                }
            }
            None => Totals {
                bytes,
                messages,
                seq,
            },
        };

        inner.totals.insert(flow_id.to_string(), updated);
        inner
            .ordered
            .insert((updated.bytes, seq, flow_id.to_string()));

        if inner.totals.len() > self.capacity {
            if let Some(min) = inner.ordered.iter().next().cloned() {
                inner.ordered.remove(&min);
                inner.totals.remove(&min.2);
            }
        }
    }

    /// Whether a flow is currently tracked.
    pub fn contains(&self, flow_id: &str) -> bool {
        self.inner.lock().totals.contains_key(flow_id)
    }

    /// Current entries, heaviest first.
    pub fn snapshot(&self) -> Vec<FlowEntry> {
        let inner = self.inner.lock();
        inner
            .ordered
            .iter()
            .rev()
            .map(|(bytes, _, flow_id)| FlowEntry {
                flow_id: flow_id.clone(),
                bytes: *bytes,
                messages: inner.totals[flow_id].messages,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_per_flow() {
        let top = FlowTop::new(10);
        top.add("a", 3, 100);
        top.add("a", 5, 200);

        let snap = top.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].messages, 8);
        assert_eq!(snap[0].bytes, 300);
    }

    #[test]
    fn evicts_minimum_when_full() {
        let top = FlowTop::new(2);
        top.add("small", 1, 10);
        top.add("medium", 1, 50);
        top.add("large", 1, 100);

        assert_eq!(top.len(), 2);
        assert!(!top.contains("small"));
        assert!(top.contains("medium"));
        assert!(top.contains("large"));
    }

    #[test]
    fn ties_evict_the_stalest() {
        let top = FlowTop::new(2);
        top.add("old", 1, 10);
        top.add("new", 1, 10);
        top.add("big", 1, 100);

        assert!(!top.contains("old"));
        assert!(top.contains("new"));
        assert!(top.contains("big"));
    }

    #[test]
    fn snapshot_orders_heaviest_first() {
        let top = FlowTop::new(10);
        top.add("a", 1, 10);
        top.add("b", 1, 100);
        top.add("c", 1, 50);

        let snapshot = top.snapshot();
        let ids: Vec<&str> = snapshot.iter().map(|e| e.flow_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn updated_flow_can_escape_eviction() {
        let top = FlowTop::new(2);
        top.add("a", 1, 10);
        top.add("b", 1, 20);
        // "a" grows past "b"; a new entry should now evict "b".
        top.add("a", 1, 50);
        top.add("c", 1, 30);

        assert!(top.contains("a"));
        assert!(!top.contains("b"));
        assert!(top.contains("c"));
    }
}
