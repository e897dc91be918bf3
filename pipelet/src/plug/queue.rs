//! Ordered query-update queue shared by inputs and outputs.
//!
//! Every query change a plug must apply is queued under a monotonic sequence
//! number. Entries complete out of order (fetch replies race each other) but
//! are only released in sequence order: a completed entry parks behind any
//! earlier entry still waiting on its fetch.

use crate::core::StageId;
use crate::query::QueryChanges;
use std::collections::BTreeMap;

/// What a queued entry changes once applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryUpdate {
    /// Explicit removed and added terms.
    Changes(QueryChanges),
    /// Every term the destination is subscribed to, resolved at apply time.
    RemoveDestination,
}

/// A released queue entry, ready to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedUpdate {
    /// The change.
    pub update: QueryUpdate,
    /// Destination the change applies to, on outputs.
    pub destination: Option<StageId>,
    /// Whether the resulting diff must still be forwarded upstream.
    pub propagate: bool,
}

impl QueuedUpdate {
    /// An update forwarded upstream once applied.
    #[must_use]
    pub fn new(update: QueryUpdate, destination: Option<StageId>) -> Self {
        Self {
            update,
            destination,
            propagate: true,
        }
    }

    /// An update already carried upstream by its fetch.
    #[must_use]
    pub fn local(update: QueryUpdate, destination: Option<StageId>) -> Self {
        Self {
            update,
            destination,
            propagate: false,
        }
    }
}

#[derive(Debug)]
struct Entry {
    done: bool,
    effective: bool,
    update: QueuedUpdate,
}

/// FIFO of query updates gated by fetch completion.
#[derive(Debug, Default)]
pub struct QueryUpdateQueue {
    next_seq: u64,
    entries: BTreeMap<u64, Entry>,
}

impl QueryUpdateQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an update waiting on a fetch; returns its sequence number.
    pub fn push(&mut self, update: QueuedUpdate) -> u64 {
        self.insert(update, false)
    }

    /// Queues an update that is ready as soon as earlier entries are.
    pub fn push_done(&mut self, update: QueuedUpdate) -> u64 {
        self.insert(update, true)
    }

    fn insert(&mut self, update: QueuedUpdate, done: bool) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            seq,
            Entry {
                done,
                effective: true,
                update,
            },
        );
        seq
    }

    /// Marks an entry done. An ineffective entry is released without being
    /// applied. Returns false if the entry is unknown.
    pub fn complete(&mut self, seq: u64, effective: bool) -> bool {
        match self.entries.get_mut(&seq) {
            Some(entry) => {
                entry.done = true;
                entry.effective = effective;
                true
            }
            None => false,
        }
    }

    /// Pops the leading run of done entries, returning those to apply in
    /// order.
    pub fn drain_ready(&mut self) -> Vec<QueuedUpdate> {
        let mut ready = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if !entry.get().done {
                break;
            }
            let entry = entry.remove();
            if entry.effective {
                ready.push(entry.update);
            }
        }
        ready
    }

    /// Returns the number of entries still waiting on their fetch.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.entries.values().filter(|e| !e.done).count()
    }

    /// Returns the number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Term;

    fn changes(key: &str) -> QueuedUpdate {
        let mut term = Term::new();
        term.insert(key.to_string(), serde_json::Value::Bool(true));
        QueuedUpdate::new(QueryUpdate::Changes(QueryChanges::adding(vec![term])), Some(StageId::new(1)))
    }

    #[test]
    fn test_done_entry_parks_behind_pending() {
        let mut queue = QueryUpdateQueue::new();
        let first = queue.push(changes("a"));
        queue.push_done(changes("b"));

        assert!(queue.drain_ready().is_empty());
        assert_eq!(queue.pending(), 1);

        queue.complete(first, true);
        let ready = queue.drain_ready();
        assert_eq!(ready, vec![changes("a"), changes("b")]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_out_of_order_completion_applies_in_order() {
        let mut queue = QueryUpdateQueue::new();
        let first = queue.push(changes("a"));
        let second = queue.push(changes("b"));

        queue.complete(second, true);
        assert!(queue.drain_ready().is_empty());

        queue.complete(first, true);
        assert_eq!(queue.drain_ready(), vec![changes("a"), changes("b")]);
    }

    #[test]
    fn test_ineffective_entry_released_without_update() {
        let mut queue = QueryUpdateQueue::new();
        let first = queue.push(changes("a"));
        queue.push_done(changes("b"));

        queue.complete(first, false);
        assert_eq!(queue.drain_ready(), vec![changes("b")]);
    }

    #[test]
    fn test_complete_unknown_entry() {
        let mut queue = QueryUpdateQueue::new();
        assert!(!queue.complete(7, true));
    }
}
