//! Producer/consumer bookkeeping keyed by [`DependencyKey`].
//!
//! Each key names a resource that exactly one live task produces. Consumers
//! that arrive while the producer is pending are recorded in the key's
//! adjacency list so resolution touches only the direct fan-out. Successful
//! keys leave the table; failed keys stay behind so later consumers inherit
//! the failure instead of running on garbage.

use std::collections::HashMap;

use hwsched_core::DependencyKey;
use serde::Serialize;

use super::task::{SchedError, TaskError, TaskResult};
use super::types::SyncHandle;

/// Answer to "has this resource been produced yet?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The producer finished. Successful keys leave the table, so in
    /// practice this carries a retained failure.
    Resolved(TaskResult),
    /// A live task will produce it.
    Pending(SyncHandle),
    /// No entry: never registered, or already produced successfully.
    Unknown,
}

/// Outcome of wiring one input of a new task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InputLink {
    /// The consumer was recorded; it waits for the producer.
    Pending,
    /// Nothing to wait for.
    Satisfied,
    /// The producer already failed.
    Poisoned(TaskError),
}

#[derive(Debug, Clone)]
enum EntryState {
    Pending,
    Failed(TaskError),
}

#[derive(Debug, Clone)]
struct Entry {
    producer: SyncHandle,
    state: EntryState,
    consumers: Vec<SyncHandle>,
}

/// Snapshot for diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyStats {
    pub pending: usize,
    pub failed: usize,
}

pub(crate) struct DependencyTable {
    entries: HashMap<DependencyKey, Entry>,
    capacity: usize,
}

impl DependencyTable {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
        }
    }

    /// Check that `keys` can be registered by a new producer.
    ///
    /// A pending key is a collision. A failed key may be taken over by the
    /// new producer and does not count against capacity.
    pub(crate) fn check_outputs(&self, keys: &[DependencyKey]) -> Result<(), SchedError> {
        let mut added = 0;
        for key in keys {
            match self.entries.get(key) {
                Some(Entry {
                    state: EntryState::Pending,
                    ..
                }) => return Err(SchedError::KeyCollision(*key)),
                Some(_) => {}
                None => added += 1,
            }
        }
        if self.entries.len() + added > self.capacity {
            return Err(SchedError::DependencyTableFull {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Record `producer` as the pending source of `keys`. Call
    /// [`check_outputs`](Self::check_outputs) first.
    pub(crate) fn register_outputs(&mut self, producer: SyncHandle, keys: &[DependencyKey]) {
        for key in keys {
            self.entries.insert(
                *key,
                Entry {
                    producer,
                    state: EntryState::Pending,
                    consumers: Vec::new(),
                },
            );
        }
    }

    pub(crate) fn link_input(&mut self, consumer: SyncHandle, key: DependencyKey) -> InputLink {
        match self.entries.get_mut(&key) {
            None => InputLink::Satisfied,
            Some(entry) => match &entry.state {
                EntryState::Pending => {
                    entry.consumers.push(consumer);
                    InputLink::Pending
                }
                EntryState::Failed(err) => InputLink::Poisoned(err.clone()),
            },
        }
    }

    /// Drop a consumer recorded by [`link_input`](Self::link_input), used
    /// when a submit is rolled back.
    pub(crate) fn unlink_input(&mut self, consumer: SyncHandle, key: DependencyKey) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.consumers.retain(|h| *h != consumer);
        }
    }

    /// Resolve `key` with its producer's result and return the consumers
    /// that were waiting on it.
    pub(crate) fn resolve(
        &mut self,
        producer: SyncHandle,
        key: DependencyKey,
        result: &TaskResult,
    ) -> Vec<SyncHandle> {
        let owned = matches!(
            self.entries.get(&key),
            Some(e) if e.producer == producer && matches!(e.state, EntryState::Pending)
        );
        if !owned {
            tracing::error!(%key, %producer, "resolving a key this producer does not hold");
            debug_assert!(owned, "resolve of {key} by non-owner {producer}");
            return Vec::new();
        }

        match result {
            Ok(()) => self
                .entries
                .remove(&key)
                .map(|e| e.consumers)
                .unwrap_or_default(),
            Err(err) => match self.entries.get_mut(&key) {
                Some(entry) => {
                    entry.state = EntryState::Failed(err.clone());
                    std::mem::take(&mut entry.consumers)
                }
                None => Vec::new(),
            },
        }
    }

    pub(crate) fn lookup(&self, key: DependencyKey) -> Lookup {
        match self.entries.get(&key) {
            None => Lookup::Unknown,
            Some(Entry {
                state: EntryState::Pending,
                producer,
                ..
            }) => Lookup::Pending(*producer),
            Some(Entry {
                state: EntryState::Failed(err),
                ..
            }) => Lookup::Resolved(Err(err.clone())),
        }
    }

    /// Forget every failed key. Returns how many were dropped.
    pub(crate) fn clear_failed(&mut self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| matches!(e.state, EntryState::Pending));
        before - self.entries.len()
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.entries
            .values()
            .any(|e| matches!(e.state, EntryState::Failed(_)))
    }

    pub(crate) fn stats(&self) -> DependencyStats {
        let failed = self
            .entries
            .values()
            .filter(|e| matches!(e.state, EntryState::Failed(_)))
            .count();
        DependencyStats {
            pending: self.entries.len() - failed,
            failed,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u64) -> DependencyKey {
        DependencyKey::new(n)
    }

    #[test]
    fn unknown_key_is_satisfied() {
        let mut table = DependencyTable::with_capacity(4);
        let consumer = SyncHandle::new(1, 1);
        assert_eq!(table.link_input(consumer, key(9)), InputLink::Satisfied);
        assert_eq!(table.lookup(key(9)), Lookup::Unknown);
    }

    #[test]
    fn success_removes_entry_and_returns_consumers() {
        let mut table = DependencyTable::with_capacity(4);
        let producer = SyncHandle::new(0, 1);
        let consumer = SyncHandle::new(1, 2);
        table.register_outputs(producer, &[key(1)]);
        assert_eq!(table.link_input(consumer, key(1)), InputLink::Pending);
        assert_eq!(table.lookup(key(1)), Lookup::Pending(producer));

        let woken = table.resolve(producer, key(1), &Ok(()));
        assert_eq!(woken, vec![consumer]);
        assert_eq!(table.lookup(key(1)), Lookup::Unknown);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn failure_is_retained_and_poisons_late_consumers() {
        let mut table = DependencyTable::with_capacity(4);
        let producer = SyncHandle::new(0, 1);
        table.register_outputs(producer, &[key(1)]);

        let err = TaskError::Failed(-17);
        assert!(table.resolve(producer, key(1), &Err(err.clone())).is_empty());
        assert_eq!(table.lookup(key(1)), Lookup::Resolved(Err(err.clone())));
        assert!(table.has_failed());

        let late = SyncHandle::new(2, 3);
        assert_eq!(table.link_input(late, key(1)), InputLink::Poisoned(err));
    }

    #[test]
    fn pending_key_collides() {
        let mut table = DependencyTable::with_capacity(4);
        table.register_outputs(SyncHandle::new(0, 1), &[key(1)]);
        assert!(matches!(
            table.check_outputs(&[key(2), key(1)]),
            Err(SchedError::KeyCollision(k)) if k == key(1)
        ));
    }

    #[test]
    fn failed_key_can_be_reregistered() {
        let mut table = DependencyTable::with_capacity(1);
        let first = SyncHandle::new(0, 1);
        table.register_outputs(first, &[key(1)]);
        table.resolve(first, key(1), &Err(TaskError::Failed(1)));

        // Taking over a failed key does not need extra capacity.
        table.check_outputs(&[key(1)]).unwrap();
        let second = SyncHandle::new(0, 2);
        table.register_outputs(second, &[key(1)]);
        assert_eq!(table.lookup(key(1)), Lookup::Pending(second));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut table = DependencyTable::with_capacity(2);
        table.register_outputs(SyncHandle::new(0, 1), &[key(1)]);
        assert!(table.check_outputs(&[key(2)]).is_ok());
        assert!(matches!(
            table.check_outputs(&[key(2), key(3)]),
            Err(SchedError::DependencyTableFull { capacity: 2 })
        ));
    }

    #[test]
    fn clear_failed_keeps_pending() {
        let mut table = DependencyTable::with_capacity(4);
        let a = SyncHandle::new(0, 1);
        let b = SyncHandle::new(1, 2);
        table.register_outputs(a, &[key(1)]);
        table.register_outputs(b, &[key(2)]);
        table.resolve(a, key(1), &Err(TaskError::Aborted));

        assert_eq!(table.stats().failed, 1);
        assert_eq!(table.clear_failed(), 1);
        assert!(!table.has_failed());
        assert_eq!(table.lookup(key(2)), Lookup::Pending(b));
    }

    #[test]
    fn unlink_drops_consumer() {
        let mut table = DependencyTable::with_capacity(4);
        let producer = SyncHandle::new(0, 1);
        let consumer = SyncHandle::new(1, 2);
        table.register_outputs(producer, &[key(1)]);
        table.link_input(consumer, key(1));
        table.unlink_input(consumer, key(1));
        assert!(table.resolve(producer, key(1), &Ok(())).is_empty());
    }
}
