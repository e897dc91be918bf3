//! Per-destination transaction bookkeeping on an output.

use crate::core::{Options, StageId};
use crate::transactions::TransactionId;
use std::collections::{BTreeSet, HashMap};

/// Options adjusted for one destination.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationOptions {
    /// Options to deliver with.
    pub options: Options,
    /// True when this delivery terminates the destination's instance of the
    /// transaction (always true for single-shot emissions).
    pub terminated: bool,
}

/// Tracks which destinations hold partially delivered transactions.
#[derive(Debug, Default)]
pub struct OutputTransactions {
    open: HashMap<StageId, BTreeSet<TransactionId>>,
}

impl OutputTransactions {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a delivery to `destination` and returns its options.
    pub fn get_options(&mut self, destination: StageId, options: &Options) -> DestinationOptions {
        let Some(meta) = options.transaction.as_ref() else {
            return DestinationOptions {
                options: options.clone(),
                terminated: true,
            };
        };

        if meta.more {
            self.open.entry(destination).or_default().insert(meta.id);
            return DestinationOptions {
                options: options.clone(),
                terminated: false,
            };
        }

        if let Some(ids) = self.open.get_mut(&destination) {
            ids.remove(&meta.id);
            if ids.is_empty() {
                self.open.remove(&destination);
            }
        }
        DestinationOptions {
            options: options.clone(),
            terminated: true,
        }
    }

    /// Returns destinations that received partial data for `id`.
    #[must_use]
    pub fn open_destinations(&self, id: TransactionId) -> Vec<StageId> {
        let mut destinations: Vec<_> = self
            .open
            .iter()
            .filter(|(_, ids)| ids.contains(&id))
            .map(|(destination, _)| *destination)
            .collect();
        destinations.sort_unstable();
        destinations
    }

    /// Returns true if `destination` holds `id` open.
    #[must_use]
    pub fn is_open(&self, destination: StageId, id: TransactionId) -> bool {
        self.open.get(&destination).is_some_and(|ids| ids.contains(&id))
    }

    /// Forgets a destination, returning the transactions it held open.
    pub fn remove_destination(&mut self, destination: StageId) -> Vec<TransactionId> {
        self.open
            .remove(&destination)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transactions::TransactionMeta;

    fn options(id: TransactionId, more: bool) -> Options {
        Options::new().with_transaction(TransactionMeta::new(id, more))
    }

    #[test]
    fn test_single_shot_is_terminated() {
        let mut registry = OutputTransactions::new();
        let result = registry.get_options(StageId::new(1), &Options::new());
        assert!(result.terminated);
    }

    #[test]
    fn test_partial_then_terminal() {
        let mut registry = OutputTransactions::new();
        let dest = StageId::new(1);
        let id = TransactionId::generate();

        assert!(!registry.get_options(dest, &options(id, true)).terminated);
        assert_eq!(registry.open_destinations(id), vec![dest]);

        assert!(registry.get_options(dest, &options(id, false)).terminated);
        assert!(registry.open_destinations(id).is_empty());
    }

    #[test]
    fn test_remove_destination_returns_open() {
        let mut registry = OutputTransactions::new();
        let dest = StageId::new(2);
        let id = TransactionId::generate();
        registry.get_options(dest, &options(id, true));

        assert!(registry.is_open(dest, id));
        assert_eq!(registry.remove_destination(dest), vec![id]);
        assert!(!registry.is_open(dest, id));
    }
}
