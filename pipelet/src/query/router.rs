//! Query router: indexes destinations by subscription and splits batches.

use super::{Matcher, Query, QueryChanges, Term};
use crate::core::{Operation, StageId, UpdateMode, UpdatePair};
use serde_json::Value;
use std::collections::BTreeMap;

/// The part of one emitted batch a single destination must receive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutedBatch {
    /// Values leaving the destination's view.
    pub removes: Vec<Value>,
    /// Values changing while staying visible.
    pub updates: Vec<UpdatePair>,
    /// Values entering the destination's view.
    pub adds: Vec<Value>,
    /// The destination must clear its state.
    pub clear: bool,
}

impl RoutedBatch {
    /// Returns true if nothing is to be delivered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.clear && self.removes.is_empty() && self.updates.is_empty() && self.adds.is_empty()
    }

    /// Splits into operations, in delivery order: clear, remove, update, add.
    #[must_use]
    pub fn into_operations(self) -> Vec<Operation> {
        let mut operations = Vec::with_capacity(3);
        if self.clear {
            operations.push(Operation::Clear);
        }
        if !self.removes.is_empty() {
            operations.push(Operation::Remove(self.removes));
        }
        if !self.updates.is_empty() {
            operations.push(Operation::Update(self.updates));
        }
        if !self.adds.is_empty() {
            operations.push(Operation::Add(self.adds));
        }
        operations
    }
}

#[derive(Debug, Clone, Default)]
struct Subscription {
    query: Query,
    matcher: Matcher,
}

impl Subscription {
    fn refresh(&mut self) {
        self.query.discard_operations();
        self.matcher = self.query.generate();
    }
}

/// Indexes destination subscriptions and routes batches to them.
///
/// A destination can be registered with an empty query: it then receives no
/// data but still counts as a subscriber for fork completion.
#[derive(Debug, Clone, Default)]
pub struct QueryRouter {
    subscriptions: BTreeMap<StageId, Subscription>,
}

impl QueryRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a destination with no terms, if absent.
    pub fn register(&mut self, destination: StageId) {
        self.subscriptions.entry(destination).or_default();
    }

    /// Forgets a destination, returning its query.
    pub fn unregister(&mut self, destination: StageId) -> Option<Query> {
        self.subscriptions.remove(&destination).map(|s| s.query)
    }

    /// Returns true if the destination is registered.
    #[must_use]
    pub fn is_registered(&self, destination: StageId) -> bool {
        self.subscriptions.contains_key(&destination)
    }

    /// Associates terms with a destination.
    pub fn add(&mut self, terms: &[Term], destination: StageId) {
        let subscription = self.subscriptions.entry(destination).or_default();
        subscription.query.add(terms);
        subscription.refresh();
    }

    /// Dissociates terms from a destination.
    pub fn remove(&mut self, terms: &[Term], destination: StageId) {
        if let Some(subscription) = self.subscriptions.get_mut(&destination) {
            subscription.query.remove(terms);
            subscription.refresh();
        }
    }

    /// Applies a diff for a destination.
    pub fn apply(&mut self, changes: &QueryChanges, destination: StageId) {
        let subscription = self.subscriptions.entry(destination).or_default();
        subscription.query.apply(changes);
        subscription.refresh();
    }

    /// Returns the destination's terms, repeated by reference count.
    #[must_use]
    pub fn terms_of(&self, destination: StageId) -> Vec<Term> {
        self.subscriptions
            .get(&destination)
            .map(|s| s.query.counted_terms())
            .unwrap_or_default()
    }

    /// Returns the destination's query.
    #[must_use]
    pub fn query_of(&self, destination: StageId) -> Option<&Query> {
        self.subscriptions.get(&destination).map(|s| &s.query)
    }

    /// Returns every registered destination, in id order.
    #[must_use]
    pub fn get_all_subscribers(&self) -> Vec<StageId> {
        self.subscriptions.keys().copied().collect()
    }

    /// Returns the number of registered destinations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Returns true if no destination is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Splits an operation into per-destination batches.
    ///
    /// Destinations with nothing to receive are omitted. An update pair is
    /// delivered as an update when both sides match, as a remove when only
    /// the old value matches and as an add when only the new one does.
    #[must_use]
    pub fn route(&self, operation: &Operation, mode: UpdateMode) -> Vec<(StageId, RoutedBatch)> {
        let mut routed = Vec::new();

        for (&destination, subscription) in &self.subscriptions {
            let matcher = &subscription.matcher;
            let mut batch = RoutedBatch::default();

            match operation {
                Operation::Add(values) => batch.adds = matcher.filter(values),
                Operation::Remove(values) => batch.removes = matcher.filter(values),
                Operation::Update(pairs) => {
                    for (old, new) in pairs {
                        match (matcher.matches(old), matcher.matches(new)) {
                            (true, true) if mode == UpdateMode::Strict => {
                                batch.updates.push((old.clone(), new.clone()));
                            }
                            (true, true) => {
                                batch.removes.push(old.clone());
                                batch.adds.push(new.clone());
                            }
                            (true, false) => batch.removes.push(old.clone()),
                            (false, true) => batch.adds.push(new.clone()),
                            (false, false) => {}
                        }
                    }
                }
                Operation::Clear => batch.clear = true,
            }

            if !batch.is_empty() {
                routed.push((destination, batch));
            }
        }

        routed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn term(value: Value) -> Term {
        value.as_object().cloned().unwrap()
    }

    fn router_ab() -> (QueryRouter, StageId, StageId) {
        let a = StageId::new(1);
        let b = StageId::new(2);
        let mut router = QueryRouter::new();
        router.add(&[term(json!({"type": "a"}))], a);
        router.add(&[term(json!({"type": "b"}))], b);
        (router, a, b)
    }

    #[test]
    fn test_disjoint_subscriptions() {
        let (router, a, b) = router_ab();
        let op = Operation::Add(vec![json!({"type": "a"}), json!({"type": "b"}), json!({"type": "c"})]);

        let routed = router.route(&op, UpdateMode::Strict);
        assert_eq!(routed.len(), 2);
        assert_eq!(routed[0], (a, RoutedBatch { adds: vec![json!({"type": "a"})], ..RoutedBatch::default() }));
        assert_eq!(routed[1], (b, RoutedBatch { adds: vec![json!({"type": "b"})], ..RoutedBatch::default() }));
    }

    #[test]
    fn test_update_moving_between_subscriptions() {
        let (router, a, b) = router_ab();
        let op = Operation::Update(vec![(json!({"id": 1, "type": "a"}), json!({"id": 1, "type": "b"}))]);

        let routed = router.route(&op, UpdateMode::Strict);
        assert_eq!(routed[0].0, a);
        assert_eq!(routed[0].1.removes, vec![json!({"id": 1, "type": "a"})]);
        assert_eq!(routed[1].0, b);
        assert_eq!(routed[1].1.adds, vec![json!({"id": 1, "type": "b"})]);
    }

    #[test]
    fn test_update_modes() {
        let dest = StageId::new(1);
        let mut router = QueryRouter::new();
        router.add(&[Term::new()], dest);
        let op = Operation::Update(vec![(json!({"id": 1}), json!({"id": 1, "v": 2}))]);

        let strict = router.route(&op, UpdateMode::Strict);
        assert_eq!(strict[0].1.updates.len(), 1);

        let split = router.route(&op, UpdateMode::Split);
        assert_eq!(split[0].1.clone().into_operations(), vec![
            Operation::Remove(vec![json!({"id": 1})]),
            Operation::Add(vec![json!({"id": 1, "v": 2})]),
        ]);
    }

    #[test]
    fn test_registered_without_terms_receives_nothing_but_clear() {
        let dest = StageId::new(5);
        let mut router = QueryRouter::new();
        router.register(dest);

        assert!(router.route(&Operation::Add(vec![json!({"x": 1})]), UpdateMode::Strict).is_empty());
        assert_eq!(router.route(&Operation::Clear, UpdateMode::Strict).len(), 1);
        assert_eq!(router.get_all_subscribers(), vec![dest]);
    }

    #[test]
    fn test_terms_of_and_remove() {
        let (mut router, a, _) = router_ab();
        router.add(&[term(json!({"type": "a"}))], a);
        assert_eq!(router.terms_of(a).len(), 2);

        let terms = router.terms_of(a);
        router.remove(&terms, a);
        assert!(router.query_of(a).unwrap().is_empty());
        assert!(router.is_registered(a));
    }

    #[test]
    fn test_into_operations_order() {
        let batch = RoutedBatch {
            removes: vec![json!(1)],
            updates: vec![(json!(2), json!(3))],
            adds: vec![json!(4)],
            clear: false,
        };
        let kinds: Vec<_> = batch.into_operations().iter().map(Operation::kind).collect();
        assert_eq!(kinds, vec![
            crate::core::OperationKind::Remove,
            crate::core::OperationKind::Update,
            crate::core::OperationKind::Add,
        ]);
    }
}
