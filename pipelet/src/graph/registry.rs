//! Keyed registry of shared stages.

use super::Graph;
use crate::core::StageId;
use std::collections::HashMap;

/// Holds at most one stage per key.
///
/// The registry is an ordinary value owned by whoever builds the graph, so
/// two graphs (or two tests) never share stages by accident.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    stages: HashMap<String, StageId>,
}

impl StageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stage registered under `key`, creating it on first use.
    pub fn get_or_insert_with(
        &mut self,
        graph: &mut Graph,
        key: impl Into<String>,
        make: impl FnOnce(&mut Graph) -> StageId,
    ) -> StageId {
        *self.stages.entry(key.into()).or_insert_with(|| make(graph))
    }

    /// Returns the stage registered under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<StageId> {
        self.stages.get(key).copied()
    }

    /// Forgets a key.
    pub fn remove(&mut self, key: &str) -> Option<StageId> {
        self.stages.remove(key)
    }

    /// Returns the number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphConfig;
    use crate::stages::PassThrough;

    #[test]
    fn test_one_stage_per_key() {
        let mut graph = Graph::new(GraphConfig::default()).unwrap();
        let mut registry = StageRegistry::new();

        let first = registry.get_or_insert_with(&mut graph, "shared", |g| g.add_stage("shared", PassThrough));
        let second = registry.get_or_insert_with(&mut graph, "shared", |g| g.add_stage("other", PassThrough));

        assert_eq!(first, second);
        assert_eq!(graph.stage_count(), 1);
        assert_eq!(registry.get("shared"), Some(first));
    }

    #[test]
    fn test_registries_are_independent() {
        let mut graph = Graph::new(GraphConfig::default()).unwrap();
        let mut left = StageRegistry::new();
        let mut right = StageRegistry::new();

        let a = left.get_or_insert_with(&mut graph, "k", |g| g.add_stage("a", PassThrough));
        let b = right.get_or_insert_with(&mut graph, "k", |g| g.add_stage("b", PassThrough));

        assert_ne!(a, b);
        assert_eq!(left.remove("k"), Some(a));
        assert!(left.is_empty());
    }
}
