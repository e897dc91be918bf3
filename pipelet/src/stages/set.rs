//! Stateful stage holding the latest value per key.

use super::{Emissions, Fetcher, OperationSink, QueryTransform, Snapshot};
use crate::core::{Options, UpdatePair};
use crate::plug::FetchContext;
use serde_json::Value;
use std::collections::BTreeMap;

/// Keeps its current state keyed by one field and answers fetches from it.
///
/// Meant to sit behind a greedy input so it always holds the complete
/// upstream state.
#[derive(Debug, Clone)]
pub struct Set {
    key: String,
    values: BTreeMap<String, Value>,
}

impl Set {
    /// Creates an empty set keyed by `key`.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            values: BTreeMap::new(),
        }
    }

    /// Returns the number of held values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn key_of(key: &str, value: &Value) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => value.to_string(),
    }
}

impl OperationSink for Set {
    fn add(&mut self, values: Vec<Value>, options: &Options, out: &mut Emissions) {
        for value in &values {
            self.values.insert(key_of(&self.key, value), value.clone());
        }
        out.add(values, options.clone());
    }

    fn remove(&mut self, values: Vec<Value>, options: &Options, out: &mut Emissions) {
        let removed: Vec<Value> = values
            .into_iter()
            .filter_map(|value| self.values.remove(&key_of(&self.key, &value)))
            .collect();
        out.emit_all(vec![crate::core::Operation::Remove(removed)], options);
    }

    fn update(&mut self, updates: Vec<UpdatePair>, options: &Options, out: &mut Emissions) {
        for (old, new) in &updates {
            self.values.remove(&key_of(&self.key, old));
            self.values.insert(key_of(&self.key, new), new.clone());
        }
        out.update(updates, options.clone());
    }

    fn clear(&mut self, options: &Options, out: &mut Emissions) {
        self.values.clear();
        out.clear(options.clone());
    }
}

impl Fetcher for Set {
    fn fetch_unfiltered(&mut self, _context: &FetchContext) -> Snapshot {
        Snapshot::Ready(self.values.values().cloned().collect())
    }
}

impl QueryTransform for Set {}
