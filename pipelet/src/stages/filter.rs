//! Stage keeping only values matching a fixed query.

use super::{Emissions, Fetcher, OperationSink, QueryTransform};
use crate::core::{Operation, Options, UpdatePair};
use crate::query::{Matcher, Query, QueryChanges};
use serde_json::Value;

/// Drops values outside a fixed query.
///
/// Subscriptions forwarded upstream are ANDed with the filter, so sources
/// only push values that can pass it.
#[derive(Debug, Clone)]
pub struct Filter {
    query: Query,
    matcher: Matcher,
}

impl Filter {
    /// Creates a filter.
    #[must_use]
    pub fn new(query: Query) -> Self {
        let matcher = query.generate();
        Self { query, matcher }
    }

    /// Returns the filter query.
    #[must_use]
    pub fn query(&self) -> &Query {
        &self.query
    }
}

impl OperationSink for Filter {
    fn add(&mut self, values: Vec<Value>, options: &Options, out: &mut Emissions) {
        out.emit_all(vec![Operation::Add(self.matcher.retain(values))], options);
    }

    fn remove(&mut self, values: Vec<Value>, options: &Options, out: &mut Emissions) {
        out.emit_all(vec![Operation::Remove(self.matcher.retain(values))], options);
    }

    fn update(&mut self, updates: Vec<UpdatePair>, options: &Options, out: &mut Emissions) {
        let mut removes = Vec::new();
        let mut kept = Vec::new();
        let mut adds = Vec::new();
        for (old, new) in updates {
            match (self.matcher.matches(&old), self.matcher.matches(&new)) {
                (true, true) => kept.push((old, new)),
                (true, false) => removes.push(old),
                (false, true) => adds.push(new),
                (false, false) => {}
            }
        }
        out.emit_all(
            vec![Operation::Remove(removes), Operation::Update(kept), Operation::Add(adds)],
            options,
        );
    }
}

impl Fetcher for Filter {
    fn transform_fetched(&mut self, values: Vec<Value>) -> Vec<Value> {
        self.matcher.retain(values)
    }
}

impl QueryTransform for Filter {
    fn transform_query(&self, changes: QueryChanges) -> QueryChanges {
        let narrow = |terms| Query::from_terms(terms).and(&self.query).terms();
        QueryChanges::new(narrow(changes.removes), narrow(changes.adds))
    }
}
