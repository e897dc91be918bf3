//! Stage logic: the capability traits concrete stages implement.
//!
//! The protocol core never looks at data. It hands operations to a stage
//! through [`OperationSink`], asks it for snapshots through [`Fetcher`] and
//! lets it narrow subscriptions through [`QueryTransform`]. Every method has
//! a default, so a stage overrides only what it changes; a type implementing
//! all three is a [`StageLogic`].

mod filter;
mod pass_through;
mod set;
mod union;

pub use filter::Filter;
pub use pass_through::PassThrough;
pub use set::Set;
pub use union::union;

use crate::core::{Operation, Options, UpdatePair};
use crate::plug::FetchContext;
use crate::query::QueryChanges;
use serde_json::Value;

/// Operations a stage handler pushes to its output.
///
/// Emissions are buffered while the handler runs and flushed in order once
/// it returns.
#[derive(Debug, Default)]
pub struct Emissions {
    operations: Vec<(Operation, Options)>,
}

impl Emissions {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one operation.
    pub fn emit(&mut self, operation: Operation, options: Options) {
        self.operations.push((operation, options));
    }

    /// Queues added values.
    pub fn add(&mut self, values: Vec<Value>, options: Options) {
        self.emit(Operation::Add(values), options);
    }

    /// Queues removed values.
    pub fn remove(&mut self, values: Vec<Value>, options: Options) {
        self.emit(Operation::Remove(values), options);
    }

    /// Queues updates.
    pub fn update(&mut self, updates: Vec<UpdatePair>, options: Options) {
        self.emit(Operation::Update(updates), options);
    }

    /// Queues a clear.
    pub fn clear(&mut self, options: Options) {
        self.emit(Operation::Clear, options);
    }

    /// Queues several operations answering one incoming step.
    ///
    /// Empty operations are skipped; only the last one carries the incoming
    /// `more` flag. A terminal step with nothing left to send still emits one
    /// empty add so completion propagates.
    pub fn emit_all(&mut self, operations: Vec<Operation>, options: &Options) {
        let operations: Vec<_> = operations.into_iter().filter(|op| !op.is_empty()).collect();
        if operations.is_empty() {
            if options.is_terminal() {
                self.add(Vec::new(), options.clone());
            }
            return;
        }
        let steps = options.steps(operations.len());
        for (operation, step) in operations.into_iter().zip(steps) {
            self.emit(operation, step);
        }
    }

    /// Returns the number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns true if nothing was emitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub(crate) fn into_inner(self) -> Vec<(Operation, Options)> {
        self.operations
    }
}

/// Receives the four operations. Defaults forward unchanged.
pub trait OperationSink {
    /// Handles added values.
    fn add(&mut self, values: Vec<Value>, options: &Options, out: &mut Emissions) {
        out.add(values, options.clone());
    }

    /// Handles removed values.
    fn remove(&mut self, values: Vec<Value>, options: &Options, out: &mut Emissions) {
        out.remove(values, options.clone());
    }

    /// Handles `[old, new]` updates.
    fn update(&mut self, updates: Vec<UpdatePair>, options: &Options, out: &mut Emissions) {
        out.update(updates, options.clone());
    }

    /// Handles a clear.
    fn clear(&mut self, options: &Options, out: &mut Emissions) {
        out.clear(options.clone());
    }
}

/// How a stage answers a fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    /// No state of its own: fetch from upstream sources.
    Upstream,
    /// The complete current state, filtered by the fetch query afterwards.
    Ready(Vec<Value>),
    /// The stage replies later through [`FetchContext::defer`].
    Deferred,
}

/// Snapshot capability.
pub trait Fetcher {
    /// Produces the stage's full unfiltered state, if it has one.
    fn fetch_unfiltered(&mut self, _context: &FetchContext) -> Snapshot {
        Snapshot::Upstream
    }

    /// Maps values fetched from upstream before they are filtered and
    /// delivered downstream.
    fn transform_fetched(&mut self, values: Vec<Value>) -> Vec<Value> {
        values
    }
}

/// Subscription narrowing on the way upstream.
pub trait QueryTransform {
    /// Rewrites a subscription diff before it is forwarded to sources.
    fn transform_query(&self, changes: QueryChanges) -> QueryChanges {
        changes
    }
}

/// Complete stage logic.
pub trait StageLogic: OperationSink + Fetcher + QueryTransform {}

impl<T: OperationSink + Fetcher + QueryTransform> StageLogic for T {}

/// Routes one operation to the matching handler.
pub(crate) fn dispatch(logic: &mut dyn StageLogic, operation: Operation, options: &Options, out: &mut Emissions) {
    match operation {
        Operation::Add(values) => logic.add(values, options, out),
        Operation::Remove(values) => logic.remove(values, options, out),
        Operation::Update(updates) => logic.update(updates, options, out),
        Operation::Clear => logic.clear(options, out),
    }
}
