//! Mock stages for testing.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

use crate::core::{Operation, Options, UpdatePair};
use crate::plug::{FetchContext, PendingFetch};
use crate::stages::{Emissions, Fetcher, OperationSink, QueryTransform, Snapshot};

/// One delivery seen by a [`RecordingStage`].
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    /// The delivered operation.
    pub operation: Operation,
    /// The options it arrived with.
    pub options: Options,
}

/// Shared view of what a [`RecordingStage`] received.
#[derive(Debug, Clone, Default)]
pub struct Recording {
    seen: Arc<Mutex<Vec<Recorded>>>,
}

impl Recording {
    /// Returns every delivery, in arrival order.
    #[must_use]
    pub fn operations(&self) -> Vec<Recorded> {
        self.seen.lock().clone()
    }

    /// Returns every value delivered in an add, in arrival order.
    #[must_use]
    pub fn added(&self) -> Vec<Value> {
        self.values(|op| match op {
            Operation::Add(values) => Some(values),
            _ => None,
        })
    }

    /// Returns every value delivered in a remove, in arrival order.
    #[must_use]
    pub fn removed(&self) -> Vec<Value> {
        self.values(|op| match op {
            Operation::Remove(values) => Some(values),
            _ => None,
        })
    }

    /// Returns how many deliveries ended a transaction.
    #[must_use]
    pub fn terminal_count(&self) -> usize {
        self.seen
            .lock()
            .iter()
            .filter(|r| r.options.transaction.is_some() && r.options.is_terminal())
            .count()
    }

    /// Returns the number of deliveries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// Returns true if nothing was delivered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    /// Forgets every delivery.
    pub fn clear(&self) {
        self.seen.lock().clear();
    }

    fn values(&self, pick: impl Fn(&Operation) -> Option<&Vec<Value>>) -> Vec<Value> {
        self.seen
            .lock()
            .iter()
            .filter_map(|r| pick(&r.operation))
            .flatten()
            .cloned()
            .collect()
    }

    fn push(&self, operation: Operation, options: &Options) {
        self.seen.lock().push(Recorded {
            operation,
            options: options.clone(),
        });
    }
}

/// A stage recording every operation it receives.
///
/// Operations are forwarded downstream unchanged unless the stage is made
/// silent.
#[derive(Debug, Clone, Default)]
pub struct RecordingStage {
    recording: Recording,
    silent: bool,
}

impl RecordingStage {
    /// Creates a forwarding recorder and the handle to inspect it.
    #[must_use]
    pub fn new() -> (Self, Recording) {
        let stage = Self::default();
        let recording = stage.recording.clone();
        (stage, recording)
    }

    /// Stops forwarding operations downstream.
    #[must_use]
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

impl OperationSink for RecordingStage {
    fn add(&mut self, values: Vec<Value>, options: &Options, out: &mut Emissions) {
        self.recording.push(Operation::Add(values.clone()), options);
        if !self.silent {
            out.add(values, options.clone());
        }
    }

    fn remove(&mut self, values: Vec<Value>, options: &Options, out: &mut Emissions) {
        self.recording.push(Operation::Remove(values.clone()), options);
        if !self.silent {
            out.remove(values, options.clone());
        }
    }

    fn update(&mut self, updates: Vec<UpdatePair>, options: &Options, out: &mut Emissions) {
        self.recording.push(Operation::Update(updates.clone()), options);
        if !self.silent {
            out.update(updates, options.clone());
        }
    }

    fn clear(&mut self, options: &Options, out: &mut Emissions) {
        self.recording.push(Operation::Clear, options);
        if !self.silent {
            out.clear(options.clone());
        }
    }
}

impl Fetcher for RecordingStage {}

impl QueryTransform for RecordingStage {}

/// Reply handles parked by a [`DeferredSource`].
#[derive(Debug, Clone, Default)]
pub struct PendingFetches {
    handles: Arc<Mutex<Vec<PendingFetch>>>,
}

impl PendingFetches {
    /// Takes every parked handle, oldest first.
    #[must_use]
    pub fn take(&self) -> Vec<PendingFetch> {
        std::mem::take(&mut *self.handles.lock())
    }

    /// Returns the number of parked handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Returns true if no fetch is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

/// A source answering every fetch later, through a parked [`PendingFetch`].
#[derive(Debug, Default)]
pub struct DeferredSource {
    pending: PendingFetches,
}

impl DeferredSource {
    /// Creates the source and the handle to its parked fetches.
    #[must_use]
    pub fn new() -> (Self, PendingFetches) {
        let source = Self::default();
        let pending = source.pending.clone();
        (source, pending)
    }
}

impl OperationSink for DeferredSource {}

impl Fetcher for DeferredSource {
    fn fetch_unfiltered(&mut self, context: &FetchContext) -> Snapshot {
        self.pending.handles.lock().push(context.defer());
        Snapshot::Deferred
    }
}

impl QueryTransform for DeferredSource {}
