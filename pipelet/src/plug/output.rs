//! Output plug: fans a stage's operations out to its destinations.
//!
//! The router is the only place routing state changes, and it changes only
//! through the output's update queue, so a destination's subscription moves
//! in step with the fetches that back it.

use super::{QueryUpdate, QueryUpdateQueue, QueuedUpdate};
use crate::core::{Operation, Options, PlugRef, StageId, UpdatePair};
use crate::errors::{PipeletError, Result};
use crate::graph::{Graph, PlugEvent, PlugEventKind};
use crate::query::{QueryChanges, QueryRouter};
use crate::transactions::{ForkTag, OutputTransactions, TransactionId, TransactionMeta, Transactions};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
pub(crate) struct OutputState {
    pub(crate) destinations: Vec<StageId>,
    pub(crate) router: QueryRouter,
    pub(crate) queue: QueryUpdateQueue,
    pub(crate) transactions: Transactions,
    pub(crate) per_destination: OutputTransactions,
    pub(crate) fork_tag: Option<ForkTag>,
}

impl OutputState {
    pub(crate) fn add_destination(&mut self, owner: StageId, destination: StageId) -> Result<()> {
        if self.destinations.contains(&destination) {
            return Err(PipeletError::DuplicateDestination {
                output: owner,
                destination,
            });
        }
        self.destinations.push(destination);
        Ok(())
    }

    /// Returns true when the last destination is gone.
    pub(crate) fn remove_destination(&mut self, owner: StageId, destination: StageId) -> Result<bool> {
        let Some(pos) = self.destinations.iter().position(|d| *d == destination) else {
            return Err(PipeletError::DestinationNotFound {
                output: owner,
                destination,
            });
        };
        self.destinations.remove(pos);
        Ok(self.destinations.is_empty())
    }
}

impl Graph {
    /// Changes what `destination` receives from `output`.
    ///
    /// The change is queued behind fetches still pending on the output,
    /// then folded into the router and forwarded, through the stage's
    /// query transform, to its input. A controllet forwards it to its
    /// sources unchanged.
    pub fn update_query(&mut self, output: StageId, changes: QueryChanges, destination: StageId) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let record = self.record_mut(output)?;
        if record.is_controllet() {
            for source in record.input.sources.clone() {
                self.update_query(source, changes.clone(), destination)?;
            }
            return Ok(());
        }
        record
            .output
            .queue
            .push_done(QueuedUpdate::new(QueryUpdate::Changes(changes), Some(destination)));
        self.drain_output_queue(output)
    }

    pub(crate) fn drain_output_queue(&mut self, output: StageId) -> Result<()> {
        let ready = self.record_mut(output)?.output.queue.drain_ready();
        for update in ready {
            self.apply_output_update(output, update)?;
        }
        Ok(())
    }

    fn apply_output_update(&mut self, output: StageId, update: QueuedUpdate) -> Result<()> {
        let Some(destination) = update.destination else {
            warn!(output = %output, "output update without destination ignored");
            return Ok(());
        };
        let record = self.record_mut(output)?;
        let changes = match update.update {
            QueryUpdate::Changes(changes) => changes,
            QueryUpdate::RemoveDestination => QueryChanges::removing(record.output.router.terms_of(destination)),
        };
        if changes.is_empty() {
            return Ok(());
        }
        record.output.router.apply(&changes, destination);
        trace!(
            output = %output,
            destination = %destination,
            adds = changes.adds.len(),
            removes = changes.removes.len(),
            "router updated"
        );
        if !update.propagate {
            return Ok(());
        }
        let upstream = self.with_logic(output, |logic| logic.transform_query(changes))?;
        self.update_upstream_query(output, upstream)
    }

    /// Detaches a destination; the last one leaving fires
    /// [`PlugEventKind::Disconnected`].
    pub(crate) fn detach_destination(&mut self, output: StageId, destination: StageId) -> Result<()> {
        if !self.record_mut(output)?.output.remove_destination(output, destination)? {
            return Ok(());
        }
        debug!(output = %output, "output disconnected");
        self.publish("output.disconnected", json!({ "output": output.index(), "last": destination.index() }));
        self.fire(&PlugEvent::lifecycle(
            PlugRef::Output(output),
            PlugEventKind::Disconnected,
            Some(destination),
        ))
    }

    /// Emits an operation from `stage`'s output.
    ///
    /// The output's fork tag is stamped first. An empty emission that does
    /// not end a transaction is dropped; a terminal one is always routed so
    /// destinations holding partial data see the transaction end.
    pub fn emit(&mut self, stage: StageId, operation: Operation, options: Options) -> Result<()> {
        let record = self.record(stage)?;
        if record.is_controllet() {
            return Err(PipeletError::ControlletOperation(stage));
        }
        let mut options = options;
        if let Some(tag) = record.output.fork_tag.clone() {
            let meta = options
                .transaction
                .get_or_insert_with(|| TransactionMeta::new(TransactionId::generate(), false));
            if !meta.forks.contains(&tag) {
                meta.forks.push(tag);
            }
        }
        if operation.is_empty() && !options.is_terminal() {
            trace!(stage = %stage, "empty non-terminal emission dropped");
            return Ok(());
        }

        self.route(stage, &operation, &options)?;
        self.fire(&PlugEvent::operation(PlugRef::Output(stage), &operation, &options))?;
        if !options.is_terminal() {
            return Ok(());
        }
        self.fire(&PlugEvent {
            kind: PlugEventKind::Complete,
            ..PlugEvent::operation(PlugRef::Output(stage), &operation, &options)
        })?;
        if let Some(id) = options.transaction_id() {
            debug!(stage = %stage, transaction = %id, "transaction completed");
            self.publish(
                "transaction.completed",
                json!({
                    "stage": stage.index(),
                    "transaction": id.to_string(),
                    "forks": options.forks().iter().map(ForkTag::as_str).collect::<Vec<_>>(),
                }),
            );
        }
        Ok(())
    }

    fn route(&mut self, stage: StageId, operation: &Operation, options: &Options) -> Result<()> {
        let mode = self.config.update_mode;
        let output = &self.record(stage)?.output;
        let routed = output.router.route(operation, mode);
        let subscribers = output.router.get_all_subscribers();

        let mut notified = BTreeSet::new();
        for (destination, batch) in routed {
            let operations = batch.into_operations();
            let steps = options.steps(operations.len());
            for (operation, step) in operations.into_iter().zip(steps) {
                let delivery = self.record_mut(stage)?.output.per_destination.get_options(destination, &step);
                self.deliver(destination, Some(stage), operation, delivery.options)?;
            }
            notified.insert(destination);
        }

        let Some(meta) = options.transaction.as_ref().filter(|meta| !meta.more) else {
            return Ok(());
        };
        let pending = if meta.forks.is_empty() {
            self.record(stage)?.output.per_destination.open_destinations(meta.id)
        } else {
            subscribers
        };
        for destination in pending.into_iter().filter(|d| !notified.contains(d)) {
            trace!(stage = %stage, destination = %destination, transaction = %meta.id, "closing transaction");
            let delivery = self.record_mut(stage)?.output.per_destination.get_options(destination, options);
            self.deliver(destination, Some(stage), Operation::Add(Vec::new()), delivery.options)?;
        }
        Ok(())
    }

    /// Emits added values.
    pub fn emit_add(&mut self, stage: StageId, values: Vec<Value>) -> Result<()> {
        self.emit(stage, Operation::Add(values), Options::new())
    }

    /// Emits removed values.
    pub fn emit_remove(&mut self, stage: StageId, values: Vec<Value>) -> Result<()> {
        self.emit(stage, Operation::Remove(values), Options::new())
    }

    /// Emits updates.
    pub fn emit_update(&mut self, stage: StageId, updates: Vec<UpdatePair>) -> Result<()> {
        self.emit(stage, Operation::Update(updates), Options::new())
    }

    /// Emits a clear.
    pub fn emit_clear(&mut self, stage: StageId) -> Result<()> {
        self.emit(stage, Operation::Clear, Options::new())
    }

    /// Emits `steps` as one transaction and returns its id.
    ///
    /// Every step but the last carries `more`; an empty list still emits
    /// the terminal step. Inside an upstream transaction (`options` carrying
    /// one) the id and `more` flag are inherited.
    pub fn emit_transaction(&mut self, stage: StageId, steps: Vec<Operation>, options: &Options) -> Result<TransactionId> {
        let output = &mut self.record_mut(stage)?.output;
        let transaction = output
            .transactions
            .get_transaction(steps.len(), options, output.fork_tag.as_ref());
        let id = transaction.id();
        if steps.is_empty() {
            let last = output.transactions.end(transaction);
            self.emit(stage, Operation::Add(Vec::new()), last)?;
            return Ok(id);
        }
        for operation in steps {
            let step = self.record_mut(stage)?.output.transactions.next(&transaction);
            self.emit(stage, operation, step)?;
        }
        Ok(id)
    }

    /// Sets the fork tag stamped on every emission of `stage`.
    pub fn set_fork_tag(&mut self, stage: StageId, tag: Option<ForkTag>) -> Result<()> {
        self.record_mut(stage)?.output.fork_tag = tag;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OperationKind;
    use crate::plug::SourceOptions;
    use crate::query::Term;
    use crate::stages::PassThrough;
    use crate::testing::RecordingStage;
    use crate::graph::GraphConfig;
    use serde_json::json;

    fn term(value: Value) -> Term {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_destination_list_errors() {
        let mut state = OutputState::default();
        let (owner, dest) = (StageId::new(0), StageId::new(1));
        state.add_destination(owner, dest).unwrap();
        assert!(matches!(
            state.add_destination(owner, dest),
            Err(PipeletError::DuplicateDestination { .. })
        ));
        assert!(state.remove_destination(owner, dest).unwrap());
        assert!(matches!(
            state.remove_destination(owner, dest),
            Err(PipeletError::DestinationNotFound { .. })
        ));
    }

    #[test]
    fn test_emit_routes_by_subscription() {
        let mut graph = Graph::new(GraphConfig::default()).unwrap();
        let source = graph.add_stage("source", PassThrough);
        let (stage, recording) = RecordingStage::new();
        let sink = graph.add_stage("sink", stage);
        graph.add_source(sink, source, SourceOptions::no_fetch()).unwrap();
        graph
            .update_upstream_query(sink, QueryChanges::adding(vec![term(json!({"k": 1}))]))
            .unwrap();

        graph.emit_add(source, vec![json!({"k": 1}), json!({"k": 2})]).unwrap();

        assert_eq!(recording.added(), vec![json!({"k": 1})]);
    }

    #[test]
    fn test_empty_non_terminal_emission_dropped() {
        let mut graph = Graph::new(GraphConfig::default()).unwrap();
        let source = graph.add_stage("source", PassThrough);
        let (stage, recording) = RecordingStage::new();
        let sink = graph.add_stage_with(crate::graph::StageSpec::new("sink", stage).greedy());
        graph.add_source(sink, source, SourceOptions::no_fetch()).unwrap();

        let partial = Options::new().with_transaction(TransactionMeta::new(TransactionId::generate(), true));
        graph.emit(source, Operation::Add(Vec::new()), partial).unwrap();
        assert!(recording.is_empty());
    }

    #[test]
    fn test_terminal_step_reaches_destination_with_partial_data() {
        let mut graph = Graph::new(GraphConfig::default()).unwrap();
        let source = graph.add_stage("source", PassThrough);
        let (stage, recording) = RecordingStage::new();
        let sink = graph.add_stage("sink", stage);
        graph.add_source(sink, source, SourceOptions::no_fetch()).unwrap();
        graph
            .update_upstream_query(sink, QueryChanges::adding(vec![term(json!({"k": 1}))]))
            .unwrap();

        let id = graph
            .emit_transaction(
                source,
                vec![Operation::Add(vec![json!({"k": 1})]), Operation::Add(vec![json!({"k": 2})])],
                &Options::new(),
            )
            .unwrap();

        let seen = recording.operations();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].operation, Operation::Add(vec![json!({"k": 1})]));
        assert!(seen[0].options.more());
        assert_eq!(seen[1].operation.kind(), OperationKind::Add);
        assert!(seen[1].operation.is_empty());
        assert_eq!(seen[1].options.transaction_id(), Some(id));
        assert!(seen[1].options.is_terminal());
    }

    #[test]
    fn test_controllet_cannot_emit() {
        let mut graph = Graph::new(GraphConfig::default()).unwrap();
        let union = graph.add_stage_with(crate::graph::StageSpec::controllet("u"));
        assert!(matches!(
            graph.emit_clear(union),
            Err(PipeletError::ControlletOperation(_))
        ));
    }

    #[test]
    fn test_disconnected_fires_on_last_destination() {
        let mut graph = Graph::new(GraphConfig::default()).unwrap();
        let source = graph.add_stage("source", PassThrough);
        let sink = graph.add_stage("sink", PassThrough);
        graph.add_source(sink, source, SourceOptions::no_fetch()).unwrap();

        let fired = std::rc::Rc::new(std::cell::Cell::new(0));
        let count = fired.clone();
        graph.on(PlugRef::Output(source), PlugEventKind::Disconnected, move |_, event| {
            assert_eq!(event.peer, Some(sink));
            count.set(count.get() + 1);
            Ok(())
        });
        graph.remove_source(sink, source, SourceOptions::no_fetch()).unwrap();
        assert_eq!(fired.get(), 1);
    }
}
