//! Input plug: a stage's demand on its sources.
//!
//! The input keeps two queries. `future_query` is what the stage wants once
//! every pending change settles; `query` is what its sources have
//! acknowledged. Changes go through the input's update queue, so `query`
//! trails `future_query` only while changes wait on a fetch.

use super::fetch::FetchReceiver;
use super::{QueryUpdate, QueryUpdateQueue, QueuedUpdate};
use crate::core::{FetchChunk, FetchId, InputMode, Operation, OperationKind, PlugRef, StageId};
use crate::errors::{PipeletError, Result};
use crate::graph::{Graph, PlugEvent, PlugEventKind};
use crate::query::{Query, QueryChanges};
use crate::transactions::{ForkTag, InputTransactions};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use tracing::{debug, trace};

/// Options of [`Graph::add_source`] and [`Graph::remove_source`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOptions {
    /// Change the subscription without fetching (or retracting) values.
    #[serde(default)]
    pub no_fetch: bool,
}

impl SourceOptions {
    /// Options skipping the snapshot fetch.
    #[must_use]
    pub const fn no_fetch() -> Self {
        Self { no_fetch: true }
    }

    /// Sets the `no_fetch` flag.
    #[must_use]
    pub const fn with_no_fetch(mut self, no_fetch: bool) -> Self {
        self.no_fetch = no_fetch;
        self
    }
}

type OnEnd = Box<dyn FnOnce(&mut Graph) -> Result<()>>;

pub(crate) struct InputState {
    pub(crate) mode: InputMode,
    multi_source: bool,
    pub(crate) sources: Vec<StageId>,
    pub(crate) query: Query,
    pub(crate) future_query: Query,
    pub(crate) queue: QueryUpdateQueue,
    pub(crate) transactions: InputTransactions,
    in_flight: BTreeMap<FetchId, StageId>,
}

impl std::fmt::Debug for InputState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputState")
            .field("mode", &self.mode)
            .field("sources", &self.sources)
            .field("query", &self.query.describe())
            .field("future_query", &self.future_query.describe())
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl InputState {
    pub(crate) fn new(mode: InputMode, multi_source: bool) -> Self {
        let query = match mode {
            InputMode::Greedy => Query::pass_all(),
            InputMode::Subscriber => Query::new(),
        };
        Self {
            mode,
            multi_source,
            sources: Vec::new(),
            future_query: query.clone(),
            query,
            queue: QueryUpdateQueue::new(),
            transactions: InputTransactions::new(),
            in_flight: BTreeMap::new(),
        }
    }

    fn attach(&mut self, owner: StageId, source: StageId) -> Result<()> {
        if !self.multi_source {
            if let Some(&existing) = self.sources.first() {
                return Err(PipeletError::SourceAlreadyAttached {
                    input: owner,
                    existing,
                    upstream: source,
                });
            }
        }
        if self.sources.contains(&source) {
            return Err(PipeletError::DuplicateSource {
                input: owner,
                upstream: source,
            });
        }
        self.sources.push(source);
        Ok(())
    }

    fn detach(&mut self, source: StageId) -> bool {
        let before = self.sources.len();
        self.sources.retain(|s| *s != source);
        before != self.sources.len()
    }
}

fn signed(count: usize) -> isize {
    isize::try_from(count).unwrap_or(isize::MAX)
}

impl Graph {
    /// Connects `source`'s output to `stage`'s input.
    ///
    /// Unless `no_fetch` is set, the current values matching the stage's
    /// subscription are fetched and delivered to the stage as adds. A lazy
    /// input fetches with an empty query and receives nothing. When the
    /// source answers synchronously the values arrive before this returns.
    pub fn add_source(&mut self, stage: StageId, source: StageId, options: SourceOptions) -> Result<()> {
        self.record(source)?;
        self.record_mut(stage)?.input.attach(stage, source)?;
        if let Err(err) = self.record_mut(source)?.output.add_destination(source, stage) {
            self.record_mut(stage)?.input.detach(source);
            return Err(err);
        }
        debug!(stage = %stage, source = %source, no_fetch = options.no_fetch, "source added");
        self.publish(
            "stage.source_added",
            json!({ "stage": stage.index(), "source": source.index(), "no_fetch": options.no_fetch }),
        );

        let source_record = self.record(source)?;
        if source_record.is_controllet() {
            if let Some(tag) = source_record.input.transactions.tag().cloned() {
                self.set_join_tag(stage, Some(tag))?;
            }
        }

        if !self.record(stage)?.is_controllet() {
            return self.subscribe_source(stage, source, options);
        }
        let share = self.branch_share(source)?;
        self.record_mut(stage)?.input.transactions.add_branches(signed(share));
        for destination in self.ultimate_destinations(stage)? {
            self.subscribe_source(destination, source, options)?;
        }
        Ok(())
    }

    /// Disconnects `source` from `stage`'s input.
    ///
    /// Listeners get [`PlugEventKind::RemoveSource`] before anything is
    /// detached. Fetches still running toward the source are cancelled, the
    /// values the stage received through it are fetched and delivered as
    /// removes (unless `no_fetch`), and transactions the source left open
    /// are terminated. Branch accounting and routing state are released
    /// once that removal fetch settles.
    pub fn remove_source(&mut self, stage: StageId, source: StageId, options: SourceOptions) -> Result<()> {
        if !self.record(stage)?.input.sources.contains(&source) {
            return Err(PipeletError::SourceNotFound {
                input: stage,
                upstream: source,
            });
        }
        self.fire(&PlugEvent::lifecycle(PlugRef::Input(stage), PlugEventKind::RemoveSource, Some(source)))?;
        if !self.record_mut(stage)?.input.detach(source) {
            trace!(stage = %stage, source = %source, "source already detached by a listener");
            return Ok(());
        }
        debug!(stage = %stage, source = %source, no_fetch = options.no_fetch, "source removed");
        self.publish(
            "stage.source_removed",
            json!({ "stage": stage.index(), "source": source.index(), "no_fetch": options.no_fetch }),
        );
        self.detach_destination(source, stage)?;

        if !self.record(stage)?.is_controllet() {
            return self.unsubscribe_source(stage, source, options);
        }
        let share = self.branch_share(source)?;
        self.record_mut(stage)?.input.transactions.add_branches(-signed(share));
        for destination in self.ultimate_destinations(stage)? {
            self.unsubscribe_source(destination, source, options)?;
        }
        Ok(())
    }

    /// Propagates a subscription change of `stage`'s downstream to its
    /// sources.
    ///
    /// The change is folded into `future_query` at once and applied to
    /// `query` in queue order; only the resulting minimal diff travels
    /// further upstream. A no-op on greedy inputs.
    pub fn update_upstream_query(&mut self, stage: StageId, changes: QueryChanges) -> Result<()> {
        let record = self.record_mut(stage)?;
        if record.is_controllet() {
            return Err(PipeletError::ControlletOperation(stage));
        }
        if record.input.mode == InputMode::Greedy || changes.is_empty() {
            return Ok(());
        }
        record.input.future_query.apply(&changes);
        record.input.future_query.discard_operations();
        record
            .input
            .queue
            .push_done(QueuedUpdate::new(QueryUpdate::Changes(changes), None));
        self.drain_input_queue(stage)
    }

    /// Changes what `stage` itself wants from its sources.
    ///
    /// Newly wanted terms are fetched and delivered as adds; the input's
    /// `query` catches up once every source answered. Values matching only
    /// dropped terms are not retracted. A no-op on greedy inputs.
    pub fn update_subscription(&mut self, stage: StageId, changes: QueryChanges) -> Result<()> {
        let record = self.record_mut(stage)?;
        if record.is_controllet() {
            return Err(PipeletError::ControlletOperation(stage));
        }
        if record.input.mode == InputMode::Greedy {
            return Ok(());
        }
        record.input.future_query.apply(&changes);
        let diff = record.input.future_query.discard_operations();
        if diff.is_empty() {
            return Ok(());
        }
        let sources = record.input.sources.clone();
        debug!(stage = %stage, adds = diff.adds.len(), removes = diff.removes.len(), "subscription changed");

        if diff.adds.is_empty() || sources.is_empty() {
            record
                .input
                .queue
                .push_done(QueuedUpdate::new(QueryUpdate::Changes(changes), None));
            return self.drain_input_queue(stage);
        }

        let seq = record
            .input
            .queue
            .push(QueuedUpdate::local(QueryUpdate::Changes(changes), None));
        let remaining = Rc::new(Cell::new(sources.len()));
        for source in sources {
            let remaining = Rc::clone(&remaining);
            let on_end: OnEnd = Box::new(move |graph| {
                remaining.set(remaining.get().saturating_sub(1));
                if remaining.get() == 0 {
                    graph.complete_queued(PlugRef::Input(stage), seq, true)?;
                }
                Ok(())
            });
            let fetch = self.fetch_with(
                source,
                Some(Query::from_terms(diff.adds.clone())),
                Some(QueryUpdate::Changes(diff.clone())),
                Some(stage),
                Self::source_receiver(stage, OperationKind::Add, Some(on_end)),
            )?;
            self.track_in_flight(stage, fetch, source)?;
        }
        Ok(())
    }

    /// Returns true if the stage wants nothing from its sources.
    ///
    /// A controllet is lazy when every destination is.
    pub fn is_lazy(&self, stage: StageId) -> Result<bool> {
        let record = self.record(stage)?;
        if record.is_controllet() {
            for &destination in &record.output.destinations {
                if !self.is_lazy(destination)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
        Ok(record.input.mode != InputMode::Greedy && record.input.query.is_empty())
    }

    /// Sets the fork tag `stage`'s input joins on. A controllet hands the
    /// tag on to its destinations.
    pub fn set_join_tag(&mut self, stage: StageId, tag: Option<ForkTag>) -> Result<()> {
        let record = self.record_mut(stage)?;
        record.input.transactions.set_tag(tag.clone());
        if !record.is_controllet() {
            return Ok(());
        }
        for destination in record.output.destinations.clone() {
            self.set_join_tag(destination, tag.clone())?;
        }
        Ok(())
    }

    pub(crate) fn drain_input_queue(&mut self, stage: StageId) -> Result<()> {
        let ready = self.record_mut(stage)?.input.queue.drain_ready();
        for update in ready {
            self.apply_input_update(stage, update)?;
        }
        Ok(())
    }

    fn apply_input_update(&mut self, stage: StageId, update: QueuedUpdate) -> Result<()> {
        let QueryUpdate::Changes(changes) = update.update else {
            return Ok(());
        };
        let record = self.record_mut(stage)?;
        record.input.query.apply(&changes);
        let diff = record.input.query.discard_operations();
        if !update.propagate || diff.is_empty() {
            return Ok(());
        }
        let sources = record.input.sources.clone();
        trace!(stage = %stage, adds = diff.adds.len(), removes = diff.removes.len(), "query propagated upstream");
        for source in sources {
            self.update_query(source, diff.clone(), stage)?;
        }
        Ok(())
    }

    /// Registers `destination` with the routers behind `source` and fetches
    /// what it wants from them.
    fn subscribe_source(&mut self, destination: StageId, source: StageId, options: SourceOptions) -> Result<()> {
        for upstream in self.ultimate_sources(source)? {
            self.record_mut(upstream)?.output.router.register(destination);
        }
        let share = self.branch_share(source)?;
        let record = self.record_mut(destination)?;
        record.input.transactions.add_branches(signed(share));
        let terms = record.input.future_query.terms();

        if options.no_fetch {
            return self.update_query(source, QueryChanges::adding(terms), destination);
        }
        let fetch = self.fetch_with(
            source,
            Some(Query::from_terms(terms.clone())),
            Some(QueryUpdate::Changes(QueryChanges::adding(terms))),
            Some(destination),
            Self::source_receiver(destination, OperationKind::Add, None),
        )?;
        self.track_in_flight(destination, fetch, source)
    }

    fn unsubscribe_source(&mut self, destination: StageId, source: StageId, options: SourceOptions) -> Result<()> {
        let upstream = self.ultimate_sources(source)?;

        let mut targets: BTreeSet<StageId> = upstream.iter().copied().collect();
        targets.insert(source);
        let doomed: Vec<FetchId> = self
            .record(destination)?
            .input
            .in_flight
            .iter()
            .filter(|(_, target)| targets.contains(target))
            .map(|(fetch, _)| *fetch)
            .collect();
        for fetch in doomed {
            self.record_mut(destination)?.input.in_flight.remove(&fetch);
            trace!(fetch = %fetch, destination = %destination, "cancelling fetch toward removed source");
            self.cancel_fetch(fetch)?;
        }

        let share = self.branch_share(source)?;
        let reached = self.reachable_sources(destination)?;
        let update = if upstream.iter().any(|u| reached.contains(u)) {
            // Another path still feeds these routers: only withdraw this
            // path's share of the subscription.
            QueryUpdate::Changes(QueryChanges::removing(self.record(destination)?.input.query.terms()))
        } else {
            QueryUpdate::RemoveDestination
        };

        if options.no_fetch {
            for &u in &upstream {
                self.record_mut(u)?
                    .output
                    .queue
                    .push_done(QueuedUpdate::new(update.clone(), Some(destination)));
                self.drain_output_queue(u)?;
            }
            return self.finish_removal(destination, &upstream, share);
        }

        let query = match &update {
            QueryUpdate::Changes(changes) => Some(Query::from_terms(changes.removes.clone())),
            QueryUpdate::RemoveDestination => None,
        };
        let on_end: OnEnd = Box::new(move |graph| graph.finish_removal(destination, &upstream, share));
        self.fetch_with(
            source,
            query,
            Some(update),
            Some(destination),
            Self::source_receiver(destination, OperationKind::Remove, Some(on_end)),
        )?;
        Ok(())
    }

    /// Terminates what the removed sources left open and releases their
    /// routing state.
    fn finish_removal(&mut self, destination: StageId, upstream: &[StageId], share: usize) -> Result<()> {
        for &u in upstream {
            let closing = self.record_mut(destination)?.input.transactions.remove_source(u);
            for options in closing {
                self.deliver(destination, Some(u), Operation::Add(Vec::new()), options)?;
            }
        }
        self.record_mut(destination)?
            .input
            .transactions
            .add_branches(-signed(share));

        let reached = self.reachable_sources(destination)?;
        for &u in upstream.iter().filter(|u| !reached.contains(*u)) {
            let output = &mut self.record_mut(u)?.output;
            output.per_destination.remove_destination(destination);
            output.router.unregister(destination);
        }
        trace!(destination = %destination, sources = upstream.len(), "source removal settled");
        Ok(())
    }

    /// Non-controllet stages currently feeding `stage` directly or through
    /// controllets.
    fn reachable_sources(&self, stage: StageId) -> Result<BTreeSet<StageId>> {
        let mut reached = BTreeSet::new();
        for &source in &self.record(stage)?.input.sources {
            reached.extend(self.ultimate_sources(source)?);
        }
        Ok(reached)
    }

    fn track_in_flight(&mut self, stage: StageId, fetch: FetchId, target: StageId) -> Result<()> {
        if self.fetches.is_active(fetch) {
            self.record_mut(stage)?.input.in_flight.insert(fetch, target);
        }
        Ok(())
    }

    /// Receiver handing fetched values to `stage` as adds or removes.
    fn source_receiver(stage: StageId, kind: OperationKind, on_end: Option<OnEnd>) -> FetchReceiver {
        let mut on_end = on_end;
        Box::new(move |graph, chunk| {
            let FetchChunk {
                adds,
                removes,
                terminal,
                options,
                ..
            } = chunk;
            if kind == OperationKind::Remove {
                if !adds.is_empty() {
                    graph.deliver(stage, None, Operation::Remove(adds), options)?;
                }
            } else {
                if !removes.is_empty() {
                    graph.deliver(stage, None, Operation::Remove(removes), options.clone())?;
                }
                if !adds.is_empty() {
                    graph.deliver(stage, None, Operation::Add(adds), options)?;
                }
            }
            if !terminal {
                return Ok(());
            }
            let fetches = &graph.fetches;
            if let Some(record) = graph.stages.get_mut(stage.index()) {
                record.input.in_flight.retain(|fetch, _| fetches.is_active(*fetch));
            }
            match on_end.take() {
                Some(finish) => finish(graph),
                None => Ok(()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Options;
    use crate::graph::{GraphConfig, StageSpec};
    use crate::query::Term;
    use crate::stages::{PassThrough, Set};
    use crate::testing::RecordingStage;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn term(value: Value) -> Term {
        value.as_object().cloned().unwrap()
    }

    fn graph() -> Graph {
        Graph::new(GraphConfig::default()).unwrap()
    }

    #[test]
    fn test_single_source_input_refuses_second_source() {
        let mut graph = graph();
        let a = graph.add_stage("a", PassThrough);
        let b = graph.add_stage("b", PassThrough);
        let sink = graph.add_stage("sink", PassThrough);

        graph.add_source(sink, a, SourceOptions::no_fetch()).unwrap();
        let err = graph.add_source(sink, b, SourceOptions::no_fetch()).unwrap_err();
        assert!(matches!(err, PipeletError::SourceAlreadyAttached { existing, .. } if existing == a));
        assert!(graph.destinations(b).unwrap().is_empty());
    }

    #[test]
    fn test_multi_source_input_refuses_duplicate() {
        let mut graph = graph();
        let a = graph.add_stage("a", PassThrough);
        let sink = graph.add_stage_with(StageSpec::new("sink", PassThrough).multi_source());

        graph.add_source(sink, a, SourceOptions::no_fetch()).unwrap();
        let err = graph.add_source(sink, a, SourceOptions::no_fetch()).unwrap_err();
        assert!(matches!(err, PipeletError::DuplicateSource { .. }));
    }

    #[test]
    fn test_remove_unknown_source() {
        let mut graph = graph();
        let a = graph.add_stage("a", PassThrough);
        let sink = graph.add_stage("sink", PassThrough);
        let err = graph.remove_source(sink, a, SourceOptions::default()).unwrap_err();
        assert!(matches!(err, PipeletError::SourceNotFound { .. }));
    }

    #[test]
    fn test_greedy_input_fetches_everything() {
        let mut graph = graph();
        let set = graph.add_stage_with(StageSpec::new("set", Set::new("id")).greedy());
        graph
            .inject(set, Operation::Add(vec![json!({"id": 1}), json!({"id": 2})]), Options::new())
            .unwrap();
        let (stage, recording) = RecordingStage::new();
        let sink = graph.add_stage_with(StageSpec::new("sink", stage).greedy());

        graph.add_source(sink, set, SourceOptions::default()).unwrap();

        assert_eq!(recording.added(), vec![json!({"id": 1}), json!({"id": 2})]);
        assert!(!graph.is_lazy(sink).unwrap());
        graph.update_upstream_query(sink, QueryChanges::adding(vec![term(json!({"x": 1}))])).unwrap();
        assert!(graph.query(sink).unwrap().is_pass_all());
    }

    #[test]
    fn test_update_upstream_query_reaches_router() {
        let mut graph = graph();
        let source = graph.add_stage("source", PassThrough);
        let middle = graph.add_stage("middle", PassThrough);
        graph.add_source(middle, source, SourceOptions::no_fetch()).unwrap();
        let wanted = term(json!({"type": "a"}));

        graph.update_upstream_query(middle, QueryChanges::adding(vec![wanted.clone()])).unwrap();

        assert_eq!(graph.query(middle).unwrap(), graph.future_query(middle).unwrap());
        assert!(graph.query(middle).unwrap().contains(&wanted));
        assert!(graph.subscription(source, middle).unwrap().unwrap().contains(&wanted));
        assert!(graph.query(source).unwrap().contains(&wanted));
    }

    #[test]
    fn test_update_subscription_fetches_new_terms() {
        let mut graph = graph();
        let set = graph.add_stage_with(StageSpec::new("set", Set::new("id")).greedy());
        graph
            .inject(
                set,
                Operation::Add(vec![json!({"id": 1, "t": "a"}), json!({"id": 2, "t": "b"})]),
                Options::new(),
            )
            .unwrap();
        let (stage, recording) = RecordingStage::new();
        let sink = graph.add_stage("sink", stage);
        graph.add_source(sink, set, SourceOptions::default()).unwrap();
        assert!(graph.is_lazy(sink).unwrap());
        assert!(recording.added().is_empty());

        graph
            .update_subscription(sink, QueryChanges::adding(vec![term(json!({"t": "b"}))]))
            .unwrap();

        assert_eq!(recording.added(), vec![json!({"id": 2, "t": "b"})]);
        assert!(!graph.is_lazy(sink).unwrap());
        assert_eq!(graph.query(sink).unwrap(), graph.future_query(sink).unwrap());

        graph
            .inject(set, Operation::Add(vec![json!({"id": 3, "t": "b"}), json!({"id": 4, "t": "a"})]), Options::new())
            .unwrap();
        assert_eq!(recording.added().last(), Some(&json!({"id": 3, "t": "b"})));
    }

    #[test]
    fn test_controllet_rejects_query_updates() {
        let mut graph = graph();
        let union = graph.add_stage_with(StageSpec::controllet("union"));
        let err = graph.update_upstream_query(union, QueryChanges::default()).unwrap_err();
        assert!(matches!(err, PipeletError::ControlletOperation(_)));
        assert!(graph.is_lazy(union).unwrap());
    }

    #[test]
    fn test_remove_source_listener_sees_source_attached() {
        let mut graph = graph();
        let a = graph.add_stage("a", PassThrough);
        let sink = graph.add_stage("sink", PassThrough);
        graph.add_source(sink, a, SourceOptions::no_fetch()).unwrap();

        let seen = Rc::new(Cell::new(false));
        let flag = seen.clone();
        graph.on(PlugRef::Input(sink), PlugEventKind::RemoveSource, move |graph, event| {
            flag.set(event.peer == Some(a) && graph.sources(sink)?.contains(&a));
            Ok(())
        });
        graph.remove_source(sink, a, SourceOptions::default()).unwrap();

        assert!(seen.get());
        assert!(graph.sources(sink).unwrap().is_empty());
        assert!(graph.subscription(a, sink).unwrap().is_none());
    }
}
