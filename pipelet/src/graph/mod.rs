//! The stage arena.
//!
//! A [`Graph`] owns every stage record, addressed by [`StageId`]. Edges are
//! id lists on both ends (an input's sources, an output's destinations), so
//! traversal works in both directions without ownership cycles. All protocol
//! operations are methods on the graph; the input and output roles live in
//! [`crate::plug`].

mod config;
mod listeners;
mod registry;
mod scheduler;


pub use config::GraphConfig;
pub use listeners::{Listener, ListenerId, PlugEvent, PlugEventKind};
pub use registry::StageRegistry;
pub use scheduler::{Spawner, Task};

use crate::core::{InputMode, Operation, Options, StageId, StageKind};
use crate::errors::{PipeletError, Result};
use crate::events::{EventSink, NoOpEventSink};
use crate::plug::{FetchRegistry, InputState, OutputState};
use crate::query::Query;
use crate::stages::{dispatch, Emissions, PassThrough, StageLogic};
use crate::transactions::ForkTag;
use listeners::ListenerRegistry;
use scheduler::TaskQueue;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Describes a stage to add to the graph.
pub struct StageSpec {
    name: String,
    logic: Box<dyn StageLogic>,
    kind: StageKind,
    input_mode: InputMode,
    multi_source: bool,
    fork_tag: Option<ForkTag>,
}

impl StageSpec {
    /// A single-source subscriber stage running `logic`.
    #[must_use]
    pub fn new(name: impl Into<String>, logic: impl StageLogic + 'static) -> Self {
        Self {
            name: name.into(),
            logic: Box::new(logic),
            kind: StageKind::Pipelet,
            input_mode: InputMode::Subscriber,
            multi_source: false,
            fork_tag: None,
        }
    }

    /// A controllet: a multi-source stage that forwards demand and never handles data.
    #[must_use]
    pub fn controllet(name: impl Into<String>) -> Self {
        Self {
            kind: StageKind::Controllet,
            multi_source: true,
            ..Self::new(name, PassThrough)
        }
    }

    /// Pins the input to the full upstream state.
    #[must_use]
    pub fn greedy(mut self) -> Self {
        self.input_mode = InputMode::Greedy;
        self
    }

    /// Accepts several sources.
    #[must_use]
    pub fn multi_source(mut self) -> Self {
        self.multi_source = true;
        self
    }

    /// Stamps every emitted transaction with a fork tag.
    #[must_use]
    pub fn with_fork_tag(mut self, tag: ForkTag) -> Self {
        self.fork_tag = Some(tag);
        self
    }
}

impl std::fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("input_mode", &self.input_mode)
            .field("multi_source", &self.multi_source)
            .field("fork_tag", &self.fork_tag)
            .finish_non_exhaustive()
    }
}

pub(crate) struct StageRecord {
    pub(crate) name: String,
    pub(crate) kind: StageKind,
    pub(crate) logic: Option<Box<dyn StageLogic>>,
    pub(crate) input: InputState,
    pub(crate) output: OutputState,
}

impl StageRecord {
    pub(crate) fn is_controllet(&self) -> bool {
        self.kind == StageKind::Controllet
    }
}

/// Arena of stages and driver of the coordination protocol.
pub struct Graph {
    pub(crate) config: GraphConfig,
    pub(crate) stages: Vec<StageRecord>,
    pub(crate) fetches: FetchRegistry,
    pub(crate) listeners: ListenerRegistry,
    sink: Arc<dyn EventSink>,
    spawner: Spawner,
    tasks: TaskQueue,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.config.name)
            .field("stages", &self.stages.len())
            .field("active_fetches", &self.fetches.active_len())
            .finish_non_exhaustive()
    }
}

impl Graph {
    /// Creates an empty graph.
    pub fn new(config: GraphConfig) -> Result<Self> {
        config.validate()?;
        let (spawner, tasks) = scheduler::channel();
        Ok(Self {
            fetches: FetchRegistry::new(config.fetch_history_capacity),
            config,
            stages: Vec::new(),
            listeners: ListenerRegistry::default(),
            sink: Arc::new(NoOpEventSink),
            spawner,
            tasks,
        })
    }

    /// Replaces the event sink lifecycle events are published to.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Returns a handle posting tasks to this graph.
    #[must_use]
    pub fn spawner(&self) -> Spawner {
        self.spawner.clone()
    }

    /// Adds a single-source subscriber stage.
    pub fn add_stage(&mut self, name: impl Into<String>, logic: impl StageLogic + 'static) -> StageId {
        self.add_stage_with(StageSpec::new(name, logic))
    }

    /// Adds a stage described by `spec`.
    pub fn add_stage_with(&mut self, spec: StageSpec) -> StageId {
        let index = u32::try_from(self.stages.len()).unwrap_or(u32::MAX);
        let id = StageId::new(index);
        let mut output = OutputState::default();
        output.fork_tag = spec.fork_tag;
        self.stages.push(StageRecord {
            name: spec.name,
            kind: spec.kind,
            logic: Some(spec.logic),
            input: InputState::new(spec.input_mode, spec.multi_source),
            output,
        });
        tracing::debug!(stage = %id, name = %self.stages[id.index()].name, kind = ?spec.kind, "stage added");
        id
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns a stage's name.
    pub fn stage_name(&self, stage: StageId) -> Result<&str> {
        Ok(&self.record(stage)?.name)
    }

    /// Returns a stage's kind.
    pub fn stage_kind(&self, stage: StageId) -> Result<StageKind> {
        Ok(self.record(stage)?.kind)
    }

    /// Returns the subscription acknowledged upstream by a stage's input.
    pub fn query(&self, stage: StageId) -> Result<&Query> {
        Ok(&self.record(stage)?.input.query)
    }

    /// Returns the input subscription once pending changes settle.
    pub fn future_query(&self, stage: StageId) -> Result<&Query> {
        Ok(&self.record(stage)?.input.future_query)
    }

    /// Returns the sources attached to a stage's input.
    pub fn sources(&self, stage: StageId) -> Result<&[StageId]> {
        Ok(&self.record(stage)?.input.sources)
    }

    /// Returns the destinations attached to a stage's output.
    pub fn destinations(&self, stage: StageId) -> Result<&[StageId]> {
        Ok(&self.record(stage)?.output.destinations)
    }

    /// Returns what `destination` is subscribed to on `output`'s router.
    ///
    /// `None` when the destination is not registered there.
    pub fn subscription(&self, output: StageId, destination: StageId) -> Result<Option<&Query>> {
        Ok(self.record(output)?.output.router.query_of(destination))
    }

    /// Returns the number of branches feeding a stage's input.
    pub fn branches(&self, stage: StageId) -> Result<usize> {
        Ok(self.record(stage)?.input.transactions.branches())
    }

    /// Returns the number of fetches still waiting on their terminal chunk.
    #[must_use]
    pub fn active_fetches(&self) -> usize {
        self.fetches.active_len()
    }

    pub(crate) fn record(&self, stage: StageId) -> Result<&StageRecord> {
        self.stages.get(stage.index()).ok_or(PipeletError::UnknownStage(stage))
    }

    pub(crate) fn record_mut(&mut self, stage: StageId) -> Result<&mut StageRecord> {
        self.stages.get_mut(stage.index()).ok_or(PipeletError::UnknownStage(stage))
    }

    /// Runs `f` with the stage's logic taken out of its slot.
    pub(crate) fn with_logic<R>(&mut self, stage: StageId, f: impl FnOnce(&mut dyn StageLogic) -> R) -> Result<R> {
        let mut logic = self.record_mut(stage)?.logic.take().ok_or(PipeletError::ReentrantStage(stage))?;
        let result = f(logic.as_mut());
        self.record_mut(stage)?.logic = Some(logic);
        Ok(result)
    }

    /// Feeds an operation to a stage as external input.
    ///
    /// This is how data enters a graph: the stage's handler runs as if the
    /// operation had arrived from upstream, and whatever it emits is routed
    /// to its destinations.
    pub fn inject(&mut self, stage: StageId, operation: Operation, options: Options) -> Result<()> {
        self.deliver(stage, None, operation, options)
    }

    /// Hands an operation to a stage's handler and emits what it produced.
    pub(crate) fn deliver(
        &mut self,
        stage: StageId,
        source: Option<StageId>,
        operation: Operation,
        options: Options,
    ) -> Result<()> {
        let record = self.record_mut(stage)?;
        if record.is_controllet() {
            return Err(PipeletError::ControlletOperation(stage));
        }
        let options = record.input.transactions.get_options(source, &options);
        tracing::trace!(
            stage = %stage,
            operation = %operation.kind(),
            count = operation.len(),
            more = options.more(),
            "delivering"
        );

        let mut out = Emissions::new();
        self.with_logic(stage, |logic| dispatch(logic, operation, &options, &mut out))?;
        for (operation, options) in out.into_inner() {
            self.emit(stage, operation, options)?;
        }
        Ok(())
    }

    /// Non-controllet stages reached through `stage`'s input, itself included
    /// when it is one.
    pub(crate) fn ultimate_sources(&self, stage: StageId) -> Result<Vec<StageId>> {
        let mut found = Vec::new();
        let mut seen = BTreeSet::new();
        self.collect_ultimate(stage, true, &mut seen, &mut found)?;
        Ok(found)
    }

    /// Non-controllet stages reached through `stage`'s output.
    pub(crate) fn ultimate_destinations(&self, stage: StageId) -> Result<Vec<StageId>> {
        let mut found = Vec::new();
        let mut seen = BTreeSet::new();
        for &destination in &self.record(stage)?.output.destinations {
            self.collect_ultimate(destination, false, &mut seen, &mut found)?;
        }
        Ok(found)
    }

    fn collect_ultimate(
        &self,
        stage: StageId,
        upstream: bool,
        seen: &mut BTreeSet<StageId>,
        found: &mut Vec<StageId>,
    ) -> Result<()> {
        if !seen.insert(stage) {
            return Ok(());
        }
        let record = self.record(stage)?;
        if !record.is_controllet() {
            found.push(stage);
            return Ok(());
        }
        let next = if upstream {
            &record.input.sources
        } else {
            &record.output.destinations
        };
        for &neighbour in next {
            self.collect_ultimate(neighbour, upstream, seen, found)?;
        }
        Ok(())
    }

    /// Branches a source contributes to whatever it feeds.
    pub(crate) fn branch_share(&self, source: StageId) -> Result<usize> {
        let record = self.record(source)?;
        Ok(if record.is_controllet() {
            record.input.transactions.branches()
        } else {
            1
        })
    }

    /// Publishes a lifecycle event to the sink, stamped with graph name and
    /// time.
    pub(crate) fn publish(&self, event_type: &str, mut data: serde_json::Value) {
        if !self.config.emit_events {
            return;
        }
        if let Some(fields) = data.as_object_mut() {
            fields.insert("graph".to_string(), self.config.name.clone().into());
            fields.insert("timestamp".to_string(), chrono::Utc::now().to_rfc3339().into());
        }
        self.sink.try_emit(event_type, Some(data));
    }
}
