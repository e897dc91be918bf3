//! Fetches: one-time snapshot pulls through the plug graph.
//!
//! A fetch is issued against an output and answered by the stage itself
//! (full-state capability), by its upstream sources, or immediately with an
//! empty terminal chunk when there is nothing to fetch. Every fetch delivers
//! exactly one terminal chunk to its receiver; any chunk after that is a
//! protocol violation reported with the plug's recent fetch history.

use crate::core::{FetchCause, FetchChunk, FetchId, PlugRef, StageId};
use crate::errors::{PipeletError, Result};
use crate::graph::{Graph, Spawner};
use crate::observability::SpanTimer;
use crate::plug::{QueryUpdate, QueuedUpdate};
use crate::query::{Matcher, Query, QueryChanges};
use crate::stages::Snapshot;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Callback receiving the chunks of one fetch.
pub type FetchReceiver = Box<dyn FnMut(&mut Graph, FetchChunk) -> Result<()>>;

pub(crate) struct FetchState {
    plug: PlugRef,
    receiver: Option<FetchReceiver>,
    queued: Option<u64>,
    matcher: Option<Matcher>,
    query: String,
    children: Vec<FetchId>,
    timer: SpanTimer,
}

impl FetchState {
    fn new(plug: PlugRef, receiver: FetchReceiver, queued: Option<u64>, query: Option<&Query>) -> Self {
        Self {
            plug,
            receiver: Some(receiver),
            queued,
            matcher: query.map(Query::generate),
            query: query.map_or_else(|| "unfiltered".to_string(), Query::describe),
            children: Vec::new(),
            timer: SpanTimer::start(format!("fetch@{plug}")),
        }
    }
}

#[derive(Debug, Clone)]
struct CompletedFetch {
    id: FetchId,
    plug: PlugRef,
    query: String,
    cause: Option<FetchCause>,
}

/// Open fetches, cancelled fetches and a bounded history of completed ones.
pub(crate) struct FetchRegistry {
    next_id: u64,
    active: BTreeMap<FetchId, FetchState>,
    /// Cancelled fetches answered directly by a stage, whose late chunks
    /// are still expected.
    cancelled: BTreeSet<FetchId>,
    /// Fetches cancelled while their receiver was handling a chunk.
    interrupted: BTreeSet<FetchId>,
    history: VecDeque<CompletedFetch>,
    capacity: usize,
}

impl std::fmt::Debug for FetchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchRegistry")
            .field("active", &self.active.len())
            .field("cancelled", &self.cancelled.len())
            .field("interrupted", &self.interrupted.len())
            .field("history", &self.history.len())
            .finish()
    }
}

impl FetchRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            next_id: 0,
            active: BTreeMap::new(),
            cancelled: BTreeSet::new(),
            interrupted: BTreeSet::new(),
            history: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn open(&mut self, state: FetchState) -> FetchId {
        let id = FetchId::new(self.next_id);
        self.next_id += 1;
        self.active.insert(id, state);
        id
    }

    pub(crate) fn active_len(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn is_active(&self, id: FetchId) -> bool {
        self.active.contains_key(&id)
    }

    fn adopt(&mut self, parent: FetchId, child: FetchId) {
        if !self.active.contains_key(&child) {
            return;
        }
        if let Some(state) = self.active.get_mut(&parent) {
            state.children.push(child);
        }
    }

    fn finish(&mut self, id: FetchId, cause: Option<FetchCause>) -> Option<FetchState> {
        let state = self.active.remove(&id)?;
        if self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(CompletedFetch {
            id,
            plug: state.plug,
            query: state.query.clone(),
            cause,
        });
        Some(state)
    }

    fn late_chunk(&self, id: FetchId) -> PipeletError {
        let Some(done) = self.history.iter().rev().find(|c| c.id == id) else {
            return PipeletError::UnknownFetch(id);
        };
        let history = self
            .history
            .iter()
            .filter(|c| c.plug == done.plug)
            .map(|c| match &c.cause {
                Some(cause) => format!("{} {} ({cause})", c.id, c.query),
                None => format!("{} {}", c.id, c.query),
            })
            .collect();
        PipeletError::chunk_after_terminal(id, Some(done.plug), history)
    }
}

/// What a stage's fetcher is asked to answer.
#[derive(Debug)]
pub struct FetchContext {
    fetch: FetchId,
    output: StageId,
    query: Option<Query>,
    destination: Option<StageId>,
    spawner: Spawner,
}

impl FetchContext {
    /// Returns the fetch id.
    #[must_use]
    pub const fn id(&self) -> FetchId {
        self.fetch
    }

    /// Returns the stage being fetched from.
    #[must_use]
    pub const fn output(&self) -> StageId {
        self.output
    }

    /// Returns the query the reply will be filtered by.
    #[must_use]
    pub fn query(&self) -> Option<&Query> {
        self.query.as_ref()
    }

    /// Returns the destination the fetch is made for, if any.
    #[must_use]
    pub const fn destination(&self) -> Option<StageId> {
        self.destination
    }

    /// Takes responsibility for answering later.
    ///
    /// Return [`Snapshot::Deferred`] after calling this.
    #[must_use]
    pub fn defer(&self) -> PendingFetch {
        PendingFetch {
            fetch: self.fetch,
            spawner: self.spawner.clone(),
            settled: false,
        }
    }
}

/// Reply handle of a deferred fetch. `Send`, so it can be answered from
/// another task.
///
/// Dropping the handle without a terminal reply ends the fetch with
/// [`FetchCause::Abandoned`].
#[derive(Debug)]
pub struct PendingFetch {
    fetch: FetchId,
    spawner: Spawner,
    settled: bool,
}

impl PendingFetch {
    /// Returns the fetch id.
    #[must_use]
    pub const fn id(&self) -> FetchId {
        self.fetch
    }

    /// Sends a non-terminal chunk of values.
    pub fn chunk(&self, values: Vec<Value>) -> bool {
        self.post(FetchChunk::partial(values))
    }

    /// Sends the terminal chunk.
    pub fn reply(mut self, values: Vec<Value>) -> bool {
        self.send(FetchChunk::last(values))
    }

    /// Ends the fetch with a failure.
    pub fn fail(mut self, reason: impl Into<String>) -> bool {
        self.send(FetchChunk::ended_by(FetchCause::Failed(reason.into())))
    }

    /// Sends a raw chunk.
    ///
    /// Unlike [`PendingFetch::reply`] this does not consume the handle, so a
    /// misbehaving fetcher can deliver past its terminal chunk; the graph
    /// reports that as [`PipeletError::ChunkAfterTerminal`].
    pub fn send(&mut self, chunk: FetchChunk) -> bool {
        if chunk.terminal {
            self.settled = true;
        }
        self.post(chunk)
    }

    fn post(&self, chunk: FetchChunk) -> bool {
        let fetch = self.fetch;
        self.spawner.schedule(move |graph| graph.deliver_chunk(fetch, chunk))
    }
}

impl Drop for PendingFetch {
    fn drop(&mut self) {
        if !self.settled {
            self.settled = true;
            if !self.post(FetchChunk::ended_by(FetchCause::Abandoned)) {
                trace!(fetch = %self.fetch, "abandoned fetch outlived its graph");
            }
        }
    }
}

#[derive(Debug)]
struct Merge {
    remaining: usize,
    cause: Option<FetchCause>,
}

impl Graph {
    /// Fetches a snapshot from `output`.
    ///
    /// `changes`, if given, are queued on the output for `destination` and
    /// applied to its router right before the terminal chunk reaches
    /// `receiver`. Values are filtered by `query` when one is given. Returns
    /// the fetch id, usable with [`Graph::cancel_fetch`]; the fetch may
    /// already be complete when this returns.
    pub fn fetch(
        &mut self,
        output: StageId,
        query: Option<Query>,
        changes: Option<QueryChanges>,
        destination: Option<StageId>,
        receiver: impl FnMut(&mut Graph, FetchChunk) -> Result<()> + 'static,
    ) -> Result<FetchId> {
        self.fetch_with(output, query, changes.map(QueryUpdate::Changes), destination, Box::new(receiver))
    }

    pub(crate) fn fetch_with(
        &mut self,
        output: StageId,
        query: Option<Query>,
        update: Option<QueryUpdate>,
        destination: Option<StageId>,
        receiver: FetchReceiver,
    ) -> Result<FetchId> {
        if self.record(output)?.is_controllet() {
            return self.fetch_through_controllet(output, query, update, destination, receiver);
        }

        let record = self.record_mut(output)?;
        let query = match (query, &update, destination) {
            (None, Some(QueryUpdate::RemoveDestination), Some(destination)) => {
                Some(Query::from_terms(record.output.router.terms_of(destination)))
            }
            (query, _, _) => query,
        };
        let queued = update.map(|update| record.output.queue.push(QueuedUpdate::new(update, destination)));
        let id = self
            .fetches
            .open(FetchState::new(PlugRef::Output(output), receiver, queued, query.as_ref()));
        debug!(fetch = %id, output = %output, destination = ?destination, "fetch issued");

        if query.as_ref().is_some_and(Query::is_empty) {
            trace!(fetch = %id, "nothing to fetch");
            self.deliver_chunk(id, FetchChunk::end())?;
            return Ok(id);
        }

        let context = FetchContext {
            fetch: id,
            output,
            query: query.clone(),
            destination,
            spawner: self.spawner(),
        };
        match self.with_logic(output, |logic| logic.fetch_unfiltered(&context))? {
            Snapshot::Ready(values) => self.deliver_chunk(id, FetchChunk::last(values))?,
            Snapshot::Deferred => trace!(fetch = %id, "fetch deferred"),
            Snapshot::Upstream => self.fetch_upstream(output, id, query)?,
        }
        Ok(id)
    }

    fn fetch_upstream(&mut self, output: StageId, parent: FetchId, query: Option<Query>) -> Result<()> {
        let sources = self.record(output)?.input.sources.clone();
        if sources.is_empty() {
            trace!(fetch = %parent, "no source to fetch from");
            return self.deliver_chunk(parent, FetchChunk::end());
        }

        let upstream = match query {
            Some(query) => {
                let changes = self.with_logic(output, |logic| logic.transform_query(QueryChanges::adding(query.terms())))?;
                Some(Query::from_terms(changes.adds))
            }
            None => None,
        };
        self.fan_out(parent, sources, Some(output), move |graph, source, receiver| {
            graph.fetch_with(source, upstream.clone(), None, None, receiver)
        })
    }

    fn fetch_through_controllet(
        &mut self,
        controllet: StageId,
        query: Option<Query>,
        update: Option<QueryUpdate>,
        destination: Option<StageId>,
        receiver: FetchReceiver,
    ) -> Result<FetchId> {
        let sources = self.record(controllet)?.input.sources.clone();
        let id = self
            .fetches
            .open(FetchState::new(PlugRef::Output(controllet), receiver, None, None));
        debug!(fetch = %id, controllet = %controllet, sources = sources.len(), "fetch forwarded by controllet");

        if sources.is_empty() {
            self.deliver_chunk(id, FetchChunk::end())?;
            return Ok(id);
        }
        self.fan_out(id, sources, None, move |graph, source, receiver| {
            graph.fetch_with(source, query.clone(), update.clone(), destination, receiver)
        })?;
        Ok(id)
    }

    /// Issues one child fetch per target and merges their replies into
    /// `parent`, which terminates once every child has.
    fn fan_out(
        &mut self,
        parent: FetchId,
        targets: Vec<StageId>,
        transform: Option<StageId>,
        mut issue: impl FnMut(&mut Self, StageId, FetchReceiver) -> Result<FetchId>,
    ) -> Result<()> {
        let merge = Rc::new(RefCell::new(Merge {
            remaining: targets.len(),
            cause: None,
        }));

        for target in targets {
            let merge = Rc::clone(&merge);
            let receiver: FetchReceiver = Box::new(move |graph, mut chunk| {
                if let Some(stage) = transform {
                    let adds = std::mem::take(&mut chunk.adds);
                    chunk.adds = graph.with_logic(stage, |logic| logic.transform_fetched(adds))?;
                    if !chunk.removes.is_empty() {
                        let removes = std::mem::take(&mut chunk.removes);
                        chunk.removes = graph.with_logic(stage, |logic| logic.transform_fetched(removes))?;
                    }
                }
                if chunk.terminal {
                    let mut merge = merge.borrow_mut();
                    merge.remaining = merge.remaining.saturating_sub(1);
                    if let Some(cause) = chunk.cause.take() {
                        if merge.cause.is_none() {
                            merge.cause = Some(cause);
                        }
                    }
                    chunk.terminal = merge.remaining == 0;
                    if chunk.terminal {
                        chunk.cause = merge.cause.take();
                    } else if chunk.is_empty() {
                        return Ok(());
                    }
                }
                graph.deliver_chunk(parent, chunk)
            });
            let child = issue(self, target, receiver)?;
            self.fetches.adopt(parent, child);
        }
        Ok(())
    }

    /// Delivers one chunk to a fetch's receiver.
    ///
    /// On the terminal chunk the fetch's queued query change is released
    /// first, so the receiver observes the updated subscription.
    pub(crate) fn deliver_chunk(&mut self, fetch: FetchId, mut chunk: FetchChunk) -> Result<()> {
        if self.fetches.cancelled.contains(&fetch) {
            if chunk.terminal {
                self.fetches.cancelled.remove(&fetch);
            }
            trace!(fetch = %fetch, "chunk for cancelled fetch dropped");
            return Ok(());
        }

        let Some(state) = self.fetches.active.get_mut(&fetch) else {
            return Err(self.fetches.late_chunk(fetch));
        };
        if let Some(matcher) = &state.matcher {
            chunk.adds = matcher.retain(std::mem::take(&mut chunk.adds));
            chunk.removes = matcher.retain(std::mem::take(&mut chunk.removes));
            chunk.updates.retain(|(old, new)| matcher.matches(old) || matcher.matches(new));
        }

        if !chunk.terminal {
            let plug = state.plug;
            let mut receiver = state.receiver.take().ok_or(PipeletError::ReentrantStage(plug.stage()))?;
            let result = receiver(self, chunk);
            if let Some(state) = self.fetches.active.get_mut(&fetch) {
                state.receiver = Some(receiver);
            } else if self.fetches.interrupted.remove(&fetch) {
                trace!(fetch = %fetch, "fetch cancelled by its own receiver");
                result?;
                return receiver(self, FetchChunk::ended_by(FetchCause::Cancelled));
            }
            return result;
        }

        let cause = chunk.cause.clone();
        let Some(mut state) = self.fetches.finish(fetch, cause.clone()) else {
            return Ok(());
        };
        for child in std::mem::take(&mut state.children) {
            self.abort_fetch(child)?;
        }
        debug!(
            fetch = %fetch,
            plug = %state.plug,
            elapsed_ms = state.timer.elapsed_ms(),
            cause = ?cause,
            "fetch completed"
        );
        if let Some(cause @ (FetchCause::Failed(_) | FetchCause::Abandoned)) = &cause {
            warn!(fetch = %fetch, plug = %state.plug, cause = %cause, "fetch ended without a reply");
            self.publish(
                "fetch.failed",
                json!({ "fetch": fetch.get(), "plug": state.plug.to_string(), "cause": cause.to_string() }),
            );
        }
        if let Some(seq) = state.queued {
            // Only a cancelled subscription is withdrawn; a failed one is
            // still in force upstream.
            let effective = !matches!(cause, Some(FetchCause::Cancelled));
            self.complete_queued(state.plug, seq, effective)?;
        }
        match state.receiver {
            Some(mut receiver) => receiver(self, chunk),
            None => Err(PipeletError::ReentrantStage(state.plug.stage())),
        }
    }

    /// Cancels a fetch.
    ///
    /// Its queued query change is released without effect, upstream
    /// sub-fetches are detached and the receiver gets one last empty chunk
    /// tagged [`FetchCause::Cancelled`]. Cancelling a settled fetch does
    /// nothing.
    pub fn cancel_fetch(&mut self, fetch: FetchId) -> Result<()> {
        let Some(state) = self.abort_fetch(fetch)? else {
            trace!(fetch = %fetch, "cancel of settled fetch ignored");
            return Ok(());
        };
        debug!(fetch = %fetch, plug = %state.plug, "fetch cancelled");
        self.publish(
            "fetch.cancelled",
            json!({ "fetch": fetch.get(), "plug": state.plug.to_string(), "query": state.query }),
        );
        match state.receiver {
            Some(mut receiver) => receiver(self, FetchChunk::ended_by(FetchCause::Cancelled)),
            None => {
                self.fetches.interrupted.insert(fetch);
                Ok(())
            }
        }
    }

    /// Returns true while a fetch waits on its terminal chunk.
    #[must_use]
    pub fn is_fetch_active(&self, fetch: FetchId) -> bool {
        self.fetches.is_active(fetch)
    }

    fn abort_fetch(&mut self, fetch: FetchId) -> Result<Option<FetchState>> {
        let Some(mut state) = self.fetches.finish(fetch, Some(FetchCause::Cancelled)) else {
            return Ok(None);
        };
        let children = std::mem::take(&mut state.children);
        if children.is_empty() {
            self.fetches.cancelled.insert(fetch);
        }
        for child in children {
            self.abort_fetch(child)?;
        }
        if let Some(seq) = state.queued.take() {
            self.complete_queued(state.plug, seq, false)?;
        }
        Ok(Some(state))
    }

    /// Marks a queued update done and applies whatever it unblocks.
    pub(crate) fn complete_queued(&mut self, plug: PlugRef, seq: u64, effective: bool) -> Result<()> {
        match plug {
            PlugRef::Output(stage) => {
                self.record_mut(stage)?.output.queue.complete(seq, effective);
                self.drain_output_queue(stage)
            }
            PlugRef::Input(stage) => {
                self.record_mut(stage)?.input.queue.complete(seq, effective);
                self.drain_input_queue(stage)
            }
        }
    }
}
