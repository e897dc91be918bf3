//! # Pipelet
//!
//! Coordination core of an incremental dataflow engine.
//!
//! Stages exchange add / remove / update / clear operations downstream and
//! content-based subscription queries upstream. Pipelet keeps both graphs
//! consistent while snapshots are being fetched and subscriptions change,
//! and closes multi-step transactions exactly once on every branch:
//!
//! - **Subscriptions**: every input tells its sources which values it wants;
//!   outputs route emitted batches per destination through a query router
//! - **Fetches**: snapshot pulls ordered against query changes, answered
//!   synchronously or later through a [`PendingFetch`](plug::PendingFetch)
//! - **Transactions**: multi-step emissions, forked across branches and
//!   joined again downstream of a union
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pipelet::prelude::*;
//!
//! let mut graph = Graph::new(GraphConfig::new("orders"))?;
//! let orders = graph.add_stage_with(StageSpec::new("orders", Set::new("id")).greedy());
//! let open = graph.add_stage("open", Filter::new(open_orders_query));
//! graph.add_source(open, orders, SourceOptions::default())?;
//!
//! graph.inject(orders, Operation::Add(batch), Options::new())?;
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod core;
pub mod errors;
pub mod events;
pub mod graph;
pub mod observability;
pub mod plug;
pub mod query;
pub mod stages;
pub mod testing;
pub mod transactions;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::core::{
        FetchCause, FetchChunk, FetchId, InputMode, Operation, OperationKind, Options, PlugRef, StageId, StageKind,
        UpdateMode,
    };
    pub use crate::errors::{PipeletError, ProtocolViolation, Result};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::graph::{Graph, GraphConfig, PlugEvent, PlugEventKind, Spawner, StageRegistry, StageSpec};
    pub use crate::plug::{FetchContext, PendingFetch, SourceOptions};
    pub use crate::query::{Query, QueryChanges, QueryRouter, Term};
    pub use crate::stages::{
        union, Emissions, Fetcher, Filter, OperationSink, PassThrough, QueryTransform, Set, Snapshot, StageLogic,
    };
    pub use crate::transactions::{ForkTag, TransactionId, TransactionMeta};
}
