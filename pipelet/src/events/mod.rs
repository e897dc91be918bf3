//! Lifecycle event sinks.
//!
//! The graph publishes coarse lifecycle events (sources attached and
//! detached, outputs disconnected, fetches cancelled, transactions
//! completed) to an [`EventSink`] injected with
//! [`Graph::with_event_sink`](crate::graph::Graph::with_event_sink).
//! Fine-grained diagnostics go through `tracing` instead.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LifecycleEvent, LoggingEventSink, NoOpEventSink};
