//! Event sink trait and implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, Level};

/// Receiver of graph lifecycle events.
///
/// The graph itself only calls [`EventSink::try_emit`], which must not
/// block; `emit` exists for sinks forwarding to asynchronous backends.
/// Payloads are JSON objects carrying the graph name and an RFC 3339
/// timestamp next to the event's own fields.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers `event_type` with its payload, awaiting the backend.
    async fn emit(&self, event_type: &str, data: Option<Value>);

    /// Delivers an event without blocking. Failures are swallowed.
    fn try_emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards every event. The graph's default sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Logs events through `tracing` under the `pipelet::events` target.
///
/// `fetch.*` events log at `DEBUG` whatever the configured level.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self::info()
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at `level`. Levels other than `DEBUG` log at
    /// `INFO`.
    #[must_use]
    pub const fn new(level: Level) -> Self {
        Self { level }
    }

    /// Logs every event at `DEBUG`.
    #[must_use]
    pub const fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// Logs stage, output and transaction events at `INFO`.
    #[must_use]
    pub const fn info() -> Self {
        Self::new(Level::INFO)
    }

    fn log_event(&self, event_type: &str, data: Option<&Value>) {
        let graph = data.and_then(|d| d.get("graph")).and_then(Value::as_str).unwrap_or("-");
        if self.level == Level::DEBUG || event_type.starts_with("fetch.") {
            debug!(target: "pipelet::events", graph, event_type, payload = ?data, "lifecycle event");
        } else {
            info!(target: "pipelet::events", graph, event_type, payload = ?data, "lifecycle event");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.log_event(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.log_event(event_type, data.as_ref());
    }
}

/// An event captured by [`CollectingEventSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// The event type, e.g. `fetch.cancelled`.
    pub event_type: String,
    /// The payload.
    pub data: Option<Value>,
}

impl LifecycleEvent {
    /// Returns a payload field.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|data| data.get(key))
    }
}

/// Keeps every event in memory, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<LifecycleEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every collected event, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Forgets every collected event.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns the events whose type starts with `prefix`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<LifecycleEvent> {
        self.events
            .read()
            .iter()
            .filter(|event| event.event_type.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn record(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push(LifecycleEvent {
            event_type: event_type.to_string(),
            data,
        });
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.record(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.record(event_type, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_noop_and_logging_sinks_accept_events() {
        NoOpEventSink.emit("fetch.cancelled", None).await;
        LoggingEventSink::debug().try_emit("fetch.cancelled", Some(json!({"fetch": 1})));
        LoggingEventSink::info().emit("stage.source_added", None).await;
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit("stage.source_added", Some(json!({"stage": 1}))).await;
        sink.try_emit("stage.source_removed", None);
        sink.try_emit("fetch.cancelled", None);

        assert_eq!(sink.len(), 3);
        let stage_events = sink.events_of_type("stage.");
        assert_eq!(stage_events.len(), 2);
        assert_eq!(stage_events[0].field("stage"), Some(&json!(1)));

        sink.clear();
        assert!(sink.is_empty());
    }
}
