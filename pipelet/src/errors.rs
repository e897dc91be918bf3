//! Error types for the pipelet protocol core.
//!
//! Everything here is a protocol violation: a caller or collaborator broke
//! the subscription graph contract. Recoverable conditions (nothing to fetch,
//! no upstream source, upstream failure) never surface as errors, they are
//! reported to fetch receivers as empty terminal chunks instead.

use crate::core::{FetchId, PlugRef, StageId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PipeletError>;

/// The main error type for pipelet operations.
#[derive(Debug, Error)]
pub enum PipeletError {
    /// A destination was added twice to the same output.
    #[error("stage {destination} is already a destination of {output}")]
    DuplicateDestination {
        /// The output plug.
        output: StageId,
        /// The offending destination.
        destination: StageId,
    },

    /// A destination was removed from an output it is not attached to.
    #[error("stage {destination} is not a destination of {output}")]
    DestinationNotFound {
        /// The output plug.
        output: StageId,
        /// The missing destination.
        destination: StageId,
    },

    /// A single-source input already has a source.
    #[error("input {input} already has source {existing}, cannot add {upstream}")]
    SourceAlreadyAttached {
        /// The input plug.
        input: StageId,
        /// The source currently attached.
        existing: StageId,
        /// The source that was refused.
        upstream: StageId,
    },

    /// A multi-source input already holds this source.
    #[error("input {input} already has source {upstream}")]
    DuplicateSource {
        /// The input plug.
        input: StageId,
        /// The duplicated source.
        upstream: StageId,
    },

    /// A source was removed from an input it was never added to.
    #[error("stage {upstream} is not a source of input {input}")]
    SourceNotFound {
        /// The input plug.
        input: StageId,
        /// The missing source.
        upstream: StageId,
    },

    /// A fetch chunk arrived after the terminal chunk of the same fetch.
    #[error("{0}")]
    ChunkAfterTerminal(Box<ProtocolViolation>),

    /// A chunk was delivered for a fetch the graph never issued.
    #[error("unknown fetch {0}")]
    UnknownFetch(FetchId),

    /// An operation reached a controllet, which never handles data.
    #[error("controllet {0} received a data operation")]
    ControlletOperation(StageId),

    /// A stage id that is not part of the graph.
    #[error("unknown stage {0}")]
    UnknownStage(StageId),

    /// A stage handler was re-entered while already running.
    #[error("stage {0} re-entered while its handler is running")]
    ReentrantStage(StageId),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipeletError {
    /// Builds the fatal error for a chunk delivered after its fetch terminated.
    #[must_use]
    pub fn chunk_after_terminal(fetch: FetchId, plug: Option<PlugRef>, history: Vec<String>) -> Self {
        let violation = ProtocolViolation {
            code: "PLUG-FETCH-AFTER-TERMINAL".to_string(),
            summary: format!("fetch {fetch} received a chunk after its terminal chunk"),
            fix_hint: Some("An upstream fetcher must deliver exactly one terminal chunk per fetch.".to_string()),
            plug: plug.map(|p| p.to_string()),
            query_history: history,
            context: BTreeMap::new(),
        }
        .with_context("fetch", fetch.get());
        Self::ChunkAfterTerminal(Box::new(violation))
    }

    /// Returns true for errors that indicate a corrupted subscription graph.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, Self::InvalidConfig(_) | Self::Serialization(_))
    }
}

/// Diagnostic context attached to fatal protocol violations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProtocolViolation {
    /// Stable code, e.g. `PLUG-FETCH-AFTER-TERMINAL`.
    pub code: String,
    /// One-line description.
    pub summary: String,
    /// What the offending collaborator should do instead.
    pub fix_hint: Option<String>,
    /// The plug the violation happened on.
    pub plug: Option<String>,
    /// Recent fetches completed on the plug, oldest first, with their query.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_history: Vec<String>,
    /// Anything else worth reporting.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, Value>,
}

impl ProtocolViolation {
    /// Creates a violation with a code and summary only.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            ..Self::default()
        }
    }

    /// Attaches one context value.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Renders the violation as a JSON object, for event payloads and logs.
    #[must_use]
    pub fn to_dict(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.summary)?;
        if let Some(plug) = &self.plug {
            write!(f, " (plug {plug})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_after_terminal_carries_context() {
        let err = PipeletError::chunk_after_terminal(
            FetchId::new(7),
            Some(PlugRef::Output(StageId::new(2))),
            vec!["[{\"a\":1}]".to_string()],
        );

        let PipeletError::ChunkAfterTerminal(ref violation) = err else {
            panic!("unexpected variant: {err:?}");
        };
        assert_eq!(violation.code, "PLUG-FETCH-AFTER-TERMINAL");
        assert_eq!(violation.context.get("fetch"), Some(&Value::from(7)));
        assert_eq!(violation.query_history.len(), 1);
        assert!(err.to_string().contains("output#2"));
    }

    #[test]
    fn test_protocol_violation_to_dict() {
        let violation = ProtocolViolation::new("PLUG-TEST", "bad plug").with_context("stage", 3);
        let dict = violation.to_dict();

        assert_eq!(dict.get("code"), Some(&Value::from("PLUG-TEST")));
        assert_eq!(dict["context"]["stage"], Value::from(3));
        assert!(dict.get("query_history").is_none());
    }

    #[test]
    fn test_config_errors_are_not_protocol_violations() {
        assert!(!PipeletError::InvalidConfig("x".into()).is_protocol_violation());
        assert!(PipeletError::UnknownStage(StageId::new(1)).is_protocol_violation());
    }
}
