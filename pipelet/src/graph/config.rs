//! Graph configuration.

use crate::core::UpdateMode;
use crate::errors::{PipeletError, Result};
use serde::{Deserialize, Serialize};

fn default_name() -> String {
    "pipelet".to_string()
}

const fn default_fetch_history_capacity() -> usize {
    256
}

const fn default_emit_events() -> bool {
    true
}

/// Settings of one [`Graph`](super::Graph).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Name reported in lifecycle events.
    #[serde(default = "default_name")]
    pub name: String,
    /// Whether routed updates stay updates or split into remove + add.
    #[serde(default)]
    pub update_mode: UpdateMode,
    /// Completed fetches remembered for late-chunk diagnostics.
    #[serde(default = "default_fetch_history_capacity")]
    pub fetch_history_capacity: usize,
    /// Publish lifecycle events to the event sink.
    #[serde(default = "default_emit_events")]
    pub emit_events: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            update_mode: UpdateMode::default(),
            fetch_history_capacity: default_fetch_history_capacity(),
            emit_events: default_emit_events(),
        }
    }
}

impl GraphConfig {
    /// Creates the default configuration with a name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the update mode.
    #[must_use]
    pub fn with_update_mode(mut self, mode: UpdateMode) -> Self {
        self.update_mode = mode;
        self
    }

    /// Sets the fetch history capacity.
    #[must_use]
    pub fn with_fetch_history_capacity(mut self, capacity: usize) -> Self {
        self.fetch_history_capacity = capacity;
        self
    }

    /// Enables or disables lifecycle events.
    #[must_use]
    pub fn with_emit_events(mut self, emit: bool) -> Self {
        self.emit_events = emit;
        self
    }

    /// Parses a configuration from JSON, then validates it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.fetch_history_capacity == 0 {
            return Err(PipeletError::InvalidConfig(
                "fetch_history_capacity must be greater than zero".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(PipeletError::InvalidConfig("name must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GraphConfig::default();
        assert_eq!(config.name, "pipelet");
        assert_eq!(config.update_mode, UpdateMode::Strict);
        assert_eq!(config.fetch_history_capacity, 256);
        assert!(config.emit_events);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = GraphConfig::from_json(r#"{"update_mode": "split"}"#).unwrap();
        assert_eq!(config.update_mode, UpdateMode::Split);
        assert_eq!(config.fetch_history_capacity, 256);
    }

    #[test]
    fn test_rejects_zero_history() {
        let err = GraphConfig::from_json(r#"{"fetch_history_capacity": 0}"#).unwrap_err();
        assert!(matches!(err, PipeletError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_malformed_json() {
        let err = GraphConfig::from_json("{").unwrap_err();
        assert!(matches!(err, PipeletError::Serialization(_)));
    }
}
