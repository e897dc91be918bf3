//! Stage kind and mode enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The role a stage plays in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// A stage that handles data and owns a query router.
    #[default]
    Pipelet,
    /// A pass-through stage with no router of its own (e.g. a union).
    ///
    /// Lifecycle and subscription calls go straight to its destinations, and
    /// query updates straight to its sources.
    Controllet,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipelet => write!(f, "pipelet"),
            Self::Controllet => write!(f, "controllet"),
        }
    }
}

/// How an input expresses demand upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Demand follows the union of downstream subscriptions.
    #[default]
    Subscriber,
    /// Always wants the full upstream state; downstream demand is ignored.
    Greedy,
}

impl fmt::Display for InputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscriber => write!(f, "subscriber"),
            Self::Greedy => write!(f, "greedy"),
        }
    }
}

/// How a routed update is delivered to a destination that sees both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Deliver an update as an update.
    #[default]
    Strict,
    /// Deliver every update as a remove of the old value plus an add of the new.
    Split,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(StageKind::default(), StageKind::Pipelet);
        assert_eq!(InputMode::default(), InputMode::Subscriber);
        assert_eq!(UpdateMode::default(), UpdateMode::Strict);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&UpdateMode::Split).unwrap(), "\"split\"");
        assert_eq!(StageKind::Controllet.to_string(), "controllet");
        assert_eq!(InputMode::Greedy.to_string(), "greedy");
    }
}
