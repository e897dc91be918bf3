//! Stable identifiers for arena records.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle of a stage record in the graph arena.
///
/// Ids are never reused, so a stale id resolves to `UnknownStage` rather
/// than to a different stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageId(u32);

impl StageId {
    /// Creates a stage id from its raw index.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the arena index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage#{}", self.0)
    }
}

/// Handle of an in-flight fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FetchId(u64);

impl FetchId {
    /// Creates a fetch id from its raw sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FetchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fetch#{}", self.0)
    }
}

/// One of the two plugs of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlugRef {
    /// The consuming endpoint.
    Input(StageId),
    /// The producing endpoint.
    Output(StageId),
}

impl PlugRef {
    /// Returns the stage owning this plug.
    #[must_use]
    pub const fn stage(self) -> StageId {
        match self {
            Self::Input(id) | Self::Output(id) => id,
        }
    }
}

impl fmt::Display for PlugRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input(id) => write!(f, "input#{}", id.0),
            Self::Output(id) => write!(f, "output#{}", id.0),
        }
    }
}
