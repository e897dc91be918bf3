//! Core domain model types for pipelet.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stable ids for stages, plugs and fetches
//! - Operation batches and their emission options
//! - Stage kind and input/update mode enums

mod ids;
mod operation;
mod status;

pub use ids::{FetchId, PlugRef, StageId};
pub use operation::{FetchCause, FetchChunk, Operation, OperationKind, Options, UpdatePair};
pub use status::{InputMode, StageKind, UpdateMode};
