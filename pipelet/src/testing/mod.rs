//! Testing utilities for pipelet graphs.
//!
//! This module provides:
//! - Recording and deferred-fetch mock stages
//! - Assertions over recorded deliveries and subscription state

mod assertions;
mod mocks;

pub use assertions::{assert_added, assert_query_settled, assert_single_terminal, assert_unordered_eq};
pub use mocks::{DeferredSource, PendingFetches, Recorded, Recording, RecordingStage};
