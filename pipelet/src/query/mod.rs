//! Subscription queries and the query router.
//!
//! A [`Query`] is an OR of AND-terms. Stages use queries to tell their
//! upstream exactly which subset of its output they want, and outputs use a
//! [`QueryRouter`] to split emitted batches per destination.

mod router;
mod terms;

pub use router::{QueryRouter, RoutedBatch};
pub use terms::{term_matches, Matcher, Query, QueryChanges, Term};
