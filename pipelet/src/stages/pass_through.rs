//! Stage forwarding everything unchanged.

use super::{Fetcher, OperationSink, QueryTransform};

/// Forwards operations, fetches and subscriptions unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl OperationSink for PassThrough {}

impl Fetcher for PassThrough {}

impl QueryTransform for PassThrough {}
