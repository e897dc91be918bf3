//! Operation batches exchanged between stages, and fetch reply chunks.

use crate::transactions::{ForkTag, TransactionId, TransactionMeta};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// An `[old, new]` value pair carried by an update operation.
pub type UpdatePair = (Value, Value);

/// The kind of an operation, used for listeners and tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Values added.
    Add,
    /// Values removed.
    Remove,
    /// Values replaced.
    Update,
    /// Whole state cleared.
    Clear,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Remove => write!(f, "remove"),
            Self::Update => write!(f, "update"),
            Self::Clear => write!(f, "clear"),
        }
    }
}

/// An incremental state change flowing downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "values", rename_all = "snake_case")]
pub enum Operation {
    /// Values added.
    Add(Vec<Value>),
    /// Values removed.
    Remove(Vec<Value>),
    /// Values replaced, as `[old, new]` pairs.
    Update(Vec<UpdatePair>),
    /// Whole state cleared.
    Clear,
}

impl Operation {
    /// Returns the operation kind.
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Add(_) => OperationKind::Add,
            Self::Remove(_) => OperationKind::Remove,
            Self::Update(_) => OperationKind::Update,
            Self::Clear => OperationKind::Clear,
        }
    }

    /// Returns the number of values (or pairs) carried.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Add(values) | Self::Remove(values) => values.len(),
            Self::Update(pairs) => pairs.len(),
            Self::Clear => 0,
        }
    }

    /// Returns true if the operation carries nothing to apply.
    ///
    /// A clear is never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Clear => false,
            _ => self.len() == 0,
        }
    }
}

/// Options travelling with an operation or a fetch chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Options {
    /// Transaction metadata, absent for single-shot emissions.
    #[serde(default, rename = "_t", skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionMeta>,
}

impl Options {
    /// Creates empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the transaction metadata.
    #[must_use]
    pub fn with_transaction(mut self, meta: TransactionMeta) -> Self {
        self.transaction = Some(meta);
        self
    }

    /// Returns true if more steps of the same transaction will follow.
    #[must_use]
    pub fn more(&self) -> bool {
        self.transaction.as_ref().is_some_and(|t| t.more)
    }

    /// Returns true if this is the terminal step (or a single-shot emission).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.more()
    }

    /// Returns the transaction id, if any.
    #[must_use]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction.as_ref().map(|t| t.id)
    }

    /// Returns the fork tags carried by the transaction.
    #[must_use]
    pub fn forks(&self) -> &[ForkTag] {
        self.transaction.as_ref().map_or(&[], |t| t.forks.as_slice())
    }

    /// Returns a copy with the `more` flag forced.
    #[must_use]
    pub fn with_more(&self, more: bool) -> Self {
        let mut options = self.clone();
        if let Some(ref mut t) = options.transaction {
            t.more = more;
        }
        options
    }

    /// Splits these options over `count` consecutive deliveries.
    ///
    /// Every delivery but the last is marked `more`; the last keeps the
    /// original flag. A transaction id is allocated when several deliveries
    /// must be tied together and none was given.
    #[must_use]
    pub fn steps(&self, count: usize) -> Vec<Self> {
        if count <= 1 {
            return vec![self.clone(); count];
        }
        let base = if self.transaction.is_some() {
            self.clone()
        } else {
            Self::new().with_transaction(TransactionMeta::new(TransactionId::generate(), false))
        };
        let mut steps = vec![base.with_more(true); count - 1];
        steps.push(base);
        steps
    }
}

/// Why a fetch ended without (complete) data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchCause {
    /// The consumer cancelled the fetch.
    Cancelled,
    /// The upstream fetcher reported a failure.
    Failed(String),
    /// The upstream fetcher dropped its reply handle without answering.
    Abandoned,
}

impl fmt::Display for FetchCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// One reply chunk of a fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchChunk {
    /// Values in the snapshot.
    #[serde(default)]
    pub adds: Vec<Value>,
    /// Values to retract, for fetchers replaying their own changes.
    #[serde(default)]
    pub removes: Vec<Value>,
    /// Pending updates.
    #[serde(default)]
    pub updates: Vec<UpdatePair>,
    /// True on the last chunk of the fetch.
    pub terminal: bool,
    /// Set when the fetch ended early.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<FetchCause>,
    /// Options forwarded from the fetcher.
    #[serde(default)]
    pub options: Options,
}

impl FetchChunk {
    /// A non-terminal chunk of added values.
    #[must_use]
    pub fn partial(adds: Vec<Value>) -> Self {
        Self {
            adds,
            ..Self::default()
        }
    }

    /// The terminal chunk of added values.
    #[must_use]
    pub fn last(adds: Vec<Value>) -> Self {
        Self {
            adds,
            terminal: true,
            ..Self::default()
        }
    }

    /// An empty terminal chunk.
    #[must_use]
    pub fn end() -> Self {
        Self::last(Vec::new())
    }

    /// An empty terminal chunk tagged with a cause.
    #[must_use]
    pub fn ended_by(cause: FetchCause) -> Self {
        Self {
            terminal: true,
            cause: Some(cause),
            ..Self::default()
        }
    }

    /// Returns true if the chunk carries no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removes.is_empty() && self.updates.is_empty()
    }

    /// Returns true if the fetch was cancelled by its consumer.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cause == Some(FetchCause::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_emptiness() {
        assert!(Operation::Add(vec![]).is_empty());
        assert!(!Operation::Clear.is_empty());
        assert_eq!(Operation::Update(vec![(json!({"id": 1}), json!({"id": 1, "v": 2}))]).len(), 1);
    }

    #[test]
    fn test_options_terminal_without_transaction() {
        let options = Options::new();
        assert!(options.is_terminal());
        assert!(options.forks().is_empty());
        assert!(options.transaction_id().is_none());
    }

    #[test]
    fn test_options_with_more() {
        let options = Options::new().with_transaction(TransactionMeta::new(TransactionId::generate(), true));
        assert!(options.more());
        assert!(options.with_more(false).is_terminal());
    }

    #[test]
    fn test_steps_tie_deliveries_together() {
        let steps = Options::new().steps(3);
        assert_eq!(steps.len(), 3);
        assert!(steps[0].more() && steps[1].more());
        assert!(steps[2].is_terminal());
        let id = steps[0].transaction_id();
        assert!(id.is_some());
        assert!(steps.iter().all(|s| s.transaction_id() == id));

        assert_eq!(Options::new().steps(1), vec![Options::new()]);
    }

    #[test]
    fn test_operation_serialization() {
        let op = Operation::Add(vec![json!({"id": 1})]);
        let encoded = serde_json::to_value(&op).unwrap();
        assert_eq!(encoded, json!({"op": "add", "values": [{"id": 1}]}));
    }

    #[test]
    fn test_cancelled_chunk() {
        let chunk = FetchChunk::ended_by(FetchCause::Cancelled);
        assert!(chunk.terminal);
        assert!(chunk.is_empty());
        assert!(chunk.is_cancelled());
        assert_eq!(FetchCause::Cancelled.to_string(), "cancelled");
    }
}
