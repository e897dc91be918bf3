//! Transaction ids, metadata and multi-step allocation.

use crate::core::Options;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Identifies one logical transaction across every stage it crosses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Generates a fresh id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for TransactionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Marks a transaction as forked into concurrent branches joined downstream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForkTag(String);

impl ForkTag {
    /// Creates a fork tag.
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Returns the tag name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ForkTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction metadata carried in [`Options`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMeta {
    /// The transaction id.
    pub id: TransactionId,
    /// False on the terminating step.
    pub more: bool,
    /// Fork tags the transaction was forked with, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forks: Vec<ForkTag>,
}

impl TransactionMeta {
    /// Creates metadata without forks.
    #[must_use]
    pub fn new(id: TransactionId, more: bool) -> Self {
        Self {
            id,
            more,
            forks: Vec::new(),
        }
    }

    /// Adds a fork tag unless already present.
    #[must_use]
    pub fn with_fork(mut self, tag: ForkTag) -> Self {
        if !self.forks.contains(&tag) {
            self.forks.push(tag);
        }
        self
    }
}

/// Handle on a transaction allocated by [`Transactions::get_transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    id: TransactionId,
}

impl Transaction {
    /// Returns the transaction id.
    #[must_use]
    pub const fn id(&self) -> TransactionId {
        self.id
    }
}

#[derive(Debug)]
struct OpenTransaction {
    remaining: usize,
    upstream_more: bool,
    forks: Vec<ForkTag>,
}

/// Allocates multi-step transactions for one output.
///
/// Concurrent allocations under the same upstream id share one record whose
/// expected step count accumulates.
#[derive(Debug, Default)]
pub struct Transactions {
    open: HashMap<TransactionId, OpenTransaction>,
}

impl Transactions {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates (or extends) a transaction expected to span `count` steps.
    ///
    /// The id and `more` flag of `options` are inherited, so a stage emitting
    /// inside an upstream transaction stays inside it.
    pub fn get_transaction(&mut self, count: usize, options: &Options, fork_tag: Option<&ForkTag>) -> Transaction {
        let id = options.transaction_id().unwrap_or_else(TransactionId::generate);
        let upstream_more = options.more();
        let mut forks = options.forks().to_vec();
        if let Some(tag) = fork_tag {
            if !forks.contains(tag) {
                forks.push(tag.clone());
            }
        }

        let open = self.open.entry(id).or_insert_with(|| OpenTransaction {
            remaining: 0,
            upstream_more,
            forks: Vec::new(),
        });
        open.remaining += count;
        open.upstream_more = upstream_more;
        for tag in forks {
            if !open.forks.contains(&tag) {
                open.forks.push(tag);
            }
        }

        tracing::trace!(transaction = %id, count, remaining = open.remaining, "transaction allocated");
        Transaction { id }
    }

    /// Consumes one step and returns its emit options.
    ///
    /// `more` is false only on the last expected step of a transaction whose
    /// upstream is not itself continuing.
    pub fn next(&mut self, transaction: &Transaction) -> Options {
        let Some(open) = self.open.get_mut(&transaction.id) else {
            return Options::new().with_transaction(TransactionMeta::new(transaction.id, false));
        };
        open.remaining = open.remaining.saturating_sub(1);
        let more = open.remaining > 0 || open.upstream_more;
        let meta = TransactionMeta {
            id: transaction.id,
            more,
            forks: open.forks.clone(),
        };
        if open.remaining == 0 {
            self.open.remove(&transaction.id);
        }
        Options::new().with_transaction(meta)
    }

    /// Ends a transaction early, returning the options of its final step.
    pub fn end(&mut self, transaction: Transaction) -> Options {
        let (more, forks) = self
            .open
            .remove(&transaction.id)
            .map_or((false, Vec::new()), |open| (open.upstream_more, open.forks));
        Options::new().with_transaction(TransactionMeta {
            id: transaction.id,
            more,
            forks,
        })
    }

    /// Returns true if the transaction still expects steps.
    #[must_use]
    pub fn is_open(&self, id: TransactionId) -> bool {
        self.open.contains_key(&id)
    }

    /// Returns the number of open transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.open.len()
    }

    /// Returns true if no transaction is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}
