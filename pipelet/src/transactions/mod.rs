//! Transaction coordination.
//!
//! Three registries cooperate to close multi-step emissions correctly:
//! - [`Transactions`] allocates multi-step transactions on an output
//! - [`OutputTransactions`] tracks, per destination, which transactions have
//!   delivered partial data and therefore need a terminal notification
//! - [`InputTransactions`] joins forked transactions on an input, reporting
//!   completion only once every branch has terminated

mod input;
mod output;
mod transaction;

pub use input::InputTransactions;
pub use output::{DestinationOptions, OutputTransactions};
pub use transaction::{ForkTag, Transaction, TransactionId, TransactionMeta, Transactions};
