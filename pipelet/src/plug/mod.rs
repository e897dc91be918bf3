//! Input and output plugs.
//!
//! Both plugs share the fetch machinery and the ordered query-update queue
//! ([`queue`]). An input holds a stage's demand on its sources; an output
//! fans data out to its destinations and routes subscription changes. The
//! state lives in the graph's stage records; the protocol operations are
//! methods on [`Graph`](crate::graph::Graph).

mod fetch;
mod input;
mod output;
mod queue;

pub use fetch::{FetchContext, FetchReceiver, PendingFetch};
pub use input::SourceOptions;
pub use queue::{QueryUpdate, QueryUpdateQueue, QueuedUpdate};

pub(crate) use fetch::FetchRegistry;
pub(crate) use input::InputState;
pub(crate) use output::OutputState;
