//! Worker pool / dispatcher.
//!
//! - `admission` — live-worker cap with fail-fast or bounded FIFO queueing
//! - `pending` — correlation table of requests awaiting a reply
//! - `dispatcher` — spawns a worker per request and resolves its reply

pub mod admission;
pub mod dispatcher;
pub mod pending;

pub use admission::Admission;
pub use dispatcher::{Dispatcher, DispatcherStats};
pub use pending::{PendingRequest, PendingTable, Reply};
