//! Worker side of the offloader — what runs inside each worker process.
//!
//! - `runtime` — the stdin/stdout message loop and the `WorkHandler` trait
//! - `ops` — built-in compute operations

pub mod ops;
pub mod runtime;

pub use ops::BuiltinOps;
pub use runtime::{WorkHandler, serve, serve_io};
