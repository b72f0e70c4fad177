//! compute-offload — process-per-request compute offloading.
//!
//! A [`Dispatcher`](dispatch::Dispatcher) runs each unit of work in its own
//! worker process, talking to it over a line-delimited JSON channel on the
//! child's stdin/stdout, and resolves every request exactly once: with the
//! worker's result, or with a timeout, worker failure or capacity error.

pub mod child;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod process;
