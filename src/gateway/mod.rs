//! Request gateway — HTTP front door for offloaded computation.
//!
//! Handlers never wait on a worker synchronously: each request awaits its own
//! dispatch future, so a slow or stuck worker only delays its own caller.
//!
//! Routes:
//! - `POST /compute` — `{"a", "b"}` → `Sum is <n>`
//! - `POST /api/dispatch` — `{"op", "args", "timeout_ms"?}` → `{"correlation_id", "result"}`
//! - `GET /health` — service status and dispatcher counters
//! - anything else → `Ok`

pub mod error;
pub mod routes;

pub use error::ApiError;
pub use routes::{GatewayState, gateway_routes};
