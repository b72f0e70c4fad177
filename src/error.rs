//! Error types for compute-offload.

use std::time::Duration;

use crate::process::WorkerId;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Cannot locate worker program: {0}")]
    WorkerProgram(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors resolved onto a single dispatched request.
///
/// None of these are fatal to the dispatcher itself; each belongs to the
/// request that triggered it.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Failed to spawn worker {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Channel to worker {worker_id} is closed")]
    ChannelClosed { worker_id: WorkerId },

    #[error("Worker {worker_id} failed: {reason}")]
    WorkerFailure { worker_id: WorkerId, reason: String },

    #[error("No result within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Worker capacity exceeded ({max} live workers)")]
    CapacityExceeded { max: usize },

    #[error("Dispatcher is shutting down")]
    ShuttingDown,

    #[error("Payload rejected: {0}")]
    Payload(#[source] ProtocolError),
}

impl DispatchError {
    /// Short machine-readable name of the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "spawn_error",
            Self::ChannelClosed { .. } => "channel_closed",
            Self::WorkerFailure { .. } => "worker_failure",
            Self::Timeout { .. } => "timeout",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::ShuttingDown => "shutting_down",
            Self::Payload(_) => "payload_rejected",
        }
    }
}

/// Errors from one-shot command execution (`exec`, `exec_file`, streaming spawn).
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Message exceeds {max} bytes")]
    TooLarge { max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
