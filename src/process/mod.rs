//! Child process plumbing.
//!
//! Core components:
//! - `options` — `ProgramRef` and `SpawnConfig` (cwd, env, stdio, shell)
//! - `protocol` — newline-delimited JSON envelopes between parent and worker
//! - `handle` — `WorkerHandle`, one worker process with a message channel
//! - `exec` — one-shot execution: buffered `exec`/`exec_file`, streaming spawn

pub mod exec;
pub mod handle;
pub mod options;
pub mod protocol;

pub use exec::{ExecOutput, ExitInfo, OutputLine, StreamingChild, exec, exec_file, spawn_streaming};
pub use handle::{
    KillSignal, WorkerEvent, WorkerEvents, WorkerHandle, WorkerId, WorkerState, WorkerStatus,
};
pub use options::{EnvPolicy, ProgramRef, SpawnConfig, StdioMode};
pub use protocol::{ChildMessage, ParentMessage, ResultMessage, WorkPayload};
