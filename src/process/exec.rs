//! One-shot command execution.
//!
//! Provides the non-IPC ways of running a child:
//! - `exec` — shell-interpreted, output buffered in memory
//! - `exec_file` — runs a file directly without a shell, output buffered
//! - `spawn_streaming` — input written and output read line by line while
//!   the child runs
//!
//! Buffered execution is for commands with small output; anything large
//! belongs on the streaming path.

use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio_stream::wrappers::LinesStream;
use tracing::debug;

use super::handle::describe_exit;
use super::options::{ProgramRef, SpawnConfig, StdioMode};
use crate::error::ExecError;

/// Maximum buffered output per stream before truncation (64KB).
pub const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Captured output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or -1 when the process was ended by a signal.
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run a command line through the shell and buffer its output.
///
/// Shell syntax (pipes, redirects, `$VARS`) works here, which also means the
/// command line must never contain unvalidated external input.
pub async fn exec(
    command: &str,
    config: &SpawnConfig,
    timeout: Duration,
) -> Result<ExecOutput, ExecError> {
    run_buffered(&ProgramRef::new(command), config, true, timeout).await
}

/// Run a program directly (no shell) and buffer its output.
pub async fn exec_file(
    program: &ProgramRef,
    config: &SpawnConfig,
    timeout: Duration,
) -> Result<ExecOutput, ExecError> {
    run_buffered(program, config, false, timeout).await
}

async fn run_buffered(
    program: &ProgramRef,
    config: &SpawnConfig,
    shell: bool,
    timeout: Duration,
) -> Result<ExecOutput, ExecError> {
    let mut command = config.build_command(program, shell);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|source| ExecError::Spawn {
        program: program.to_string(),
        source,
    })?;

    // Dropping the future on timeout drops the child, which kills it.
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ExecError::Timeout(timeout))??;

    Ok(ExecOutput {
        stdout: capture(&output.stdout),
        stderr: capture(&output.stderr),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// A line of output from a streaming child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// How a streaming child finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

type LineStream = Pin<Box<dyn Stream<Item = std::io::Result<OutputLine>> + Send>>;

/// A running child whose output is consumed as a stream of lines.
///
/// Its stdin is a pipe. Take it with [`take_stdin`](Self::take_stdin) to feed
/// the child; [`wait`](Self::wait) closes it if it is still held.
pub struct StreamingChild {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: LineStream,
}

impl StreamingChild {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Writer for the child's stdin. Dropping it signals end of input.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Next line from either stdout or stderr. `None` once both are closed.
    ///
    /// Lines from the same stream arrive in order; the interleaving between
    /// stdout and stderr is not guaranteed.
    pub async fn next_line(&mut self) -> Option<std::io::Result<OutputLine>> {
        self.lines.next().await
    }

    /// Drain remaining output and wait for the process to exit.
    pub async fn wait(mut self) -> Result<ExitInfo, ExecError> {
        drop(self.stdin.take());
        while let Some(line) = self.lines.next().await {
            if let Err(e) = line {
                debug!(error = %e, "Output stream failed while draining");
                break;
            }
        }
        let status = self.child.wait().await?;
        let (code, signal) = describe_exit(status);
        Ok(ExitInfo { code, signal })
    }

    /// Force the child to stop.
    pub async fn kill(&mut self) -> Result<(), ExecError> {
        self.child.kill().await?;
        Ok(())
    }
}

/// Spawn a child and stream its output.
///
/// With `StdioMode::Piped` both stdout and stderr are captured. With
/// `Inherit` the child writes straight to the creator's descriptors and the
/// stream is empty. `Ignored` discards output. Stdin is always piped.
pub fn spawn_streaming(
    program: &ProgramRef,
    config: &SpawnConfig,
) -> Result<StreamingChild, ExecError> {
    let mut command = config.command(program);
    let stdio = config.stdio;
    command
        .stdin(Stdio::piped())
        .stdout(stdio.to_stdio())
        .stderr(stdio.to_stdio())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| ExecError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let lines: LineStream = match (stdio, child.stdout.take(), child.stderr.take()) {
        (StdioMode::Piped, Some(stdout), Some(stderr)) => {
            let out = LinesStream::new(BufReader::new(stdout).lines())
                .map(|line| line.map(OutputLine::Stdout));
            let err = LinesStream::new(BufReader::new(stderr).lines())
                .map(|line| line.map(OutputLine::Stderr));
            Box::pin(futures::stream::select(out, err))
        }
        _ => Box::pin(futures::stream::empty::<std::io::Result<OutputLine>>()),
    };

    let stdin = child.stdin.take();
    Ok(StreamingChild {
        child,
        stdin,
        lines,
    })
}

/// Decode captured output, keeping the first and last `MAX_OUTPUT_SIZE / 2`
/// bytes when it is too large. Cuts fall on character boundaries.
fn capture(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_OUTPUT_SIZE {
        return text.into_owned();
    }

    let keep = MAX_OUTPUT_SIZE / 2;
    let head_end = (0..=keep)
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0);
    let tail_start = (text.len() - keep..text.len())
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(text.len());
    let dropped = tail_start - head_end;
    format!(
        "{}\n[... {dropped} bytes of output omitted ...]\n{}",
        &text[..head_end],
        &text[tail_start..]
    )
}
