//! Worker process handle — one spawned worker and its message channel.
//!
//! Each handle runs three background tasks:
//! - writer: drains the outbound queue into the child's stdin, in send order
//! - reader: parses stdout lines into [`WorkerEvent::Message`]s, in arrival order
//! - supervisor: owns the `Child`, applies kill requests, and emits exactly
//!   one terminal event ([`WorkerEvent::Exit`] or [`WorkerEvent::Error`])
//!   once the process is gone and its output has been drained
//!
//! A worker that writes a line longer than [`MAX_LINE_BYTES`] is killed and
//! reported as an [`WorkerEvent::Error`].

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::options::{ProgramRef, SpawnConfig, StdioMode};
use super::protocol::{
    ChildMessage, LineReader, MAX_LINE_BYTES, ParentMessage, WorkPayload, decode_line, encode_line,
};
use crate::error::{DispatchError, ProtocolError};

/// How long to wait for stdout to drain after the process has exited.
///
/// A grandchild can keep the pipe open after the worker itself is gone.
/// Skipped when the worker was killed outright.
const READER_DRAIN: Duration = Duration::from_millis(250);

/// Opaque worker identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Process is being created.
    Starting,
    /// Process is up and idle.
    Ready,
    /// Work has been sent and no reply has arrived yet.
    Busy,
    /// Process exited (normally or by signal).
    Exited,
    /// Process could not be observed to completion.
    Failed,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Failed)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Exited => "exited",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of a worker's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
}

impl WorkerStatus {
    fn starting() -> Self {
        Self {
            state: WorkerState::Starting,
            exit_code: None,
            exit_signal: None,
        }
    }
}

/// Termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// Ask politely (SIGTERM), escalate to a forced kill after the grace period.
    Term,
    /// Kill immediately.
    Kill,
}

/// Notifications from a worker, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Message(ChildMessage),
    Exit {
        code: Option<i32>,
        signal: Option<String>,
    },
    Error(String),
}

impl WorkerEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Message(_))
    }
}

/// Receiving end of a worker's event stream.
pub type WorkerEvents = mpsc::UnboundedReceiver<WorkerEvent>;

/// Handle to one worker process.
pub struct WorkerHandle {
    id: WorkerId,
    pid: Option<u32>,
    program: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    control: mpsc::UnboundedSender<KillSignal>,
    status: Arc<watch::Sender<WorkerStatus>>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("program", &self.program)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl WorkerHandle {
    /// Spawn a worker. Its stdin/stdout become the message channel; stderr
    /// follows `config.stdio` (piped stderr is forwarded to the log).
    pub fn spawn(
        program: &ProgramRef,
        config: &SpawnConfig,
    ) -> Result<(Self, WorkerEvents), DispatchError> {
        let id = WorkerId::new();
        let status = Arc::new(watch::channel(WorkerStatus::starting()).0);

        let mut command = config.command(program);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(config.stdio.to_stdio())
            .kill_on_drop(true);

        let spawn_err = |source: std::io::Error| DispatchError::Spawn {
            program: program.to_string(),
            source,
        };

        let mut child = command.spawn().map_err(spawn_err)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err(std::io::Error::other("stdin not captured")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err(std::io::Error::other("stdout not captured")))?;

        if config.stdio == StdioMode::Piped {
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(worker_id = %id, line = %line, "Worker stderr");
                    }
                });
            }
        }

        let pid = child.id();
        info!(worker_id = %id, pid = ?pid, program = %program, "Worker spawned");
        status.send_modify(|s| s.state = WorkerState::Ready);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (failed_tx, failed_rx) = oneshot::channel();

        tokio::spawn(write_loop(id, stdin, outbound_rx));
        let reader = tokio::spawn(read_loop(
            id,
            stdout,
            event_tx.clone(),
            control_tx.clone(),
            failed_tx,
            Arc::clone(&status),
        ));
        tokio::spawn(supervise(
            id,
            child,
            control_rx,
            reader,
            failed_rx,
            event_tx,
            Arc::clone(&status),
            config.kill_grace,
        ));

        let handle = Self {
            id,
            pid,
            program: program.to_string(),
            outbound: Mutex::new(Some(outbound_tx)),
            control: control_tx,
            status,
        };
        Ok((handle, event_rx))
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// OS process id, if the platform reported one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.status.borrow().state
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    /// Queue a unit of work for delivery.
    ///
    /// The envelope is encoded here, so a payload that cannot go over the
    /// wire fails with `DispatchError::Payload` instead of being dropped.
    pub fn send(&self, correlation_id: Uuid, payload: WorkPayload) -> Result<(), DispatchError> {
        if self.state().is_terminal() {
            return Err(closed_err(self.id));
        }

        let line = encode_line(&ParentMessage::Work {
            correlation_id,
            payload,
        })
        .map_err(DispatchError::Payload)?;

        let outbound = self.outbound.lock().map_err(|_| closed_err(self.id))?;
        let tx = outbound.as_ref().ok_or_else(|| closed_err(self.id))?;
        tx.send(line).map_err(|_| closed_err(self.id))?;
        drop(outbound);

        self.status.send_if_modified(|s| {
            if s.state.is_terminal() {
                return false;
            }
            s.state = WorkerState::Busy;
            true
        });
        debug!(worker_id = %self.id, correlation_id = %correlation_id, "Work queued");
        Ok(())
    }

    /// Close the outbound channel. A well-behaved worker exits on stdin EOF.
    pub fn close_channel(&self) {
        if let Ok(mut outbound) = self.outbound.lock() {
            outbound.take();
        }
    }

    /// Request termination. The terminal event still fires.
    pub fn kill(&self, signal: KillSignal) {
        if self.control.send(signal).is_err() {
            debug!(worker_id = %self.id, "Kill requested after supervisor finished");
        }
    }

    /// Wait until the worker reaches a terminal state.
    pub async fn terminated(&self) -> WorkerStatus {
        let mut rx = self.status.subscribe();
        match rx.wait_for(|s| s.state.is_terminal()).await {
            Ok(status) => status.clone(),
            // The sender lives in `self`, so this only happens mid-drop.
            Err(_) => self.status(),
        }
    }
}

fn closed_err(worker_id: WorkerId) -> DispatchError {
    DispatchError::ChannelClosed { worker_id }
}

async fn write_loop(id: WorkerId, mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            debug!(worker_id = %id, error = %e, "Worker stdin closed");
            return;
        }
        if let Err(e) = stdin.flush().await {
            debug!(worker_id = %id, error = %e, "Worker stdin flush failed");
            return;
        }
    }
    // Dropping stdin here signals EOF to the worker.
}

/// Unacceptable output is reported on `failed` before the kill is requested.
async fn read_loop(
    id: WorkerId,
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<WorkerEvent>,
    control: mpsc::UnboundedSender<KillSignal>,
    failed: oneshot::Sender<String>,
    status: Arc<watch::Sender<WorkerStatus>>,
) {
    let mut lines = LineReader::new(BufReader::new(stdout));
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match decode_line::<ChildMessage>(&line) {
                    Ok(msg) => {
                        status.send_if_modified(|s| {
                            if s.state != WorkerState::Busy {
                                return false;
                            }
                            s.state = WorkerState::Ready;
                            true
                        });
                        let _ = events.send(WorkerEvent::Message(msg));
                    }
                    Err(e) => {
                        warn!(worker_id = %id, error = %e, "Ignoring malformed worker output");
                    }
                }
            }
            Ok(None) => return,
            Err(ProtocolError::TooLarge { max }) => {
                warn!(worker_id = %id, max, "Worker output line too long, killing");
                let _ = failed.send(format!("output line exceeds {max} bytes"));
                let _ = control.send(KillSignal::Kill);
                return;
            }
            Err(e) => {
                debug!(worker_id = %id, error = %e, "Worker stdout read failed");
                return;
            }
        }
    }
}

async fn supervise(
    id: WorkerId,
    mut child: Child,
    mut control: mpsc::UnboundedReceiver<KillSignal>,
    mut reader: JoinHandle<()>,
    mut failed: oneshot::Receiver<String>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    status: Arc<watch::Sender<WorkerStatus>>,
    grace: Duration,
) {
    let mut control_open = true;
    let mut force_at: Option<Instant> = None;
    let mut forced = false;

    let outcome = loop {
        tokio::select! {
            result = child.wait() => break result,
            signal = control.recv(), if control_open => {
                // A dropped handle counts as a polite termination request.
                let signal = signal.unwrap_or_else(|| {
                    control_open = false;
                    KillSignal::Term
                });
                match signal {
                    KillSignal::Kill => {
                        forced = true;
                        if let Err(e) = child.start_kill() {
                            debug!(worker_id = %id, error = %e, "Kill failed");
                        }
                    }
                    KillSignal::Term => {
                        if let Err(e) = terminate(&child) {
                            debug!(worker_id = %id, error = %e, "Terminate failed");
                        }
                        force_at.get_or_insert_with(|| deadline_after(grace));
                    }
                }
            }
            _ = deadline(force_at) => {
                warn!(worker_id = %id, grace = ?grace, "Worker ignored termination, killing");
                force_at = None;
                forced = true;
                if let Err(e) = child.start_kill() {
                    debug!(worker_id = %id, error = %e, "Kill failed");
                }
            }
        }
    };

    match outcome {
        Ok(exit) => {
            // Deliver every message the worker wrote before it died, unless
            // it was killed and nobody is waiting for them.
            let drain = if forced { Duration::ZERO } else { READER_DRAIN };
            if tokio::time::timeout(drain, &mut reader).await.is_err() {
                reader.abort();
            }
            let failure = failed.try_recv().ok();
            let (code, signal) = describe_exit(exit);
            status.send_modify(|s| {
                s.state = if failure.is_some() {
                    WorkerState::Failed
                } else {
                    WorkerState::Exited
                };
                s.exit_code = code;
                s.exit_signal = signal.clone();
            });
            match failure {
                Some(cause) => {
                    warn!(worker_id = %id, cause = %cause, "Worker failed");
                    let _ = events.send(WorkerEvent::Error(cause));
                }
                None => {
                    info!(worker_id = %id, code = ?code, signal = ?signal, "Worker exited");
                    let _ = events.send(WorkerEvent::Exit { code, signal });
                }
            }
        }
        Err(e) => {
            reader.abort();
            status.send_modify(|s| s.state = WorkerState::Failed);
            warn!(worker_id = %id, error = %e, "Lost track of worker process");
            let _ = events.send(WorkerEvent::Error(e.to_string()));
        }
    }
}

/// `now + after`, saturating far in the future instead of overflowing.
pub(crate) fn deadline_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn terminate(child: &Child) -> std::io::Result<()> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = i32::try_from(pid).map_err(std::io::Error::other)?;
    signal::kill(Pid::from_raw(pid), Signal::SIGTERM)?;
    Ok(())
}

#[cfg(not(unix))]
fn terminate(child: &Child) -> std::io::Result<()> {
    // No polite termination here; the grace deadline escalates to a kill.
    let _ = child;
    Ok(())
}

/// Split an exit status into (code, signal name).
pub(crate) fn describe_exit(status: ExitStatus) -> (Option<i32>, Option<String>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        (status.code(), status.signal().map(signal_name))
    }
    #[cfg(not(unix))]
    {
        (status.code(), None)
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    match nix::sys::signal::Signal::try_from(signal) {
        Ok(signal) => signal.as_str().to_string(),
        Err(_) => format!("SIG{signal}"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn sh(script: &str) -> ProgramRef {
        ProgramRef::new("sh").args(["-c", script])
    }

    async fn next_terminal(events: &mut WorkerEvents) -> WorkerEvent {
        tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                let event = events.recv().await.expect("event stream ended early");
                if event.is_terminal() {
                    return event;
                }
            }
        })
        .await
        .expect("no terminal event")
    }

    #[tokio::test]
    async fn spawn_missing_program_fails() {
        let result = WorkerHandle::spawn(
            &ProgramRef::new("/definitely/not/a/real/program"),
            &SpawnConfig::default(),
        );
        assert!(matches!(result, Err(DispatchError::Spawn { .. })));
    }

    #[tokio::test]
    async fn exit_code_is_reported_once() {
        let (handle, mut events) = WorkerHandle::spawn(&sh("exit 3"), &SpawnConfig::default()).unwrap();

        let event = next_terminal(&mut events).await;
        assert_eq!(
            event,
            WorkerEvent::Exit {
                code: Some(3),
                signal: None
            }
        );
        // Stream closes after the single terminal event.
        assert!(events.recv().await.is_none());

        let status = handle.terminated().await;
        assert_eq!(status.state, WorkerState::Exited);
        assert_eq!(status.exit_code, Some(3));
    }

    #[tokio::test]
    async fn send_after_exit_is_channel_closed() {
        let (handle, mut events) = WorkerHandle::spawn(&sh("exit 0"), &SpawnConfig::default()).unwrap();
        next_terminal(&mut events).await;

        let result = handle.send(Uuid::new_v4(), WorkPayload::new("echo", serde_json::json!(1)));
        assert!(matches!(result, Err(DispatchError::ChannelClosed { .. })));
    }

    #[tokio::test]
    async fn reply_is_delivered_before_exit() {
        // Turn the work envelope into a result envelope carrying the payload.
        let script = r#"read -r line; printf '%s\n' "$line" | sed 's/"type":"work"/"type":"result"/; s/"payload"/"result"/'"#;
        let (handle, mut events) = WorkerHandle::spawn(&sh(script), &SpawnConfig::default()).unwrap();

        let id = Uuid::new_v4();
        let payload = WorkPayload::new("echo", serde_json::json!({"x": 1}));
        handle.send(id, payload.clone()).unwrap();
        assert_eq!(handle.state(), WorkerState::Busy);

        let first = tokio::time::timeout(TEST_TIMEOUT, events.recv())
            .await
            .unwrap()
            .unwrap();
        match first {
            WorkerEvent::Message(ChildMessage::Result {
                correlation_id,
                result,
            }) => {
                assert_eq!(correlation_id, id);
                assert_eq!(result, serde_json::to_value(&payload).unwrap());
            }
            other => panic!("expected result message, got {other:?}"),
        }

        assert!(matches!(
            next_terminal(&mut events).await,
            WorkerEvent::Exit { code: Some(0), .. }
        ));
    }

    #[tokio::test]
    async fn term_reports_signal() {
        let (handle, mut events) =
            WorkerHandle::spawn(&ProgramRef::new("sleep").arg("30"), &SpawnConfig::default()).unwrap();
        handle.kill(KillSignal::Term);

        let event = next_terminal(&mut events).await;
        assert_eq!(
            event,
            WorkerEvent::Exit {
                code: None,
                signal: Some("SIGTERM".to_string())
            }
        );
        assert_eq!(handle.status().exit_signal.as_deref(), Some("SIGTERM"));
    }

    #[tokio::test]
    async fn term_escalates_after_grace() {
        let config = SpawnConfig::default()
            .with_stdio(StdioMode::Ignored)
            .with_kill_grace(Duration::from_millis(100));
        let (handle, mut events) =
            WorkerHandle::spawn(&sh("trap '' TERM; while true; do sleep 1; done"), &config).unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.kill(KillSignal::Term);

        let event = next_terminal(&mut events).await;
        assert_eq!(
            event,
            WorkerEvent::Exit {
                code: None,
                signal: Some("SIGKILL".to_string())
            }
        );
    }

    #[tokio::test]
    async fn closing_channel_lets_worker_finish() {
        let (handle, mut events) =
            WorkerHandle::spawn(&ProgramRef::new("cat"), &SpawnConfig::default()).unwrap();
        handle.close_channel();

        assert!(matches!(
            next_terminal(&mut events).await,
            WorkerEvent::Exit { code: Some(0), .. }
        ));
    }

    #[tokio::test]
    async fn oversized_work_is_rejected_on_send() {
        let (handle, mut events) =
            WorkerHandle::spawn(&ProgramRef::new("cat"), &SpawnConfig::default()).unwrap();
        let big = serde_json::Value::String("x".repeat(MAX_LINE_BYTES + 1));

        let result = handle.send(Uuid::new_v4(), WorkPayload::new("echo", big));
        assert!(matches!(
            result,
            Err(DispatchError::Payload(ProtocolError::TooLarge { .. }))
        ));
        // Nothing was queued, so the worker is still idle.
        assert_eq!(handle.state(), WorkerState::Ready);

        handle.close_channel();
        next_terminal(&mut events).await;
    }

    #[tokio::test]
    async fn endless_output_line_fails_worker() {
        let config = SpawnConfig::default().with_stdio(StdioMode::Ignored);
        let script = "head -c 2000000 /dev/zero | tr '\\0' x; exec sleep 30";
        let (handle, mut events) = WorkerHandle::spawn(&sh(script), &config).unwrap();

        match next_terminal(&mut events).await {
            WorkerEvent::Error(cause) => assert!(cause.contains("exceeds")),
            other => panic!("expected Error, got {other:?}"),
        }
        assert_eq!(handle.state(), WorkerState::Failed);
    }

    #[tokio::test]
    async fn kill_is_not_delayed_by_lingering_grandchild() {
        let config = SpawnConfig::default().with_stdio(StdioMode::Ignored);
        // The trailing `:` keeps sh from exec'ing sleep, so sleep inherits stdout.
        let (handle, mut events) = WorkerHandle::spawn(&sh("sleep 30; :"), &config).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        handle.kill(KillSignal::Kill);
        let event = next_terminal(&mut events).await;
        assert!(started.elapsed() < READER_DRAIN);
        assert_eq!(
            event,
            WorkerEvent::Exit {
                code: None,
                signal: Some("SIGKILL".to_string())
            }
        );
    }

    #[test]
    fn deadline_after_saturates() {
        assert!(deadline_after(Duration::MAX) > Instant::now());
    }

    #[test]
    fn state_display_and_terminal() {
        assert_eq!(WorkerState::Busy.to_string(), "busy");
        assert!(WorkerState::Exited.is_terminal());
        assert!(WorkerState::Failed.is_terminal());
        assert!(!WorkerState::Ready.is_terminal());
        assert!(!WorkerState::Starting.is_terminal());
    }

    #[test]
    fn signal_names() {
        use nix::sys::signal::Signal;
        assert_eq!(signal_name(Signal::SIGKILL as i32), "SIGKILL");
        assert_eq!(signal_name(Signal::SIGTERM as i32), "SIGTERM");
        assert!(signal_name(64).starts_with("SIG"));
    }
}
