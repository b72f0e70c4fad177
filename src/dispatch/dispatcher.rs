//! Dispatcher — routes each unit of work to its own worker process and
//! correlates the reply back to the caller.
//!
//! Every dispatch gets a fresh worker and a driver task that owns the worker's
//! event stream. The driver, not the caller, enforces the timeout, so a
//! request is resolved and its worker reaped even if the caller goes away.
//! The timeout clock starts before admission: time spent queued for a slot
//! counts against it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::admission::Admission;
use super::pending::{PendingRequest, PendingTable};
use crate::config::DispatcherConfig;
use crate::error::DispatchError;
use crate::process::handle::deadline_after;
use crate::process::{
    ChildMessage, KillSignal, ResultMessage, WorkPayload, WorkerEvent, WorkerEvents, WorkerHandle,
    WorkerId,
};

/// Longest timeout a dispatch may carry; longer requests are clamped.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub live_workers: usize,
    pub max_workers: usize,
    pub pending_requests: usize,
    pub queued: usize,
}

/// Process-per-request dispatcher. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    config: DispatcherConfig,
    admission: Admission,
    pending: Mutex<PendingTable>,
    workers: Mutex<HashMap<WorkerId, Arc<WorkerHandle>>>,
}

impl Dispatcher {
    /// Create a dispatcher. Workers are only spawned on demand.
    pub fn new(config: DispatcherConfig) -> Self {
        let admission = Admission::new(config.max_workers, config.admission);
        Self {
            inner: Arc::new(Inner {
                config,
                admission,
                pending: Mutex::new(PendingTable::new()),
                workers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.config.default_timeout
    }

    /// Run `payload` on a fresh worker and wait for its result.
    ///
    /// Resolves exactly once: with the worker's result, or with `Timeout`,
    /// `WorkerFailure`, `CapacityExceeded`, `Spawn`, `ChannelClosed`,
    /// `Payload` or `ShuttingDown`. On timeout the worker has already been
    /// killed and its slot released when this returns. `timeout` is clamped
    /// to [`MAX_TIMEOUT`].
    pub async fn dispatch(
        &self,
        payload: WorkPayload,
        timeout: Duration,
    ) -> Result<ResultMessage, DispatchError> {
        let inner = &self.inner;
        let timeout = timeout.min(MAX_TIMEOUT);
        let deadline = deadline_after(timeout);

        let permit = tokio::time::timeout_at(deadline, inner.admission.acquire())
            .await
            .map_err(|_| {
                debug!(timeout = ?timeout, "Timed out waiting for a worker slot");
                DispatchError::Timeout { timeout }
            })??;

        let (handle, events) = WorkerHandle::spawn(&inner.config.program, &inner.config.spawn)
            .inspect_err(|e| warn!(error = %e, "Worker spawn failed"))?;
        let handle = Arc::new(handle);
        let worker_id = handle.id();
        let correlation_id = Uuid::new_v4();

        // Register before sending so the reply can never outrun the entry.
        let reply = inner.pending.lock().await.register(correlation_id, worker_id);
        inner
            .workers
            .lock()
            .await
            .insert(worker_id, Arc::clone(&handle));

        tokio::spawn(drive_worker(
            Arc::clone(inner),
            Arc::clone(&handle),
            events,
            correlation_id,
            deadline,
            timeout,
            permit,
        ));

        if inner.admission.is_closed() {
            // Shutdown raced with this dispatch and may have missed our worker.
            inner.pending.lock().await.take(correlation_id);
            handle.kill(KillSignal::Kill);
            return Err(DispatchError::ShuttingDown);
        }

        debug!(
            worker_id = %worker_id,
            pid = ?handle.pid(),
            correlation_id = %correlation_id,
            op = %payload.op,
            "Dispatching"
        );
        if let Err(e) = handle.send(correlation_id, payload) {
            inner.pending.lock().await.take(correlation_id);
            handle.kill(KillSignal::Kill);
            return Err(e);
        }

        match reply.await {
            Ok(reply) => reply,
            Err(_) => Err(DispatchError::WorkerFailure {
                worker_id,
                reason: "request dropped without a reply".to_string(),
            }),
        }
    }

    /// Dispatch with the configured default timeout.
    pub async fn dispatch_default(
        &self,
        payload: WorkPayload,
    ) -> Result<ResultMessage, DispatchError> {
        self.dispatch(payload, self.default_timeout()).await
    }

    pub async fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            live_workers: self.inner.admission.in_use(),
            max_workers: self.inner.admission.max(),
            pending_requests: self.inner.pending.lock().await.len(),
            queued: self.inner.admission.waiting(),
        }
    }

    /// Number of worker processes that have not been reaped yet.
    pub fn live_workers(&self) -> usize {
        self.inner.admission.in_use()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.admission.is_closed()
    }

    /// Stop admitting work, fail every outstanding request with
    /// `ShuttingDown`, and terminate all live workers.
    ///
    /// Waits up to the kill grace plus reap timeout for workers to exit.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.admission.close();

        let outstanding = inner.pending.lock().await.drain();
        let failed = outstanding.len();
        for request in outstanding {
            request.resolve(Err(DispatchError::ShuttingDown));
        }

        let workers: Vec<Arc<WorkerHandle>> =
            inner.workers.lock().await.values().cloned().collect();
        info!(
            workers = workers.len(),
            requests = failed,
            "Dispatcher shutting down"
        );
        for worker in &workers {
            worker.kill(KillSignal::Term);
        }

        let budget = inner.config.spawn.kill_grace + inner.config.reap_timeout;
        let all_exited =
            futures::future::join_all(workers.iter().map(|w| w.terminated()));
        if tokio::time::timeout(budget, all_exited).await.is_err() {
            warn!(budget = ?budget, "Some workers did not exit during shutdown");
        }
    }
}

impl Inner {
    /// Hand a worker's message to the request it answers.
    ///
    /// Returns true if a pending request owned by this worker was resolved.
    async fn route(&self, worker_id: WorkerId, msg: ChildMessage) -> bool {
        let correlation_id = msg.correlation_id();
        let request = self
            .pending
            .lock()
            .await
            .take_owned(correlation_id, worker_id);

        let Some(request) = request else {
            warn!(
                worker_id = %worker_id,
                correlation_id = %correlation_id,
                "Discarding message for unknown or resolved request"
            );
            return false;
        };

        let latency = request.age();
        let reply = match msg {
            ChildMessage::Result {
                correlation_id,
                result,
            } => Ok(ResultMessage {
                correlation_id,
                result,
            }),
            ChildMessage::Error { message, .. } => Err(DispatchError::WorkerFailure {
                worker_id,
                reason: message,
            }),
        };

        debug!(
            worker_id = %worker_id,
            correlation_id = %correlation_id,
            ok = reply.is_ok(),
            latency_ms = latency.as_millis() as u64,
            "Request resolved"
        );
        if !request.resolve(reply) {
            debug!(correlation_id = %correlation_id, "Caller stopped waiting before the reply");
        }
        true
    }
}

/// Own one worker from spawn to reap.
async fn drive_worker(
    inner: Arc<Inner>,
    handle: Arc<WorkerHandle>,
    mut events: WorkerEvents,
    correlation_id: Uuid,
    deadline: Instant,
    timeout: Duration,
    permit: OwnedSemaphorePermit,
) {
    let worker_id = handle.id();
    let reap_timeout = inner.config.reap_timeout;

    let mut deadline = Some(deadline);
    let mut reap_by: Option<Instant> = None;
    // A timed-out request, answered once its worker is gone.
    let mut expired: Option<PendingRequest> = None;

    let terminal = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(WorkerEvent::Message(msg)) => {
                    if inner.route(worker_id, msg).await {
                        // One request per worker: let it wind down.
                        deadline = None;
                        handle.close_channel();
                        reap_by.get_or_insert_with(|| deadline_after(reap_timeout));
                    }
                }
                Some(event) => break Some(event),
                None => break None,
            },
            _ = sleep_until(deadline) => {
                deadline = None;
                expired = inner.pending.lock().await.take(correlation_id);
                if expired.is_some() {
                    warn!(
                        worker_id = %worker_id,
                        correlation_id = %correlation_id,
                        timeout = ?timeout,
                        "Worker timed out, killing"
                    );
                    handle.kill(KillSignal::Kill);
                    reap_by = Some(deadline_after(reap_timeout));
                }
            }
            _ = sleep_until(reap_by) => {
                reap_by = None;
                match expired.take() {
                    Some(request) => {
                        warn!(worker_id = %worker_id, "Killed worker has not exited yet");
                        request.resolve(Err(DispatchError::Timeout { timeout }));
                    }
                    None => {
                        debug!(worker_id = %worker_id, "Worker lingering after reply, terminating");
                        handle.kill(KillSignal::Term);
                    }
                }
            }
        }
    };

    inner.workers.lock().await.remove(&worker_id);
    drop(permit);

    if let Some(request) = expired {
        request.resolve(Err(DispatchError::Timeout { timeout }));
    }

    let reason = match terminal {
        Some(WorkerEvent::Exit { code, signal }) => match (code, signal) {
            (Some(code), _) => format!("exited with code {code} before replying"),
            (None, Some(signal)) => format!("killed by {signal} before replying"),
            (None, None) => "exited before replying".to_string(),
        },
        Some(WorkerEvent::Error(cause)) => cause,
        Some(WorkerEvent::Message(_)) | None => "event stream closed".to_string(),
    };
    let orphans = inner.pending.lock().await.take_for_worker(worker_id);
    for request in orphans {
        warn!(
            worker_id = %worker_id,
            correlation_id = %request.correlation_id,
            reason = %reason,
            "Worker failed"
        );
        request.resolve(Err(DispatchError::WorkerFailure {
            worker_id,
            reason: reason.clone(),
        }));
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
