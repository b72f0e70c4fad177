//! Admission control — caps the number of live workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

use crate::config::AdmissionPolicy;
use crate::error::DispatchError;

/// Gate in front of worker creation. A permit is held for the whole life of
/// a worker process, not just until its result arrives.
#[derive(Debug)]
pub struct Admission {
    permits: Arc<Semaphore>,
    max: usize,
    policy: AdmissionPolicy,
    waiting: Arc<AtomicUsize>,
}

/// Decrements the waiting count when a queued caller stops waiting,
/// including when its future is dropped.
struct WaitGuard(Arc<AtomicUsize>);

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Admission {
    pub fn new(max: usize, policy: AdmissionPolicy) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max)),
            max,
            policy,
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Obtain a slot for one worker according to the policy.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, DispatchError> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(DispatchError::ShuttingDown),
            Err(TryAcquireError::NoPermits) => {}
        }

        let max_waiting = match self.policy {
            AdmissionPolicy::FailFast => {
                return Err(DispatchError::CapacityExceeded { max: self.max });
            }
            AdmissionPolicy::Queue { max_waiting } => max_waiting,
        };

        let ahead = self.waiting.fetch_add(1, Ordering::SeqCst);
        let _guard = WaitGuard(Arc::clone(&self.waiting));
        if ahead >= max_waiting {
            debug!(waiting = ahead, max_waiting, "Admission queue full");
            return Err(DispatchError::CapacityExceeded { max: self.max });
        }

        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::ShuttingDown)
    }

    /// Refuse all further admissions and wake queued callers with an error.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.max.saturating_sub(self.permits.available_permits())
    }

    /// Callers queued for a slot.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}
