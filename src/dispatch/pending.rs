//! Correlation table — requests waiting for a worker's reply.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::process::{ResultMessage, WorkerId};

/// Outcome delivered to a waiting caller.
pub type Reply = Result<ResultMessage, DispatchError>;

/// A request that has been sent to a worker and not yet resolved.
#[derive(Debug)]
pub struct PendingRequest {
    pub correlation_id: Uuid,
    /// The one worker allowed to answer this request.
    pub worker_id: WorkerId,
    pub submitted_at: DateTime<Utc>,
    reply: oneshot::Sender<Reply>,
}

impl PendingRequest {
    /// Resolve the request. Consumes it, so a request resolves at most once.
    ///
    /// Returns false if the caller stopped waiting.
    pub fn resolve(self, reply: Reply) -> bool {
        self.reply.send(reply).is_ok()
    }

    /// Time since submission.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.submitted_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Pending requests keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingTable {
    requests: HashMap<Uuid, PendingRequest>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request owned by `worker_id`; the receiver yields its reply.
    pub fn register(&mut self, correlation_id: Uuid, worker_id: WorkerId) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.requests.insert(
            correlation_id,
            PendingRequest {
                correlation_id,
                worker_id,
                submitted_at: Utc::now(),
                reply: tx,
            },
        );
        rx
    }

    /// Remove a request regardless of owner.
    pub fn take(&mut self, correlation_id: Uuid) -> Option<PendingRequest> {
        self.requests.remove(&correlation_id)
    }

    /// Remove a request only if `worker_id` owns it.
    pub fn take_owned(&mut self, correlation_id: Uuid, worker_id: WorkerId) -> Option<PendingRequest> {
        match self.requests.get(&correlation_id) {
            Some(request) if request.worker_id == worker_id => self.requests.remove(&correlation_id),
            _ => None,
        }
    }

    /// Remove every request owned by `worker_id`.
    pub fn take_for_worker(&mut self, worker_id: WorkerId) -> Vec<PendingRequest> {
        let ids: Vec<Uuid> = self
            .requests
            .values()
            .filter(|r| r.worker_id == worker_id)
            .map(|r| r.correlation_id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.requests.remove(&id))
            .collect()
    }

    /// Remove everything.
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.requests.drain().map(|(_, r)| r).collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: Uuid, value: i64) -> Reply {
        Ok(ResultMessage {
            correlation_id: id,
            result: serde_json::json!(value),
        })
    }

    #[tokio::test]
    async fn register_and_resolve() {
        let mut table = PendingTable::new();
        let id = Uuid::new_v4();
        let worker = WorkerId::new();
        let rx = table.register(id, worker);
        assert_eq!(table.len(), 1);

        let request = table.take(id).unwrap();
        assert_eq!(request.worker_id, worker);
        assert!(request.resolve(result(id, 5)));
        assert!(table.is_empty());

        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.result, serde_json::json!(5));
    }

    #[test]
    fn unknown_id_is_none() {
        let mut table = PendingTable::new();
        let _rx = table.register(Uuid::new_v4(), WorkerId::new());
        assert!(table.take(Uuid::new_v4()).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn take_owned_checks_owner() {
        let mut table = PendingTable::new();
        let id = Uuid::new_v4();
        let owner = WorkerId::new();
        let _rx = table.register(id, owner);

        assert!(table.take_owned(id, WorkerId::new()).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.take_owned(id, owner).is_some());
        assert!(table.take_owned(id, owner).is_none());
    }

    #[test]
    fn take_for_worker_only_removes_that_worker() {
        let mut table = PendingTable::new();
        let a = WorkerId::new();
        let b = WorkerId::new();
        let _r1 = table.register(Uuid::new_v4(), a);
        let _r2 = table.register(Uuid::new_v4(), b);

        let taken = table.take_for_worker(a);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].worker_id, a);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn resolve_after_caller_left() {
        let mut table = PendingTable::new();
        let id = Uuid::new_v4();
        drop(table.register(id, WorkerId::new()));
        let request = table.take(id).unwrap();
        assert!(!request.resolve(result(id, 1)));
    }

    #[test]
    fn drain_empties_table() {
        let mut table = PendingTable::new();
        let _r1 = table.register(Uuid::new_v4(), WorkerId::new());
        let _r2 = table.register(Uuid::new_v4(), WorkerId::new());
        assert_eq!(table.drain().len(), 2);
        assert!(table.is_empty());
    }
}
