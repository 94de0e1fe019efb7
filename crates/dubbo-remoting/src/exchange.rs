//! Correlation of responses with the requests that caused them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dubbo_proto::{ResponsePayload, ReturnType};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::RemotingError;

/// Allocates request ids for one client.
///
/// Ids advance by two so that the first id handed out is 2.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    current: AtomicU64,
}

impl SequenceGenerator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.current.fetch_add(2, Ordering::Relaxed).wrapping_add(2)
    }
}

/// Outcome delivered to an asynchronous caller.
#[derive(Debug)]
pub struct CallbackResponse {
    pub id: u64,
    /// When the request was handed to the connection.
    pub start: Instant,
    pub result: Result<ResponsePayload, RemotingError>,
}

impl CallbackResponse {
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Callback invoked once with the outcome of an asynchronous request.
pub type ResponseCallback = Box<dyn FnOnce(CallbackResponse) + Send + 'static>;

enum Completion {
    Waiter(oneshot::Sender<Result<ResponsePayload, RemotingError>>),
    // Behind a mutex so the pending map stays `Sync` for any `Send` callback.
    Callback(Mutex<ResponseCallback>),
}

/// A request awaiting its response.
pub struct PendingResponse {
    id: u64,
    start: Instant,
    reply: ReturnType,
    completion: Completion,
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("id", &self.id)
            .field("start", &self.start)
            .field("reply", &self.reply)
            .field(
                "async",
                &matches!(self.completion, Completion::Callback(_)),
            )
            .finish()
    }
}

impl PendingResponse {
    /// Pending entry completed through a oneshot channel.
    #[must_use]
    pub fn waiter(
        id: u64,
        reply: ReturnType,
    ) -> (Self, oneshot::Receiver<Result<ResponsePayload, RemotingError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                id,
                start: Instant::now(),
                reply,
                completion: Completion::Waiter(tx),
            },
            rx,
        )
    }

    /// Pending entry completed by running `callback`.
    #[must_use]
    pub fn callback(id: u64, reply: ReturnType, callback: ResponseCallback) -> Self {
        Self {
            id,
            start: Instant::now(),
            reply,
            completion: Completion::Callback(Mutex::new(callback)),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn start(&self) -> Instant {
        self.start
    }

    #[must_use]
    pub const fn reply(&self) -> &ReturnType {
        &self.reply
    }

    /// Delivers the outcome. Consumes the entry, so it happens once.
    pub fn complete(self, result: Result<ResponsePayload, RemotingError>) {
        match self.completion {
            // The waiter may have given up already.
            Completion::Waiter(tx) => {
                let _ = tx.send(result);
            }
            Completion::Callback(callback) => (callback.into_inner())(CallbackResponse {
                id: self.id,
                start: self.start,
                result,
            }),
        }
    }
}

/// In-flight requests of one client, keyed by id.
#[derive(Debug, Default)]
pub struct PendingResponses {
    entries: DashMap<u64, PendingResponse>,
}

impl PendingResponses {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pending: PendingResponse) {
        self.entries.insert(pending.id, pending);
    }

    pub fn remove(&self, id: u64) -> Option<PendingResponse> {
        self.entries.remove(&id).map(|(_, pending)| pending)
    }

    /// Expected response shape for `id`, used before the body is decoded.
    #[must_use]
    pub fn reply_type(&self, id: u64) -> Option<ReturnType> {
        self.entries.get(&id).map(|p| p.reply.clone())
    }

    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Completes `id` if it is still pending.
    ///
    /// Returns `false` when the id is unknown or already timed out; the
    /// result is dropped in that case.
    pub fn complete(&self, id: u64, result: Result<ResponsePayload, RemotingError>) -> bool {
        match self.remove(id) {
            Some(pending) => {
                pending.complete(result);
                true
            }
            None => {
                warn!(id, "response for unknown request dropped");
                false
            }
        }
    }

    /// Fails every pending entry with an error built by `error`.
    pub fn fail_all(&self, error: impl Fn() -> RemotingError) -> usize {
        let ids: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some(pending) = self.remove(id) {
                pending.complete(Err(error()));
                failed += 1;
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use dubbo_proto::Value;

    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn pending_state_is_shareable_across_tasks() {
        assert_send_sync::<PendingResponse>();
        assert_send_sync::<PendingResponses>();
        assert_send_sync::<crate::ExchangeClient>();
    }

    #[test]
    fn ids_start_at_two_and_step_by_two() {
        let seq = SequenceGenerator::new();
        assert_eq!(seq.next_id(), 2);
        assert_eq!(seq.next_id(), 4);
        assert_eq!(seq.next_id(), 6);
    }

    #[test]
    fn ids_unique_under_concurrency() {
        let seq = Arc::new(SequenceGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let seq = Arc::clone(&seq);
                std::thread::spawn(move || (0..1000).map(|_| seq.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 8000);
        assert!(seen.iter().all(|id| id % 2 == 0));
    }

    #[tokio::test]
    async fn waiter_completed_once() {
        let pending = PendingResponses::new();
        let (entry, rx) = PendingResponse::waiter(2, ReturnType::Int);
        pending.insert(entry);
        assert_eq!(pending.reply_type(2), Some(ReturnType::Int));

        assert!(pending.complete(2, Ok(ResponsePayload::value(Value::Int(1)))));
        assert!(!pending.complete(2, Ok(ResponsePayload::default())));

        let got = rx.await.unwrap().unwrap();
        assert_eq!(got.value, Some(Value::Int(1)));
        assert!(pending.is_empty());
    }

    #[test]
    fn callback_receives_outcome() {
        let pending = PendingResponses::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        pending.insert(PendingResponse::callback(
            4,
            ReturnType::Any,
            Box::new(move |rsp| *sink.lock() = Some((rsp.id, rsp.result.is_ok()))),
        ));

        pending.complete(4, Ok(ResponsePayload::default()));
        assert_eq!(*seen.lock(), Some((4, true)));
    }

    #[tokio::test]
    async fn fail_all_drains_map() {
        let pending = PendingResponses::new();
        let (a, rx_a) = PendingResponse::waiter(2, ReturnType::Any);
        let (b, rx_b) = PendingResponse::waiter(4, ReturnType::Any);
        pending.insert(a);
        pending.insert(b);

        let failed = pending.fail_all(|| RemotingError::Closed("127.0.0.1:20880".into()));
        assert_eq!(failed, 2);
        assert!(pending.is_empty());
        assert!(matches!(rx_a.await.unwrap(), Err(RemotingError::Closed(_))));
        assert!(matches!(rx_b.await.unwrap(), Err(RemotingError::Closed(_))));
    }
}
