//! Clarification coordinator
//!
//! Single-slot rendezvous between a tool asking the user a question and
//! the front end that collects the answer. At most one request is pending;
//! it settles exactly once, by whichever comes first of an answer, its
//! timeout, or an explicit cancel:
//!
//! ```text
//! Idle -> Pending -> { Resolved | TimedOut | Cancelled } -> Idle
//! ```
//!
//! The slot is guarded by a mutex. The timer is a spawned task that is
//! aborted when the request settles another way, and it re-checks the
//! request id before acting, so a stale timer can never touch a newer
//! request.

use crate::error::ClarificationError;
use crate::events::{ClarificationOutcome, EngineEvent, EventBus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type Answer = Result<String, ClarificationError>;

/// Front-end hook consumed by tools through their execution context
#[async_trait]
pub trait ClarificationHandler: Send + Sync {
    async fn request_clarification(&self, request: ClarificationRequest) -> Answer;
}

/// A question a tool asks of the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClarificationRequest {
    pub id: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_answer: Option<String>,
    /// Milliseconds to wait; zero or negative waits indefinitely
    pub timeout: i64,
}

impl ClarificationRequest {
    pub fn new(question: &str, timeout_ms: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            question: question.to_string(),
            context: None,
            default_answer: None,
            timeout: timeout_ms,
        }
    }

    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    pub fn with_default_answer(mut self, default_answer: Option<String>) -> Self {
        self.default_answer = default_answer;
        self
    }

    fn deadline(&self) -> Option<Duration> {
        u64::try_from(self.timeout)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

struct Pending {
    request: ClarificationRequest,
    responder: oneshot::Sender<Answer>,
    timer: Option<JoinHandle<()>>,
}

impl Pending {
    /// Settle the request; the receiver may already be gone
    fn settle(self, answer: Answer) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        let _ = self.responder.send(answer);
    }
}

/// Owner of the single pending clarification slot
#[derive(Clone, Default)]
pub struct ClarificationCoordinator {
    slot: Arc<Mutex<Option<Pending>>>,
    events: Option<EventBus>,
}

impl std::fmt::Debug for ClarificationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClarificationCoordinator")
            .field("pending", &self.pending_request().map(|r| r.id))
            .finish()
    }
}

impl ClarificationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coordinator that announces requests and settlements on `events`
    pub fn with_events(events: EventBus) -> Self {
        Self {
            slot: Arc::default(),
            events: Some(events),
        }
    }

    /// Take the slot for `request`, or fail fast with `AlreadyPending`
    ///
    /// Registration happens before this returns; the returned future only
    /// waits. Must be called inside a tokio runtime when the request has a
    /// timeout.
    pub fn submit(&self, request: ClarificationRequest) -> Result<PendingAnswer, ClarificationError> {
        let mut slot = self.lock();
        if let Some(current) = slot.as_ref() {
            warn!(
                "Rejecting clarification '{}': '{}' is still pending",
                request.id, current.request.id
            );
            return Err(ClarificationError::AlreadyPending);
        }

        let (responder, receiver) = oneshot::channel();
        let timer = request.deadline().map(|deadline| {
            let coordinator = self.clone();
            let id = request.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                coordinator.expire(&id);
            })
        });

        let id = request.id.clone();
        *slot = Some(Pending {
            request: request.clone(),
            responder,
            timer,
        });
        drop(slot);

        info!("Clarification '{}' pending: {}", id, request.question);
        self.emit(EngineEvent::ClarificationRequested { request });

        Ok(PendingAnswer {
            id,
            receiver,
            coordinator: self.clone(),
        })
    }

    /// Submit and wait for the outcome
    pub async fn request_input(&self, request: ClarificationRequest) -> Answer {
        self.submit(request)?.await
    }

    /// Resolve the pending request with the trimmed answer
    ///
    /// Returns `false` when nothing is pending, which includes an answer
    /// arriving after the request timed out.
    pub fn deliver_answer(&self, text: &str) -> bool {
        let Some(pending) = self.lock().take() else {
            debug!("Answer delivered with no clarification pending");
            return false;
        };

        let id = pending.request.id.clone();
        pending.settle(Ok(text.trim().to_string()));
        debug!("Clarification '{}' answered", id);
        self.settled(id, ClarificationOutcome::Answered);
        true
    }

    /// Fail the pending request with `Cancelled(reason)`
    ///
    /// Returns `false` when nothing is pending.
    pub fn cancel(&self, reason: &str) -> bool {
        let Some(pending) = self.lock().take() else {
            return false;
        };

        let id = pending.request.id.clone();
        pending.settle(Err(ClarificationError::Cancelled(reason.to_string())));
        info!("Clarification '{}' cancelled: {}", id, reason);
        self.settled(id, ClarificationOutcome::Cancelled);
        true
    }

    pub fn is_pending(&self) -> bool {
        self.lock().is_some()
    }

    pub fn pending_request(&self) -> Option<ClarificationRequest> {
        self.lock().as_ref().map(|p| p.request.clone())
    }

    fn expire(&self, id: &str) {
        let pending = {
            let mut slot = self.lock();
            match slot.as_ref() {
                Some(p) if p.request.id == id => slot.take(),
                _ => None,
            }
        };

        if let Some(pending) = pending {
            let timeout = pending.request.timeout;
            // The timer task is the caller; dropping its handle is enough.
            let Pending { responder, .. } = pending;
            let _ = responder.send(Err(ClarificationError::Timeout(timeout)));
            info!("Clarification '{}' timed out after {}ms", id, timeout);
            self.settled(id.to_string(), ClarificationOutcome::TimedOut);
        }
    }

    fn release(&self, id: &str) {
        let pending = {
            let mut slot = self.lock();
            match slot.as_ref() {
                Some(p) if p.request.id == id => slot.take(),
                _ => None,
            }
        };

        if let Some(pending) = pending {
            pending.settle(Err(ClarificationError::Cancelled(
                "request abandoned".to_string(),
            )));
            debug!("Clarification '{}' abandoned by its requester", id);
            self.settled(id.to_string(), ClarificationOutcome::Abandoned);
        }
    }

    fn settled(&self, id: String, outcome: ClarificationOutcome) {
        self.emit(EngineEvent::ClarificationSettled { id, outcome });
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Pending>> {
        // Every critical section is a take/insert, so a poisoned slot is
        // still consistent.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ClarificationHandler for ClarificationCoordinator {
    async fn request_clarification(&self, request: ClarificationRequest) -> Answer {
        self.request_input(request).await
    }
}

/// Outcome of a submitted clarification
///
/// Dropping it before it settles frees the slot.
pub struct PendingAnswer {
    id: String,
    receiver: oneshot::Receiver<Answer>,
    coordinator: ClarificationCoordinator,
}

impl PendingAnswer {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingAnswer {
    type Output = Answer;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(ClarificationError::Cancelled(
                    "clarification coordinator dropped".to_string(),
                ))
            })
        })
    }
}

impl Drop for PendingAnswer {
    fn drop(&mut self) {
        self.coordinator.release(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn request(timeout_ms: i64) -> ClarificationRequest {
        ClarificationRequest::new("Which color?", timeout_ms)
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_before_timeout_is_trimmed() {
        let coordinator = ClarificationCoordinator::new();
        let pending = coordinator.submit(request(5000)).unwrap();

        let answerer = coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(answerer.deliver_answer("blue "));
        });

        assert_eq!(pending.await, Ok("blue".to_string()));
        assert!(!coordinator.is_pending());

        // The aborted timer must never fire afterwards.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!coordinator.is_pending());
        assert!(!coordinator.deliver_answer("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_at_deadline_not_earlier() {
        let coordinator = ClarificationCoordinator::new();
        let start = Instant::now();
        let pending = coordinator.submit(request(50)).unwrap();

        tokio::time::sleep(Duration::from_millis(49)).await;
        assert!(coordinator.is_pending());

        assert_eq!(pending.await, Err(ClarificationError::Timeout(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(!coordinator.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_answer_after_timeout_is_rejected() {
        let coordinator = ClarificationCoordinator::new();
        let result = coordinator.request_input(request(20)).await;

        assert_eq!(result, Err(ClarificationError::Timeout(20)));
        assert!(!coordinator.deliver_answer("too late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_request_fails_fast() {
        let coordinator = ClarificationCoordinator::new();
        let first = coordinator.submit(request(1000)).unwrap();
        let first_id = first.id().to_string();

        let second = coordinator.submit(request(1000));
        assert!(matches!(second, Err(ClarificationError::AlreadyPending)));

        // The first request is untouched.
        assert_eq!(coordinator.pending_request().unwrap().id, first_id);
        assert!(coordinator.deliver_answer("red"));
        assert_eq!(first.await, Ok("red".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_fails_pending_with_reason() {
        let coordinator = ClarificationCoordinator::new();
        let pending = coordinator.submit(request(60_000)).unwrap();

        assert!(coordinator.cancel("turn aborted"));
        assert_eq!(
            pending.await,
            Err(ClarificationError::Cancelled("turn aborted".to_string()))
        );
        assert!(!coordinator.is_pending());
        assert!(!coordinator.cancel("again"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_positive_timeout_waits_indefinitely() {
        for timeout in [0, -1] {
            let coordinator = ClarificationCoordinator::new();
            let pending = coordinator.submit(request(timeout)).unwrap();

            tokio::time::sleep(Duration::from_secs(3600)).await;
            assert!(coordinator.is_pending());

            coordinator.deliver_answer("eventually");
            assert_eq!(pending.await, Ok("eventually".to_string()));
        }
    }

    #[test]
    fn test_deliver_when_idle_reports_nothing_pending() {
        let coordinator = ClarificationCoordinator::new();
        assert!(!coordinator.deliver_answer("hello"));
        assert!(coordinator.pending_request().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_pending_answer_frees_slot() {
        let coordinator = ClarificationCoordinator::new();
        let pending = coordinator.submit(request(1000)).unwrap();
        drop(pending);

        assert!(!coordinator.is_pending());
        assert!(coordinator.submit(request(1000)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_touch_newer_request() {
        let coordinator = ClarificationCoordinator::new();
        let first = coordinator.submit(request(30)).unwrap();
        coordinator.deliver_answer("one");
        assert_eq!(first.await, Ok("one".to_string()));

        let second = coordinator.submit(request(0)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(coordinator.is_pending());

        coordinator.deliver_answer("two");
        assert_eq!(second.await, Ok("two".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_announce_lifecycle() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let coordinator = ClarificationCoordinator::with_events(bus);

        let pending = coordinator.submit(request(1000)).unwrap();
        let id = pending.id().to_string();
        coordinator.deliver_answer("yes");
        pending.await.unwrap();

        match rx.recv().await.unwrap() {
            EngineEvent::ClarificationRequested { request } => assert_eq!(request.id, id),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            EngineEvent::ClarificationSettled { id: settled, outcome } => {
                assert_eq!(settled, id);
                assert_eq!(outcome, ClarificationOutcome::Answered);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_admit_exactly_one() {
        let coordinator = ClarificationCoordinator::new();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let c = coordinator.clone();
                tokio::spawn(async move { c.submit(ClarificationRequest::new(&format!("q{i}"), 0)) })
            })
            .collect();

        let mut admitted = Vec::new();
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(pending) => admitted.push(pending),
                Err(ClarificationError::AlreadyPending) => rejected += 1,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        assert_eq!(admitted.len(), 1);
        assert_eq!(rejected, 15);
        assert_eq!(
            coordinator.pending_request().unwrap().id,
            admitted[0].id()
        );
    }

    #[test]
    fn test_request_serializes_camel_case() {
        let req = request(50).with_default_answer(Some("yes".to_string()));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["defaultAnswer"], "yes");
        assert_eq!(json["timeout"], 50);
        assert!(json.get("context").is_none());
    }
}
