//! Request/response correlation by job id.
//!
//! Each tracked request gets a fresh, strictly increasing source job id. A
//! response whose target job id matches completes that request exactly once
//! and is not dispatched further. The pending set belongs to one transport
//! link: tearing the link down fails everything still waiting with
//! `ProtocolError::ConnectionLost`.

use crate::core::envelope::JobId;
use crate::error::{ProtocolError, Result};
use crate::protocol::messages::ClientMessage;
use crate::protocol::registry::DecodedMessage;
use crate::utils::metrics::Metrics;
use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time::Sleep;
use tracing::{debug, warn};

/// Client-scoped source of job ids. Never yields the wire's "absent" sentinel.
#[derive(Debug)]
pub struct JobIdSequence {
    next: u64,
}

impl JobIdSequence {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_id(&mut self) -> JobId {
        let id = JobId(self.next);
        self.next = match self.next.checked_add(1) {
            Some(n) if n != u64::MAX => n,
            _ => 1,
        };
        id
    }
}

impl Default for JobIdSequence {
    fn default() -> Self {
        Self::new()
    }
}

struct PendingRequest {
    tx: oneshot::Sender<Result<DecodedMessage>>,
    expected: TypeId,
    expected_name: &'static str,
    issued_at: Instant,
}

/// Pending requests for one link
pub struct Correlator {
    pending: HashMap<JobId, PendingRequest>,
    metrics: Arc<Metrics>,
}

impl Correlator {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            pending: HashMap::new(),
            metrics,
        }
    }

    /// Start waiting for a `T` addressed to `job`
    pub fn track<T: ClientMessage>(&mut self, job: JobId) -> PendingResponse<T> {
        self.prune_abandoned();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            job,
            PendingRequest {
                tx,
                expected: TypeId::of::<T>(),
                expected_name: std::any::type_name::<T>(),
                issued_at: Instant::now(),
            },
        );
        self.metrics.request_issued();
        PendingResponse {
            job,
            rx,
            timeout: None,
            deadline: None,
            _response: PhantomData,
        }
    }

    pub fn is_pending(&self, job: JobId) -> bool {
        self.pending.contains_key(&job)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Complete the request `msg` targets.
    ///
    /// Returns the message back when nothing is waiting for it, so the caller
    /// can dispatch it as an ordinary message.
    pub fn complete(&mut self, msg: DecodedMessage) -> Option<DecodedMessage> {
        let Some(job) = msg.header.target_job_id else {
            return Some(msg);
        };
        let Some(request) = self.pending.remove(&job) else {
            return Some(msg);
        };
        if request.tx.is_closed() {
            debug!(job_id = %job, "Response for an abandoned request");
            return Some(msg);
        }

        let outcome = if msg.type_id() == request.expected {
            Ok(msg)
        } else {
            warn!(
                job_id = %job,
                expected = request.expected_name,
                actual = msg.type_name(),
                "Response type does not match request"
            );
            Err(ProtocolError::UnexpectedResponse {
                expected: request.expected_name,
                actual: msg.type_name(),
            })
        };

        debug!(
            job_id = %job,
            elapsed_ms = request.issued_at.elapsed().as_millis() as u64,
            "Request completed"
        );
        self.metrics.request_completed();
        // The receiver may have been dropped; completion still counts.
        let _ = request.tx.send(outcome);
        None
    }

    /// Forget requests whose caller dropped its `PendingResponse`
    fn prune_abandoned(&mut self) {
        let before = self.pending.len();
        self.pending.retain(|_, request| !request.tx.is_closed());
        let pruned = before - self.pending.len();
        if pruned > 0 {
            debug!(pruned, "Pruned abandoned requests");
        }
    }

    /// Stop tracking `job` without resolving it
    pub fn forget(&mut self, job: JobId) -> bool {
        self.pending.remove(&job).is_some()
    }

    /// Resolve every pending request with `ConnectionLost`
    pub fn fail_all(&mut self) -> usize {
        let count = self.pending.len();
        for (job, request) in self.pending.drain() {
            debug!(job_id = %job, "Failing pending request: connection lost");
            let _ = request.tx.send(Err(ProtocolError::ConnectionLost));
        }
        if count > 0 {
            self.metrics.requests_failed(count as u64);
        }
        count
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.fail_all();
    }
}

/// Awaitable response to a tracked request.
///
/// With a timeout set, awaiting fails with `ProtocolError::Timeout` once it
/// elapses, counted from the first poll.
#[must_use = "a pending response does nothing unless awaited"]
pub struct PendingResponse<T> {
    job: JobId,
    rx: oneshot::Receiver<Result<DecodedMessage>>,
    timeout: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
    _response: PhantomData<fn() -> T>,
}

impl<T: ClientMessage + Clone> PendingResponse<T> {
    pub fn job_id(&self) -> JobId {
        self.job
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Fail with `ProtocolError::Timeout` if no response arrives within `duration`
    pub fn expire_after(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self.deadline = None;
        self
    }

    /// Wait at most `duration` for the response, replacing any earlier timeout
    pub async fn with_timeout(self, duration: Duration) -> Result<T> {
        self.expire_after(duration).await
    }

    /// Non-blocking check; `None` while the request is still pending
    pub fn try_resolve(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(Self::unpack(outcome)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ProtocolError::ConnectionLost)),
        }
    }

    fn unpack(outcome: Result<DecodedMessage>) -> Result<T> {
        let msg = outcome?;
        msg.downcast_ref::<T>()
            .cloned()
            .ok_or(ProtocolError::UnexpectedResponse {
                expected: std::any::type_name::<T>(),
                actual: msg.type_name(),
            })
    }
}

impl<T: ClientMessage + Clone> Future for PendingResponse<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => return Poll::Ready(Self::unpack(outcome)),
            Poll::Ready(Err(_)) => return Poll::Ready(Err(ProtocolError::ConnectionLost)),
            Poll::Pending => {}
        }

        let Some(limit) = this.timeout else {
            return Poll::Pending;
        };
        let deadline = this
            .deadline
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(limit)));
        match deadline.as_mut().poll(cx) {
            Poll::Ready(()) => {
                debug!(job_id = %this.job, timeout_ms = limit.as_millis() as u64, "Request timed out");
                Poll::Ready(Err(ProtocolError::Timeout))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::envelope::{AppId, Envelope, MessageHeader};
    use crate::protocol::messages::{ClientLogonResponse, ClientNewLoginKey, ResultCode};
    use crate::protocol::registry::{ActiveRegistry, MessageRegistry};

    fn response_for(job: Option<JobId>) -> DecodedMessage {
        let mut active = ActiveRegistry::new();
        active
            .add(
                &MessageRegistry::new()
                    .with::<ClientLogonResponse>()
                    .unwrap()
                    .with::<ClientNewLoginKey>()
                    .unwrap(),
            )
            .unwrap();
        let header = MessageHeader::new(ClientLogonResponse::OPCODE, AppId::PLATFORM).with_target_job(job);
        let payload = ClientLogonResponse {
            result: ResultCode::OK,
            heartbeat_seconds: 9,
            public_ip: None,
        }
        .encode()
        .unwrap();
        active.decode(&Envelope::new(header, payload)).unwrap()
    }

    #[test]
    fn job_ids_strictly_increase() {
        let mut seq = JobIdSequence::new();
        let a = seq.next_id();
        let b = seq.next_id();
        let c = seq.next_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn job_ids_skip_the_absent_sentinel() {
        let mut seq = JobIdSequence { next: u64::MAX - 1 };
        assert_eq!(seq.next_id(), JobId(u64::MAX - 1));
        assert_eq!(seq.next_id(), JobId(1));
    }

    #[test]
    fn match_completes_once_and_removes() {
        let mut correlator = Correlator::new(Arc::new(Metrics::new()));
        let mut pending = correlator.track::<ClientLogonResponse>(JobId(5));

        assert!(correlator.complete(response_for(Some(JobId(5)))).is_none());
        assert!(!correlator.is_pending(JobId(5)));

        // A duplicate response falls through as an ordinary message
        assert!(correlator.complete(response_for(Some(JobId(5)))).is_some());

        let resolved = pending.try_resolve().unwrap().unwrap();
        assert_eq!(resolved.heartbeat_seconds, 9);
    }

    #[test]
    fn unmatched_response_falls_through() {
        let mut correlator = Correlator::new(Arc::new(Metrics::new()));
        let _pending = correlator.track::<ClientLogonResponse>(JobId(1));
        assert!(correlator.complete(response_for(Some(JobId(2)))).is_some());
        assert!(correlator.complete(response_for(None)).is_some());
        assert_eq!(correlator.len(), 1);
    }

    #[test]
    fn wrong_type_fails_the_request() {
        let mut correlator = Correlator::new(Arc::new(Metrics::new()));
        let mut pending = correlator.track::<ClientNewLoginKey>(JobId(3));
        assert!(correlator.complete(response_for(Some(JobId(3)))).is_none());
        assert!(matches!(
            pending.try_resolve(),
            Some(Err(ProtocolError::UnexpectedResponse { .. }))
        ));
    }

    #[test]
    fn fail_all_resolves_everything() {
        let metrics = Arc::new(Metrics::new());
        let mut correlator = Correlator::new(metrics.clone());
        let mut a = correlator.track::<ClientLogonResponse>(JobId(1));
        let mut b = correlator.track::<ClientLogonResponse>(JobId(2));

        assert_eq!(correlator.fail_all(), 2);
        assert!(correlator.is_empty());
        assert!(matches!(a.try_resolve(), Some(Err(ProtocolError::ConnectionLost))));
        assert!(matches!(b.try_resolve(), Some(Err(ProtocolError::ConnectionLost))));
        assert_eq!(metrics.snapshot().requests_failed, 2);
    }

    #[test]
    fn abandoned_requests_are_pruned() {
        let mut correlator = Correlator::new(Arc::new(Metrics::new()));
        let abandoned = correlator.track::<ClientLogonResponse>(JobId(1));
        let _kept = correlator.track::<ClientLogonResponse>(JobId(2));
        drop(abandoned);
        assert_eq!(correlator.len(), 2);

        let _next = correlator.track::<ClientLogonResponse>(JobId(3));
        assert!(!correlator.is_pending(JobId(1)));
        assert_eq!(correlator.len(), 2);
    }

    #[test]
    fn response_to_abandoned_request_falls_through() {
        let mut correlator = Correlator::new(Arc::new(Metrics::new()));
        drop(correlator.track::<ClientLogonResponse>(JobId(4)));
        assert!(correlator.complete(response_for(Some(JobId(4)))).is_some());
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn dropping_the_correlator_fails_waiters() {
        let mut correlator = Correlator::new(Arc::new(Metrics::new()));
        let pending = correlator.track::<ClientLogonResponse>(JobId(8));
        drop(correlator);
        assert!(matches!(pending.await, Err(ProtocolError::ConnectionLost)));
    }
}
