//! Exchange client: one outstanding request per session, retried in the
//! background, resolved through a completion channel.

use crate::error::{Result, VoiceError};
use crate::exchange::retry::RetryPolicy;
use crate::exchange::transport::ExchangeTransport;
use crate::exchange::types::{
    ExchangePayload, ExchangeRequest, ExchangeResponse, RequestId, RequestMetadata, SessionId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of a logical request, delivered once per uncancelled request.
#[derive(Debug)]
pub struct ExchangeCompletion {
    pub session_id: SessionId,
    pub request_id: RequestId,
    /// Attempts made, including the last.
    pub attempts: u32,
    pub outcome: Result<ExchangeResponse>,
}

/// Handle returned by [`ExchangeClient::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub session_id: SessionId,
    pub request_id: RequestId,
}

struct InFlight {
    request_id: RequestId,
    cancel: CancellationToken,
}

/// Sends payloads to the backend without blocking the caller.
pub struct ExchangeClient {
    transport: Arc<dyn ExchangeTransport>,
    policy: RetryPolicy,
    request_timeout: Duration,
    attempt_timeout: Duration,
    completions: mpsc::Sender<ExchangeCompletion>,
    in_flight: HashMap<SessionId, InFlight>,
}

impl ExchangeClient {
    pub fn new(
        transport: Arc<dyn ExchangeTransport>,
        policy: RetryPolicy,
        request_timeout: Duration,
        completions: mpsc::Sender<ExchangeCompletion>,
    ) -> Self {
        Self {
            transport,
            policy,
            request_timeout,
            attempt_timeout: request_timeout,
            completions,
            in_flight: HashMap::new(),
        }
    }

    /// Bound each attempt separately. A timed-out attempt counts as a
    /// transient failure and is retried while the request lifetime allows.
    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout.min(self.request_timeout);
        self
    }

    pub fn transport(&self) -> &Arc<dyn ExchangeTransport> {
        &self.transport
    }

    /// Request id outstanding for `session_id`, if any.
    pub fn in_flight(&self, session_id: SessionId) -> Option<RequestId> {
        self.in_flight.get(&session_id).map(|f| f.request_id)
    }

    /// Start a request. The attempt loop runs on the tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::RequestInFlight`] if the session already has an
    /// outstanding request.
    pub fn send(
        &mut self,
        session_id: SessionId,
        payload: ExchangePayload,
        metadata: RequestMetadata,
    ) -> Result<PendingRequest> {
        if let Some(existing) = self.in_flight.get(&session_id) {
            return Err(VoiceError::RequestInFlight {
                session_id: session_id.to_string(),
                request_id: existing.request_id.to_string(),
            });
        }

        let request_id = RequestId::new();
        let cancel = CancellationToken::new();
        self.in_flight.insert(
            session_id,
            InFlight {
                request_id,
                cancel: cancel.clone(),
            },
        );

        info!(
            session_id = %session_id,
            request_id = %request_id,
            payload = payload.kind(),
            transport = self.transport.name(),
            "exchange request started"
        );

        let request = ExchangeRequest {
            session_id,
            request_id,
            attempt: 0,
            payload: Arc::new(payload),
            metadata: Arc::new(metadata),
        };
        tokio::spawn(run_request(
            Arc::clone(&self.transport),
            self.policy.clone(),
            self.request_timeout,
            self.attempt_timeout,
            request,
            cancel,
            self.completions.clone(),
        ));

        Ok(PendingRequest {
            session_id,
            request_id,
        })
    }

    /// Claim a completion drained from the channel.
    ///
    /// Returns false for completions of requests that were cancelled or
    /// superseded; callers drop those. Returns true and frees the session's
    /// slot otherwise.
    pub fn accept(&mut self, completion: &ExchangeCompletion) -> bool {
        match self.in_flight.get(&completion.session_id) {
            Some(f) if f.request_id == completion.request_id => {
                self.in_flight.remove(&completion.session_id);
                true
            }
            _ => {
                debug!(request_id = %completion.request_id, "dropping stale completion");
                false
            }
        }
    }

    /// Abort the session's outstanding request and any scheduled retry.
    pub fn cancel(&mut self, session_id: SessionId) -> Option<RequestId> {
        let f = self.in_flight.remove(&session_id)?;
        f.cancel.cancel();
        info!(session_id = %session_id, request_id = %f.request_id, "exchange request cancelled");
        Some(f.request_id)
    }

    /// Cancel every outstanding request.
    pub fn cancel_all(&mut self) {
        for (_, f) in self.in_flight.drain() {
            f.cancel.cancel();
        }
    }
}

impl Drop for ExchangeClient {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

async fn run_request(
    transport: Arc<dyn ExchangeTransport>,
    policy: RetryPolicy,
    request_timeout: Duration,
    attempt_timeout: Duration,
    request: ExchangeRequest,
    cancel: CancellationToken,
    completions: mpsc::Sender<ExchangeCompletion>,
) {
    let session_id = request.session_id;
    let request_id = request.request_id;
    let attempts = Arc::new(AtomicU32::new(0));

    let attempt_loop = run_attempts(
        transport,
        &policy,
        attempt_timeout,
        request,
        Arc::clone(&attempts),
    );
    let outcome = tokio::select! {
        () = cancel.cancelled() => {
            debug!(request_id = %request_id, "request task stopped by cancel");
            return;
        }
        res = tokio::time::timeout(request_timeout, attempt_loop) => match res {
            Ok(outcome) => outcome,
            Err(_) => Err(VoiceError::Timeout {
                what: format!("exchange request {request_id}"),
                elapsed: request_timeout,
            }),
        },
    };

    if cancel.is_cancelled() {
        return;
    }
    let attempts = attempts.load(Ordering::Relaxed);
    match &outcome {
        Ok(_) => info!(request_id = %request_id, attempts, "exchange request completed"),
        Err(e) => warn!(request_id = %request_id, attempts, error = %e, "exchange request failed"),
    }
    let completion = ExchangeCompletion {
        session_id,
        request_id,
        attempts,
        outcome,
    };
    if completions.send(completion).await.is_err() {
        debug!(request_id = %request_id, "completion receiver closed");
    }
}

async fn run_attempts(
    transport: Arc<dyn ExchangeTransport>,
    policy: &RetryPolicy,
    attempt_timeout: Duration,
    mut request: ExchangeRequest,
    attempts: Arc<AtomicU32>,
) -> Result<ExchangeResponse> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        attempts.store(attempt, Ordering::Relaxed);
        request.attempt = attempt;

        let sent = tokio::time::timeout(attempt_timeout, transport.send(&request))
            .await
            .unwrap_or_else(|_| {
                Err(VoiceError::TransientExchange {
                    status: None,
                    message: format!(
                        "attempt {attempt} timed out after {}ms",
                        attempt_timeout.as_millis()
                    ),
                })
            });
        match sent {
            Ok(response) => return Ok(response),
            Err(e) if e.is_retryable() && policy.allows_retry_after(attempt) => {
                let delay = policy.delay_for_retry(attempt);
                warn!(
                    request_id = %request.request_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient exchange failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::exchange::mock::{ScriptStep, ScriptedTransport};

    fn metadata() -> RequestMetadata {
        RequestMetadata {
            model_id: "m".into(),
            system_prompt: "p".into(),
            sample_rate: 16_000,
            include_audio: true,
            include_text: true,
        }
    }

    fn client(
        transport: ScriptedTransport,
        timeout: Duration,
    ) -> (ExchangeClient, mpsc::Receiver<ExchangeCompletion>) {
        let (tx, rx) = mpsc::channel(8);
        let client = ExchangeClient::new(
            Arc::new(transport),
            RetryPolicy::default().without_jitter(),
            timeout,
            tx,
        );
        (client, rx)
    }

    fn text() -> ExchangePayload {
        ExchangePayload::Text("table for two".into())
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_with_backoff_then_succeed() {
        let transport = ScriptedTransport::new([
            ScriptStep::status(503),
            ScriptStep::status(500),
            ScriptStep::text("welcome"),
        ]);
        let (mut client, mut rx) = client(transport.clone(), Duration::from_secs(10));
        let session = SessionId::new();

        let started = tokio::time::Instant::now();
        let pending = client.send(session, text(), metadata()).unwrap();
        let completion = rx.recv().await.expect("completion");

        // 100ms before attempt 2, 200ms before attempt 3.
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(310),
            "elapsed {elapsed:?}"
        );
        assert_eq!(completion.request_id, pending.request_id);
        assert_eq!(completion.attempts, 3);
        assert_eq!(
            completion.outcome.unwrap().response_text.as_deref(),
            Some("welcome")
        );

        let seen = transport.requests();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|r| r.request_id == pending.request_id));
        assert_eq!(
            seen.iter().map(|r| r.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err(), "exactly one completion");
        assert_eq!(transport.requests().len(), 3, "no further retries");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_the_last_error() {
        let transport = ScriptedTransport::new([
            ScriptStep::status(503),
            ScriptStep::status(503),
            ScriptStep::status(503),
            ScriptStep::text("never"),
        ]);
        let (mut client, mut rx) = client(transport.clone(), Duration::from_secs(10));
        client.send(SessionId::new(), text(), metadata()).unwrap();
        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.attempts, 3);
        assert!(completion.outcome.unwrap_err().is_retryable());
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_rejection_is_not_retried() {
        let transport = ScriptedTransport::new([ScriptStep::status(401), ScriptStep::text("no")]);
        let (mut client, mut rx) = client(transport.clone(), Duration::from_secs(10));
        client.send(SessionId::new(), text(), metadata()).unwrap();
        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.attempts, 1);
        assert!(matches!(
            completion.outcome,
            Err(VoiceError::NonRetryableExchange {
                status: Some(401),
                ..
            })
        ));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_send_is_rejected_until_completion_accepted() {
        let transport = ScriptedTransport::new([
            ScriptStep::Reply {
                delay: Duration::from_millis(500),
                text: Some("first".into()),
                audio: None,
            },
            ScriptStep::text("second"),
        ]);
        let (mut client, mut rx) = client(transport, Duration::from_secs(10));
        let session = SessionId::new();

        let first = client.send(session, text(), metadata()).unwrap();
        let err = client.send(session, text(), metadata()).unwrap_err();
        assert_eq!(err.kind(), crate::error::error_kinds::REQUEST_IN_FLIGHT);

        // Other sessions are independent.
        assert!(client.send(SessionId::new(), text(), metadata()).is_ok());

        let completion = loop {
            let c = rx.recv().await.unwrap();
            if c.session_id == session {
                break c;
            }
        };
        assert_eq!(completion.request_id, first.request_id);
        assert!(client.accept(&completion));
        assert!(client.in_flight(session).is_none());
        assert!(client.send(session, text(), metadata()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_request_delivers_nothing() {
        let transport = ScriptedTransport::new([ScriptStep::Hang]);
        let (mut client, mut rx) = client(transport, Duration::from_secs(30));
        let session = SessionId::new();
        let pending = client.send(session, text(), metadata()).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.cancel(session), Some(pending.request_id));
        assert!(client.in_flight(session).is_none());

        let waited = tokio::time::timeout(Duration::from_secs(60), rx.recv()).await;
        assert!(waited.is_err(), "no completion after cancel");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_retries() {
        let transport = ScriptedTransport::new([ScriptStep::status(503), ScriptStep::text("late")]);
        let (mut client, mut rx) = client(transport.clone(), Duration::from_secs(30));
        let session = SessionId::new();
        client.send(session, text(), metadata()).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        client.cancel(session);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.requests().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn lifetime_timeout_covers_all_attempts() {
        let transport = ScriptedTransport::new([ScriptStep::Hang]);
        let (mut client, mut rx) = client(transport, Duration::from_secs(3));
        let started = tokio::time::Instant::now();
        client.send(SessionId::new(), text(), metadata()).unwrap();
        let completion = rx.recv().await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3_100));
        assert!(matches!(completion.outcome, Err(VoiceError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_attempt_times_out_and_is_retried() {
        let transport = ScriptedTransport::new([
            ScriptStep::delayed(Duration::from_secs(3), "slow"),
            ScriptStep::text("fast"),
        ]);
        let (client, mut rx) = client(transport.clone(), Duration::from_secs(10));
        let mut client = client.with_attempt_timeout(Duration::from_millis(500));
        let started = tokio::time::Instant::now();
        client.send(SessionId::new(), text(), metadata()).unwrap();

        let completion = rx.recv().await.unwrap();
        // 500ms attempt timeout, then 100ms backoff.
        assert!(started.elapsed() < Duration::from_millis(700));
        assert_eq!(completion.attempts, 2);
        assert_eq!(
            completion.outcome.unwrap().response_text.as_deref(),
            Some("fast")
        );
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_completion_is_not_accepted() {
        let transport = ScriptedTransport::new([ScriptStep::text("one")]);
        let (mut client, mut rx) = client(transport, Duration::from_secs(10));
        let session = SessionId::new();
        client.send(session, text(), metadata()).unwrap();
        let completion = rx.recv().await.unwrap();

        // Cancelled after the result was already queued.
        client.cancel(session);
        assert!(!client.accept(&completion));
    }
}
