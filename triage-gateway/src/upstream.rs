//! One logical call to the completion service, retried across transient
//! failures.
//!
//! Each attempt first takes an admission token, then sends under a wall-clock
//! timeout. Statuses are classified by [`classify_status`] and the wait
//! before the next attempt comes from [`RetryPolicy::next_delay`]. Nothing
//! here panics or escapes as an unhandled fault: the outcome is either an
//! [`UpstreamSuccess`] or a [`CallFailure`] describing the last attempt.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::admission::AdmissionController;
use crate::backoff::{RetryPolicy, StatusClass, classify_status};
use crate::error::GatewayError;
use crate::ratelimit::{RateLimitKind, RateLimitSnapshot};
use crate::transport::{CompletionRequest, CompletionTransport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    Status { status: u16, body: String },
    Transport(TransportError),
}

impl AttemptFailure {
    pub fn status(&self) -> Option<u16> {
        match self {
            AttemptFailure::Status { status, .. } => Some(*status),
            AttemptFailure::Transport(_) => None,
        }
    }

    pub fn detail(&self) -> String {
        match self {
            AttemptFailure::Status { status, body } if body.trim().is_empty() => {
                format!("HTTP {status}")
            }
            AttemptFailure::Status { status, body } => format!("HTTP {status}: {}", body.trim()),
            AttemptFailure::Transport(error) => error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Non-retryable status.
    Terminal,
    /// Attempt ceiling reached.
    Exhausted,
    /// The upstream asked for a wait longer than the policy allows.
    RetryAfterTooLong,
}

#[derive(Debug, Clone)]
pub struct CallFailure {
    pub last: AttemptFailure,
    pub attempts: u32,
    pub snapshot: Option<RateLimitSnapshot>,
    pub stop: StopReason,
}

impl CallFailure {
    pub fn into_error(self) -> GatewayError {
        let detail = self.last.detail();
        match (self.stop, self.last.status()) {
            (StopReason::Terminal, Some(status)) => GatewayError::UpstreamRejected { status, detail },
            (_, Some(429)) => GatewayError::RateLimitExceeded {
                limit: self.limit_hint(),
                attempts: self.attempts,
                detail,
            },
            (_, status) => GatewayError::TransientUpstream {
                status,
                attempts: self.attempts,
                detail,
            },
        }
    }

    fn limit_hint(&self) -> Option<RateLimitKind> {
        self.snapshot.as_ref().and_then(RateLimitSnapshot::exhausted)
    }

    /// Body of the last failed response, if there was one.
    pub fn last_body(&self) -> Option<&str> {
        match &self.last {
            AttemptFailure::Status { body, .. } => Some(body),
            AttemptFailure::Transport(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamSuccess {
    pub body: String,
    pub attempts: u32,
    pub snapshot: Option<RateLimitSnapshot>,
    pub request_id: Option<String>,
    pub model: Option<String>,
    pub processing_ms: Option<u64>,
}

pub struct UpstreamCaller {
    transport: Arc<dyn CompletionTransport>,
    admission: Arc<AdmissionController>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl UpstreamCaller {
    pub fn new(
        transport: Arc<dyn CompletionTransport>,
        admission: Arc<AdmissionController>,
        policy: RetryPolicy,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            admission,
            policy,
            attempt_timeout,
        }
    }

    pub async fn call(&self, request: &CompletionRequest) -> Result<UpstreamSuccess, CallFailure> {
        self.call_counted(request, &AtomicU32::new(0)).await
    }

    /// Same as [`call`](Self::call); `sent` is bumped as each attempt goes
    /// out so an observer still sees the count if this future is dropped.
    pub async fn call_counted(
        &self,
        request: &CompletionRequest,
        sent: &AtomicU32,
    ) -> Result<UpstreamSuccess, CallFailure> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut snapshot: Option<RateLimitSnapshot> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.admission.acquire().await;
            sent.fetch_add(1, Ordering::SeqCst);
            debug!(attempt, model = %request.model, "Sending completion request");

            let sent = tokio::time::timeout(self.attempt_timeout, self.transport.send(request)).await;
            let (failure, headers): (AttemptFailure, Option<HeaderMap>) = match sent {
                Err(_) => (AttemptFailure::Transport(TransportError::Timeout), None),
                Ok(Err(error)) => (AttemptFailure::Transport(error), None),
                Ok(Ok(response)) => {
                    if let Some(reported) = RateLimitSnapshot::from_headers(&response.headers) {
                        snapshot = Some(reported);
                    }
                    match classify_status(response.status) {
                        StatusClass::Success => {
                            return Ok(UpstreamSuccess {
                                request_id: header_string(&response.headers, "x-request-id"),
                                model: header_string(&response.headers, "openai-model"),
                                processing_ms: header_string(&response.headers, "openai-processing-ms")
                                    .and_then(|v| v.parse().ok()),
                                body: response.body,
                                attempts: attempt,
                                snapshot,
                            });
                        }
                        StatusClass::Terminal => {
                            warn!(status = response.status, attempt, "Upstream rejected request");
                            return Err(CallFailure {
                                last: AttemptFailure::Status {
                                    status: response.status,
                                    body: response.body,
                                },
                                attempts: attempt,
                                snapshot,
                                stop: StopReason::Terminal,
                            });
                        }
                        StatusClass::Retryable => (
                            AttemptFailure::Status {
                                status: response.status,
                                body: response.body,
                            },
                            Some(response.headers),
                        ),
                    }
                }
            };

            if attempt >= max_attempts {
                warn!(attempt, error = %failure.detail(), "Upstream attempts exhausted");
                return Err(CallFailure {
                    last: failure,
                    attempts: attempt,
                    snapshot,
                    stop: StopReason::Exhausted,
                });
            }

            let delay = self
                .policy
                .next_delay(attempt, failure.status(), headers.as_ref())
                .resolve(self.policy.jitter_max);
            let Some(delay) = delay else {
                warn!(attempt, "Upstream requested a wait beyond the allowed maximum");
                return Err(CallFailure {
                    last: failure,
                    attempts: attempt,
                    snapshot,
                    stop: StopReason::RetryAfterTooLong,
                });
            };

            warn!(
                attempt,
                status = ?failure.status(),
                delay_ms = %delay.as_millis(),
                error = %failure.detail(),
                "Retryable upstream failure, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parts of a chat-completions body the gateway needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionText {
    pub text: String,
    pub id: Option<String>,
    pub model: Option<String>,
}

#[derive(Deserialize)]
struct ChatCompletionBody {
    id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChatChoiceMessage>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Pulls the assistant text out of a successful response body.
pub fn decode_completion(body: &str) -> Result<CompletionText, GatewayError> {
    let parsed: ChatCompletionBody = serde_json::from_str(body).map_err(|e| {
        GatewayError::malformed(format!("completion body is not valid JSON: {e}"), body)
    })?;

    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message)
        .and_then(|message| message.content)
        .ok_or_else(|| GatewayError::malformed("completion has no message content", body))?;

    Ok(CompletionText {
        text,
        id: parsed.id,
        model: parsed.model,
    })
}
