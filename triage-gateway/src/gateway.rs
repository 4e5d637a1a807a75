//! The single entry point callers use to evaluate a referral.
//!
//! A call runs strictly in sequence: sanitize, render the task template, call
//! upstream with retries, decode the completion, then extract and validate
//! the payload. Failures come back as an [`EvaluationFailure`] value carrying
//! whatever diagnostics were gathered; nothing is raised past this boundary.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::config::GatewayConfig;
use crate::error::{ErrorKind, GatewayError};
use crate::extract::parse_evaluation;
use crate::models::{EvaluationResult, EvaluationTask, Referral};
use crate::ratelimit::RateLimitSnapshot;
use crate::sanitize::PayloadSanitizer;
use crate::templates::template_for;
use crate::transport::{CompletionRequest, CompletionTransport, HttpTransport};
use crate::upstream::{UpstreamCaller, decode_completion};

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationRequest {
    pub task: EvaluationTask,
    pub referral: Referral,
    /// Return the raw upstream text alongside the result.
    #[serde(default)]
    pub debug: bool,
}

impl EvaluationRequest {
    pub fn new(task: EvaluationTask, referral: Referral) -> Self {
        Self {
            task,
            referral,
            debug: false,
        }
    }

    pub fn with_debug(mut self) -> Self {
        self.debug = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_ms: Option<u64>,
    pub elapsed_ms: u64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSnapshot>,
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub task: EvaluationTask,
    pub result: EvaluationResult,
    pub model: String,
    pub diagnostics: Diagnostics,
    /// Only set when the request asked for debug output.
    pub raw_text: Option<String>,
}

#[derive(Debug)]
pub struct EvaluationFailure {
    pub error: GatewayError,
    pub diagnostics: Diagnostics,
    pub raw_text: Option<String>,
}

impl EvaluationFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// What one pass through the pipeline produced, before debug filtering.
struct Outcome {
    result: Result<(EvaluationResult, String), GatewayError>,
    diagnostics: Diagnostics,
    raw_text: Option<String>,
}

pub struct EvaluationGateway {
    config: GatewayConfig,
    sanitizer: PayloadSanitizer,
    admission: Arc<AdmissionController>,
    transport: Option<Arc<dyn CompletionTransport>>,
}

impl EvaluationGateway {
    /// Gateway over an explicit transport. Always enabled.
    pub fn new(config: GatewayConfig, transport: Arc<dyn CompletionTransport>) -> Self {
        Self::assemble(config, Some(transport))
    }

    /// Gateway over HTTP when a credential is configured, disabled otherwise.
    pub fn from_config(config: GatewayConfig) -> Result<Self, GatewayError> {
        let transport: Option<Arc<dyn CompletionTransport>> = match &config.api_key {
            Some(key) => {
                let http = HttpTransport::new(&config.upstream_url, key, config.attempt_timeout)
                    .map_err(|e| {
                        GatewayError::Configuration(format!("failed to build HTTP client: {e}"))
                    })?;
                Some(Arc::new(http))
            }
            None => None,
        };
        Ok(Self::assemble(config, transport))
    }

    fn assemble(config: GatewayConfig, transport: Option<Arc<dyn CompletionTransport>>) -> Self {
        let admission = Arc::new(AdmissionController::with_system_clock(
            config.bucket_capacity,
            config.bucket_refill_per_sec,
            config.retry.jitter_max,
        ));
        Self {
            sanitizer: PayloadSanitizer::new(config.max_document_chars),
            admission,
            transport,
            config,
        }
    }

    /// Share an admission controller with other gateways in the process.
    pub fn with_admission(mut self, admission: Arc<AdmissionController>) -> Self {
        self.admission = admission;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }

    pub fn admission_available(&self) -> f64 {
        self.admission.available()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub async fn evaluate(&self, request: EvaluationRequest) -> Result<Evaluation, EvaluationFailure> {
        self.evaluate_counted(request, &AtomicU32::new(0)).await
    }

    async fn evaluate_counted(
        &self,
        request: EvaluationRequest,
        sent: &AtomicU32,
    ) -> Result<Evaluation, EvaluationFailure> {
        let started = Instant::now();
        let task = request.task;
        let debug_output = request.debug;

        let Outcome {
            result,
            mut diagnostics,
            raw_text,
        } = self.run(&request, sent).await;
        diagnostics.elapsed_ms = elapsed_ms(started.elapsed());
        let raw_text = raw_text.filter(|_| debug_output);

        match result {
            Ok((result, model)) => {
                info!(
                    task = %task,
                    model = %model,
                    request_id = diagnostics.request_id.as_deref().unwrap_or("-"),
                    attempts = diagnostics.attempts,
                    elapsed_ms = diagnostics.elapsed_ms,
                    "Evaluation completed"
                );
                Ok(Evaluation {
                    task,
                    result,
                    model,
                    diagnostics,
                    raw_text,
                })
            }
            Err(error) => {
                warn!(
                    task = %task,
                    model = %self.config.model,
                    request_id = diagnostics.request_id.as_deref().unwrap_or("-"),
                    attempts = diagnostics.attempts,
                    elapsed_ms = diagnostics.elapsed_ms,
                    error_kind = ?error.kind(),
                    error = %error,
                    "Evaluation failed"
                );
                Err(EvaluationFailure {
                    error,
                    diagnostics,
                    raw_text,
                })
            }
        }
    }

    /// Like [`evaluate`](Self::evaluate), but stops as soon as `cancel` fires.
    ///
    /// Dropping the in-flight evaluation aborts the outbound request and any
    /// backoff or admission wait. An admission wait that is abandoned has not
    /// taken a token.
    pub async fn evaluate_cancellable(
        &self,
        request: EvaluationRequest,
        cancel: &CancellationToken,
    ) -> Result<Evaluation, EvaluationFailure> {
        let started = Instant::now();
        let task = request.task;
        let sent = AtomicU32::new(0);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let elapsed = elapsed_ms(started.elapsed());
                let attempts = sent.load(Ordering::SeqCst);
                debug!(task = %task, attempts, elapsed_ms = elapsed, "Evaluation cancelled by caller");
                Err(EvaluationFailure {
                    error: GatewayError::Cancelled,
                    diagnostics: Diagnostics {
                        elapsed_ms: elapsed,
                        attempts,
                        ..Diagnostics::default()
                    },
                    raw_text: None,
                })
            }
            outcome = self.evaluate_counted(request, &sent) => outcome,
        }
    }

    async fn run(&self, request: &EvaluationRequest, sent: &AtomicU32) -> Outcome {
        let mut diagnostics = Diagnostics::default();

        let Some(transport) = &self.transport else {
            return Outcome {
                result: Err(GatewayError::Configuration(
                    "OPENROUTER_API_KEY is not set; the evaluation gateway is disabled".to_string(),
                )),
                diagnostics,
                raw_text: None,
            };
        };

        let referral = self.sanitizer.sanitize(&request.referral);
        let messages = match template_for(request.task).render(&referral) {
            Ok(messages) => messages,
            Err(e) => {
                return Outcome {
                    result: Err(GatewayError::Configuration(format!(
                        "failed to render referral: {e}"
                    ))),
                    diagnostics,
                    raw_text: None,
                };
            }
        };
        let completion_request = CompletionRequest {
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            messages,
        };

        let caller = UpstreamCaller::new(
            Arc::clone(transport),
            Arc::clone(&self.admission),
            self.config.retry.clone(),
            self.config.attempt_timeout,
        );

        let success = match caller.call_counted(&completion_request, sent).await {
            Ok(success) => success,
            Err(failure) => {
                diagnostics.attempts = failure.attempts;
                diagnostics.rate_limit = failure.snapshot.clone();
                let raw_text = failure.last_body().map(str::to_string);
                return Outcome {
                    result: Err(failure.into_error()),
                    diagnostics,
                    raw_text,
                };
            }
        };

        diagnostics.attempts = success.attempts;
        diagnostics.rate_limit = success.snapshot;
        diagnostics.request_id = success.request_id;
        diagnostics.model = success.model;
        diagnostics.processing_ms = success.processing_ms;

        let completion = match decode_completion(&success.body) {
            Ok(completion) => completion,
            Err(error) => {
                return Outcome {
                    result: Err(error),
                    diagnostics,
                    raw_text: Some(success.body),
                };
            }
        };

        if diagnostics.request_id.is_none() {
            diagnostics.request_id = completion.id;
        }
        if diagnostics.model.is_none() {
            diagnostics.model = completion.model;
        }
        let model = diagnostics
            .model
            .clone()
            .unwrap_or_else(|| self.config.model.clone());

        let result = parse_evaluation(request.task, &completion.text).map(|result| (result, model));
        Outcome {
            result,
            diagnostics,
            raw_text: Some(completion.text),
        }
    }
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RetryPolicy;
    use crate::clock::ManualClock;
    use crate::models::{Patient, ReferralDocument, RiskBand};
    use crate::transport::{ScriptedTransport, UpstreamResponse};
    use chrono::{TimeZone, Utc};

    const AUTH_REPLY: &str = r#"Sure! {"band":"high","reason":"payer requires prior auth","checklist":["signed order","notes"]}"#;

    fn referral() -> Referral {
        Referral {
            id: "R-2041".to_string(),
            received_at: Utc.with_ymd_and_hms(2024, 6, 3, 14, 0, 0).unwrap(),
            patient: Patient {
                name: "Dana Whitfield".to_string(),
                date_of_birth: None,
                sex: None,
                phone: Some("555-0102".to_string()),
                preferred_language: None,
            },
            specialty: "orthopedics".to_string(),
            diagnosis_codes: vec!["M17.11".to_string()],
            procedure_codes: vec!["27447".to_string()],
            intake_source: Some("fax".to_string()),
            distance_miles: Some(12.5),
            tele_eligible: false,
            insurance: None,
            documents: vec![],
        }
    }

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::with_api_key("sk-test");
        config.retry = RetryPolicy {
            jitter_max: Duration::ZERO,
            ..RetryPolicy::default()
        };
        config
    }

    fn gateway(transport: Arc<ScriptedTransport>) -> EvaluationGateway {
        EvaluationGateway::new(config(), transport)
    }

    #[tokio::test(start_paused = true)]
    async fn auth_evaluation_succeeds_end_to_end() {
        let transport = Arc::new(ScriptedTransport::new().push_response(
            UpstreamResponse::completion(AUTH_REPLY)
                .with_header("x-request-id", "req-42")
                .with_header("openai-processing-ms", "812"),
        ));
        let gateway = gateway(transport.clone());

        let evaluation = gateway
            .evaluate(EvaluationRequest::new(EvaluationTask::Auth, referral()))
            .await
            .unwrap();

        match &evaluation.result {
            EvaluationResult::Auth(auth) => {
                assert_eq!(auth.band, RiskBand::High);
                assert_eq!(auth.checklist.len(), 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(evaluation.task, EvaluationTask::Auth);
        assert_eq!(evaluation.model, "scripted-model");
        assert_eq!(evaluation.diagnostics.request_id.as_deref(), Some("req-42"));
        assert_eq!(evaluation.diagnostics.processing_ms, Some(812));
        assert_eq!(evaluation.diagnostics.attempts, 1);
        assert!(evaluation.raw_text.is_none());

        let sent = transport.requests();
        assert_eq!(sent[0].model, "openai/gpt-4o-mini");
        assert!(sent[0].messages[1].content.contains("R-2041"));
    }

    #[tokio::test]
    async fn missing_credential_fails_without_calling_upstream() {
        let gateway = EvaluationGateway::from_config(GatewayConfig::default()).unwrap();
        assert!(!gateway.is_enabled());

        let failure = gateway
            .evaluate(EvaluationRequest::new(EvaluationTask::Completeness, referral()))
            .await
            .unwrap_err();

        assert_eq!(failure.kind(), ErrorKind::ConfigurationError);
        assert_eq!(failure.diagnostics.attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn referral_is_sanitized_before_it_leaves() {
        let transport = Arc::new(ScriptedTransport::new().push_completion(AUTH_REPLY));
        let gateway = gateway(transport.clone());
        let mut referral = referral();
        referral.documents = (0..5)
            .map(|i| ReferralDocument {
                id: format!("doc-{i}"),
                name: format!("page {i}"),
                text: if i == 0 { "y".repeat(10_000) } else { "other".to_string() },
                ocr_confidence: 0.9,
            })
            .collect();

        gateway
            .evaluate(EvaluationRequest::new(EvaluationTask::Auth, referral.clone()))
            .await
            .unwrap();

        let prompt = &transport.requests()[0].messages[1].content;
        assert!(prompt.contains("doc-0"));
        assert!(!prompt.contains("doc-1"));
        assert!(prompt.contains(&"y".repeat(3_000)));
        assert!(!prompt.contains(&"y".repeat(3_001)));
        // The caller's copy is untouched.
        assert_eq!(referral.documents.len(), 5);
        assert_eq!(referral.documents[0].text.len(), 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn schema_violation_carries_raw_text_only_in_debug_mode() {
        let bad = r#"{"band":"urgent","reason":"r","checklist":["x"]}"#;
        let transport = Arc::new(
            ScriptedTransport::new()
                .push_completion(bad)
                .push_completion(bad),
        );
        let gateway = gateway(transport);

        let quiet = gateway
            .evaluate(EvaluationRequest::new(EvaluationTask::Auth, referral()))
            .await
            .unwrap_err();
        assert_eq!(quiet.kind(), ErrorKind::SchemaViolation);
        assert!(quiet.raw_text.is_none());

        let verbose = gateway
            .evaluate(EvaluationRequest::new(EvaluationTask::Auth, referral()).with_debug())
            .await
            .unwrap_err();
        assert_eq!(verbose.raw_text.as_deref(), Some(bad));
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_success_body_is_malformed() {
        let transport = Arc::new(ScriptedTransport::new().push_status(200, "<html>maintenance</html>"));
        let gateway = gateway(transport);

        let failure = gateway
            .evaluate(EvaluationRequest::new(EvaluationTask::Bundle, referral()).with_debug())
            .await
            .unwrap_err();

        assert_eq!(failure.kind(), ErrorKind::MalformedResponse);
        assert_eq!(failure.raw_text.as_deref(), Some("<html>maintenance</html>"));
        assert_eq!(failure.diagnostics.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_rate_limit_diagnostics() {
        let limited = || {
            UpstreamResponse::new(429, "{\"error\":\"rate limited\"}")
                .with_header("x-ratelimit-remaining-requests", "0")
                .with_header("x-ratelimit-reset-requests", "1s")
        };
        let transport = Arc::new(
            ScriptedTransport::new()
                .push_response(limited())
                .push_response(limited())
                .push_response(limited())
                .push_response(limited()),
        );
        let gateway = gateway(transport.clone());

        let failure = gateway
            .evaluate(EvaluationRequest::new(EvaluationTask::Completeness, referral()))
            .await
            .unwrap_err();

        assert_eq!(failure.kind(), ErrorKind::RateLimitExceeded);
        assert!(failure.error.user_message().contains("requests"));
        assert_eq!(failure.diagnostics.attempts, 4);
        assert_eq!(
            failure.diagnostics.rate_limit.as_ref().and_then(|s| s.remaining_requests),
            Some(0)
        );
        assert_eq!(transport.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_stops_further_attempts() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .push_status(503, "busy")
                .push_completion(AUTH_REPLY),
        );
        let gateway = gateway(transport.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let failure = gateway
            .evaluate_cancellable(EvaluationRequest::new(EvaluationTask::Auth, referral()), &cancel)
            .await
            .unwrap_err();

        assert_eq!(failure.kind(), ErrorKind::Cancelled);
        assert_eq!(failure.diagnostics.attempts, 1);
        assert_eq!(transport.attempts(), 1);

        // Well past the backoff, still no second attempt.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_admission_wait_takes_no_token() {
        let clock = Arc::new(ManualClock::new());
        let admission = Arc::new(AdmissionController::new(1, 0.5, Duration::ZERO, clock.clone()));
        admission.try_acquire().unwrap();

        let transport = Arc::new(ScriptedTransport::new().push_completion(AUTH_REPLY));
        let gateway = gateway(transport.clone()).with_admission(admission.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let failure = gateway
            .evaluate_cancellable(EvaluationRequest::new(EvaluationTask::Auth, referral()), &cancel)
            .await
            .unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::Cancelled);
        assert_eq!(transport.attempts(), 0);

        // The refilled token is still there for the next caller.
        clock.advance(Duration::from_secs(2));
        assert!(admission.try_acquire().is_ok());
        assert!(admission.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_evaluations_share_one_bucket() {
        let mut transport = ScriptedTransport::new();
        for _ in 0..6 {
            transport = transport.push_completion(AUTH_REPLY);
        }
        let transport = Arc::new(transport);
        let mut config = config();
        config.bucket_capacity = 2;
        config.bucket_refill_per_sec = 1.0;
        let gateway = Arc::new(EvaluationGateway::new(config, transport.clone()));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    gateway
                        .evaluate(EvaluationRequest::new(EvaluationTask::Auth, referral()))
                        .await
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        let mut times = transport.attempt_times();
        times.sort();
        // Two burst through, the remaining four wait for one-per-second refill.
        for window in times.windows(3) {
            assert!(window[2] - window[0] >= Duration::from_millis(999));
        }
    }
}
