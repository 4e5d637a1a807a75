//! # triage-gateway
//!
//! Throttled gateway between referral triage callers and a rate-limited
//! upstream completion service.
//!
//! Every evaluation is sanitized, admitted through a shared token bucket,
//! sent with retries and backoff that honor server rate-limit metadata, and
//! its free-text reply is reduced to a validated, typed result.
//!
//! ```rust,no_run
//! use triage_gateway::{EvaluationGateway, EvaluationRequest, EvaluationTask, GatewayConfig};
//!
//! # async fn run(referral: triage_gateway::Referral) -> Result<(), Box<dyn std::error::Error>> {
//! let gateway = EvaluationGateway::from_config(GatewayConfig::from_env()?)?;
//! match gateway.evaluate(EvaluationRequest::new(EvaluationTask::Auth, referral)).await {
//!     Ok(evaluation) => println!("{:?}", evaluation.result),
//!     Err(failure) => println!("{}", failure.error.user_message()),
//! }
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod extract;
pub mod gateway;
pub mod models;
pub mod ratelimit;
pub mod sanitize;
pub mod templates;
pub mod transport;
pub mod upstream;

// Re-export commonly used types
pub use admission::AdmissionController;
pub use backoff::{Delay, RetryPolicy, StatusClass, classify_status};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, GatewayConfig};
pub use error::{ErrorKind, GatewayError, Result};
pub use extract::{extract_payload, parse_evaluation, validate};
pub use gateway::{
    Diagnostics, Evaluation, EvaluationFailure, EvaluationGateway, EvaluationRequest,
};
pub use models::{
    AuthResult, BundleMessages, BundleResult, CompletenessResult, EvaluationResult,
    EvaluationTask, InsuranceCoverage, Patient, Referral, ReferralDocument, RiskBand,
};
pub use ratelimit::{RateLimitKind, RateLimitSnapshot};
pub use sanitize::PayloadSanitizer;
pub use transport::{
    ChatMessage, CompletionRequest, CompletionTransport, HttpTransport, ScriptedTransport,
    TransportError, UpstreamResponse,
};
pub use upstream::{CallFailure, UpstreamCaller, UpstreamSuccess};
