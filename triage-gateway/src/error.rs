use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ratelimit::RateLimitKind;

/// Stable, serializable classification of a gateway failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ConfigurationError,
    TransientUpstreamError,
    RateLimitExceeded,
    UpstreamRejected,
    MalformedResponse,
    SchemaViolation,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Upstream unavailable after {attempts} attempt(s): {detail}")]
    TransientUpstream {
        status: Option<u16>,
        attempts: u32,
        detail: String,
    },

    #[error("Upstream rate limit exceeded after {attempts} attempt(s): {detail}")]
    RateLimitExceeded {
        limit: Option<RateLimitKind>,
        attempts: u32,
        detail: String,
    },

    #[error("Upstream rejected the request with status {status}: {detail}")]
    UpstreamRejected { status: u16, detail: String },

    #[error("Malformed upstream response: {detail}")]
    MalformedResponse { detail: String, raw: String },

    #[error("Schema violation at `{field}`: {detail}")]
    SchemaViolation { field: String, detail: String },

    #[error("Evaluation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Configuration(_) => ErrorKind::ConfigurationError,
            GatewayError::TransientUpstream { .. } => ErrorKind::TransientUpstreamError,
            GatewayError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            GatewayError::UpstreamRejected { .. } => ErrorKind::UpstreamRejected,
            GatewayError::MalformedResponse { .. } => ErrorKind::MalformedResponse,
            GatewayError::SchemaViolation { .. } => ErrorKind::SchemaViolation,
            GatewayError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// True when trying again a little later is likely to succeed.
    pub fn is_overload(&self) -> bool {
        matches!(
            self,
            GatewayError::TransientUpstream { .. } | GatewayError::RateLimitExceeded { .. }
        )
    }

    /// Short actionable message suitable for an end user.
    pub fn user_message(&self) -> &'static str {
        match self {
            GatewayError::RateLimitExceeded {
                limit: Some(RateLimitKind::Requests),
                ..
            } => "Too many evaluation requests right now; temporarily overloaded, try again shortly.",
            GatewayError::RateLimitExceeded {
                limit: Some(RateLimitKind::Tokens),
                ..
            } => "Evaluation volume limit reached; temporarily overloaded, try again shortly.",
            GatewayError::RateLimitExceeded { .. } | GatewayError::TransientUpstream { .. } => {
                "Temporarily overloaded, try again shortly."
            }
            GatewayError::Cancelled => "Evaluation was cancelled.",
            _ => "Service unavailable, using offline estimate.",
        }
    }

    pub(crate) fn malformed(detail: impl Into<String>, raw: &str) -> Self {
        GatewayError::MalformedResponse {
            detail: detail.into(),
            raw: raw.to_string(),
        }
    }

    pub(crate) fn violation(field: impl Into<String>, detail: impl Into<String>) -> Self {
        GatewayError::SchemaViolation {
            field: field.into(),
            detail: detail.into(),
        }
    }
}
