use std::time::Duration;

use reqwest::header::HeaderMap;

use crate::admission::jitter;
use crate::ratelimit::{RateLimitSnapshot, retry_after};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Retryable,
    Terminal,
}

pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        429 | 500 | 502 | 503 | 504 => StatusClass::Retryable,
        _ => StatusClass::Terminal,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// The upstream asked for exactly this wait.
    RetryAfter(Duration),
    /// Computed backoff; jitter is added on top.
    Backoff(Duration),
    /// The requested wait is longer than we are willing to hold a caller.
    GiveUp,
}

impl Delay {
    /// The wall-clock sleep to perform, or `None` to stop retrying.
    pub fn resolve(self, jitter_max: Duration) -> Option<Duration> {
        match self {
            Delay::RetryAfter(wait) => Some(wait),
            Delay::Backoff(wait) => Some(wait + jitter(jitter_max)),
            Delay::GiveUp => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_max: Duration,
    /// Longest server-requested wait that is honored.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(4),
            jitter_max: Duration::from_millis(200),
            max_retry_after: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    ///
    /// `status` is `None` for transport failures. Pure: no clock, no randomness.
    pub fn next_delay(&self, attempt: u32, status: Option<u16>, headers: Option<&HeaderMap>) -> Delay {
        if let Some(wait) = headers.and_then(retry_after) {
            return if wait > self.max_retry_after {
                Delay::GiveUp
            } else {
                Delay::RetryAfter(wait)
            };
        }

        let exponential = self.exponential(attempt);

        if status == Some(429) {
            let reset = headers
                .and_then(RateLimitSnapshot::from_headers)
                .and_then(|snapshot| {
                    let kind = snapshot.exhausted()?;
                    snapshot.reset_after(kind)
                });
            if let Some(reset) = reset {
                return Delay::Backoff(exponential.max(reset).min(self.max_retry_after));
            }
        }

        Delay::Backoff(exponential)
    }

    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn exponential(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}
