use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

/// Which upstream budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitKind {
    Requests,
    Tokens,
}

/// Capacity state reported by the upstream on its last response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_requests: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_requests: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_requests_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_tokens_ms: Option<u64>,
}

impl RateLimitSnapshot {
    /// Reads the `x-ratelimit-*` headers. `None` when the upstream sent none.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let snapshot = Self {
            limit_requests: header_u64(headers, "x-ratelimit-limit-requests"),
            limit_tokens: header_u64(headers, "x-ratelimit-limit-tokens"),
            remaining_requests: header_u64(headers, "x-ratelimit-remaining-requests"),
            remaining_tokens: header_u64(headers, "x-ratelimit-remaining-tokens"),
            reset_requests_ms: header_str(headers, "x-ratelimit-reset-requests")
                .and_then(parse_reset_duration)
                .map(|d| d.as_millis() as u64),
            reset_tokens_ms: header_str(headers, "x-ratelimit-reset-tokens")
                .and_then(parse_reset_duration)
                .map(|d| d.as_millis() as u64),
        };

        (snapshot != Self::default()).then_some(snapshot)
    }

    /// The dimension at zero, requests first.
    pub fn exhausted(&self) -> Option<RateLimitKind> {
        if self.remaining_requests == Some(0) {
            Some(RateLimitKind::Requests)
        } else if self.remaining_tokens == Some(0) {
            Some(RateLimitKind::Tokens)
        } else {
            None
        }
    }

    pub fn reset_after(&self, kind: RateLimitKind) -> Option<Duration> {
        let ms = match kind {
            RateLimitKind::Requests => self.reset_requests_ms,
            RateLimitKind::Tokens => self.reset_tokens_ms,
        };
        ms.map(Duration::from_millis)
    }
}

/// Server-requested wait from `retry-after-ms` or `retry-after`.
///
/// `retry-after` may be delta-seconds (decimals tolerated) or an HTTP date.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(ms) = header_str(headers, "retry-after-ms").and_then(|v| v.parse::<f64>().ok()) {
        return secs_to_duration(ms / 1_000.0);
    }

    let raw = header_str(headers, "retry-after")?;
    if let Ok(secs) = raw.parse::<f64>() {
        return secs_to_duration(secs);
    }

    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let delta = at.signed_duration_since(Utc::now());
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Parses reset intervals such as `1s`, `250ms`, `6m0s`, `1h2m3.5s` or bare seconds.
pub fn parse_reset_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<f64>() {
        return secs_to_duration(secs);
    }

    let mut total = 0.0_f64;
    let mut rest = raw;
    while !rest.is_empty() {
        let number_len = rest.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
        if number_len == 0 {
            return None;
        }
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3_600.0,
            _ => return None,
        };
        total += value * scale;
        rest = &rest[unit_len..];
    }

    secs_to_duration(total)
}

fn secs_to_duration(secs: f64) -> Option<Duration> {
    if secs < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_str(headers, name).and_then(|v| v.parse().ok())
}
