use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::backoff::RetryPolicy;
use crate::sanitize::MAX_DOCUMENT_CHARS;

pub const DEFAULT_UPSTREAM_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";
const MAX_ATTEMPTS_CEILING: u32 = 5;
const MIN_REFILL_PER_SEC: f64 = 0.001;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Invalid { .. } => "ERR_INVALID_CONFIG",
        }
    }

    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

#[derive(Clone)]
pub struct GatewayConfig {
    /// Absent means the gateway is disabled.
    pub api_key: Option<String>,
    pub upstream_url: String,
    pub model: String,
    pub temperature: f32,
    pub attempt_timeout: Duration,
    pub retry: RetryPolicy,
    pub bucket_capacity: u32,
    pub bucket_refill_per_sec: f64,
    pub max_document_chars: usize,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("upstream_url", &self.upstream_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("retry", &self.retry)
            .field("bucket_capacity", &self.bucket_capacity)
            .field("bucket_refill_per_sec", &self.bucket_refill_per_sec)
            .field("max_document_chars", &self.max_document_chars)
            .finish()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.2,
            attempt_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            bucket_capacity: 4,
            bucket_refill_per_sec: 1.5,
            max_document_chars: MAX_DOCUMENT_CHARS,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_kv(&vars)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let default_retry = RetryPolicy::default();

        let api_key = non_empty(kv.get("OPENROUTER_API_KEY"));
        let upstream_url =
            non_empty(kv.get("TRIAGE_UPSTREAM_URL")).unwrap_or(defaults.upstream_url);
        if !upstream_url.starts_with("http://") && !upstream_url.starts_with("https://") {
            return Err(ConfigError::invalid(
                "TRIAGE_UPSTREAM_URL",
                "must be an http(s) URL",
            ));
        }
        let model = non_empty(kv.get("TRIAGE_MODEL")).unwrap_or(defaults.model);

        let temperature = parse_f64(
            kv.get("TRIAGE_TEMPERATURE"),
            f64::from(defaults.temperature),
            "TRIAGE_TEMPERATURE",
        )?;
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigError::invalid(
                "TRIAGE_TEMPERATURE",
                "must be between 0 and 2",
            ));
        }

        let attempt_timeout = parse_millis(
            kv.get("TRIAGE_ATTEMPT_TIMEOUT_MS"),
            defaults.attempt_timeout,
            "TRIAGE_ATTEMPT_TIMEOUT_MS",
        )?;
        if attempt_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "TRIAGE_ATTEMPT_TIMEOUT_MS",
                "must be greater than zero",
            ));
        }

        let max_attempts = parse_u32(
            kv.get("TRIAGE_MAX_ATTEMPTS"),
            default_retry.max_attempts,
            "TRIAGE_MAX_ATTEMPTS",
        )?;
        if !(1..=MAX_ATTEMPTS_CEILING).contains(&max_attempts) {
            return Err(ConfigError::invalid(
                "TRIAGE_MAX_ATTEMPTS",
                format!("must be between 1 and {MAX_ATTEMPTS_CEILING}"),
            ));
        }

        let retry = RetryPolicy {
            max_attempts,
            base_delay: parse_millis(
                kv.get("TRIAGE_BACKOFF_BASE_MS"),
                default_retry.base_delay,
                "TRIAGE_BACKOFF_BASE_MS",
            )?,
            max_delay: parse_millis(
                kv.get("TRIAGE_BACKOFF_MAX_MS"),
                default_retry.max_delay,
                "TRIAGE_BACKOFF_MAX_MS",
            )?,
            jitter_max: parse_millis(
                kv.get("TRIAGE_JITTER_MAX_MS"),
                default_retry.jitter_max,
                "TRIAGE_JITTER_MAX_MS",
            )?,
            max_retry_after: parse_millis(
                kv.get("TRIAGE_MAX_RETRY_AFTER_MS"),
                default_retry.max_retry_after,
                "TRIAGE_MAX_RETRY_AFTER_MS",
            )?,
        };
        if retry.max_delay < retry.base_delay {
            return Err(ConfigError::invalid(
                "TRIAGE_BACKOFF_MAX_MS",
                "must not be smaller than TRIAGE_BACKOFF_BASE_MS",
            ));
        }

        let bucket_capacity = parse_u32(
            kv.get("TRIAGE_BUCKET_CAPACITY"),
            defaults.bucket_capacity,
            "TRIAGE_BUCKET_CAPACITY",
        )?;
        if bucket_capacity == 0 {
            return Err(ConfigError::invalid(
                "TRIAGE_BUCKET_CAPACITY",
                "must be at least 1",
            ));
        }

        let bucket_refill_per_sec = parse_f64(
            kv.get("TRIAGE_BUCKET_REFILL_PER_SEC"),
            defaults.bucket_refill_per_sec,
            "TRIAGE_BUCKET_REFILL_PER_SEC",
        )?;
        if bucket_refill_per_sec < MIN_REFILL_PER_SEC {
            return Err(ConfigError::invalid(
                "TRIAGE_BUCKET_REFILL_PER_SEC",
                format!("must be at least {MIN_REFILL_PER_SEC}"),
            ));
        }

        let max_document_chars = parse_usize(
            kv.get("TRIAGE_MAX_DOCUMENT_CHARS"),
            defaults.max_document_chars,
            "TRIAGE_MAX_DOCUMENT_CHARS",
        )?;

        Ok(Self {
            api_key,
            upstream_url,
            model,
            temperature: temperature as f32,
            attempt_timeout,
            retry,
            bucket_capacity,
            bucket_refill_per_sec,
            max_document_chars,
        })
    }

    /// Test and embedding convenience: defaults plus a credential.
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn parse_u32(value: Option<&String>, default: u32, key: &'static str) -> Result<u32, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse::<u32>()
            .map_err(|_| ConfigError::invalid(key, "must be a non-negative integer")),
    }
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse::<usize>()
            .map_err(|_| ConfigError::invalid(key, "must be a non-negative integer")),
    }
}

fn parse_millis(
    value: Option<&String>,
    default: Duration,
    key: &'static str,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::invalid(key, "must be a whole number of milliseconds")),
    }
}

fn parse_f64(value: Option<&String>, default: f64, key: &'static str) -> Result<f64, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => match v.trim().parse::<f64>() {
            Ok(parsed) if parsed.is_finite() => Ok(parsed),
            _ => Err(ConfigError::invalid(key, "must be a finite number")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = GatewayConfig::from_kv(&HashMap::new()).unwrap();

        assert!(!config.is_enabled());
        assert_eq!(config.upstream_url, DEFAULT_UPSTREAM_URL);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.base_delay, Duration::from_millis(400));
        assert_eq!(config.retry.max_delay, Duration::from_secs(4));
        assert_eq!(config.bucket_capacity, 4);
        assert_eq!(config.bucket_refill_per_sec, 1.5);
        assert_eq!(config.max_document_chars, 3000);
        assert_eq!(config.attempt_timeout, Duration::from_secs(30));
    }

    #[test]
    fn overrides_are_read() {
        let config = GatewayConfig::from_kv(&kv(&[
            ("OPENROUTER_API_KEY", " sk-test "),
            ("TRIAGE_MODEL", "anthropic/claude-3-haiku"),
            ("TRIAGE_MAX_ATTEMPTS", "5"),
            ("TRIAGE_BUCKET_REFILL_PER_SEC", "0.5"),
            ("TRIAGE_MAX_RETRY_AFTER_MS", "10000"),
            ("TRIAGE_JITTER_MAX_MS", ""),
        ]))
        .unwrap();

        assert_eq!(config.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.model, "anthropic/claude-3-haiku");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.bucket_refill_per_sec, 0.5);
        assert_eq!(config.retry.max_retry_after, Duration::from_secs(10));
        assert_eq!(config.retry.jitter_max, Duration::from_millis(200));
    }

    #[test]
    fn blank_api_key_disables_the_gateway() {
        let config = GatewayConfig::from_kv(&kv(&[("OPENROUTER_API_KEY", "   ")])).unwrap();
        assert!(!config.is_enabled());
    }

    #[test]
    fn invalid_values_fail_with_a_stable_code() {
        let cases = [
            ("TRIAGE_MAX_ATTEMPTS", "0"),
            ("TRIAGE_MAX_ATTEMPTS", "6"),
            ("TRIAGE_BUCKET_CAPACITY", "0"),
            ("TRIAGE_BUCKET_REFILL_PER_SEC", "-1"),
            ("TRIAGE_BUCKET_REFILL_PER_SEC", "NaN"),
            ("TRIAGE_BUCKET_REFILL_PER_SEC", "1e-20"),
            ("TRIAGE_BUCKET_REFILL_PER_SEC", "0"),
            ("TRIAGE_ATTEMPT_TIMEOUT_MS", "soon"),
            ("TRIAGE_ATTEMPT_TIMEOUT_MS", "0"),
            ("TRIAGE_TEMPERATURE", "9"),
            ("TRIAGE_UPSTREAM_URL", "ftp://example.org"),
        ];
        for (key, value) in cases {
            let err = GatewayConfig::from_kv(&kv(&[(key, value)])).unwrap_err();
            assert_eq!(err.code(), "ERR_INVALID_CONFIG");
            assert!(err.to_string().contains(key), "{key}={value}: {err}");
        }
    }

    #[test]
    fn backoff_cap_must_cover_base() {
        let err = GatewayConfig::from_kv(&kv(&[
            ("TRIAGE_BACKOFF_BASE_MS", "5000"),
            ("TRIAGE_BACKOFF_MAX_MS", "1000"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "TRIAGE_BACKOFF_MAX_MS",
                ..
            }
        ));
    }

    #[test]
    fn debug_output_redacts_the_key() {
        let config = GatewayConfig::with_api_key("sk-very-secret");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-very-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
