//! Upstream failure classification
//!
//! Maps an HTTP-like failure (status plus headers) to pool policy: whether the
//! key is dead, and how long it should cool down otherwise. Classification is
//! pure and never fails; anything that cannot be read is treated as transient.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::config::PoolConfig;

/// Header carrying the server-requested backoff in whole seconds.
const RETRY_AFTER: &str = "retry-after";

/// Why a key was taken out of rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    /// 401/403: the credential itself was refused
    AuthRejected,
    /// 429: the credential is throttled
    RateLimited,
    /// 5xx, network errors, everything else
    Transient,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::AuthRejected => "auth-rejected",
            FailureReason::RateLimited => "rate-limited",
            FailureReason::Transient => "transient",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy decision for a single failure report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub is_dead: bool,
    pub cooldown_ms: u64,
    pub reason: FailureReason,
}

impl Classification {
    pub fn dead() -> Self {
        Self {
            is_dead: true,
            cooldown_ms: 0,
            reason: FailureReason::AuthRejected,
        }
    }

    pub fn rate_limited(cooldown: Duration) -> Self {
        Self {
            is_dead: false,
            cooldown_ms: cooldown.as_millis() as u64,
            reason: FailureReason::RateLimited,
        }
    }

    pub fn transient(cooldown: Duration) -> Self {
        Self {
            is_dead: false,
            cooldown_ms: cooldown.as_millis() as u64,
            reason: FailureReason::Transient,
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// The parts of an upstream failure the classifier looks at.
///
/// `status` is `None` for failures that never produced a response
/// (connection refused, DNS, timeouts).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
}

impl ErrorResponse {
    pub fn from_status(status: u16) -> Self {
        Self {
            status: Some(status),
            headers: Vec::new(),
        }
    }

    pub fn network() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header value matching `name` case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Read a loosely-shaped error object such as `{"status": 429, "headers": {"Retry-After": "2"}}`.
    ///
    /// `status` may be a number or a numeric string. Header values may be
    /// strings or numbers. Fields that cannot be read are dropped rather than
    /// rejected, so the result always classifies.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let status = match value.get("status") {
            Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|s| u16::try_from(s).ok()),
            Some(serde_json::Value::String(s)) => s.trim().parse::<u16>().ok(),
            _ => None,
        };

        let headers = value
            .get("headers")
            .and_then(|h| h.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(name, v)| match v {
                        serde_json::Value::String(s) => Some((name.clone(), s.clone())),
                        serde_json::Value::Number(n) => Some((name.clone(), n.to_string())),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self { status, headers }
    }
}

/// Classify an upstream failure under the given cooldown policy.
///
/// 401/403 are permanent. 429 cools down for `retry-after` seconds when the
/// header holds a non-negative integer, else the configured rate-limit
/// cooldown. Everything else, including a missing status, gets the transient
/// cooldown.
pub fn classify(response: &ErrorResponse, config: &PoolConfig) -> Classification {
    match response.status {
        Some(401 | 403) => Classification::dead(),
        Some(429) => {
            let cooldown = response
                .header(RETRY_AFTER)
                .and_then(parse_retry_after)
                .unwrap_or_else(|| config.rate_limit_cooldown());
            Classification::rate_limited(cooldown)
        }
        _ => Classification::transient(config.transient_cooldown()),
    }
}

/// Integer seconds only; HTTP-date forms fall back to the default cooldown.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: u64 = value.trim().parse().ok()?;
    Some(Duration::from_millis(secs.saturating_mul(1000)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> PoolConfig {
        PoolConfig::default()
    }

    #[test]
    fn status_401_is_dead() {
        let c = classify(&ErrorResponse::from_status(401), &config());
        assert!(c.is_dead);
        assert_eq!(c.cooldown_ms, 0);
        assert_eq!(c.reason, FailureReason::AuthRejected);
    }

    #[test]
    fn status_403_is_dead() {
        let c = classify(&ErrorResponse::from_status(403), &config());
        assert!(c.is_dead);
        assert_eq!(c.reason.as_str(), "auth-rejected");
    }

    #[test]
    fn status_429_with_retry_after_uses_header() {
        let response = ErrorResponse::from_status(429).with_header("retry-after", "2");
        let c = classify(&response, &config());
        assert!(!c.is_dead);
        assert_eq!(c.cooldown_ms, 2000);
        assert_eq!(c.reason, FailureReason::RateLimited);
    }

    #[test]
    fn retry_after_header_name_is_case_insensitive() {
        let response = ErrorResponse::from_status(429).with_header("Retry-After", " 7 ");
        assert_eq!(classify(&response, &config()).cooldown_ms, 7000);
    }

    #[test]
    fn status_429_without_header_uses_default() {
        let c = classify(&ErrorResponse::from_status(429), &config());
        assert_eq!(c.cooldown_ms, 300_000);
        assert_eq!(c.reason, FailureReason::RateLimited);
    }

    #[test]
    fn retry_after_http_date_falls_back_to_default() {
        let response = ErrorResponse::from_status(429)
            .with_header("retry-after", "Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(classify(&response, &config()).cooldown_ms, 300_000);
    }

    #[test]
    fn retry_after_negative_or_fractional_falls_back_to_default() {
        for value in ["-5", "2.5", ""] {
            let response = ErrorResponse::from_status(429).with_header("retry-after", value);
            assert_eq!(
                classify(&response, &config()).cooldown_ms,
                300_000,
                "retry-after {value:?}"
            );
        }
    }

    #[test]
    fn retry_after_zero_is_honored() {
        let response = ErrorResponse::from_status(429).with_header("retry-after", "0");
        assert_eq!(classify(&response, &config()).cooldown_ms, 0);
    }

    #[test]
    fn huge_retry_after_saturates() {
        let response = ErrorResponse::from_status(429)
            .with_header("retry-after", u64::MAX.to_string());
        assert_eq!(classify(&response, &config()).cooldown_ms, u64::MAX);
    }

    #[test]
    fn server_errors_are_transient() {
        for status in [500, 502, 503, 504, 408] {
            let c = classify(&ErrorResponse::from_status(status), &config());
            assert!(!c.is_dead, "status {status}");
            assert_eq!(c.cooldown_ms, 30_000, "status {status}");
            assert_eq!(c.reason, FailureReason::Transient, "status {status}");
        }
    }

    #[test]
    fn network_error_is_transient() {
        let c = classify(&ErrorResponse::network(), &config());
        assert_eq!(c, Classification::transient(Duration::from_secs(30)));
    }

    #[test]
    fn configured_cooldowns_apply() {
        let config = PoolConfig {
            rate_limit_cooldown_secs: 60,
            transient_cooldown_secs: 5,
            ..PoolConfig::default()
        };
        assert_eq!(
            classify(&ErrorResponse::from_status(429), &config).cooldown_ms,
            60_000
        );
        assert_eq!(
            classify(&ErrorResponse::from_status(500), &config).cooldown_ms,
            5_000
        );
    }

    #[test]
    fn from_json_reads_status_and_headers() {
        let response = ErrorResponse::from_json(&json!({
            "status": 429,
            "headers": { "Retry-After": "2" }
        }));
        assert_eq!(response.status, Some(429));
        assert_eq!(response.header("retry-after"), Some("2"));
        assert_eq!(classify(&response, &config()).cooldown_ms, 2000);
    }

    #[test]
    fn from_json_accepts_numeric_header_and_string_status() {
        let response = ErrorResponse::from_json(&json!({
            "status": "429",
            "headers": { "retry-after": 3 }
        }));
        assert_eq!(classify(&response, &config()).cooldown_ms, 3000);
    }

    #[test]
    fn from_json_malformed_input_is_transient() {
        for value in [
            json!(null),
            json!("boom"),
            json!({ "status": "not a number" }),
            json!({ "status": 70000 }),
            json!({ "status": -1 }),
            json!({ "message": "socket hang up" }),
        ] {
            let c = classify(&ErrorResponse::from_json(&value), &config());
            assert_eq!(c.reason, FailureReason::Transient, "input {value}");
            assert!(!c.is_dead, "input {value}");
        }
    }

    #[test]
    fn reason_serializes_kebab_case() {
        let c = Classification::rate_limited(Duration::from_secs(2));
        let value = serde_json::to_value(&c).unwrap();
        assert_eq!(value["reason"], "rate-limited");
        assert_eq!(value["cooldown_ms"], 2000);
        assert_eq!(value["is_dead"], false);
    }
}
