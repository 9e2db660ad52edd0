//! Retry policy and response classification.

use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

use super::error::{ApiError, LastFailure};

/// Default ceiling of counted failed attempts per call.
pub const MAX_RETRIES: usize = 3;

/// `message` returned with a 403 once the account is no longer active.
pub const ACCOUNT_EXPIRED_MESSAGE: &str = "The requested Account has expired.";

/// Delays and bounds applied by the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Counted failures tolerated before giving up.
    pub max_attempts: usize,
    /// Wait after a connect/timeout failure.
    pub transport_delay: Duration,
    /// Wait after a 403 that is not an account expiry.
    pub forbidden_delay: Duration,
    /// Wait after a 429. These waits are not counted.
    pub rate_limit_delay: Duration,
    /// Wait after any other unexpected status.
    pub other_status_delay: Duration,
    /// Upper bound on 429 waits within one call. `None` waits forever.
    pub max_rate_limit_waits: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRIES,
            transport_delay: Duration::from_secs(15),
            forbidden_delay: Duration::from_secs(15),
            rate_limit_delay: Duration::from_secs(40),
            other_status_delay: Duration::from_secs(10),
            max_rate_limit_waits: None,
        }
    }
}

impl RetryPolicy {
    /// Same bounds with every delay set to zero.
    pub fn immediate() -> Self {
        Self {
            transport_delay: Duration::ZERO,
            forbidden_delay: Duration::ZERO,
            rate_limit_delay: Duration::ZERO,
            other_status_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// What the retry loop should do with a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Success(Value),
    Fatal(ApiError),
    Retry {
        delay: Duration,
        /// Whether the attempt counts against the ceiling.
        counted: bool,
        reason: LastFailure,
    },
}

/// Classifies a received response according to the policy table.
pub fn classify(policy: &RetryPolicy, status: u16, body: &str) -> Verdict {
    match StatusCode::from_u16(status).ok() {
        Some(StatusCode::OK) => match serde_json::from_str::<Value>(body) {
            Ok(value) => Verdict::Success(value),
            Err(_) => Verdict::Fatal(ApiError::Decode {
                body: body.to_string(),
            }),
        },
        Some(StatusCode::UNAUTHORIZED) => Verdict::Fatal(ApiError::Unauthorized),
        Some(StatusCode::FORBIDDEN) => match serde_json::from_str::<Value>(body) {
            Ok(value) if is_account_expired(&value) => Verdict::Fatal(ApiError::AccountExpired),
            _ => Verdict::Retry {
                delay: policy.forbidden_delay,
                counted: true,
                reason: LastFailure::Forbidden,
            },
        },
        Some(StatusCode::TOO_MANY_REQUESTS) => Verdict::Retry {
            delay: policy.rate_limit_delay,
            counted: false,
            reason: LastFailure::RateLimited,
        },
        _ => Verdict::Retry {
            delay: policy.other_status_delay,
            counted: true,
            reason: LastFailure::Status(status),
        },
    }
}

fn is_account_expired(body: &Value) -> bool {
    body.get("message").and_then(Value::as_str) == Some(ACCOUNT_EXPIRED_MESSAGE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[test]
    fn test_default_policy_constants() {
        let p = policy();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.transport_delay, Duration::from_secs(15));
        assert_eq!(p.forbidden_delay, Duration::from_secs(15));
        assert_eq!(p.rate_limit_delay, Duration::from_secs(40));
        assert_eq!(p.other_status_delay, Duration::from_secs(10));
        assert_eq!(p.max_rate_limit_waits, None);
    }

    #[test]
    fn test_immediate_policy_keeps_bounds() {
        let p = RetryPolicy::immediate();
        assert_eq!(p.max_attempts, MAX_RETRIES);
        assert_eq!(p.rate_limit_delay, Duration::ZERO);
    }

    #[test]
    fn test_classify_ok_json() {
        let verdict = classify(&policy(), 200, r#"{"result":"success","export_file":"abc123"}"#);
        assert_eq!(
            verdict,
            Verdict::Success(json!({"result": "success", "export_file": "abc123"}))
        );
    }

    #[test]
    fn test_classify_ok_not_json_is_fatal() {
        let verdict = classify(&policy(), 200, "<html>oops</html>");
        assert!(matches!(verdict, Verdict::Fatal(ApiError::Decode { .. })));
    }

    #[test]
    fn test_classify_unauthorized() {
        assert_eq!(
            classify(&policy(), 401, ""),
            Verdict::Fatal(ApiError::Unauthorized)
        );
    }

    #[test]
    fn test_classify_forbidden_account_expired() {
        let body = json!({ "message": ACCOUNT_EXPIRED_MESSAGE }).to_string();
        assert_eq!(
            classify(&policy(), 403, &body),
            Verdict::Fatal(ApiError::AccountExpired)
        );
    }

    #[test]
    fn test_classify_forbidden_other_message_is_counted_retry() {
        let verdict = classify(&policy(), 403, r#"{"message":"Slow down"}"#);
        assert!(matches!(
            verdict,
            Verdict::Retry { delay, counted: true, .. } if delay == Duration::from_secs(15)
        ));
    }

    #[test]
    fn test_classify_forbidden_without_message_is_counted_retry() {
        let verdict = classify(&policy(), 403, r#"{"result":"failure"}"#);
        assert!(matches!(verdict, Verdict::Retry { counted: true, .. }));
    }

    #[test]
    fn test_classify_forbidden_non_json_is_counted_retry() {
        let verdict = classify(&policy(), 403, "Forbidden");
        assert_eq!(
            verdict,
            Verdict::Retry {
                delay: Duration::from_secs(15),
                counted: true,
                reason: LastFailure::Forbidden,
            }
        );
    }

    #[test]
    fn test_classify_rate_limited_is_uncounted() {
        let verdict = classify(&policy(), 429, "");
        assert!(matches!(
            verdict,
            Verdict::Retry { delay, counted: false, .. } if delay == Duration::from_secs(40)
        ));
    }

    #[test]
    fn test_classify_other_status() {
        for status in [400, 404, 422, 500, 503] {
            let verdict = classify(&policy(), status, "error");
            match verdict {
                Verdict::Retry {
                    delay,
                    counted,
                    reason,
                } => {
                    assert_eq!(delay, Duration::from_secs(10));
                    assert!(counted);
                    assert_eq!(reason, LastFailure::Status(status));
                }
                other => panic!("Expected retry for {}, got {:?}", status, other),
            }
        }
    }
}
