//! Failures a call can end with.

use super::transport::TransportError;

/// The last retryable condition seen before a call gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastFailure {
    /// No response was received.
    Transport(TransportError),
    /// HTTP 403 that is not an account expiry.
    Forbidden,
    /// HTTP 429.
    RateLimited,
    /// Any other unexpected status.
    Status(u16),
}

impl std::fmt::Display for LastFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LastFailure::Transport(e) => write!(f, "transport error: {}", e),
            LastFailure::Forbidden => write!(f, "HTTP 403"),
            LastFailure::RateLimited => write!(f, "HTTP 429 rate limited"),
            LastFailure::Status(status) => write!(f, "HTTP {}", status),
        }
    }
}

/// Fatal outcome of [`super::ApiClient::call`].
///
/// Retryable conditions never surface individually. Transport failures and
/// unexpected statuses are absorbed by the retry loop and at most show up as
/// the `last` detail of `ExhaustedRetries`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// HTTP 401. Never retried.
    Unauthorized,
    /// HTTP 403 reporting the account has expired. Never retried.
    AccountExpired,
    /// HTTP 200 whose body is not JSON.
    Decode { body: String },
    /// HTTP 429 persisted past the configured wait bound.
    RateLimited { waits: u32 },
    /// The retry ceiling was reached without a usable response. `last` is
    /// `None` only when the policy allows no attempts at all.
    ExhaustedRetries {
        attempts: usize,
        last: Option<LastFailure>,
    },
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized => {
                write!(f, "Unauthorized. Check the user and token in suredone.yaml.")
            }
            ApiError::AccountExpired => write!(f, "The requested Account has expired."),
            ApiError::Decode { body } => {
                write!(f, "Response was not valid JSON: {}", truncate(body, 200))
            }
            ApiError::RateLimited { waits } => {
                write!(f, "Still rate limited after {} waits", waits)
            }
            ApiError::ExhaustedRetries {
                attempts,
                last: Some(last),
            } => write!(f, "Gave up after {} failed attempts (last: {})", attempts, last),
            ApiError::ExhaustedRetries { attempts, last: None } => {
                write!(f, "Gave up after {} failed attempts", attempts)
            }
        }
    }
}

impl std::error::Error for ApiError {}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
