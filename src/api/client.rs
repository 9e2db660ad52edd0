//! SureDone API client with built-in retry logic.

use anyhow::{Context, Result};
use log::{debug, error, warn};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::error::{ApiError, LastFailure};
use super::request::{ApiRequest, Method, Payload, PreparedRequest};
use super::retry::{RetryPolicy, Verdict, classify};
use super::transport::{ReqwestTransport, Transport};
use crate::config::Credentials;

/// Base URL every endpoint is appended to.
pub const API_ENDPOINT: &str = "https://api.suredone.com/v1/";

/// Value of the `x-auth-integration` header.
pub const INTEGRATION_ID: &str = "partnername";

const AUTH_INTEGRATION: &str = "x-auth-integration";
const AUTH_USER: &str = "x-auth-user";
const AUTH_TOKEN: &str = "x-auth-token";

/// Client for the SureDone REST API.
///
/// Holds only what is fixed at construction: the credential headers, the base
/// URL, the retry policy and the transport. Every [`ApiClient::call`] starts
/// with a fresh retry counter.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    headers: HeaderMap,
    base_url: String,
    policy: RetryPolicy,
}

impl ApiClient {
    /// Creates a client whose requests time out after `timeout`.
    /// No network activity happens here.
    pub fn new(credentials: &Credentials, timeout: Duration) -> Result<Self> {
        let transport = ReqwestTransport::new(timeout)?;
        Self::with_transport(credentials, Arc::new(transport))
    }

    /// Creates a client on top of an arbitrary transport.
    pub fn with_transport(credentials: &Credentials, transport: Arc<dyn Transport>) -> Result<Self> {
        Ok(Self {
            transport,
            headers: auth_headers(credentials)?,
            base_url: API_ENDPOINT.to_string(),
            policy: RetryPolicy::default(),
        })
    }

    /// Points the client at another API root (mock servers, staging).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        self.base_url = base_url;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Calls `endpoint`, retrying until a JSON response arrives, a fatal
    /// condition is hit, or the retry ceiling is reached.
    #[tracing::instrument(skip(self, payload))]
    pub async fn call(
        &self,
        method: Method,
        endpoint: &str,
        payload: Option<&Payload>,
    ) -> Result<Value, ApiError> {
        let request = ApiRequest {
            method,
            endpoint,
            payload,
        };
        let prepared = PreparedRequest::new(&self.base_url, &request);
        debug!("{} {} payload={:?}", method, prepared.url, payload);

        let mut failures = 0;
        let mut rate_limit_waits = 0u32;
        let mut last = None;

        while failures < self.policy.max_attempts {
            let response = match self.transport.send(&prepared, &self.headers).await {
                Ok(response) => response,
                Err(e) => {
                    failures += 1;
                    warn!(
                        "HTTP error {} {} payload={:?}: {} (attempt {}/{}), retrying in {:?}...",
                        method,
                        prepared.url,
                        payload,
                        e,
                        failures,
                        self.policy.max_attempts,
                        self.policy.transport_delay
                    );
                    last = Some(LastFailure::Transport(e));
                    sleep(self.policy.transport_delay).await;
                    continue;
                }
            };

            match classify(&self.policy, response.status, &response.body) {
                Verdict::Success(value) => return Ok(value),
                Verdict::Fatal(err) => {
                    error!(
                        "{} {} failed with HTTP {}: {} (body: {})",
                        method, prepared.url, response.status, err, response.body
                    );
                    return Err(err);
                }
                Verdict::Retry {
                    delay,
                    counted: false,
                    reason,
                } => {
                    rate_limit_waits += 1;
                    if let Some(max) = self.policy.max_rate_limit_waits {
                        if rate_limit_waits > max {
                            error!(
                                "{} {} still rate limited after {} waits, giving up",
                                method, prepared.url, max
                            );
                            return Err(ApiError::RateLimited { waits: max });
                        }
                    }
                    warn!(
                        "{} on {} {}, waiting {:?} (wait {})...",
                        reason, method, prepared.url, delay, rate_limit_waits
                    );
                    sleep(delay).await;
                }
                Verdict::Retry { delay, reason, .. } => {
                    failures += 1;
                    warn!(
                        "{} on {} {} payload={:?} (attempt {}/{}), retrying in {:?}: {}",
                        reason,
                        method,
                        prepared.url,
                        payload,
                        failures,
                        self.policy.max_attempts,
                        delay,
                        response.body
                    );
                    last = Some(reason);
                    sleep(delay).await;
                }
            }
        }

        error!(
            "{} {} payload={:?} gave up after {} failed attempts",
            method, prepared.url, payload, failures
        );
        Err(ApiError::ExhaustedRetries {
            attempts: failures,
            last,
        })
    }

    /// [`ApiClient::call`] followed by deserialization into `T`.
    pub async fn call_as<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        payload: Option<&Payload>,
    ) -> Result<T> {
        let value = self.call(method, endpoint, payload).await?;
        serde_json::from_value(value)
            .with_context(|| format!("Unexpected response shape from {}", endpoint))
    }
}

fn auth_headers(credentials: &Credentials) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/x-www-form-urlencoded"),
    );
    headers.insert(
        HeaderName::from_static(AUTH_INTEGRATION),
        HeaderValue::from_static(INTEGRATION_ID),
    );
    headers.insert(
        HeaderName::from_static(AUTH_USER),
        HeaderValue::from_str(&credentials.user).context("User name is not a valid header value")?,
    );
    let mut token =
        HeaderValue::from_str(&credentials.token).context("Token is not a valid header value")?;
    token.set_sensitive(true);
    headers.insert(HeaderName::from_static(AUTH_TOKEN), token);
    Ok(headers)
}

async fn sleep(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::retry::ACCOUNT_EXPIRED_MESSAGE;
    use crate::api::transport::{MockTransport, RawResponse, TransportError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn credentials() -> Credentials {
        Credentials {
            user: "alice".to_string(),
            token: "secret-token".to_string(),
        }
    }

    fn client(transport: MockTransport) -> ApiClient {
        ApiClient::with_transport(&credentials(), Arc::new(transport))
            .unwrap()
            .with_policy(RetryPolicy::immediate())
    }

    fn respond(status: u16, body: &str) -> Result<RawResponse, TransportError> {
        Ok(RawResponse {
            status,
            body: body.to_string(),
        })
    }

    /// The paused clock only moves by whole timer deadlines, so anything
    /// past the next second means an extra wait happened.
    fn assert_elapsed(start: tokio::time::Instant, expected: Duration) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_secs(1),
            "elapsed {:?}, expected {:?}",
            elapsed,
            expected
        );
    }

    #[test]
    fn test_new_builds_headers_without_network() {
        let client = ApiClient::new(&credentials(), Duration::from_secs(15)).unwrap();
        let headers = client.headers();

        assert_eq!(headers[CONTENT_TYPE], "application/x-www-form-urlencoded");
        assert_eq!(headers["x-auth-integration"], INTEGRATION_ID);
        assert_eq!(headers["x-auth-user"], "alice");
        assert_eq!(headers["x-auth-token"], "secret-token");
        assert!(headers["x-auth-token"].is_sensitive());
        assert_eq!(client.base_url(), API_ENDPOINT);
        assert_eq!(client.policy(), &RetryPolicy::default());
    }

    #[test]
    fn test_with_base_url_appends_slash() {
        let client = ApiClient::new(&credentials(), Duration::from_secs(1))
            .unwrap()
            .with_base_url("http://127.0.0.1:1234/v1");
        assert_eq!(client.base_url(), "http://127.0.0.1:1234/v1/");
    }

    #[test]
    fn test_invalid_header_value_is_rejected() {
        let credentials = Credentials {
            user: "bad\nuser".to_string(),
            token: "t".to_string(),
        };
        assert!(ApiClient::new(&credentials, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_call_success_returns_parsed_body() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|req, headers| {
                req.method == Method::Get
                    && req.url == "https://api.suredone.com/v1/bulk/exports"
                    && req.query == vec![("type".to_string(), "items".to_string())]
                    && headers["x-auth-user"] == "alice"
            })
            .times(1)
            .returning(|_, _| respond(200, r#"{"result":"success","export_file":"abc123"}"#));

        let mut payload = Payload::new();
        payload.insert("type".to_string(), json!("items"));

        let result = client(transport)
            .call(Method::Get, "bulk/exports", Some(&payload))
            .await
            .unwrap();

        assert_eq!(result, json!({"result": "success", "export_file": "abc123"}));
    }

    #[tokio::test]
    async fn test_call_transport_failures_exhaust_retries() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(3)
            .returning(|_, _| Err(TransportError("connection refused".to_string())));

        let err = client(transport)
            .call(Method::Get, "bulk/exports", None)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ApiError::ExhaustedRetries {
                attempts: 3,
                last: Some(LastFailure::Transport(TransportError(
                    "connection refused".to_string()
                ))),
            }
        );
    }

    #[tokio::test]
    async fn test_call_unauthorized_is_not_retried() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_, _| respond(401, r#"{"result":"failure"}"#));

        let err = client(transport)
            .call(Method::Get, "bulk/exports", None)
            .await
            .unwrap_err();

        assert_eq!(err, ApiError::Unauthorized);
    }

    #[tokio::test]
    async fn test_call_account_expired_is_not_retried() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_, _| respond(403, &json!({ "message": ACCOUNT_EXPIRED_MESSAGE }).to_string()));

        let err = client(transport)
            .call(Method::Post, "editor/items", None)
            .await
            .unwrap_err();

        assert_eq!(err, ApiError::AccountExpired);
    }

    #[tokio::test]
    async fn test_call_forbidden_counts_against_ceiling() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(3)
            .returning(|_, _| respond(403, r#"{"message":"Permission denied"}"#));

        let err = client(transport)
            .call(Method::Get, "bulk/exports", None)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ApiError::ExhaustedRetries {
                attempts: 3,
                last: Some(LastFailure::Forbidden),
            }
        );
    }

    #[tokio::test]
    async fn test_call_ok_with_invalid_json_is_decode_failure() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_, _| respond(200, "not json"));

        let err = client(transport)
            .call(Method::Get, "bulk/exports", None)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ApiError::Decode {
                body: "not json".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_call_rate_limit_is_not_counted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let mut transport = MockTransport::new();
        transport.expect_send().times(7).returning(move |_, _| {
            let n = calls_clone.fetch_add(1, Ordering::SeqCst);
            if n < 6 {
                respond(429, "")
            } else {
                respond(200, r#"{"result":"success"}"#)
            }
        });

        let result = client(transport)
            .call(Method::Get, "bulk/exports", None)
            .await
            .unwrap();

        assert_eq!(result, json!({"result": "success"}));
        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_call_rate_limit_bound_when_configured() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(3)
            .returning(|_, _| respond(429, ""));

        let policy = RetryPolicy {
            max_rate_limit_waits: Some(2),
            ..RetryPolicy::immediate()
        };
        let err = client(transport)
            .with_policy(policy)
            .call(Method::Get, "bulk/exports", None)
            .await
            .unwrap_err();

        assert_eq!(err, ApiError::RateLimited { waits: 2 });
    }

    #[tokio::test]
    async fn test_call_recovers_after_transport_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let mut transport = MockTransport::new();
        transport.expect_send().times(3).returning(move |_, _| {
            if calls_clone.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TransportError("timed out".to_string()))
            } else {
                respond(200, r#"{"result":"success","url":"https://files/x"}"#)
            }
        });

        let result = client(transport)
            .call(Method::Get, "bulk/exports/abc123", None)
            .await
            .unwrap();

        assert_eq!(result["url"], "https://files/x");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_call_other_status_exhausts_retries() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(3)
            .returning(|_, _| respond(500, "Internal Server Error"));

        let err = client(transport)
            .call(Method::Delete, "editor/items", None)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ApiError::ExhaustedRetries {
                attempts: 3,
                last: Some(LastFailure::Status(500)),
            }
        );
    }

    #[tokio::test]
    async fn test_call_with_no_attempts_allowed() {
        let mut transport = MockTransport::new();
        transport.expect_send().never();

        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::immediate()
        };
        let err = client(transport)
            .with_policy(policy)
            .call(Method::Get, "bulk/exports", None)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ApiError::ExhaustedRetries {
                attempts: 0,
                last: None
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_default_delays_for_each_condition() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(4)
            .returning(move |_, _| match calls_clone.fetch_add(1, Ordering::SeqCst) {
                0 => Err(TransportError("timed out".to_string())),
                1 => respond(429, ""),
                2 => respond(403, r#"{"message":"Permission denied"}"#),
                _ => respond(200, r#"{"result":"success"}"#),
            });

        let client = client(transport).with_policy(RetryPolicy::default());
        let start = tokio::time::Instant::now();
        let result = client.call(Method::Get, "bulk/exports", None).await.unwrap();

        assert_eq!(result, json!({"result": "success"}));
        // 15s transport + 40s rate limit + 15s forbidden
        assert_elapsed(start, Duration::from_secs(70));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_default_delays_until_exhausted() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(3)
            .returning(|_, _| respond(500, "Internal Server Error"));

        let client = client(transport).with_policy(RetryPolicy::default());
        let start = tokio::time::Instant::now();
        let err = client
            .call(Method::Get, "bulk/exports", None)
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::ExhaustedRetries { attempts: 3, .. }));
        // The loop also waits after the third failure before giving up.
        assert_elapsed(start, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_default_transport_delay() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(3)
            .returning(|_, _| Err(TransportError("connection refused".to_string())));

        let client = client(transport).with_policy(RetryPolicy::default());
        let start = tokio::time::Instant::now();
        client
            .call(Method::Get, "bulk/exports", None)
            .await
            .unwrap_err();

        assert_elapsed(start, Duration::from_secs(45));
    }

    #[tokio::test]
    async fn test_call_as_deserializes() {
        #[derive(serde::Deserialize)]
        struct Started {
            export_file: String,
        }

        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .returning(|_, _| respond(200, r#"{"result":"success","export_file":"f.csv"}"#));

        let started: Started = client(transport)
            .call_as(Method::Get, "bulk/exports", None)
            .await
            .unwrap();

        assert_eq!(started.export_file, "f.csv");
    }

    #[tokio::test]
    async fn test_call_against_mock_server() {
        let mut server = mockito::Server::new_async().await;

        let mock = server
            .mock("GET", "/v1/bulk/exports")
            .match_query(mockito::Matcher::UrlEncoded("mode".into(), "include".into()))
            .match_header("x-auth-integration", INTEGRATION_ID)
            .match_header("x-auth-token", "secret-token")
            .with_status(200)
            .with_body(r#"{"result":"success","export_file":"abc123"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&credentials(), Duration::from_secs(5))
            .unwrap()
            .with_base_url(&format!("{}/v1/", server.url()))
            .with_policy(RetryPolicy::immediate());

        let mut payload = Payload::new();
        payload.insert("mode".to_string(), json!("include"));
        let result = client
            .call(Method::Get, "bulk/exports", Some(&payload))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result["export_file"], "abc123");
    }
}
