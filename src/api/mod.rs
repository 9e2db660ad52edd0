//! SureDone REST client with built-in retry logic and response classification.

mod client;
mod error;
mod request;
mod retry;
mod transport;

pub use client::{ApiClient, API_ENDPOINT, INTEGRATION_ID};
pub use error::{ApiError, LastFailure};
pub use request::{ApiRequest, Method, Payload, PreparedRequest};
pub use retry::{classify, RetryPolicy, Verdict, ACCOUNT_EXPIRED_MESSAGE, MAX_RETRIES};
pub use transport::{RawResponse, ReqwestTransport, Transport, TransportError};

#[cfg(test)]
pub use transport::MockTransport;
