//! Request descriptors for the SureDone API.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Key/value payload attached to a call.
///
/// Sent as query parameters for GET and as a JSON body for everything else.
pub type Payload = BTreeMap<String, Value>;

/// HTTP verbs accepted by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Put => reqwest::Method::PUT,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A single call as described by the caller. Not retained after the call.
#[derive(Debug, Clone)]
pub struct ApiRequest<'a> {
    pub method: Method,
    pub endpoint: &'a str,
    pub payload: Option<&'a Payload>,
}

/// A request resolved against the base URL, ready for a transport.
///
/// Built once per call and resent unchanged on every attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<String>,
}

impl PreparedRequest {
    pub fn new(base_url: &str, request: &ApiRequest<'_>) -> Self {
        let url = format!("{}{}", base_url, request.endpoint.trim_start_matches('/'));

        match request.method {
            Method::Get => Self {
                method: request.method,
                url,
                query: request.payload.map(query_pairs).unwrap_or_default(),
                body: None,
            },
            _ => Self {
                method: request.method,
                url,
                query: Vec::new(),
                body: Some(json_body(request.payload)),
            },
        }
    }
}

fn query_pairs(payload: &Payload) -> Vec<(String, String)> {
    payload
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

fn json_body(payload: Option<&Payload>) -> String {
    match payload {
        // A map of JSON values always serialises.
        Some(payload) => Value::Object(payload.clone().into_iter().collect()).to_string(),
        None => Value::Null.to_string(),
    }
}
