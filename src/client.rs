//! Remote cloud API client.
//!
//! The lifecycle driver and the resource handlers talk to the cloud
//! through the [`CloudApi`] capability: one action name, one JSON request,
//! one JSON response. [`HttpApi`] is the production implementation; tests
//! substitute scripted fakes or mocks.
//!
//! Implementations are responsible for mapping failures onto the crate
//! error taxonomy. Retry decisions live in the retry executor, never
//! here: a call is made exactly once per invocation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, trace};
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Capability for calling the remote cloud API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Calls `action` with a JSON payload and returns the JSON response.
    async fn call(&self, action: &str, payload: Value) -> Result<Value>;
}

/// HTTP implementation of [`CloudApi`].
///
/// Posts each action as JSON to `{endpoint}/api/v1/{Action}` with a
/// per-request correlation id. Response statuses map onto the taxonomy:
/// 429 is rate limiting (honoring `Retry-After`), 404 is not-found, 5xx
/// is a remote-internal fault, 401/403 is an auth failure, and any other
/// 4xx is an invalid request.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: Client,
    endpoint: Url,
    credentials: Option<(String, String)>,
}

impl HttpApi {
    /// Creates a client for `endpoint` with a 30 second request timeout.
    pub fn new(endpoint: Url) -> Result<Self> {
        Self::with_timeout(endpoint, Duration::from_secs(30))
    }

    /// Creates a client with an explicit request timeout.
    pub fn with_timeout(endpoint: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout / 2)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            credentials: None,
        })
    }

    /// Attaches access credentials sent with every call.
    pub fn with_credentials(
        mut self,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        self.credentials = Some((access_key.into(), secret_key.into()));
        self
    }

    fn action_url(&self, action: &str) -> Result<Url> {
        let base = self.endpoint.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{base}/api/v1/{action}"))?)
    }

    async fn error_for_status(action: &str, status: StatusCode, response: reqwest::Response) -> Error {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = response.text().await.unwrap_or_default();
        let (code, message) = parse_error_body(&body);

        match status {
            StatusCode::TOO_MANY_REQUESTS => Error::rate_limited(action, retry_after),
            StatusCode::NOT_FOUND => {
                let entity = if message.is_empty() {
                    action.to_string()
                } else {
                    message
                };
                Error::not_found(entity)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::auth(action, message),
            s if s.is_server_error() => Error::remote_internal(action, code, message),
            _ if code.starts_with("Quota") => Error::QuotaExceeded {
                resource: action.to_string(),
                message,
            },
            _ => Error::invalid_request(action, message),
        }
    }
}

/// Extracts the first error code and message from an API error body.
///
/// The API reports failures as `{"Errors": [{"Code": ..., "Message": ...}]}`;
/// anything else falls back to the raw body.
fn parse_error_body(body: &str) -> (String, String) {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        let code = parsed
            .pointer("/Errors/0/Code")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let message = parsed
            .pointer("/Errors/0/Message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if !code.is_empty() || !message.is_empty() {
            return (code, message);
        }
    }
    let raw: String = body.trim().chars().take(200).collect();
    (String::new(), raw)
}

#[async_trait]
impl CloudApi for HttpApi {
    async fn call(&self, action: &str, payload: Value) -> Result<Value> {
        let url = self.action_url(action)?;
        let request_id = Uuid::new_v4().to_string();
        debug!(action, request_id = %request_id, "calling cloud API");

        let mut request = self
            .client
            .post(url)
            .header("X-Request-Id", &request_id)
            .json(&payload);
        if let Some((access_key, secret_key)) = &self.credentials {
            request = request.basic_auth(access_key, Some(secret_key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::transport(action, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::error_for_status(action, status, response).await);
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| Error::transport(action, format!("invalid JSON response: {e}")))?;
        trace!(action, request_id = %request_id, "cloud API call succeeded");
        Ok(parsed)
    }
}

/// Extracts a string from a response payload by JSON pointer.
pub fn pluck_str(action: &str, payload: &Value, pointer: &str) -> Result<String> {
    payload
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| Error::Internal(format!("{action} response missing '{pointer}'")))
}

/// Extracts an array from a response payload by JSON pointer.
pub fn pluck_array(action: &str, payload: &Value, pointer: &str) -> Result<Vec<Value>> {
    payload
        .pointer(pointer)
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| Error::Internal(format!("{action} response missing '{pointer}'")))
}
