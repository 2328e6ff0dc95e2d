//! Request/response transport the middleware sits on.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde_json::Value;
use tracing::debug;

use crate::error::{SessionError, SessionResult};

/// One outgoing call, independent of the HTTP library.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base URL, starting with `/`.
    pub path: String,
    pub body: Option<Value>,
    pub bearer: Option<String>,
    /// How many times this request has been replayed after a refresh.
    pub replays: u8,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            bearer: None,
            replays: 0,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into `SessionError::Http`.
    pub fn error_for_status(self) -> SessionResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(SessionError::from_status(self.status, &self.body.to_string()))
        }
    }
}

/// Sends a request and reports the server's answer. Every HTTP status is an
/// `Ok` response; only failures to get an answer at all are errors.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: ApiRequest) -> SessionResult<ApiResponse>;
}

/// Production transport over `reqwest`.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> SessionResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: ApiRequest) -> SessionResult<ApiResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        debug!(method = %request.method, url = %url, replays = request.replays, "Sending request");

        let mut builder = self
            .client
            .request(request.method, &url)
            .header(header::ACCEPT, "application/json");
        if let Some(ref token) = request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(ApiResponse { status, body })
    }
}
