//! HTTP transport for the collector and orchestration endpoints.
//!
//! Everything that leaves the process goes through the [`Transport`] trait.
//! The production implementation, [`HttpTransport`], wraps a pooled
//! `reqwest::Client` bound to a base URL; tests substitute an in-memory
//! implementation.
//!
//! # Failure Classification
//!
//! | Variant | Cause |
//! |---------|-------|
//! | [`TransportError::Connection`] | Connection refused/reset, DNS failure |
//! | [`TransportError::Timeout`] | Request exceeded the client timeout |
//! | [`TransportError::Unauthorized`] | HTTP 401 |
//! | [`TransportError::Status`] | Any other non-2xx status |
//! | [`TransportError::Rejected`] | 2xx JSON body carrying an `error` field |
//! | [`TransportError::Malformed`] | Body was not JSON |

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors produced by a single request.
///
/// None of these are retried by the transport itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Could not reach the remote at all.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The request timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The remote answered 401.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The remote answered with a non-success status other than 401.
    #[error("Request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    /// The remote answered 2xx but the JSON body carried an `error` field.
    #[error("Rejected by remote: {0}")]
    Rejected(String),

    /// The body could not be parsed as JSON.
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl TransportError {
    /// The HTTP status attached to this failure, if the remote answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Unauthorized(_) => Some(401),
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns `true` when the request never got an HTTP answer.
    pub fn is_transport_level(&self) -> bool {
        matches!(
            self,
            TransportError::Connection(_) | TransportError::Timeout(_)
        )
    }
}

/// HTTP method of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        }
    }
}

/// Authentication attached to a request.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Auth {
    #[default]
    None,
    Bearer(String),
    Basic {
        user: String,
        password: Option<String>,
    },
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::None => write!(f, "None"),
            Auth::Bearer(_) => write!(f, "Bearer(<redacted>)"),
            Auth::Basic { user, .. } => write!(f, "Basic({user}, <redacted>)"),
        }
    }
}

/// A request relative to the transport's base URL.
///
/// Absolute `http://` / `https://` paths bypass the base URL.
///
/// # Example
///
/// ```
/// use testlens::transport::{Auth, Method, Request};
///
/// let req = Request::post("/api/v1/event", serde_json::json!({"event_type": "LogCreated"}))
///     .auth(Auth::Bearer("token".to_string()))
///     .header("X-Client", "testlens");
///
/// assert_eq!(req.method, Method::Post);
/// assert_eq!(req.headers.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub auth: Auth,
    pub headers: Vec<(String, String)>,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            body: None,
            auth: Auth::None,
            headers: Vec::new(),
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            body: Some(body),
            auth: Auth::None,
            headers: Vec::new(),
        }
    }

    pub fn auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Sends one request and returns the parsed JSON body.
///
/// An empty 2xx body is returned as [`Value::Null`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> TransportResult<Value>;
}

/// [`Transport`] backed by a pooled `reqwest::Client`.
///
/// Connections are kept alive and reused across requests. Create one
/// instance per connection pool you want; the uploader keeps a second
/// instance for screenshots so large payloads don't queue small ones.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Creates a transport for `base_url` with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("testlens/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| TransportError::Connection(format!("Failed to build client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: Request) -> TransportResult<Value> {
        let url = join_url(&self.base_url, &request.path);
        debug!("{:?} {}", request.method, url);

        let mut builder = self.client.request(request.method.into(), &url);
        builder = match &request.auth {
            Auth::None => builder,
            Auth::Bearer(token) => builder.bearer_auth(token),
            Auth::Basic { user, password } => builder.basic_auth(user, password.as_ref()),
        };
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(classify)?;

        parse_response(status, &text)
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else {
        TransportError::Connection(err.to_string())
    }
}

/// Joins a base URL and a relative path. Absolute paths pass through.
pub fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Classifies a status + body pair into a JSON value or a [`TransportError`].
pub fn parse_response(status: u16, body: &str) -> TransportResult<Value> {
    if status == 401 {
        return Err(TransportError::Unauthorized(body.to_string()));
    }
    if !(200..300).contains(&status) {
        return Err(TransportError::Status {
            status,
            body: body.to_string(),
        });
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }

    let value: Value =
        serde_json::from_str(body).map_err(|e| TransportError::Malformed(e.to_string()))?;

    match value.get("error") {
        None | Some(Value::Null) => Ok(value),
        Some(Value::String(msg)) => Err(TransportError::Rejected(msg.clone())),
        Some(other) => Err(TransportError::Rejected(other.to_string())),
    }
}
