//! HTTP transport seam
//!
//! The core only hands a [`HttpRequest`] to a [`Transport`] and reads back a
//! status and body. [`ReqwestTransport`] is the production implementation;
//! tests plug in scripted transports.

use crate::error::{LoadgenError, Result};
use async_trait::async_trait;
use reqwest::{redirect, Client, Method};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Header name added by [`ReqwestTransport`] to every attempt
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Case-insensitive header map; later inserts replace earlier ones
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: BTreeMap<String, (String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries
            .insert(name.to_ascii_lowercase(), (name, value.into()));
    }

    /// Overlay every header of `layer` onto `self`
    pub fn extend<'a, I>(&mut self, layer: I)
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (name, value) in layer {
            self.insert(name.clone(), value.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(name, value)` with the name as first inserted
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// One fully built request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Operation key, used for log and metric tags
    pub name: String,
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: serde_json::Value,
    pub timeout: Duration,
}

/// What came back from the target
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Why no response was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    /// The request could not be built; sending it again cannot help
    InvalidRequest,
    Other,
}

impl TransportErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, TransportErrorKind::InvalidRequest)
    }
}

#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TransportError {}

/// Performs the literal request/response exchange
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HttpRequest)
        -> std::result::Result<HttpResponse, TransportError>;
}

/// reqwest-backed transport with connection reuse across all VUs
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(max_redirects: usize) -> Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::limited(max_redirects))
            .build()
            .map_err(|e| LoadgenError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: &HttpRequest,
    ) -> std::result::Result<HttpResponse, TransportError> {
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| {
                TransportError::new(
                    TransportErrorKind::InvalidRequest,
                    format!("invalid method '{}': {}", request.method, e),
                )
            })?;
        let has_body = !matches!(method, Method::GET | Method::HEAD | Method::DELETE);

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if !request.headers.contains(CORRELATION_HEADER) {
            builder = builder.header(CORRELATION_HEADER, Uuid::new_v4().to_string());
        }
        if has_body {
            let body = serde_json::to_vec(&request.body)
                .map_err(|e| TransportError::new(TransportErrorKind::InvalidRequest, e.to_string()))?;
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            let kind = if e.is_builder() {
                TransportErrorKind::InvalidRequest
            } else if e.is_timeout() {
                TransportErrorKind::Timeout
            } else if e.is_connect() {
                TransportErrorKind::Connect
            } else {
                TransportErrorKind::Other
            };
            TransportError::new(kind, e.to_string())
        })?;

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                debug!(operation = %request.name, error = %e, "Failed to read response body");
                String::new()
            }
        };

        Ok(HttpResponse { status, body })
    }
}
