//! HTTP exchange seam used by jobs.

use std::{error::Error as StdError, fmt};

use async_trait::async_trait;
use reqwest::{Client, redirect};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
        })
    }
}

/// A fully-built request ready for dispatch.
#[derive(Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    /// Sent as `Authorization: Bearer`.
    pub bearer_token: Option<String>,
    pub body: Option<Value>,
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("body", &self.body.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// A response whose body is `value` serialized as JSON.
    pub fn json(status: u16, value: &Value) -> Self {
        Self::new(status, value.to_string())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportErrorKind {
    /// The connection could not be established.
    Connect,
    /// Certificate validation or TLS handshake failed.
    Tls,
    /// The peer closed the connection before a full response.
    Closed,
    TimedOut,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
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

/// One request/response exchange. Dropping the future aborts it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Default transport on `reqwest` with rustls and certificate validation.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .use_rustls_tls()
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|err| map_reqwest_error(&err))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let HttpRequest {
            method,
            url,
            bearer_token,
            body,
        } = request;

        let mut builder = match method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
            Method::Put => self.client.put(url),
        };
        if let Some(token) = bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder.send().await.map_err(|err| map_reqwest_error(&err))?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|err| map_reqwest_error(&err))?;
        Ok(HttpResponse::new(status, body.to_vec()))
    }
}

fn map_reqwest_error(err: &reqwest::Error) -> TransportError {
    let chain = error_chain(err);
    let cause = Cause {
        connect: err.is_connect(),
        timeout: err.is_timeout(),
        body: err.is_body(),
    };
    TransportError::new(classify(cause, &chain), chain)
}

/// What `reqwest` reports about a failure without looking at its message.
#[derive(Debug, Clone, Copy, Default)]
struct Cause {
    connect: bool,
    timeout: bool,
    body: bool,
}

fn error_chain(err: &dyn StdError) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

/// Classify a transport failure. Only TLS failures need the cause chain;
/// `reqwest` reports them as plain connect errors.
fn classify(cause: Cause, chain: &str) -> TransportErrorKind {
    if cause.timeout {
        TransportErrorKind::TimedOut
    } else if cause.connect {
        let lowered = chain.to_ascii_lowercase();
        if ["certificate", "tls", "handshake", "unknownissuer"]
            .iter()
            .any(|needle| lowered.contains(needle))
        {
            TransportErrorKind::Tls
        } else {
            TransportErrorKind::Connect
        }
    } else if cause.body {
        TransportErrorKind::Closed
    } else {
        TransportErrorKind::Other
    }
}
