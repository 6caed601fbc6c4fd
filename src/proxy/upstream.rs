//! Outbound side of the relay.
//!
//! [`Upstream`] is the seam between the relay and the network: the relay hands
//! it a request whose body is still streaming in from the caller and gets back
//! a fully buffered response. [`HttpUpstream`] is the real implementation on
//! top of `reqwest`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::http::{Body, Headers, Method, StatusCode};

/// Connect timeout applied on top of the overall request timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from talking to the upstream.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to connect to upstream: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("upstream request timed out: {0}")]
    Timeout(#[source] reqwest::Error),

    #[error("upstream transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("request cannot be forwarded: {0}")]
    InvalidRequest(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            Self::Connect(e)
        } else if e.is_timeout() {
            Self::Timeout(e)
        } else {
            Self::Transport(e)
        }
    }
}

/// A request on its way to the upstream.
#[derive(Debug)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    /// End-to-end headers only; the client supplies `Host` and framing.
    pub headers: Headers,
    pub body: Body,
}

/// A complete upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Bytes,
}

/// Boxed future returned by [`Upstream::send`].
pub type UpstreamFuture<'a> =
    Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamError>> + Send + 'a>>;

/// Something that can carry a request to the upstream and buffer the answer.
///
/// Implementations must stream `request.body` in order and must not retry.
/// Dropping the returned future abandons the exchange.
pub trait Upstream: Send + Sync {
    fn send(&self, request: UpstreamRequest) -> UpstreamFuture<'_>;
}

/// [`Upstream`] backed by a shared `reqwest` client.
///
/// Redirects are returned to the caller rather than followed, and each
/// exchange is bounded by the timeout given to [`HttpUpstream::new`].
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::Client`] if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()
            .map_err(UpstreamError::Client)?;
        Ok(Self { client })
    }
}

impl Upstream for HttpUpstream {
    fn send(&self, request: UpstreamRequest) -> UpstreamFuture<'_> {
        Box::pin(async move {
            let UpstreamRequest {
                method,
                url,
                headers,
                body,
            } = request;

            let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
                .map_err(|_| UpstreamError::InvalidRequest(format!("method {method}")))?;
            let headers = to_header_map(&headers)?;

            let mut builder = self.client.request(method, url).headers(headers);
            if !body.is_empty() {
                builder = builder.body(reqwest::Body::wrap_stream(body));
            }

            let response = builder.send().await?;
            let status = StatusCode::from_u16(response.status().as_u16()).ok_or_else(|| {
                UpstreamError::InvalidRequest(format!("upstream status {}", response.status()))
            })?;
            let headers = from_header_map(response.headers());
            let body = response.bytes().await?;

            debug!(status = %status, bytes = body.len(), "upstream response buffered");
            Ok(UpstreamResponse {
                status,
                headers,
                body,
            })
        })
    }
}

fn to_header_map(headers: &Headers) -> Result<HeaderMap, UpstreamError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| UpstreamError::InvalidRequest(format!("header name {name:?}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| UpstreamError::InvalidRequest(format!("header value for {name}")))?;
        map.append(name, value);
    }
    Ok(map)
}

fn from_header_map(map: &HeaderMap) -> Headers {
    map.iter()
        .map(|(name, value)| {
            (
                name.as_str().to_owned(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}
