//! Proxy relay: a read-through cache in front of a fixed upstream.
//!
//! For every inbound request the [`Relay`]:
//!
//! 1. resolves the request target against the [`ProxyTarget`] and derives the
//!    cache key `"<METHOD>:<upstream URL>"`;
//! 2. answers from the [`FileCache`] when a fresh entry exists;
//! 3. otherwise forwards the request through its [`Upstream`], streaming the
//!    inbound body, buffers the whole response, stores the body in the cache
//!    and relays status, headers and body to the caller.
//!
//! Cache hits are answered with `200 OK` and `Content-Type: application/json`
//! regardless of what the upstream originally returned; only the body is
//! stored.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use url::Url;

use crate::cache::FileCache;
use crate::http::{Method, Request, Response, StatusCode};

mod target;
mod upstream;

pub use target::{ProxyTarget, Scheme, TargetError};
pub use upstream::{
    HttpUpstream, Upstream, UpstreamError, UpstreamFuture, UpstreamRequest, UpstreamResponse,
};

/// How long upstream bodies stay fresh unless configured otherwise.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Content type of every cache hit.
const CACHED_CONTENT_TYPE: &str = "application/json";

/// Body sent to the caller when the upstream cannot be reached.
const UPSTREAM_FAILURE_BODY: &str = "An error occurred while proxying the request.";

/// Request headers that are meaningful only between the caller and the relay.
const NOT_FORWARDED: &[&str] = &["host", "expect"];

/// Builds the cache key for a request: `"<METHOD>:<upstream URL>"`.
///
/// # Examples
///
/// ```
/// use ttlproxy::http::Method;
/// use ttlproxy::proxy::cache_key;
/// use url::Url;
///
/// let url = Url::parse("https://target-server.com/foo").unwrap();
/// assert_eq!(cache_key(&Method::Get, &url), "GET:https://target-server.com/foo");
/// ```
pub fn cache_key(method: &Method, url: &Url) -> String {
    format!("{method}:{url}")
}

/// The request handler: cache lookup, forwarding, cache fill.
///
/// A `Relay` holds no per-request state; share it behind an [`Arc`] and call
/// [`handle`](Self::handle) from any number of tasks.
pub struct Relay {
    cache: FileCache,
    upstream: Arc<dyn Upstream>,
    target: ProxyTarget,
    ttl: Duration,
}

impl Relay {
    pub fn new(cache: FileCache, upstream: Arc<dyn Upstream>, target: ProxyTarget) -> Self {
        Self {
            cache,
            upstream,
            target,
            ttl: DEFAULT_TTL,
        }
    }

    /// Sets how long fetched bodies stay fresh.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    /// Resolves the request's upstream URL and cache key.
    ///
    /// # Errors
    ///
    /// Returns [`TargetError`] if the request target cannot be mapped onto the
    /// upstream unchanged.
    pub fn key_for(&self, request: &Request) -> Result<(Url, String), TargetError> {
        let url = self.target.url_for(request.path(), request.query_string())?;
        let key = cache_key(request.method(), &url);
        Ok((url, key))
    }

    /// Produces the response for one inbound request. Never fails: every error
    /// is turned into a response for this request alone.
    pub async fn handle(&self, request: Request) -> Response {
        let (url, key) = match self.key_for(&request) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(path = %request.path(), error = %e, "unroutable request target");
                return Response::new(StatusCode::BAD_REQUEST).body(format!("Bad Request: {e}"));
            }
        };

        match self.cache.get(&key).await {
            Ok(Some(payload)) => {
                info!(url = %url, "cache hit");
                return Response::new(StatusCode::OK)
                    .header("Content-Type", CACHED_CONTENT_TYPE)
                    .body_bytes(payload);
            }
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "cache read failed, treating as miss"),
        }

        info!(url = %url, "proxying request");
        let (method, headers, body) = request.into_parts();
        let is_head = method == Method::Head;
        let mut headers = headers.end_to_end();
        for name in NOT_FORWARDED {
            headers.remove(name);
        }

        let upstream_request = upstream::UpstreamRequest {
            method,
            url: url.clone(),
            headers,
            body,
        };

        let upstream_response = match self.upstream.send(upstream_request).await {
            Ok(response) => response,
            Err(e) => {
                error!(url = %url, error = %e, "error proxying request");
                return Response::new(StatusCode::INTERNAL_SERVER_ERROR)
                    .header("Content-Type", "text/plain")
                    .body(UPSTREAM_FAILURE_BODY);
            }
        };

        info!(url = %url, status = %upstream_response.status, "received upstream response");

        if let Err(e) = self
            .cache
            .set(&key, &upstream_response.body, self.ttl)
            .await
        {
            warn!(key = %key, error = %e, "cache write failed");
        }

        relay_response(upstream_response, is_head)
    }
}

// Framing headers are regenerated for the buffered body. A HEAD answer has no
// body to measure, so the upstream's advertised length is passed on.
fn relay_response(upstream: UpstreamResponse, is_head: bool) -> Response {
    let head_length = upstream
        .headers
        .get("content-length")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|_| is_head);

    let mut response = Response::new(upstream.status);
    for (name, value) in upstream.headers.end_to_end().iter() {
        if !name.eq_ignore_ascii_case("content-length") {
            response.add_header(name, value);
        }
    }
    let response = response.body_bytes(upstream.body);
    match head_length {
        Some(len) => response.head_content_length(len),
        None => response,
    }
}
