//! # ttlproxy
//!
//! An async HTTP/1.1 relay that forwards every request to one fixed upstream
//! and keeps each upstream response body on disk for a short time-to-live.
//! Requests are keyed by method and upstream URL; a fresh entry is served
//! without touching the upstream.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use ttlproxy::cache::FileCache;
//! use ttlproxy::proxy::{HttpUpstream, ProxyTarget, Relay, Scheme};
//! use ttlproxy::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = FileCache::open("./cache").await?;
//!     let upstream = Arc::new(HttpUpstream::new(Duration::from_secs(30))?);
//!     let target = ProxyTarget::new(Scheme::Https, "target-server.com", 443)?;
//!     let relay = Arc::new(Relay::new(cache, upstream, target));
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server.run(move |req| {
//!         let relay = Arc::clone(&relay);
//!         async move { relay.handle(req).await }
//!     }).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod http;
pub mod proxy;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheError, FileCache};
pub use config::{Config, ConfigError};
pub use http::{Body, Headers, Method, Request, Response, StatusCode};
pub use proxy::{HttpUpstream, ProxyTarget, Relay, Scheme, TargetError, Upstream, UpstreamError};
pub use server::{Server, ServerError};
