//! The fixed upstream the relay forwards to.

use std::fmt;

use thiserror::Error;
use url::Url;

/// A request target that cannot be forwarded as sent.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("invalid request target: {0}")]
    Invalid(#[from] url::ParseError),

    /// The path holds `.`/`..` segments (in any spelling) or backslashes,
    /// which URL normalization would resolve into a different path.
    #[error("request path {0:?} is not in normal form")]
    NonCanonicalPath(String),
}

/// URL scheme spoken to the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream scheme, host and port.
///
/// # Examples
///
/// ```
/// use ttlproxy::proxy::{ProxyTarget, Scheme};
///
/// let target = ProxyTarget::new(Scheme::Https, "target-server.com", 443).unwrap();
/// let url = target.url_for("/foo", Some("a=1")).unwrap();
/// assert_eq!(url.as_str(), "https://target-server.com/foo?a=1");
/// ```
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    base: Url,
}

impl ProxyTarget {
    /// Validates the parts and builds the target.
    ///
    /// # Errors
    ///
    /// Returns [`url::ParseError`] if `host` is not a valid host name or address.
    pub fn new(scheme: Scheme, host: &str, port: u16) -> Result<Self, url::ParseError> {
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_owned()
        };
        let base = Url::parse(&format!("{scheme}://{host}:{port}/"))?;
        if base.host().is_none() {
            return Err(url::ParseError::EmptyHost);
        }
        Ok(Self { base })
    }

    pub fn scheme(&self) -> &str {
        self.base.scheme()
    }

    /// `host[:port]` as it appears in upstream URLs; default ports are elided.
    pub fn authority(&self) -> String {
        let host = self.base.host_str().unwrap_or_default();
        match self.base.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        }
    }

    /// Resolves an inbound request target against the upstream.
    ///
    /// Only the path and query of `path` are used. An absolute-form target
    /// (`http://elsewhere/x`) is reduced to its path, so every request lands on
    /// the fixed upstream. The path is forwarded as sent; characters not
    /// allowed raw in a URL path are percent-encoded, nothing else changes.
    ///
    /// # Errors
    ///
    /// - [`TargetError::Invalid`]: `path` is neither origin-form nor a parsable
    ///   absolute URL.
    /// - [`TargetError::NonCanonicalPath`]: the path has dot segments or
    ///   backslashes. The upstream would be sent a different path than the
    ///   caller asked for, so these are refused instead of rewritten.
    pub fn url_for(&self, path: &str, query: Option<&str>) -> Result<Url, TargetError> {
        if !is_normal_path(path) {
            return Err(TargetError::NonCanonicalPath(path.to_owned()));
        }

        let mut url = self.base.clone();

        let is_absolute = path
            .split_once("://")
            .is_some_and(|(scheme, _)| scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https"));

        if is_absolute {
            let inbound = Url::parse(path)?;
            url.set_path(inbound.path());
        } else if path.starts_with('/') {
            url.set_path(path);
        } else if path == "*" {
            url.set_path("/");
        } else {
            return Err(url::ParseError::RelativeUrlWithoutBase.into());
        }

        url.set_query(query);
        Ok(url)
    }
}

// Dot segments as the URL standard recognizes them, percent-encoded dots
// included; `\` is a path separator for http(s).
fn is_normal_path(path: &str) -> bool {
    !path.contains('\\')
        && !path.split('/').any(|segment| {
            matches!(
                segment.to_ascii_lowercase().as_str(),
                "." | ".." | "%2e" | ".%2e" | "%2e." | "%2e%2e"
            )
        })
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme(), self.authority())
    }
}
