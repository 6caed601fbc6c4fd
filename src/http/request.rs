//! HTTP/1.1 request parsing using the [`httparse`] crate.
//!
//! Only the request head is parsed here. The body is framed by
//! [`Request::body_framing`] and delivered separately as a [`Body`] stream.

use thiserror::Error;

use super::{Body, Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request head.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("unsupported Transfer-Encoding: {0}")]
    UnsupportedTransferEncoding(String),
}

/// How the body following a request head is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head.
    Empty,
    /// Exactly this many bytes follow.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
}

/// A parsed HTTP/1.1 request.
///
/// Created by [`Request::parse`] from a raw byte buffer holding at least the
/// complete head. The body starts out empty; the server attaches the streamed
/// body with [`Request::with_body`].
///
/// # Examples
///
/// ```
/// use ttlproxy::http::request::Request;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.query_string(), Some("name=world"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    body: Body,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Parse a raw HTTP/1.1 request head from a byte slice.
    ///
    /// Returns the parsed `Request` and the byte offset at which the body begins
    /// in `buf` (i.e. immediately after the `\r\n\r\n` header terminator).
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed to complete the request headers.
    /// - [`RequestError::Parse`]: the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`]: a required field (method, path, version) is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = match raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse::<Method>()
        {
            Ok(method) => method,
            Err(never) => match never {},
        };

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let (path, query) = match raw_path.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (raw_path.to_owned(), None),
        };

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            let value = String::from_utf8_lossy(header.value);
            header_map.insert(header.name, value);
        }

        Ok((
            Self {
                method,
                path,
                version,
                headers: header_map,
                query,
                body: Body::empty(),
            },
            body_offset,
        ))
    }

    /// Builds a request programmatically, e.g. for driving a handler directly.
    pub fn new(method: Method, target: &str, headers: Headers, body: Body) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (target.to_owned(), None),
        };
        Self {
            method,
            path,
            version: 1,
            headers,
            query,
            body,
        }
    }

    /// Attaches a body, replacing the current one.
    #[must_use]
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    ///
    /// For absolute-form targets (`GET http://host/x HTTP/1.1`) this is the
    /// whole URL up to the `?`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the request body.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Splits the request into its method, headers, and body.
    pub fn into_parts(self) -> (Method, Headers, Body) {
        (self.method, self.headers, self.body)
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        let mut tokens = self
            .headers
            .get_all("connection")
            .flat_map(|v| v.split(','))
            .map(str::trim);
        if self.version == 1 {
            !tokens.any(|t| t.eq_ignore_ascii_case("close"))
        } else {
            tokens.any(|t| t.eq_ignore_ascii_case("keep-alive"))
        }
    }

    /// Returns `true` if the client asked for an interim `100 Continue`.
    pub fn expects_continue(&self) -> bool {
        self.version == 1
            && self
                .headers
                .get("expect")
                .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
    }

    /// Determines how the body that follows the head is delimited.
    ///
    /// `Transfer-Encoding` wins over `Content-Length` (RFC 9112 §6.3). Only
    /// `chunked` as the final coding is accepted; conflicting or unparsable
    /// `Content-Length` values are rejected.
    ///
    /// # Errors
    ///
    /// - [`RequestError::UnsupportedTransferEncoding`]: a transfer coding other
    ///   than a final `chunked`.
    /// - [`RequestError::InvalidContentLength`]: malformed or conflicting lengths.
    pub fn body_framing(&self) -> Result<BodyFraming, RequestError> {
        let codings: Vec<&str> = self
            .headers
            .get_all("transfer-encoding")
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect();

        if let Some(last) = codings.last() {
            return if last.eq_ignore_ascii_case("chunked") {
                Ok(BodyFraming::Chunked)
            } else {
                Err(RequestError::UnsupportedTransferEncoding(codings.join(", ")))
            };
        }

        let mut length = None;
        for value in self.headers.get_all("content-length") {
            let parsed: u64 = value
                .trim()
                .parse()
                .map_err(|_| RequestError::InvalidContentLength)?;
            if length.is_some_and(|l| l != parsed) {
                return Err(RequestError::InvalidContentLength);
            }
            length = Some(parsed);
        }

        Ok(match length {
            None | Some(0) => BodyFraming::Empty,
            Some(n) => BodyFraming::Length(n),
        })
    }
}
