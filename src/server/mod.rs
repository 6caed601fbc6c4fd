//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler function.
//! Supports HTTP/1.1 persistent connections (keep-alive) out of the box.
//!
//! The handler for each request runs in its own task as soon as the request
//! head is parsed. Meanwhile the connection task feeds the request body into
//! the handler's [`Body`] stream and, once the body is done, watches the socket.
//! A peer that half-closes still gets its response. If the connection fails
//! before the response is ready, the handler task is aborted along with
//! whatever upstream exchange it was driving, and a response that cannot be
//! written drops the connection.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::http::{
    Body, StatusCode,
    body::BodySender,
    request::{BodyFraming, Request, RequestError},
    response::Response,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a request head we will buffer before rejecting it (64 KiB).
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

const CONTINUE_LINE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// The relay's HTTP server.
///
/// Binds to a TCP address and dispatches incoming HTTP/1.1 requests to a
/// handler function.
///
/// # Examples
///
/// ```rust,no_run
/// use ttlproxy::server::Server;
/// use ttlproxy::http::{Request, Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(|_req: Request| async {
///         Response::new(StatusCode::OK).body("Hello!")
///     }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// The handler receives a [`Request`] whose body may still be arriving and
    /// must return a [`Future`] that resolves to a [`Response`]. It is shared
    /// across all connection tasks, so it must be `Send + Sync + 'static`.
    ///
    /// This method runs until the process is terminated or the returned future
    /// is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);
        info!(address = %self.local_addr, "proxy listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, serving one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`.
async fn handle_connection<H, F>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        // Accumulate until a complete head is buffered.
        let (request, head_len) = loop {
            if !buf.is_empty() {
                match Request::parse(&buf) {
                    Ok(pair) => break pair,
                    Err(RequestError::Incomplete) => {}
                    Err(e) => {
                        warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                        let response = Response::new(StatusCode::BAD_REQUEST)
                            .body(format!("Bad Request: {e}"))
                            .keep_alive(false);
                        writer.write_all(&response.into_bytes()).await?;
                        return Ok(());
                    }
                }
            }

            if buf.len() > MAX_HEAD_SIZE {
                warn!(peer = %peer_addr, "request head too large, sending 431");
                let response = Response::new(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
                    .body("Request header fields too large")
                    .keep_alive(false);
                writer.write_all(&response.into_bytes()).await?;
                return Ok(());
            }

            if reader.read_buf(&mut buf).await? == 0 {
                debug!(peer = %peer_addr, "connection closed by peer");
                return Ok(());
            }
        };
        buf.advance(head_len);

        let framing = match request.body_framing() {
            Ok(framing) => framing,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "unframeable body, sending 400");
                let response = Response::new(StatusCode::BAD_REQUEST)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                writer.write_all(&response.into_bytes()).await?;
                return Ok(());
            }
        };

        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        if framing != BodyFraming::Empty && request.expects_continue() {
            writer.write_all(CONTINUE_LINE).await?;
        }

        let (request, body_tx) = match framing {
            BodyFraming::Empty => (request, None),
            _ => {
                let (tx, body) = Body::channel();
                (request.with_body(body), Some(tx))
            }
        };

        let mut task = tokio::spawn(handler(request));

        if let Some(tx) = body_tx {
            if let Err(e) = pump_body(&mut reader, &mut buf, framing, &tx).await {
                // Poison the stream so the upstream never sees a silently
                // truncated body, then give up on the connection.
                let _ = tx.send(Err(io::Error::new(e.kind(), e.to_string()))).await;
                task.abort();
                warn!(peer = %peer_addr, error = %e, "request body interrupted");
                return Ok(());
            }
        }

        // EOF only ends the caller's sending side; a half-closed peer still
        // reads the response. A read error means the connection is gone.
        let mut read_closed = false;
        let joined = loop {
            tokio::select! {
                joined = &mut task => break joined,
                read = reader.read_buf(&mut buf), if !read_closed && buf.len() <= MAX_HEAD_SIZE => {
                    match read {
                        Ok(0) => {
                            debug!(peer = %peer_addr, "peer half-closed, awaiting response");
                            read_closed = true;
                        }
                        Err(e) => {
                            task.abort();
                            debug!(peer = %peer_addr, error = %e, "peer went away, abandoning request");
                            return Ok(());
                        }
                        // Pipelined bytes; they wait in `buf` for the next iteration.
                        Ok(_) => {}
                    }
                }
            }
        };

        let response = match joined {
            Ok(response) => response,
            Err(e) => {
                error!(peer = %peer_addr, error = %e, "handler task failed");
                Response::new(StatusCode::INTERNAL_SERVER_ERROR).body("Internal Server Error")
            }
        };

        let keep_alive = keep_alive && !read_closed;
        writer
            .write_all(&response.keep_alive(keep_alive).into_bytes())
            .await?;
        writer.flush().await?;

        if !keep_alive {
            debug!(peer = %peer_addr, "connection close requested");
            break;
        }
    }

    Ok(())
}

/// Forwards one request body from the socket into `tx`, in order.
///
/// `buf` holds whatever was read past the head; on return it holds whatever
/// was read past the body. If the handler has dropped its end of the body the
/// remaining bytes are still consumed so the connection stays in sync.
async fn pump_body<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    framing: BodyFraming,
    tx: &BodySender,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    match framing {
        BodyFraming::Empty => Ok(()),
        BodyFraming::Length(len) => forward_exact(reader, buf, len, tx).await,
        BodyFraming::Chunked => loop {
            let size = loop {
                match httparse::parse_chunk_size(buf) {
                    Ok(httparse::Status::Complete((offset, size))) => {
                        buf.advance(offset);
                        break size;
                    }
                    Ok(httparse::Status::Partial) => read_more(reader, buf).await?,
                    Err(_) => return Err(invalid_data("malformed chunk size")),
                }
            };

            if size == 0 {
                return skip_trailers(reader, buf).await;
            }

            forward_exact(reader, buf, size, tx).await?;

            while buf.len() < 2 {
                read_more(reader, buf).await?;
            }
            if &buf[..2] != b"\r\n" {
                return Err(invalid_data("missing CRLF after chunk data"));
            }
            buf.advance(2);
        },
    }
}

async fn forward_exact<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    mut remaining: u64,
    tx: &BodySender,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    while remaining > 0 {
        if buf.is_empty() {
            read_more(reader, buf).await?;
        }
        let take = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let chunk = buf.split_to(take).freeze();
        remaining -= take as u64;
        // A closed receiver means the handler no longer wants the body.
        let _ = tx.send(Ok(chunk)).await;
    }
    Ok(())
}

// Trailer fields are dropped; the section ends at the first empty line.
async fn skip_trailers<R>(reader: &mut R, buf: &mut BytesMut) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        match buf.windows(2).position(|w| w == b"\r\n") {
            Some(0) => {
                buf.advance(2);
                return Ok(());
            }
            Some(pos) => buf.advance(pos + 2),
            None if buf.len() > MAX_HEAD_SIZE => return Err(invalid_data("trailer section too large")),
            None => read_more(reader, buf).await?,
        }
    }
}

async fn read_more<R>(reader: &mut R, buf: &mut BytesMut) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    if reader.read_buf(buf).await? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-body",
        ));
    }
    Ok(())
}

fn invalid_data(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
