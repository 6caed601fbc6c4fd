//! Inbound request bodies.
//!
//! The connection task reads body bytes off the socket while the handler is
//! already running, so a [`Body`] is usually the receiving end of a bounded
//! channel. It implements [`Stream`] so it can be handed straight to an
//! outbound client without being buffered.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

/// Chunks in flight between the connection task and the handler.
const CHANNEL_CAPACITY: usize = 16;

/// Producer half of a streaming [`Body`], owned by the connection task.
pub type BodySender = mpsc::Sender<io::Result<Bytes>>;

/// A request body: absent, fully buffered, or streamed from the connection.
///
/// # Examples
///
/// ```
/// use ttlproxy::http::Body;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let (tx, body) = Body::channel();
/// tokio::spawn(async move {
///     tx.send(Ok("hello ".into())).await.unwrap();
///     tx.send(Ok("world".into())).await.unwrap();
/// });
/// assert_eq!(&body.collect().await.unwrap()[..], b"hello world");
/// # }
/// ```
#[derive(Debug, Default)]
pub struct Body {
    kind: Kind,
}

#[derive(Debug, Default)]
enum Kind {
    #[default]
    Empty,
    Full(Option<Bytes>),
    Streaming(mpsc::Receiver<io::Result<Bytes>>),
}

impl Body {
    /// A body with no content.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A body whose content is already in memory.
    pub fn full(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Self::empty();
        }
        Self {
            kind: Kind::Full(Some(bytes)),
        }
    }

    /// Creates a streaming body and the sender that feeds it.
    ///
    /// The stream ends when every sender is dropped. Sending an `Err` makes
    /// the consumer see a truncated body.
    pub fn channel() -> (BodySender, Self) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            tx,
            Self {
                kind: Kind::Streaming(rx),
            },
        )
    }

    /// Returns `true` if the body is known to carry no bytes.
    pub fn is_empty(&self) -> bool {
        matches!(self.kind, Kind::Empty)
    }

    /// Reads the whole body into memory.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by the stream.
    pub async fn collect(mut self) -> io::Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Stream for Body {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.get_mut().kind {
            Kind::Empty => Poll::Ready(None),
            Kind::Full(bytes) => Poll::Ready(bytes.take().map(Ok)),
            Kind::Streaming(rx) => rx.poll_recv(cx),
        }
    }
}
