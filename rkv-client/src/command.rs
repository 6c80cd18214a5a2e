//! # Command Contract
//!
//! Purpose: The interface between a typed request and the machinery that
//! routes it: the cluster picks a node, the node runs the exchange, and the
//! command turns frames into a typed result.
//!
//! ## Design Principles
//! 1. **Exactly One Terminal Outcome**: Success is delivered from `decode`
//!    when it returns `Complete`; the two failure hooks take `Box<Self>`, so
//!    a command cannot be failed twice or used after failing.
//! 2. **Results Over Channels**: Callers hold a `ResponseHandle` (one
//!    result) or a `ResponseStream` (one item per streamed frame).
//! 3. **Retry State Lives On The Command**: `remaining_tries` moves with the
//!    command from node to node.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use rkv_common::{Frame, MessageCode};

use crate::error::{ClientError, ClientResult};

/// Commands travel between tasks boxed.
pub type BoxCommand = Box<dyn Command>;

// Lets tests `unwrap` results that carry a rejected command.
#[cfg(test)]
impl std::fmt::Debug for dyn Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Command").field(&self.name()).finish()
    }
}

/// What `decode` made of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// More response frames follow.
    More,
    /// The response is complete and the result has been delivered.
    Complete,
}

/// A request that can be executed against any node.
pub trait Command: Send + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Code of the request frame.
    fn request_code(&self) -> MessageCode;

    /// Code every reply frame must carry, apart from `ERROR_RESP`.
    fn response_code(&self) -> MessageCode;

    /// Request payload.
    fn encode_request(&self) -> Bytes;

    /// Called before every attempt's request goes out. Commands that build
    /// a result across frames drop whatever a failed attempt left behind.
    fn begin_attempt(&mut self) {}

    /// Consumes one reply frame. An error here is treated like a transport
    /// failure: the connection is discarded and the command may be retried.
    fn decode(&mut self, frame: Frame) -> ClientResult<Decoded>;

    /// The server answered with an error. Never retried.
    fn on_protocol_error(self: Box<Self>, error: ClientError);

    /// The command failed for good: transport failure with no tries left,
    /// no capacity anywhere, or the cluster is not running.
    fn on_transport_error(self: Box<Self>, error: ClientError);

    /// Attempts left; `None` until the cluster assigns its default.
    fn remaining_tries(&self) -> Option<u32>;

    fn set_remaining_tries(&mut self, tries: u32);

    /// Whether the server answers with several frames.
    fn is_streaming(&self) -> bool {
        false
    }

    /// Client-side deadline for one attempt, from send to final frame.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// True once part of a streamed result has reached the caller. Only
    /// read for streaming commands; such a command is not retried, since a
    /// replay would duplicate items.
    fn delivered_partial(&self) -> bool {
        false
    }

    /// True when nobody is waiting for the result any more.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Sending half for single-result commands.
#[derive(Debug)]
pub struct Reply<T> {
    tx: Option<oneshot::Sender<ClientResult<T>>>,
}

impl<T> Reply<T> {
    /// Creates a reply and the handle the caller awaits.
    pub fn channel() -> (Self, ResponseHandle<T>) {
        let (tx, rx) = oneshot::channel();
        (Reply { tx: Some(tx) }, ResponseHandle { rx })
    }

    /// Delivers the result; later calls are ignored.
    pub fn send(&mut self, result: ClientResult<T>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// Future resolving to a command's result.
#[derive(Debug)]
pub struct ResponseHandle<T> {
    rx: oneshot::Receiver<ClientResult<T>>,
}

impl<T> Future for ResponseHandle<T> {
    type Output = ClientResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The command was dropped without an outcome.
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Sending half for streaming commands.
#[derive(Debug)]
pub struct StreamReply<T> {
    tx: Option<mpsc::UnboundedSender<ClientResult<T>>>,
    delivered: bool,
}

impl<T> StreamReply<T> {
    pub fn channel() -> (Self, ResponseStream<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            StreamReply {
                tx: Some(tx),
                delivered: false,
            },
            ResponseStream { rx },
        )
    }

    /// Delivers one partial result.
    pub fn item(&mut self, item: T) {
        if let Some(tx) = &self.tx {
            self.delivered = true;
            let _ = tx.send(Ok(item));
        }
    }

    /// Delivers the last item and closes the stream.
    pub fn finish(&mut self, item: T) {
        self.item(item);
        self.tx = None;
    }

    /// Delivers an error and closes the stream.
    pub fn fail(&mut self, error: ClientError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(error));
        }
    }

    /// True once any item has been delivered.
    pub fn delivered(&self) -> bool {
        self.delivered
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// Receiving half of a streamed result. Ends after the final item or an
/// error.
#[derive(Debug)]
pub struct ResponseStream<T> {
    rx: mpsc::UnboundedReceiver<ClientResult<T>>,
}

impl<T> ResponseStream<T> {
    /// Next item, or `None` once the stream is finished.
    pub async fn next(&mut self) -> Option<ClientResult<T>> {
        self.rx.recv().await
    }

    /// Collects every item, stopping at the first error.
    pub async fn collect(mut self) -> ClientResult<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }
}

/// Retry bookkeeping shared by the built-in commands.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Attempts {
    pub(crate) remaining: Option<u32>,
    pub(crate) timeout: Option<Duration>,
}
