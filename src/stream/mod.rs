//! Server streaming.
//!
//! A server-streaming method returns a [`ResponseStream`]: a sequence of
//! messages that may end with an error. The dispatcher frames each message as
//! it arrives and finishes with a trailer. The usual producer runs on its own
//! task and feeds a bounded [`channel`]; the channel capacity is the
//! backpressure between producer and connection, and a dropped response
//! (client gone) makes [`StreamSender::send`] fail so the producer can stop.
//!
//! A channel stream ends cleanly only after [`StreamSender::finish`]. If the
//! producer drops its senders without finishing or failing (an early return,
//! a panic), the stream ends with an Internal error instead.
//!
//! ## Module Organization
//!
//! - `frame` - binary frame encoding/decoding
//! - `reader` - client-side [`StreamReader`] for both encodings

pub mod frame;
pub mod reader;

pub use reader::StreamReader;

use crate::error::Error;
use futures_util::Stream;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context as TaskContext, Poll};
use thiserror::Error;
use tokio::sync::mpsc;

/// Messages produced by a server-streaming method.
pub struct ResponseStream<T> {
    inner: BoxStream<'static, Result<T, Error>>,
}

impl<T: Send + 'static> ResponseStream<T> {
    /// Wraps any stream of results. The first `Err` ends the stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<T, Error>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
        }
    }

    /// Stream over already computed messages.
    pub fn from_messages<I>(messages: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::new(stream::iter(messages.into_iter().map(Ok)))
    }

    /// Stream with no messages; ends cleanly.
    pub fn empty() -> Self {
        Self::new(stream::empty())
    }
}

impl<T> Stream for ResponseStream<T> {
    type Item = Result<T, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<T> fmt::Debug for ResponseStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream").finish_non_exhaustive()
    }
}

/// The response side of a stream went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("response stream closed")]
pub struct StreamClosed;

/// Message of the error ending a stream whose producer went away early.
pub const PRODUCER_ENDED_EARLY: &str = "stream producer ended without completing";

/// Producer half of [`channel`].
pub struct StreamSender<T> {
    tx: mpsc::Sender<Result<T, Error>>,
    finished: Arc<AtomicBool>,
}

impl<T> Clone for StreamSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            finished: Arc::clone(&self.finished),
        }
    }
}

impl<T: Send + 'static> StreamSender<T> {
    /// Queues a message, waiting while the queue is full.
    pub async fn send(&self, message: T) -> Result<(), StreamClosed> {
        self.tx.send(Ok(message)).await.map_err(|_| StreamClosed)
    }

    /// Marks the stream complete. Once the remaining clones are dropped
    /// the response ends with a success trailer.
    pub fn finish(self) {
        self.finished.store(true, Ordering::Release);
    }

    /// Ends the stream with `err`; it becomes the trailer.
    pub async fn fail(self, err: Error) -> Result<(), StreamClosed> {
        self.finished.store(true, Ordering::Release);
        self.tx.send(Err(err)).await.map_err(|_| StreamClosed)
    }

    /// Resolves once the response side has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Bounded channel feeding a [`ResponseStream`].
///
/// The stream ends cleanly once a sender has called
/// [`StreamSender::finish`] and every sender is dropped. Dropping them all
/// without finishing ends it with an Internal error.
pub fn channel<T: Send + 'static>(capacity: usize) -> (StreamSender<T>, ResponseStream<T>) {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));
    let finished = Arc::new(AtomicBool::new(false));
    let completion = Arc::clone(&finished);
    let mut ended = false;

    let stream = stream::poll_fn(move |cx| {
        if ended {
            return Poll::Ready(None);
        }
        match rx.poll_recv(cx) {
            Poll::Ready(None) => {
                ended = true;
                if completion.load(Ordering::Acquire) {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Err(Error::internal(PRODUCER_ENDED_EARLY))))
                }
            }
            other => other,
        }
    });
    (StreamSender { tx, finished }, ResponseStream::new(stream))
}
