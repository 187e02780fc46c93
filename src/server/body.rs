//! Response body for dispatched requests.
//!
//! [`ResponseBody`] is the only body type the dispatcher produces. Besides
//! carrying bytes it ends the request lifecycle: once the transport has
//! taken the last frame, or has dropped the body, it fires `ResponseSent`
//! and cancels the request context. Streams are framed lazily, one message
//! per poll, so the connection's write readiness is the producer's
//! backpressure.

use crate::codec::Codec;
use crate::context::Context;
use crate::error::envelope::marshal_error;
use crate::error::{Error, ErrorCode};
use crate::hooks::ServerHooks;
use crate::stream::frame::{encode_message, encode_trailer};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::Stream;
use futures_util::stream::BoxStream;
use http_body::{Body, Frame, SizeHint};
use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tracing::{debug, error, warn};

/// Boxed panic payload kept until the response is finished.
pub(crate) type PanicPayload = Box<dyn Any + Send>;

enum State {
    Full {
        data: Option<Bytes>,
        /// Write failures are reported only for success responses.
        success: bool,
    },
    Stream {
        messages: BoxStream<'static, Result<Bytes, Error>>,
        codec: Codec,
        sent: usize,
    },
    Done,
}

struct Lifecycle {
    ctx: Context,
    hooks: ServerHooks,
}

/// Body of every response produced by [`crate::server::Server`].
pub struct ResponseBody {
    state: State,
    lifecycle: Option<Lifecycle>,
    panic: Option<PanicPayload>,
}

impl ResponseBody {
    pub(crate) fn full(data: Bytes, success: bool, ctx: Context, hooks: ServerHooks) -> Self {
        Self {
            state: State::Full {
                data: Some(data),
                success,
            },
            lifecycle: Some(Lifecycle { ctx, hooks }),
            panic: None,
        }
    }

    pub(crate) fn stream(
        messages: BoxStream<'static, Result<Bytes, Error>>,
        codec: Codec,
        ctx: Context,
        hooks: ServerHooks,
    ) -> Self {
        Self {
            state: State::Stream {
                messages,
                codec,
                sent: 0,
            },
            lifecycle: Some(Lifecycle { ctx, hooks }),
            panic: None,
        }
    }

    /// Re-raises `payload` once the response has been handed off.
    pub(crate) fn resume_panic_after(mut self, payload: PanicPayload) -> Self {
        self.panic = Some(payload);
        self
    }

    /// Ends the lifecycle: `ResponseSent`, then cancellation of the request
    /// context. Runs at most once.
    fn finish(&mut self) {
        self.state = State::Done;
        if let Some(Lifecycle { ctx, hooks }) = self.lifecycle.take() {
            hooks.call_response_sent(&ctx);
            ctx.cancellation_token().cancel();
        }
        if let Some(payload) = self.panic.take() {
            resume_panic(payload);
        }
    }

    /// Reports a stream producer error: status, `Error` hook, then the
    /// trailer frame.
    fn fail_stream(&mut self, codec: Codec, sent: usize, err: Error) -> Bytes {
        if let Some(Lifecycle { ctx, hooks }) = self.lifecycle.as_mut() {
            ctx.set_status_code(err.http_status());
            hooks.call_error(ctx, &err);
            warn!(
                service = ctx.service_name().unwrap_or_default(),
                method = ctx.method_name().unwrap_or_default(),
                code = %err.code(),
                sent,
                "Stream ended with error"
            );
        }
        trailer_frame(codec, sent, Some(&err))
    }

    /// Reports an unsent success response to the `Error` hook.
    fn report_abandoned(&mut self) {
        let err = match &self.state {
            State::Full {
                data: Some(data),
                success: true,
            } => Error::new(
                ErrorCode::Unknown,
                format!(
                    "failed to write response, 0 of {} bytes written: connection closed",
                    data.len()
                ),
            ),
            State::Stream { .. } => Error::internal("failed to send proto message"),
            _ => return,
        };
        if let Some(Lifecycle { ctx, hooks }) = self.lifecycle.as_mut() {
            if matches!(self.state, State::Stream { .. }) {
                ctx.set_status_code(err.http_status());
            }
            debug!(
                service = ctx.service_name().unwrap_or_default(),
                method = ctx.method_name().unwrap_or_default(),
                error = %err,
                "Client went away before the response was written"
            );
            hooks.call_error(ctx, &err);
        }
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let next = match &mut this.state {
            State::Full { data, .. } => data.take(),
            State::Stream {
                messages,
                codec,
                sent,
            } => {
                let codec = *codec;
                let count = *sent;
                match messages.as_mut().poll_next(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Some(Ok(payload))) => {
                        *sent += 1;
                        Some(message_frame(codec, count, &payload))
                    }
                    Poll::Ready(Some(Err(err))) => {
                        let frame = this.fail_stream(codec, count, err);
                        this.state = State::Full {
                            data: Some(frame),
                            success: false,
                        };
                        return Pin::new(this).poll_frame(cx);
                    }
                    Poll::Ready(None) => {
                        this.state = State::Full {
                            data: Some(trailer_frame(codec, count, None)),
                            success: false,
                        };
                        return Pin::new(this).poll_frame(cx);
                    }
                }
            }
            State::Done => None,
        };

        match next {
            Some(data) => Poll::Ready(Some(Ok(Frame::data(data)))),
            None => {
                this.finish();
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self.state, State::Done | State::Full { data: None, .. })
    }

    fn size_hint(&self) -> SizeHint {
        match &self.state {
            State::Full { data: Some(data), .. } => SizeHint::with_exact(data.len() as u64),
            State::Full { data: None, .. } | State::Done => SizeHint::with_exact(0),
            State::Stream { .. } => SizeHint::default(),
        }
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        self.report_abandoned();
        self.finish();
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Full { .. } => "full",
            State::Stream { .. } => "stream",
            State::Done => "done",
        };
        f.debug_struct("ResponseBody")
            .field("state", &state)
            .field("finished", &self.lifecycle.is_none())
            .finish()
    }
}

/// Frames one encoded message. `index` is the number of messages already
/// sent.
fn message_frame(codec: Codec, index: usize, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 16);
    match codec {
        Codec::Protobuf => encode_message(payload, &mut buf),
        Codec::Json => {
            buf.put_slice(if index == 0 { b"{\"messages\":[" } else { b"," });
            buf.put_slice(payload);
        }
    }
    buf.freeze()
}

/// Frames the end of a stream after `sent` messages.
fn trailer_frame(codec: Codec, sent: usize, err: Option<&Error>) -> Bytes {
    let mut buf = BytesMut::new();
    match codec {
        Codec::Protobuf => encode_trailer(err, &mut buf),
        Codec::Json => {
            if sent == 0 {
                buf.put_slice(b"{\"messages\":[");
            }
            buf.put_slice(b"],\"trailer\":");
            match err {
                Some(err) => buf.put_slice(&marshal_error(err)),
                None => buf.put_slice(b"{\"code\":\"stream_complete\"}"),
            }
            buf.put_slice(b"}");
        }
    }
    buf.freeze()
}

/// Text of a panic payload.
pub(crate) fn panic_message(payload: &PanicPayload) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Re-raises a contained handler panic once the error response is done.
///
/// The panic runs on its own task so the connection that carried the
/// response stays intact; a second task awaits it and logs the failure.
/// Outside a tokio runtime the panic unwinds the current thread.
fn resume_panic(payload: PanicPayload) {
    if std::thread::panicking() {
        return;
    }
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        std::panic::resume_unwind(payload);
    };
    let message = panic_message(&payload);
    let task = handle.spawn(async move {
        panic!("handler panic: {message}");
    });
    handle.spawn(async move {
        if let Err(err) = task.await {
            error!(error = %err, "Handler panic re-raised after the response was sent");
        }
    });
}
