//! Lifecycle hooks for servers and clients.
//!
//! Hooks are plain structs of optional callbacks. An absent slot is a no-op.
//! Several hook sets compose with [`chain_hooks`] / [`chain_client_hooks`]:
//! each stage runs every present callback in registration order, and stages
//! that can abort stop at the first error.
//!
//! Server stage order for one request:
//!
//! ```text
//! RequestReceived -> RequestRouted -> RequestDeserialized -> (method)
//!     -> ResponsePrepared -> ResponseSent
//! ```
//!
//! `Error` fires once, at the point of failure, and `ResponseSent` still
//! follows it. Client order is `RequestPrepared -> (send)` followed by exactly
//! one of `ResponseReceived` or `Error`.

pub mod logging;

use crate::context::Context;
use crate::error::Error;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Stage that may abort the request.
pub type RequestHook = Arc<dyn Fn(&mut Context) -> Result<(), Error> + Send + Sync>;
/// Stage that may only update the context.
pub type ContextHook = Arc<dyn Fn(&mut Context) + Send + Sync>;
/// Terminal stage; observes the final context.
pub type ObserveHook = Arc<dyn Fn(&Context) + Send + Sync>;
/// Server error stage.
pub type ErrorHook = Arc<dyn Fn(&mut Context, &Error) + Send + Sync>;
/// Client error stage.
pub type ClientErrorHook = Arc<dyn Fn(&Context, &Error) + Send + Sync>;
/// Client pre-send stage; may rewrite the outgoing request or abort.
pub type RequestPreparedHook =
    Arc<dyn Fn(&mut Context, &mut http::Request<Bytes>) -> Result<(), Error> + Send + Sync>;

/// Callbacks invoked by the dispatcher over a request's lifetime.
#[derive(Clone, Default)]
pub struct ServerHooks {
    /// As soon as the request enters the server. May abort.
    pub request_received: Option<RequestHook>,
    /// After the request is matched to a method. May abort.
    pub request_routed: Option<RequestHook>,
    /// After the body is decoded, before the method runs.
    pub request_deserialized: Option<ContextHook>,
    /// After the method returned a response, before it is serialized.
    pub response_prepared: Option<ContextHook>,
    /// After every byte of the response (error responses included) is handed
    /// to the transport, or the client went away.
    pub response_sent: Option<ObserveHook>,
    /// When the request fails, with the error sent to the client.
    pub error: Option<ErrorHook>,
}

impl ServerHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request_received<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Context) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.request_received = Some(Arc::new(f));
        self
    }

    pub fn on_request_routed<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Context) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.request_routed = Some(Arc::new(f));
        self
    }

    pub fn on_request_deserialized<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        self.request_deserialized = Some(Arc::new(f));
        self
    }

    pub fn on_response_prepared<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        self.response_prepared = Some(Arc::new(f));
        self
    }

    pub fn on_response_sent<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        self.response_sent = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Context, &Error) + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(f));
        self
    }

    pub(crate) fn call_request_received(&self, ctx: &mut Context) -> Result<(), Error> {
        self.request_received.as_ref().map_or(Ok(()), |hook| hook(ctx))
    }

    pub(crate) fn call_request_routed(&self, ctx: &mut Context) -> Result<(), Error> {
        self.request_routed.as_ref().map_or(Ok(()), |hook| hook(ctx))
    }

    pub(crate) fn call_request_deserialized(&self, ctx: &mut Context) {
        if let Some(hook) = &self.request_deserialized {
            hook(ctx);
        }
    }

    pub(crate) fn call_response_prepared(&self, ctx: &mut Context) {
        if let Some(hook) = &self.response_prepared {
            hook(ctx);
        }
    }

    pub(crate) fn call_response_sent(&self, ctx: &Context) {
        if let Some(hook) = &self.response_sent {
            hook(ctx);
        }
    }

    pub(crate) fn call_error(&self, ctx: &mut Context, err: &Error) {
        if let Some(hook) = &self.error {
            hook(ctx, err);
        }
    }
}

impl fmt::Debug for ServerHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHooks")
            .field("request_received", &self.request_received.is_some())
            .field("request_routed", &self.request_routed.is_some())
            .field("request_deserialized", &self.request_deserialized.is_some())
            .field("response_prepared", &self.response_prepared.is_some())
            .field("response_sent", &self.response_sent.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

/// Callbacks invoked by the client around each call.
#[derive(Clone, Default)]
pub struct ClientHooks {
    /// Before the request is sent. May rewrite it or abort the call.
    pub request_prepared: Option<RequestPreparedHook>,
    /// After a successful response was received and decoded.
    pub response_received: Option<ObserveHook>,
    /// When the call fails for any reason.
    pub error: Option<ClientErrorHook>,
}

impl ClientHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request_prepared<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Context, &mut http::Request<Bytes>) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.request_prepared = Some(Arc::new(f));
        self
    }

    pub fn on_response_received<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        self.response_received = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context, &Error) + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(f));
        self
    }

    pub(crate) fn call_request_prepared(
        &self,
        ctx: &mut Context,
        request: &mut http::Request<Bytes>,
    ) -> Result<(), Error> {
        self.request_prepared
            .as_ref()
            .map_or(Ok(()), |hook| hook(ctx, request))
    }

    pub(crate) fn call_response_received(&self, ctx: &Context) {
        if let Some(hook) = &self.response_received {
            hook(ctx);
        }
    }

    pub(crate) fn call_error(&self, ctx: &Context, err: &Error) {
        if let Some(hook) = &self.error {
            hook(ctx, err);
        }
    }
}

impl fmt::Debug for ClientHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHooks")
            .field("request_prepared", &self.request_prepared.is_some())
            .field("response_received", &self.response_received.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

/// Combines several server hook sets into one.
///
/// A single set is returned unchanged. A stage is present in the result only
/// if at least one input provides it.
pub fn chain_hooks(hooks: impl IntoIterator<Item = ServerHooks>) -> ServerHooks {
    let mut hooks: Vec<ServerHooks> = hooks.into_iter().collect();
    if hooks.len() <= 1 {
        return hooks.pop().unwrap_or_default();
    }

    ServerHooks {
        request_received: chain_request(hooks.iter().filter_map(|h| h.request_received.clone())),
        request_routed: chain_request(hooks.iter().filter_map(|h| h.request_routed.clone())),
        request_deserialized: chain_context(
            hooks.iter().filter_map(|h| h.request_deserialized.clone()),
        ),
        response_prepared: chain_context(hooks.iter().filter_map(|h| h.response_prepared.clone())),
        response_sent: chain_observe(hooks.iter().filter_map(|h| h.response_sent.clone())),
        error: {
            let stage: Vec<ErrorHook> = hooks.iter().filter_map(|h| h.error.clone()).collect();
            (!stage.is_empty()).then(|| -> ErrorHook {
                Arc::new(move |ctx: &mut Context, err: &Error| {
                    for hook in &stage {
                        hook(ctx, err);
                    }
                })
            })
        },
    }
}

/// Combines several client hook sets into one, with the same ordering and
/// short-circuit rules as [`chain_hooks`].
pub fn chain_client_hooks(hooks: impl IntoIterator<Item = ClientHooks>) -> ClientHooks {
    let mut hooks: Vec<ClientHooks> = hooks.into_iter().collect();
    if hooks.len() <= 1 {
        return hooks.pop().unwrap_or_default();
    }

    let prepared: Vec<RequestPreparedHook> = hooks
        .iter()
        .filter_map(|h| h.request_prepared.clone())
        .collect();
    let errors: Vec<ClientErrorHook> = hooks.iter().filter_map(|h| h.error.clone()).collect();

    ClientHooks {
        request_prepared: (!prepared.is_empty()).then(|| -> RequestPreparedHook {
            Arc::new(move |ctx: &mut Context, request: &mut http::Request<Bytes>| {
                for hook in &prepared {
                    hook(ctx, request)?;
                }
                Ok(())
            })
        }),
        response_received: chain_observe(hooks.iter().filter_map(|h| h.response_received.clone())),
        error: (!errors.is_empty()).then(|| -> ClientErrorHook {
            Arc::new(move |ctx: &Context, err: &Error| {
                for hook in &errors {
                    hook(ctx, err);
                }
            })
        }),
    }
}

fn chain_request(stage: impl Iterator<Item = RequestHook>) -> Option<RequestHook> {
    let stage: Vec<RequestHook> = stage.collect();
    (!stage.is_empty()).then(|| -> RequestHook {
        Arc::new(move |ctx: &mut Context| {
            for hook in &stage {
                hook(ctx)?;
            }
            Ok(())
        })
    })
}

fn chain_context(stage: impl Iterator<Item = ContextHook>) -> Option<ContextHook> {
    let stage: Vec<ContextHook> = stage.collect();
    (!stage.is_empty()).then(|| -> ContextHook {
        Arc::new(move |ctx: &mut Context| {
            for hook in &stage {
                hook(ctx);
            }
        })
    })
}

fn chain_observe(stage: impl Iterator<Item = ObserveHook>) -> Option<ObserveHook> {
    let stage: Vec<ObserveHook> = stage.collect();
    (!stage.is_empty()).then(|| -> ObserveHook {
        Arc::new(move |ctx: &Context| {
            for hook in &stage {
                hook(ctx);
            }
        })
    })
}
