//! Server dispatcher.
//!
//! A [`Server`] serves one service. It routes `POST [prefix]/<pkg>.<Service>/<Method>`
//! requests to registered handlers, negotiates the codec from
//! `Content-Type`, runs hooks and interceptors around the handler, and
//! writes either the encoded response, a framed stream, or a JSON error
//! envelope.
//!
//! ```text
//! RequestReceived -> [verb, path, content type] -> RequestRouted
//!   -> read + decode body -> RequestDeserialized
//!   -> interceptors -> handler -> ResponsePrepared
//!   -> encode -> ResponseSent (when the body is done)
//! ```
//!
//! `Error` fires once, at the point of failure, with the error that is
//! written to the client. `Server` is a [`tower::Service`], so it can be
//! mounted in any tower-compatible stack or served with [`serve`].
//!
//! ## Module Organization
//!
//! - `body` - [`ResponseBody`], which finishes the lifecycle
//! - `serve` - accept loop with graceful shutdown

pub mod body;
pub mod serve;

pub use body::ResponseBody;
pub use serve::serve;

use crate::codec::{Codec, CodecError, Message};
use crate::config::ServerConfig;
use crate::context::Context;
use crate::descriptor::{MethodDescriptor, MethodKind, ServiceDescriptor, normalize_prefix, parse_route_path};
use crate::error::envelope::marshal_error;
use crate::error::{BoxError, Error, ErrorCode};
use crate::hooks::ServerHooks;
use crate::interceptor::{AnyMessage, Interceptor, Method, chain_interceptors, intercept, method_fn};
use crate::stream::ResponseStream;
use body::PanicPayload;
use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use http_body::Body;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Invalid server construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerBuildError {
    #[error("service {service} has no method {method}")]
    UnknownMethod { service: String, method: String },

    #[error("method {method} is {declared}, but a {registered} handler was registered")]
    KindMismatch {
        method: String,
        declared: &'static str,
        registered: &'static str,
    },

    #[error("handler registered twice for method {0}")]
    DuplicateHandler(String),

    #[error("no handler registered for method {0}")]
    MissingHandler(String),
}

/// Panic payload of a handler, as seen through [`Error::cause`].
#[derive(Debug, Error)]
#[error("panic: {0}")]
pub struct PanicError(pub String);

impl PanicError {
    fn from_payload(payload: &PanicPayload) -> Self {
        Self(body::panic_message(payload))
    }
}

/// Encoded response of a method, before it becomes a body.
pub(crate) enum Payload {
    Unary(Bytes),
    Stream(BoxStream<'static, Result<Bytes, Error>>),
}

/// A typed method result that knows how to encode itself.
trait Outgoing: Send {
    fn into_payload(self: Box<Self>, codec: Codec, skip_defaults: bool) -> Result<Payload, Error>;
}

fn encode_response<M: Message>(codec: Codec, message: &M, skip_defaults: bool) -> Result<Bytes, CodecError> {
    if skip_defaults {
        codec.encode_skipping_defaults(message)
    } else {
        codec.encode(message)
    }
}

struct UnaryResponse<M>(M);

impl<M: Message> Outgoing for UnaryResponse<M> {
    fn into_payload(self: Box<Self>, codec: Codec, skip_defaults: bool) -> Result<Payload, Error> {
        encode_response(codec, &self.0, skip_defaults)
            .map(Payload::Unary)
            .map_err(|err| Error::wrapped(&format!("failed to marshal {} response", codec.name()), err))
    }
}

impl<M: Message> Outgoing for ResponseStream<M> {
    fn into_payload(self: Box<Self>, codec: Codec, skip_defaults: bool) -> Result<Payload, Error> {
        let frames = self.map(move |item| {
            item.and_then(|message| {
                encode_response(codec, &message, skip_defaults)
                    .map_err(|err| Error::wrap(ErrorCode::Internal, "failed to marshal proto message", err))
            })
        });
        Ok(Payload::Stream(frames.boxed()))
    }
}

type DecodeFn = Box<dyn Fn(Codec, &[u8]) -> Result<AnyMessage, CodecError> + Send + Sync>;
type PrepareFn = Box<dyn Fn(AnyMessage, &MethodDescriptor) -> Result<Box<dyn Outgoing>, Error> + Send + Sync>;

struct Registration {
    name: String,
    kind: MethodKind,
    decode: DecodeFn,
    method: Method,
    prepare: PrepareFn,
}

struct Route {
    descriptor: MethodDescriptor,
    decode: DecodeFn,
    method: Method,
    prepare: PrepareFn,
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    descriptor: ServiceDescriptor,
    registrations: Vec<Registration>,
    hooks: ServerHooks,
    interceptors: Vec<Interceptor>,
    config: ServerConfig,
    path_prefix: Option<String>,
    json_skip_defaults: Option<bool>,
}

impl ServerBuilder {
    /// Registers a unary handler for the method `name`.
    pub fn unary<Req, Resp, F, Fut, E>(mut self, name: &str, handler: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let handler = Arc::new(handler);
        let method = method_fn(move |ctx, req: AnyMessage| {
            let handler = Arc::clone(&handler);
            async move {
                let req = downcast_request::<Req>(req)?;
                match handler(ctx, req).await {
                    Ok(resp) => Ok(Box::new(resp) as AnyMessage),
                    Err(err) => Err(Error::from_boxed(err.into())),
                }
            }
        });
        self.registrations.push(Registration {
            name: name.to_string(),
            kind: MethodKind::Unary,
            decode: decoder::<Req>(),
            method,
            prepare: Box::new(|resp: AnyMessage, descriptor: &MethodDescriptor| {
                resp.downcast::<Resp>()
                    .map(|resp| Box::new(UnaryResponse(*resp)) as Box<dyn Outgoing>)
                    .map_err(|_| nil_response(descriptor))
            }),
        });
        self
    }

    /// Registers a server-streaming handler for the method `name`.
    pub fn server_streaming<Req, Resp, F, Fut, E>(mut self, name: &str, handler: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseStream<Resp>, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let handler = Arc::new(handler);
        let method = method_fn(move |ctx, req: AnyMessage| {
            let handler = Arc::clone(&handler);
            async move {
                let req = downcast_request::<Req>(req)?;
                match handler(ctx, req).await {
                    Ok(stream) => Ok(Box::new(stream) as AnyMessage),
                    Err(err) => Err(Error::from_boxed(err.into())),
                }
            }
        });
        self.registrations.push(Registration {
            name: name.to_string(),
            kind: MethodKind::Download,
            decode: decoder::<Req>(),
            method,
            prepare: Box::new(|resp: AnyMessage, descriptor: &MethodDescriptor| {
                resp.downcast::<ResponseStream<Resp>>()
                    .map(|stream| stream as Box<dyn Outgoing>)
                    .map_err(|_| nil_response(descriptor))
            }),
        });
        self
    }

    pub fn hooks(mut self, hooks: ServerHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Adds an interceptor. The first one added is the outermost.
    pub fn interceptor(mut self, interceptor: Interceptor) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn interceptors(mut self, interceptors: impl IntoIterator<Item = Interceptor>) -> Self {
        self.interceptors.extend(interceptors);
        self
    }

    /// Route prefix; overrides the one in [`ServerConfig`].
    pub fn path_prefix(mut self, prefix: &str) -> Self {
        self.path_prefix = Some(prefix.to_string());
        self
    }

    /// Leave default-valued fields out of JSON responses. Off by default, so
    /// JSON responses show every field.
    pub fn json_skip_defaults(mut self, skip: bool) -> Self {
        self.json_skip_defaults = Some(skip);
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the registrations against the descriptor.
    ///
    /// Every unary and server-streaming method needs exactly one handler of
    /// the matching kind. Client and bidirectional streaming methods take no
    /// handler; requests to them are answered with an error.
    pub fn build(self) -> Result<Server, ServerBuildError> {
        let chain = chain_interceptors(&self.interceptors);
        let mut routes = HashMap::with_capacity(self.registrations.len());

        for registration in self.registrations {
            let Some(descriptor) = self
                .descriptor
                .methods
                .iter()
                .find(|m| m.name == registration.name)
            else {
                return Err(ServerBuildError::UnknownMethod {
                    service: self.descriptor.fully_qualified_name(),
                    method: registration.name,
                });
            };
            if descriptor.kind != registration.kind {
                return Err(ServerBuildError::KindMismatch {
                    method: registration.name,
                    declared: descriptor.kind.as_str(),
                    registered: registration.kind.as_str(),
                });
            }
            if routes.contains_key(&registration.name) {
                return Err(ServerBuildError::DuplicateHandler(registration.name));
            }
            routes.insert(
                registration.name,
                Route {
                    descriptor: descriptor.clone(),
                    decode: registration.decode,
                    method: intercept(chain.as_ref(), registration.method),
                    prepare: registration.prepare,
                },
            );
        }

        if let Some(missing) = self
            .descriptor
            .methods
            .iter()
            .find(|m| m.kind.is_supported() && !routes.contains_key(&m.name))
        {
            return Err(ServerBuildError::MissingHandler(missing.name.clone()));
        }

        let mut config = self.config;
        config.path_prefix = normalize_prefix(self.path_prefix.as_deref().unwrap_or(&config.path_prefix));
        if let Some(skip) = self.json_skip_defaults {
            config.json_skip_defaults = skip;
        }

        Ok(Server {
            inner: Arc::new(ServerInner {
                descriptor: self.descriptor,
                routes,
                hooks: self.hooks,
                config,
            }),
        })
    }
}

fn decoder<M: Message>() -> DecodeFn {
    Box::new(|codec: Codec, body: &[u8]| codec.decode::<M>(body).map(|m| Box::new(m) as AnyMessage))
}

fn downcast_request<M: Message>(req: AnyMessage) -> Result<M, Error> {
    req.downcast::<M>()
        .map(|req| *req)
        .map_err(|_| Error::internal("request message has an unexpected type"))
}

fn nil_response(descriptor: &MethodDescriptor) -> Error {
    Error::internal(format!(
        "received a nil {} and nil error while calling {}. nil responses are not supported",
        descriptor.output_type, descriptor.name
    ))
}

struct ServerInner {
    descriptor: ServiceDescriptor,
    routes: HashMap<String, Route>,
    hooks: ServerHooks,
    config: ServerConfig,
}

/// A Twirp service ready to handle HTTP requests. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn builder(descriptor: ServiceDescriptor) -> ServerBuilder {
        ServerBuilder {
            descriptor,
            registrations: Vec::new(),
            hooks: ServerHooks::default(),
            interceptors: Vec::new(),
            config: ServerConfig::default(),
            path_prefix: None,
            json_skip_defaults: None,
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.inner.descriptor
    }

    /// Base path served, e.g. `/twirp/pkg.Service/`.
    pub fn path_prefix(&self) -> String {
        self.inner.descriptor.path_prefix(&self.inner.config.path_prefix)
    }

    /// Handles one HTTP request. Never fails: every error becomes a JSON
    /// error response.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        let inner = &self.inner;

        let mut ctx = Context::new();
        ctx.set_package_name(&inner.descriptor.package);
        ctx.set_service_name(&inner.descriptor.name);
        ctx.set_http_request_headers(parts.headers);
        // Cancels the handler's context if this future is dropped; the
        // response body takes over once it exists.
        let guard = ctx.cancellation_token().clone().drop_guard();

        let response = self.dispatch(ctx, &parts.method, parts.uri.path(), body).await;
        let _ = guard.disarm();
        response
    }

    async fn dispatch<B>(&self, mut ctx: Context, verb: &http::Method, path: &str, body: B) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let inner = &self.inner;
        let hooks = &inner.hooks;

        if let Err(err) = hooks.call_request_received(&mut ctx) {
            return self.error_response(ctx, err);
        }

        if verb != http::Method::POST {
            let msg = format!("unsupported method {:?} (only POST is allowed)", verb.as_str());
            return self.error_response(ctx, Error::bad_route(msg, verb.as_str(), path));
        }

        let Some(descriptor) = self.resolve(path) else {
            let msg = format!("no handler for path {path:?}");
            return self.error_response(ctx, Error::bad_route(msg, verb.as_str(), path));
        };
        ctx.set_method_name(&descriptor.name);

        let content_type = ctx
            .http_request_headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let Some(codec) = Codec::from_content_type(&content_type) else {
            let msg = format!("unexpected Content-Type: {content_type:?}");
            return self.error_response(ctx, Error::bad_route(msg, verb.as_str(), path));
        };

        let Some(route) = inner.routes.get(&descriptor.name) else {
            let msg = format!("rpc type {:?} is not implemented", descriptor.kind.as_str());
            return self.error_response(ctx, Error::internal(msg));
        };

        if let Err(err) = hooks.call_request_routed(&mut ctx) {
            return self.error_response(ctx, err);
        }

        let bytes = match Limited::new(body, inner.config.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) if err.is::<LengthLimitError>() => {
                return self.error_response(
                    ctx,
                    Error::new(ErrorCode::InvalidArgument, "request body too large"),
                );
            }
            Err(err) => {
                let err = Error::wrap(ErrorCode::Malformed, "failed to read request body", err);
                return self.error_response(ctx, err);
            }
        };

        let request = match (route.decode)(codec, &bytes) {
            Ok(request) => request,
            Err(err) => {
                let label = match codec {
                    Codec::Protobuf => "protobuf",
                    Codec::Json => "json",
                };
                let msg = format!("the {label} request could not be decoded");
                return self.error_response(ctx, Error::wrap(ErrorCode::Malformed, msg, err));
            }
        };
        hooks.call_request_deserialized(&mut ctx);

        let call = AssertUnwindSafe(async { (route.method)(ctx.clone(), request).await });
        let response = match call.catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return self.error_response(ctx, err),
            Err(payload) => return self.panic_response(ctx, payload),
        };

        let outgoing = match (route.prepare)(response, &route.descriptor) {
            Ok(outgoing) => outgoing,
            Err(err) => return self.error_response(ctx, err),
        };
        hooks.call_response_prepared(&mut ctx);

        let payload = match outgoing.into_payload(codec, inner.config.json_skip_defaults) {
            Ok(payload) => payload,
            Err(err) => return self.error_response(ctx, err),
        };
        ctx.set_status_code(StatusCode::OK);

        let mut headers = ctx.http_response_headers();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(codec.content_type()));
        let body = match payload {
            Payload::Unary(data) => {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(data.len()));
                ResponseBody::full(data, true, ctx, hooks.clone())
            }
            Payload::Stream(messages) => ResponseBody::stream(messages, codec, ctx, hooks.clone()),
        };
        build_response(StatusCode::OK, headers, body)
    }

    /// Finds the method addressed by `path`, in literal or camel-cased form.
    fn resolve(&self, path: &str) -> Option<&MethodDescriptor> {
        let route = parse_route_path(path)?;
        if route.prefix != self.inner.config.path_prefix {
            return None;
        }
        if !self.inner.descriptor.matches_service(route.service) {
            return None;
        }
        self.inner.descriptor.find_method(route.method)
    }

    /// Records `err` on the context, fires the `Error` hook and writes the
    /// JSON envelope.
    fn error_response(&self, mut ctx: Context, err: Error) -> Response<ResponseBody> {
        let status = err.http_status();
        ctx.set_status_code(status);

        let service = ctx.service_name().unwrap_or_default().to_string();
        let method = ctx.method_name().unwrap_or_default().to_string();
        if status.is_server_error() {
            warn!(service = %service, method = %method, code = %err.code(), error = %err, "Request failed");
        } else {
            debug!(service = %service, method = %method, code = %err.code(), error = %err, "Request rejected");
        }

        self.inner.hooks.call_error(&mut ctx, &err);

        let data = marshal_error(&err);
        let mut headers = ctx.http_response_headers();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(data.len()));
        let body = ResponseBody::full(data, false, ctx, self.inner.hooks.clone());
        let mut response = build_response(status, headers, body);
        response.extensions_mut().insert(err.code());
        response
    }

    fn panic_response(&self, ctx: Context, payload: PanicPayload) -> Response<ResponseBody> {
        let cause = PanicError::from_payload(&payload);
        error!(
            service = ctx.service_name().unwrap_or_default(),
            method = ctx.method_name().unwrap_or_default(),
            panic = %cause.0,
            "Handler panicked"
        );
        let err = Error::wrap(ErrorCode::Internal, "Internal service panic", cause);
        self.error_response(ctx, err)
            .map(|body| body.resume_panic_after(payload))
    }
}

fn build_response(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Response<ResponseBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("service", &self.inner.descriptor.fully_qualified_name())
            .field("path_prefix", &self.inner.config.path_prefix)
            .field("hooks", &self.inner.hooks)
            .finish()
    }
}

impl<B> tower::Service<Request<B>> for Server
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let server = self.clone();
        Box::pin(async move { Ok(server.handle(req).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::interceptor_fn;
    use http_body_util::Full;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
    #[serde(default)]
    struct Size {
        #[prost(int32, tag = "1")]
        inches: i32,
    }

    #[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
    #[serde(default)]
    struct Hat {
        #[prost(int32, tag = "1")]
        inches: i32,
        #[prost(string, tag = "2")]
        color: String,
    }

    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new("twirp.example.haberdasher", "Haberdasher")
            .method(MethodDescriptor::unary("MakeHat", "Size", "Hat"))
            .method(MethodDescriptor::server_streaming("MakeHats", "Size", "Hat"))
            .method(MethodDescriptor::new("Upload", "Size", "Hat", MethodKind::Upload))
    }

    async fn make_hat(_ctx: Context, size: Size) -> Result<Hat, Error> {
        if size.inches <= 0 {
            return Err(Error::invalid_argument("Inches", "I can't make a hat that small!"));
        }
        Ok(Hat {
            inches: size.inches,
            color: "blue".to_string(),
        })
    }

    async fn make_hats(_ctx: Context, size: Size) -> Result<ResponseStream<Hat>, Error> {
        let hats: Vec<Hat> = (0..size.inches)
            .map(|i| Hat {
                inches: i,
                color: "red".to_string(),
            })
            .collect();
        Ok(ResponseStream::from_messages(hats))
    }

    fn builder() -> ServerBuilder {
        Server::builder(descriptor())
            .unary("MakeHat", make_hat)
            .server_streaming("MakeHats", make_hats)
    }

    fn request(method: &str, path: &str, content_type: &str, body: &'static [u8]) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .header(CONTENT_TYPE, content_type)
            .body(Full::new(Bytes::from_static(body)))
            .unwrap()
    }

    async fn read(response: Response<ResponseBody>) -> (StatusCode, HeaderMap, Bytes) {
        let (parts, body) = response.into_parts();
        (parts.status, parts.headers, body.collect().await.unwrap().to_bytes())
    }

    #[tokio::test]
    async fn test_unary_json() {
        let server = builder().build().unwrap();
        let req = request(
            "POST",
            "/twirp/twirp.example.haberdasher.Haberdasher/MakeHat",
            "application/json",
            br#"{"inches":10}"#,
        );
        let (status, headers, body) = read(server.handle(req).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert_eq!(headers[CONTENT_LENGTH], body.len().to_string().as_str());
        let hat: Hat = serde_json::from_slice(&body).unwrap();
        assert_eq!(hat.inches, 10);
    }

    #[tokio::test]
    async fn test_error_code_attached_to_error_responses() {
        let server = builder().build().unwrap();
        let ok = server
            .handle(request(
                "POST",
                "/twirp/twirp.example.haberdasher.Haberdasher/MakeHat",
                "application/json",
                br#"{"inches":10}"#,
            ))
            .await;
        assert!(ok.extensions().get::<ErrorCode>().is_none());

        let rejected = server
            .handle(request(
                "POST",
                "/twirp/twirp.example.haberdasher.Haberdasher/MakeHat",
                "application/json",
                br#"{"inches":0}"#,
            ))
            .await;
        assert_eq!(rejected.extensions().get::<ErrorCode>(), Some(&ErrorCode::InvalidArgument));

        let unrouted = server
            .handle(request("GET", "/twirp/nope", "application/json", b""))
            .await;
        assert_eq!(unrouted.extensions().get::<ErrorCode>(), Some(&ErrorCode::BadRoute));
    }

    #[tokio::test]
    async fn test_unary_protobuf() {
        let server = builder().build().unwrap();
        let encoded = Codec::Protobuf.encode(&Size { inches: 3 }).unwrap();
        let req = Request::builder()
            .method("POST")
            .uri("/twirp/twirp.example.haberdasher.Haberdasher/MakeHat")
            .header(CONTENT_TYPE, "application/protobuf")
            .body(Full::new(encoded))
            .unwrap();
        let (status, _, body) = read(server.handle(req).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(Codec::Protobuf.decode::<Hat>(&body).unwrap().inches, 3);
    }

    #[tokio::test]
    async fn test_bad_routes() {
        let server = builder().build().unwrap();
        let path = "/twirp/twirp.example.haberdasher.Haberdasher/MakeHat";
        let cases = [
            ("GET", path, "application/json", r#"unsupported method "GET" (only POST is allowed)"#),
            (
                "POST",
                "/twirp/twirp.example.haberdasher.Haberdasher/Bogus",
                "application/json",
                r#"no handler for path "/twirp/twirp.example.haberdasher.Haberdasher/Bogus""#,
            ),
            (
                "POST",
                "/other/twirp.example.haberdasher.Haberdasher/MakeHat",
                "application/json",
                r#"no handler for path "/other/twirp.example.haberdasher.Haberdasher/MakeHat""#,
            ),
            ("POST", path, "application/jsonp", r#"unexpected Content-Type: "application/jsonp""#),
        ];
        for (verb, path, content_type, msg) in cases {
            let (status, headers, body) = read(server.handle(request(verb, path, content_type, b"{}")).await).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{msg}");
            assert_eq!(headers[CONTENT_TYPE], "application/json");
            let err = crate::error::envelope::unmarshal_error(&body).unwrap();
            assert_eq!(err.code(), ErrorCode::BadRoute);
            assert_eq!(err.msg(), msg);
            assert_eq!(err.meta("twirp_invalid_route"), format!("{verb} {path}"));
        }
    }

    #[tokio::test]
    async fn test_camel_cased_route_and_empty_prefix() {
        let svc = ServiceDescriptor::new("pkg", "hat_service").method(MethodDescriptor::unary("make_hat", "Size", "Hat"));
        let server = Server::builder(svc)
            .unary("make_hat", make_hat)
            .path_prefix("")
            .build()
            .unwrap();
        assert_eq!(server.path_prefix(), "/pkg.hat_service/");

        for path in ["/pkg.hat_service/make_hat", "/pkg.HatService/MakeHat"] {
            let (status, _, _) =
                read(server.handle(request("POST", path, "application/json", br#"{"inches":1}"#)).await).await;
            assert_eq!(status, StatusCode::OK, "{path}");
        }
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let server = builder().build().unwrap();
        let req = request(
            "POST",
            "/twirp/twirp.example.haberdasher.Haberdasher/MakeHat",
            "application/json",
            b"{not json",
        );
        let (status, _, body) = read(server.handle(req).await).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err = crate::error::envelope::unmarshal_error(&body).unwrap();
        assert_eq!(err.code(), ErrorCode::Malformed);
        assert_eq!(err.msg(), "the json request could not be decoded");
    }

    #[tokio::test]
    async fn test_body_too_large() {
        let server = builder()
            .config(ServerConfig {
                max_body_bytes: 4,
                ..ServerConfig::default()
            })
            .build()
            .unwrap();
        let req = request(
            "POST",
            "/twirp/twirp.example.haberdasher.Haberdasher/MakeHat",
            "application/json",
            br#"{"inches":10}"#,
        );
        let (status, _, body) = read(server.handle(req).await).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            crate::error::envelope::unmarshal_error(&body).unwrap().msg(),
            "request body too large"
        );
    }

    #[tokio::test]
    async fn test_unsupported_kind() {
        let server = builder().build().unwrap();
        let req = request(
            "POST",
            "/twirp/twirp.example.haberdasher.Haberdasher/Upload",
            "application/json",
            b"{}",
        );
        let (status, _, body) = read(server.handle(req).await).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            crate::error::envelope::unmarshal_error(&body).unwrap().msg(),
            r#"rpc type "upload" is not implemented"#
        );
    }

    #[tokio::test]
    async fn test_handler_error_and_hooks() {
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let (l1, l2, l3, l4) = (log.clone(), log.clone(), log.clone(), log.clone());
        let hooks = ServerHooks::new()
            .on_request_received(move |_| {
                l1.lock().unwrap().push("received".into());
                Ok(())
            })
            .on_request_routed(move |ctx| {
                l2.lock().unwrap().push(format!("routed:{}", ctx.method_name().unwrap()));
                Ok(())
            })
            .on_error(move |ctx, err| {
                l3.lock()
                    .unwrap()
                    .push(format!("error:{}:{}", err.code(), ctx.status_code().unwrap().as_u16()))
            })
            .on_response_sent(move |_| l4.lock().unwrap().push("sent".into()));

        let server = builder().hooks(hooks).build().unwrap();
        let req = request(
            "POST",
            "/twirp/twirp.example.haberdasher.Haberdasher/MakeHat",
            "application/json",
            br#"{"inches":0}"#,
        );
        let (status, _, body) = read(server.handle(req).await).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err = crate::error::envelope::unmarshal_error(&body).unwrap();
        assert_eq!(err.msg(), "Inches I can't make a hat that small!");
        assert_eq!(err.meta("argument"), "Inches");
        assert_eq!(
            *log.lock().unwrap(),
            vec!["received", "routed:MakeHat", "error:invalid_argument:400", "sent"]
        );
    }

    #[tokio::test]
    async fn test_request_received_hook_aborts() {
        let hooks = ServerHooks::new()
            .on_request_received(|_| Err(Error::new(ErrorCode::Unauthenticated, "who are you")));
        let server = builder().hooks(hooks).build().unwrap();
        let req = request("GET", "/nowhere", "text/plain", b"");
        let (status, _, _) = read(server.handle(req).await).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_non_twirp_handler_error_is_hidden() {
        let server = Server::builder(descriptor())
            .unary("MakeHat", |_ctx, _size: Size| async {
                Err::<Hat, _>(std::io::Error::other("disk on fire at /var/secret"))
            })
            .server_streaming("MakeHats", make_hats)
            .build()
            .unwrap();
        let req = request(
            "POST",
            "/twirp/twirp.example.haberdasher.Haberdasher/MakeHat",
            "application/json",
            b"{}",
        );
        let (status, _, body) = read(server.handle(req).await).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let err = crate::error::envelope::unmarshal_error(&body).unwrap();
        assert_eq!(err.msg(), "internal error");
    }

    #[tokio::test]
    async fn test_interceptor_replacing_response_type() {
        let server = builder()
            .interceptor(interceptor_fn(|_next: Method| {
                method_fn(|_ctx, _req| async { Ok::<AnyMessage, Error>(Box::new("not a hat")) })
            }))
            .build()
            .unwrap();
        let req = request(
            "POST",
            "/twirp/twirp.example.haberdasher.Haberdasher/MakeHat",
            "application/json",
            b"{}",
        );
        let (_, _, body) = read(server.handle(req).await).await;
        let err = crate::error::envelope::unmarshal_error(&body).unwrap();
        assert_eq!(
            err.msg(),
            "received a nil Hat and nil error while calling MakeHat. nil responses are not supported"
        );
    }

    #[tokio::test]
    async fn test_streaming_json() {
        let server = builder().build().unwrap();
        let req = request(
            "POST",
            "/twirp/twirp.example.haberdasher.Haberdasher/MakeHats",
            "application/json",
            br#"{"inches":2}"#,
        );
        let (status, headers, body) = read(server.handle(req).await).await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers.get(CONTENT_LENGTH).is_none());
        assert_eq!(
            &body[..],
            br#"{"messages":[{"inches":0,"color":"red"},{"inches":1,"color":"red"}],"trailer":{"code":"stream_complete"}}"#
        );
    }

    #[tokio::test]
    async fn test_response_headers_from_handler() {
        let server = Server::builder(descriptor())
            .unary("MakeHat", |ctx: Context, size: Size| async move {
                ctx.set_http_response_header(
                    http::HeaderName::from_static("x-hat-maker"),
                    HeaderValue::from_static("mad"),
                )?;
                make_hat(ctx, size).await
            })
            .server_streaming("MakeHats", make_hats)
            .build()
            .unwrap();
        let req = request(
            "POST",
            "/twirp/twirp.example.haberdasher.Haberdasher/MakeHat",
            "application/json",
            br#"{"inches":1}"#,
        );
        let (_, headers, _) = read(server.handle(req).await).await;
        assert_eq!(headers["x-hat-maker"], "mad");
    }

    #[test]
    fn test_build_errors() {
        let err = Server::builder(descriptor()).unary("MakeHat", make_hat).build().unwrap_err();
        assert_eq!(err, ServerBuildError::MissingHandler("MakeHats".to_string()));

        let err = builder().unary("Bogus", make_hat).build().unwrap_err();
        assert!(matches!(err, ServerBuildError::UnknownMethod { .. }));

        let err = Server::builder(descriptor())
            .unary("MakeHats", make_hat)
            .build()
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "method MakeHats is download, but a unary handler was registered"
        );

        let err = builder().unary("MakeHat", make_hat).build().unwrap_err();
        assert_eq!(err, ServerBuildError::DuplicateHandler("MakeHat".to_string()));
    }
}
