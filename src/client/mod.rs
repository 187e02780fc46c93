//! Twirp client.
//!
//! A [`Client`] is bound to one service and one codec. Calls go through the
//! client interceptor chain, then the transport; client hooks observe every
//! call that reaches the transport stage. Non-200 responses are decoded as
//! Twirp error envelopes, falling back to an intermediary error when the
//! body is not one.

pub mod transport;

pub use transport::{ClientBody, HttpClient, ReqwestTransport};

use crate::codec::{Codec, Message};
use crate::config::{ClientConfig, DEFAULT_PATH_PREFIX};
use crate::context::{Context, ContextError, TWIRP_VERSION_HEADER, check_reserved_headers};
use crate::descriptor::{MethodKind, ServiceDescriptor, camel_case, normalize_prefix};
use crate::error::Error;
use crate::error::envelope::{error_from_body, redirect_error};
use crate::hooks::ClientHooks;
use crate::interceptor::{AnyMessage, Interceptor, Method, chain_interceptors, intercept, method_fn};
use crate::stream::StreamReader;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use http_body_util::BodyExt;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Value of the `Twirp-Version` header on every request.
const TWIRP_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

/// Errors from [`ClientBuilder::build`].
#[derive(Debug, Error)]
pub enum ClientBuildError {
    #[error("invalid client header: {0}")]
    ReservedHeader(Error),

    #[error("invalid request URL {0:?}")]
    InvalidUrl(String),

    #[error("failed to build HTTP transport: {0}")]
    Transport(#[from] reqwest::Error),
}

struct ClientRoute {
    kind: MethodKind,
    uri: Uri,
}

/// Configures and builds a [`Client`].
pub struct ClientBuilder {
    base_url: String,
    descriptor: ServiceDescriptor,
    path_prefix: String,
    literal_urls: bool,
    codec: Codec,
    headers: HeaderMap,
    hooks: ClientHooks,
    interceptors: Vec<Interceptor>,
    transport: Option<Arc<dyn HttpClient>>,
    config: ClientConfig,
}

impl ClientBuilder {
    /// Use the IDL spelling of service and method names in URLs instead of
    /// their camel-cased form.
    pub fn with_literal_urls(mut self, literal: bool) -> Self {
        self.literal_urls = literal;
        self
    }

    pub fn with_path_prefix(mut self, prefix: &str) -> Self {
        self.path_prefix = prefix.to_string();
        self
    }

    /// Protobuf by default.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Adds a header sent with every request. Protocol-owned headers make
    /// [`ClientBuilder::build`] fail.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_hooks(mut self, hooks: ClientHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_interceptor(mut self, interceptor: Interceptor) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn with_interceptors(mut self, interceptors: impl IntoIterator<Item = Interceptor>) -> Self {
        self.interceptors.extend(interceptors);
        self
    }

    /// Replaces the default `reqwest` transport. The configured
    /// [`ClientConfig`] is then unused.
    pub fn with_transport(mut self, transport: Arc<dyn HttpClient>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Client, ClientBuildError> {
        check_reserved_headers(&self.headers).map_err(ClientBuildError::ReservedHeader)?;

        let base = with_scheme(&self.base_url);
        let prefix = normalize_prefix(&self.path_prefix);
        let service = if self.literal_urls {
            self.descriptor.fully_qualified_name()
        } else {
            self.descriptor.camel_fully_qualified_name()
        };

        let mut routes = HashMap::with_capacity(self.descriptor.methods.len());
        for method in &self.descriptor.methods {
            let segment = if self.literal_urls {
                method.name.clone()
            } else {
                camel_case(&method.name)
            };
            let url = format!("{base}{prefix}/{service}/{segment}");
            let uri: Uri = url.parse().map_err(|_| ClientBuildError::InvalidUrl(url.clone()))?;
            routes.insert(
                method.name.clone(),
                ClientRoute {
                    kind: method.kind,
                    uri,
                },
            );
        }

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(&self.config)?),
        };

        Ok(Client {
            inner: Arc::new(ClientInner {
                descriptor: self.descriptor,
                codec: self.codec,
                routes,
                headers: self.headers,
                hooks: self.hooks,
                interceptor: chain_interceptors(&self.interceptors),
                transport,
            }),
        })
    }
}

/// Adds `http://` when the base URL has no scheme and strips trailing
/// slashes.
fn with_scheme(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

struct ClientInner {
    descriptor: ServiceDescriptor,
    codec: Codec,
    routes: HashMap<String, ClientRoute>,
    headers: HeaderMap,
    hooks: ClientHooks,
    interceptor: Option<Interceptor>,
    transport: Arc<dyn HttpClient>,
}

/// Client for one Twirp service. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(base_url: impl Into<String>, descriptor: ServiceDescriptor) -> ClientBuilder {
        ClientBuilder {
            base_url: base_url.into(),
            descriptor,
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
            literal_urls: false,
            codec: Codec::Protobuf,
            headers: HeaderMap::new(),
            hooks: ClientHooks::default(),
            interceptors: Vec::new(),
            transport: None,
            config: ClientConfig::default(),
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.inner.descriptor
    }

    pub fn codec(&self) -> Codec {
        self.inner.codec
    }

    /// The URL requests for `method` are posted to.
    pub fn url(&self, method: &str) -> Option<String> {
        let method = self.inner.descriptor.find_method(method)?;
        self.inner.routes.get(&method.name).map(|route| route.uri.to_string())
    }

    /// Calls a unary method.
    pub async fn call_unary<Req, Resp>(&self, ctx: Context, method: &str, request: Req) -> Result<Resp, Error>
    where
        Req: Message,
        Resp: Message,
    {
        let (ctx, uri) = self.route(ctx, method, MethodKind::Unary)?;
        let client = self.clone();
        let terminal = method_fn(move |ctx, req: AnyMessage| {
            let client = client.clone();
            let uri = uri.clone();
            async move {
                let req = downcast::<Req>(req, "request")?;
                let resp = client.do_unary::<Req, Resp>(ctx, uri, req).await?;
                Ok(Box::new(resp) as AnyMessage)
            }
        });
        let response = self.invoke(terminal, ctx, Box::new(request)).await?;
        downcast::<Resp>(response, "response")
    }

    /// Calls a server-streaming method. Returns once the response headers
    /// arrive; messages are then pulled from the reader.
    pub async fn call_server_streaming<Req, Resp>(
        &self,
        ctx: Context,
        method: &str,
        request: Req,
    ) -> Result<StreamReader<Resp>, Error>
    where
        Req: Message,
        Resp: Message,
    {
        let (ctx, uri) = self.route(ctx, method, MethodKind::Download)?;
        let client = self.clone();
        let terminal = method_fn(move |ctx, req: AnyMessage| {
            let client = client.clone();
            let uri = uri.clone();
            async move {
                let req = downcast::<Req>(req, "request")?;
                let reader = client.do_server_streaming::<Req, Resp>(ctx, uri, req).await?;
                Ok(Box::new(reader) as AnyMessage)
            }
        });
        let response = self.invoke(terminal, ctx, Box::new(request)).await?;
        downcast::<StreamReader<Resp>>(response, "response")
    }

    async fn invoke(&self, terminal: Method, ctx: Context, request: AnyMessage) -> Result<AnyMessage, Error> {
        let method = intercept(self.inner.interceptor.as_ref(), terminal);
        method(ctx, request).await
    }

    fn route(&self, mut ctx: Context, method: &str, kind: MethodKind) -> Result<(Context, Uri), Error> {
        let descriptor = &self.inner.descriptor;
        let found = descriptor.find_method(method).ok_or_else(|| {
            Error::internal(format!(
                "unknown method {method:?} for service {}",
                descriptor.fully_qualified_name()
            ))
        })?;
        let route = self
            .inner
            .routes
            .get(&found.name)
            .ok_or_else(|| Error::internal(format!("no route for method {}", found.name)))?;

        ctx.set_package_name(&descriptor.package);
        ctx.set_service_name(&descriptor.name);
        ctx.set_method_name(&found.name);

        if !route.kind.is_supported() {
            let err = Error::internal(format!("rpc type {:?} is not implemented", route.kind.as_str()));
            return self.finish(&ctx, Err(err));
        }
        if route.kind != kind {
            return Err(Error::internal(format!(
                "method {} is {}, not {}",
                found.name,
                route.kind.as_str(),
                kind.as_str()
            )));
        }
        Ok((ctx, route.uri.clone()))
    }

    async fn do_unary<Req, Resp>(&self, mut ctx: Context, uri: Uri, request: Req) -> Result<Resp, Error>
    where
        Req: Message,
        Resp: Message,
    {
        let codec = self.inner.codec;
        let result = async {
            let response = self.send(&mut ctx, uri, &request).await?;
            let body = read_body(&ctx, response.into_body(), "failed to read response body").await?;
            codec
                .decode::<Resp>(&body)
                .map_err(|err| Error::wrapped(&format!("failed to unmarshal {} response", codec.name()), err))
        }
        .await;
        self.finish(&ctx, result)
    }

    async fn do_server_streaming<Req, Resp>(
        &self,
        mut ctx: Context,
        uri: Uri,
        request: Req,
    ) -> Result<StreamReader<Resp>, Error>
    where
        Req: Message,
        Resp: Message,
    {
        let result = self
            .send(&mut ctx, uri, &request)
            .await
            .map(|response| StreamReader::new(response.into_body(), self.inner.codec, ctx.clone()));
        self.finish(&ctx, result)
    }

    /// Fires exactly one of the response-received or error hooks.
    fn finish<T>(&self, ctx: &Context, result: Result<T, Error>) -> Result<T, Error> {
        match &result {
            Ok(_) => self.inner.hooks.call_response_received(ctx),
            Err(err) => {
                debug!(
                    method = ctx.method_name().unwrap_or(""),
                    code = %err.code(),
                    error = %err.msg(),
                    "Twirp call failed"
                );
                self.inner.hooks.call_error(ctx, err);
            }
        }
        result
    }

    /// Encodes, runs the request-prepared hook, sends, and turns any
    /// non-200 response into an error.
    async fn send<Req: Message>(
        &self,
        ctx: &mut Context,
        uri: Uri,
        request: &Req,
    ) -> Result<http::Response<ClientBody>, Error> {
        let codec = self.inner.codec;
        let body: Bytes = codec
            .encode(request)
            .map_err(|err| Error::wrapped(&format!("failed to marshal {} request", codec.name()), err))?;

        let mut req = http::Request::new(body);
        *req.method_mut() = http::Method::POST;
        *req.uri_mut() = uri;
        let extra = ctx.http_request_headers().clone();
        let headers = req.headers_mut();
        headers.extend(self.inner.headers.clone());
        headers.extend(extra);
        let content_type = HeaderValue::from_static(codec.content_type());
        headers.insert(CONTENT_TYPE, content_type.clone());
        headers.insert(ACCEPT, content_type);
        headers.insert(
            HeaderName::from_static(TWIRP_VERSION_HEADER),
            HeaderValue::from_static(TWIRP_VERSION),
        );

        self.inner.hooks.call_request_prepared(ctx, &mut req)?;
        if let Some(reason) = ctx.err() {
            return Err(aborted(reason));
        }

        debug!(uri = %req.uri(), codec = codec.name(), "Sending Twirp request");
        let response = tokio::select! {
            biased;
            reason = ctx.done() => return Err(aborted(reason)),
            result = self.inner.transport.send(req) => {
                result.map_err(|err| Error::wrapped("failed to do request", err))?
            }
        };

        let status = response.status();
        if status == StatusCode::OK {
            return Ok(response);
        }
        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            return Err(redirect_error(status, location));
        }
        let body = read_body(ctx, response.into_body(), "failed to read server error response body").await?;
        Err(error_from_body(status, &body))
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("service", &self.inner.descriptor.fully_qualified_name())
            .field("codec", &self.inner.codec)
            .field("methods", &self.inner.routes.len())
            .finish()
    }
}

fn aborted(reason: ContextError) -> Error {
    Error::wrapped("aborted because context was done", reason)
}

async fn read_body(ctx: &Context, body: ClientBody, desc: &str) -> Result<Bytes, Error> {
    tokio::select! {
        biased;
        reason = ctx.done() => Err(aborted(reason)),
        collected = body.collect() => collected
            .map(|c| c.to_bytes())
            .map_err(|err| Error::wrapped(desc, err)),
    }
}

fn downcast<M: Any>(message: AnyMessage, what: &str) -> Result<M, Error> {
    message
        .downcast::<M>()
        .map(|m| *m)
        .map_err(|_| Error::internal(format!("{what} has an unexpected message type")))
}
