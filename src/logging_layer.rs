//! Request logging for served Twirp routes.
//!
//! A `tower_http` [`TraceLayer`] whose span names the RPC being called,
//! parsed from the route path. Error responses carry their [`ErrorCode`] as
//! a response extension, so the response log shows the Twirp code next to
//! the HTTP status.

use crate::codec::Codec;
use crate::descriptor::parse_route_path;
use crate::error::ErrorCode;
use http::header::{AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION};
use http::{HeaderMap, HeaderName, Request, Response};
use std::fmt;
use std::time::Duration;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::{DefaultOnEos, MakeSpan, OnRequest, OnResponse, TraceLayer};
use tracing::{Level, Span, debug, info, warn};

/// Header carrying the request id, read if present and generated otherwise.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const TWIRP_VERSION_HEADER: &str = "twirp-version";

const MAX_LOGGED_VALUE: usize = 256;

pub type TwirpTraceLayer =
    TraceLayer<SharedClassifier<ServerErrorsAsFailures>, RpcSpan, LogRequest, LogResponse, (), DefaultOnEos, ()>;

/// The logging layer [`crate::server::serve`] puts in front of every server.
///
/// Failures are logged by the dispatcher, which knows the Twirp error, so
/// the layer's own failure callback is a no-op.
pub fn logging_layer() -> TwirpTraceLayer {
    TraceLayer::new_for_http()
        .make_span_with(RpcSpan)
        .on_request(LogRequest)
        .on_response(LogResponse)
        .on_body_chunk(())
        .on_failure(())
}

/// `package.Service` and method named by a route path, or empty strings.
fn rpc_name(path: &str) -> (&str, &str) {
    parse_route_path(path)
        .map(|route| (route.service, route.method))
        .unwrap_or_default()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Opens a `twirp_request` span per request.
#[derive(Clone, Copy, Debug, Default)]
pub struct RpcSpan;

impl<B> MakeSpan<B> for RpcSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let request_id = header_str(request.headers(), REQUEST_ID_HEADER)
            .map(str::to_owned)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (service, method) = rpc_name(request.uri().path());

        tracing::info_span!(
            "twirp_request",
            rpc.service = service,
            rpc.method = method,
            http.method = %request.method(),
            request_id = %request_id,
        )
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LogRequest;

impl<B> OnRequest<B> for LogRequest {
    fn on_request(&mut self, request: &Request<B>, _span: &Span) {
        let headers = request.headers();
        let codec = header_str(headers, "content-type")
            .and_then(Codec::from_content_type)
            .map(Codec::name)
            .unwrap_or("unsupported");
        info!(
            codec,
            twirp_version = header_str(headers, TWIRP_VERSION_HEADER).unwrap_or("-"),
            "Request received"
        );

        if tracing::enabled!(Level::DEBUG) {
            debug!(headers = %RedactedHeaders(headers), "Request headers");
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LogResponse;

impl<B> OnResponse<B> for LogResponse {
    fn on_response(self, response: &Response<B>, latency: Duration, _span: &Span) {
        let status = response.status().as_u16();
        let latency_ms = latency.as_millis() as u64;

        match response.extensions().get::<ErrorCode>() {
            None => info!(status, latency_ms, "Response started"),
            Some(code) if response.status().is_server_error() => {
                warn!(status, latency_ms, twirp_code = %code, "Error response")
            }
            Some(code) => info!(status, latency_ms, twirp_code = %code, "Error response"),
        }
    }
}

/// `name="value"` pairs with credentials hidden.
struct RedactedHeaders<'a>(&'a HeaderMap);

impl fmt::Display for RedactedHeaders<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{name}=")?;
            if value.is_sensitive() || is_credential(name) {
                f.write_str("<redacted>")?;
                continue;
            }
            match value.to_str() {
                // to_str only succeeds on visible ASCII, so any byte index is
                // a char boundary.
                Ok(text) if text.len() > MAX_LOGGED_VALUE => {
                    write!(f, "{:?}...({} bytes)", &text[..MAX_LOGGED_VALUE], text.len())?
                }
                Ok(text) => write!(f, "{text:?}")?,
                Err(_) => write!(f, "<{} opaque bytes>", value.len())?,
            }
        }
        Ok(())
    }
}

fn is_credential(name: &HeaderName) -> bool {
    let name_str = name.as_str();
    [AUTHORIZATION, PROXY_AUTHORIZATION, COOKIE].contains(name)
        || name_str.ends_with("-token")
        || name_str.ends_with("-key")
}
