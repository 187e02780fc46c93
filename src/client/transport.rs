//! HTTP transport used by [`super::Client`].
//!
//! The client only needs "send one request, get one response with a
//! streaming body". [`HttpClient`] is that seam; [`ReqwestTransport`] is the
//! default implementation with connection pooling. Redirects are never
//! followed: a 3xx is reported to the caller as an intermediary error.

use crate::config::ClientConfig;
use crate::error::BoxError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body::Frame;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, StreamBody};

/// Streaming response body handed back by a transport.
pub type ClientBody = UnsyncBoxBody<Bytes, BoxError>;

/// Sends fully buffered requests and returns streaming responses.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: http::Request<Bytes>) -> Result<http::Response<ClientBody>, BoxError>;
}

/// [`HttpClient`] backed by a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .tcp_nodelay(true);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Wraps an existing client. It should not follow redirects.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestTransport {
    async fn send(&self, request: http::Request<Bytes>) -> Result<http::Response<ClientBody>, BoxError> {
        let (parts, body) = request.into_parts();
        let response = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let version = response.version();
        let headers = response.headers().clone();
        let frames = response
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(|e| Box::new(e) as BoxError);

        let mut out = http::Response::new(StreamBody::new(frames).boxed_unsync());
        *out.status_mut() = status;
        *out.version_mut() = version;
        *out.headers_mut() = headers;
        Ok(out)
    }
}
