//! Request-scoped context.
//!
//! A [`Context`] travels with one RPC through hooks, interceptors and the
//! handler (server side) or the transport call (client side). It carries a
//! closed set of named fields rather than an open key/value bag:
//!
//! | Field | Set by |
//! |---|---|
//! | package / service / method name | dispatcher or client before hooks run |
//! | status code | dispatcher when the response status is known |
//! | HTTP request headers | dispatcher (inbound) or caller (outbound extras) |
//! | response header sink | handlers, via [`Context::set_http_response_header`] |
//! | cancellation token and deadline | caller, or the dispatcher per request |
//!
//! Hooks that need to keep state across lifecycle stages (timers, counters)
//! store typed values in [`Context::extensions_mut`].

use crate::error::Error;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Header carrying the protocol version.
pub const TWIRP_VERSION_HEADER: &str = "twirp-version";

/// Why a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Request-scoped values shared by hooks, interceptors and handlers.
#[derive(Debug, Clone, Default)]
pub struct Context {
    package_name: Option<String>,
    service_name: Option<String>,
    method_name: Option<String>,
    status_code: Option<StatusCode>,
    request_headers: HeaderMap,
    response_headers: Arc<Mutex<HeaderMap>>,
    extensions: http::Extensions,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Protobuf package of the service being called.
    pub fn package_name(&self) -> Option<&str> {
        self.package_name.as_deref()
    }

    /// Service name as declared in the IDL.
    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    /// Method name as declared in the IDL.
    pub fn method_name(&self) -> Option<&str> {
        self.method_name.as_deref()
    }

    /// HTTP status of the response, once known.
    pub fn status_code(&self) -> Option<StatusCode> {
        self.status_code
    }

    pub(crate) fn set_package_name(&mut self, name: &str) {
        self.package_name = Some(name.to_string());
    }

    pub(crate) fn set_service_name(&mut self, name: &str) {
        self.service_name = Some(name.to_string());
    }

    pub(crate) fn set_method_name(&mut self, name: &str) {
        self.method_name = Some(name.to_string());
    }

    pub(crate) fn set_status_code(&mut self, status: StatusCode) {
        self.status_code = Some(status);
    }

    /// Inbound request headers on the server; extra outbound headers on the
    /// client.
    pub fn http_request_headers(&self) -> &HeaderMap {
        &self.request_headers
    }

    /// Attaches headers to be sent with an outgoing client request.
    ///
    /// `Accept`, `Content-Type` and `Twirp-Version` are owned by the
    /// protocol and rejected.
    pub fn with_http_request_headers(mut self, headers: HeaderMap) -> Result<Self, Error> {
        check_reserved_headers(&headers)?;
        self.request_headers = headers;
        Ok(self)
    }

    pub(crate) fn set_http_request_headers(&mut self, headers: HeaderMap) {
        self.request_headers = headers;
    }

    /// Sets a header on the server response. Visible from every clone of
    /// this context.
    pub fn set_http_response_header(&self, name: HeaderName, value: HeaderValue) -> Result<(), Error> {
        if name == CONTENT_TYPE {
            return Err(Error::internal("header key can not be Content-Type"));
        }
        self.response_headers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name, value);
        Ok(())
    }

    /// Snapshot of headers set through [`Context::set_http_response_header`].
    pub fn http_response_headers(&self) -> HeaderMap {
        self.response_headers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn extensions(&self) -> &http::Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut http::Extensions {
        &mut self.extensions
    }

    /// Replaces the cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Sets a deadline `timeout` from now, keeping an earlier one.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Sets a deadline, keeping an earlier one.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `Some` once the context is cancelled or past its deadline.
    pub fn err(&self) -> Option<ContextError> {
        if self.cancel.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => ContextError::Canceled,
                    _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.cancel.cancelled().await;
                ContextError::Canceled
            }
        }
    }
}

pub(crate) fn check_reserved_headers(headers: &HeaderMap) -> Result<(), Error> {
    for (reserved, label) in [
        (ACCEPT.as_str(), "Accept"),
        (CONTENT_TYPE.as_str(), "Content-Type"),
        (TWIRP_VERSION_HEADER, "Twirp-Version"),
    ] {
        if headers.contains_key(reserved) {
            return Err(Error::internal(format!("provided header cannot set {label}")));
        }
    }
    Ok(())
}
