//! JSON error envelope.
//!
//! Every non-200 response body is `{"code": ..., "msg": ..., "meta": {...}}`,
//! independent of the codec the request used. This module converts between
//! [`Error`] and that envelope, and synthesizes errors for responses that
//! came from something other than a Twirp server.

use super::{Error, ErrorCode};
use bytes::Bytes;
use http::{HeaderValue, Response, StatusCode, header};
use http_body_util::Full;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Upper bound on the serialized `msg` field.
pub const MAX_MESSAGE_BYTES: usize = 1_000_000;

const FALLBACK_BODY: &str =
    r#"{"code":"internal","msg":"There was an error but it could not be serialized into JSON"}"#;

/// Serialized form of an [`Error`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(default)]
    pub code: String,

    #[serde(default)]
    pub msg: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

impl ErrorEnvelope {
    pub fn from_error(err: &Error) -> Self {
        Self {
            code: err.code().as_str().to_string(),
            msg: truncate(err.msg(), MAX_MESSAGE_BYTES).to_string(),
            meta: err.meta_map(),
        }
    }

    /// Converts the envelope back into an error. An unrecognized code is
    /// reported as `Internal` rather than trusted.
    pub fn into_error(self) -> Error {
        let Ok(code) = self.code.parse::<ErrorCode>() else {
            return Error::internal(format!(
                "invalid type returned from server error response: {}",
                self.code
            ));
        };
        self.meta
            .into_iter()
            .fold(Error::new(code, self.msg), |err, (k, v)| err.with_meta(k, v))
    }
}

/// Serializes `err` as a JSON envelope.
pub fn marshal_error(err: &Error) -> Bytes {
    match serde_json::to_vec(&ErrorEnvelope::from_error(err)) {
        Ok(buf) => Bytes::from(buf),
        Err(_) => Bytes::from_static(FALLBACK_BODY.as_bytes()),
    }
}

/// Parses a JSON envelope into an error.
pub fn unmarshal_error(body: &[u8]) -> Result<Error, serde_json::Error> {
    serde_json::from_slice::<ErrorEnvelope>(body).map(ErrorEnvelope::into_error)
}

/// Builds a standalone JSON error response, for use outside the dispatcher
/// (middleware, fallbacks).
pub fn error_response(err: &Error) -> Response<Full<Bytes>> {
    let body = marshal_error(err);
    let len = body.len();
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = err.http_status();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    response
}

/// Error for a response that did not come from a Twirp server. The HTTP
/// status picks the code; `detail` is stored as `location` for redirects and
/// as `body` otherwise.
pub fn intermediary_error(status: StatusCode, msg: String, detail: String) -> Error {
    let key = if status.is_redirection() { "location" } else { "body" };
    Error::new(ErrorCode::from_intermediary_status(status), msg)
        .with_meta("http_error_from_intermediary", "true")
        .with_meta("status_code", status.as_u16().to_string())
        .with_meta(key, detail)
}

/// Error for an unexpected redirect. Redirects are never followed.
pub fn redirect_error(status: StatusCode, location: &str) -> Error {
    let msg = format!(
        "unexpected HTTP status code {} {:?} received, Location={:?}",
        status.as_u16(),
        status_text(status),
        location
    );
    intermediary_error(status, msg, location.to_string())
}

/// Error for a non-200 response body.
///
/// Any body that decodes as an envelope is trusted, so a JSON object with a
/// missing or unknown code becomes `Internal`. Everything else falls back to
/// the intermediary mapping.
pub fn error_from_body(status: StatusCode, body: &[u8]) -> Error {
    match serde_json::from_slice::<ErrorEnvelope>(body) {
        Ok(envelope) => envelope.into_error(),
        Err(_) => {
            let msg = format!(
                "Error from intermediary with HTTP status code {} {:?}",
                status.as_u16(),
                status_text(status)
            );
            intermediary_error(status, msg, String::from_utf8_lossy(body).into_owned())
        }
    }
}

fn status_text(status: StatusCode) -> &'static str {
    status.canonical_reason().unwrap_or("")
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
