//! Canonical error model for the Twirp protocol.
//!
//! Every failure that crosses the wire is an [`Error`]: a closed [`ErrorCode`],
//! a human readable message and a string map of metadata. Errors are immutable
//! values; [`Error::with_meta`] returns a new error and never touches the
//! receiver, so a single base error can be shared across request tasks.
//!
//! ## Module Organization
//!
//! - `envelope` - JSON error envelope and the intermediary fallback mapping
//! - `Error` / `ErrorCode` - the error value and its code table

pub mod envelope;

use http::StatusCode;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Boxed error used for handler and transport failures that are not yet
/// Twirp errors.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Shared cause attached to an [`Error`].
pub type Cause = Arc<dyn StdError + Send + Sync>;

/// Closed set of Twirp error codes.
///
/// | Code | HTTP | Code | HTTP |
/// |---|---|---|---|
/// | Canceled | 408 | Aborted | 409 |
/// | Unknown | 500 | OutOfRange | 400 |
/// | InvalidArgument | 400 | Unimplemented | 501 |
/// | Malformed | 400 | Internal | 500 |
/// | DeadlineExceeded | 408 | Unavailable | 503 |
/// | NotFound | 404 | DataLoss | 500 |
/// | BadRoute | 404 | FailedPrecondition | 412 |
/// | AlreadyExists | 409 | ResourceExhausted | 403 |
/// | PermissionDenied | 403 | Unauthenticated | 401 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The operation was cancelled.
    Canceled,
    /// An unknown error occurred.
    Unknown,
    /// The client specified an invalid argument.
    InvalidArgument,
    /// The client sent a message which could not be decoded.
    Malformed,
    /// The operation expired before completion.
    DeadlineExceeded,
    /// Some requested entity was not found.
    NotFound,
    /// The requested URL path wasn't routable to a Twirp method.
    BadRoute,
    /// An attempt to create an entity failed because one already exists.
    AlreadyExists,
    /// The caller does not have permission to execute the operation.
    PermissionDenied,
    /// The request does not have valid authentication credentials.
    Unauthenticated,
    /// Some resource has been exhausted or rate-limited.
    ResourceExhausted,
    /// The system is not in a state required for the operation.
    FailedPrecondition,
    /// The operation was aborted, typically due to a concurrency issue.
    Aborted,
    /// The operation was attempted past the valid range.
    OutOfRange,
    /// The operation is not implemented or not supported.
    Unimplemented,
    /// An invariant expected by the underlying system has been broken.
    Internal,
    /// The service is currently unavailable.
    Unavailable,
    /// Unrecoverable data loss or corruption.
    DataLoss,
}

impl ErrorCode {
    /// Every canonical code, in declaration order.
    pub const ALL: [ErrorCode; 18] = [
        ErrorCode::Canceled,
        ErrorCode::Unknown,
        ErrorCode::InvalidArgument,
        ErrorCode::Malformed,
        ErrorCode::DeadlineExceeded,
        ErrorCode::NotFound,
        ErrorCode::BadRoute,
        ErrorCode::AlreadyExists,
        ErrorCode::PermissionDenied,
        ErrorCode::Unauthenticated,
        ErrorCode::ResourceExhausted,
        ErrorCode::FailedPrecondition,
        ErrorCode::Aborted,
        ErrorCode::OutOfRange,
        ErrorCode::Unimplemented,
        ErrorCode::Internal,
        ErrorCode::Unavailable,
        ErrorCode::DataLoss,
    ];

    /// Wire representation used in the JSON envelope.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
            Self::InvalidArgument => "invalid_argument",
            Self::Malformed => "malformed",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::NotFound => "not_found",
            Self::BadRoute => "bad_route",
            Self::AlreadyExists => "already_exists",
            Self::PermissionDenied => "permission_denied",
            Self::Unauthenticated => "unauthenticated",
            Self::ResourceExhausted => "resource_exhausted",
            Self::FailedPrecondition => "failed_precondition",
            Self::Aborted => "aborted",
            Self::OutOfRange => "out_of_range",
            Self::Unimplemented => "unimplemented",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
            Self::DataLoss => "dataloss",
        }
    }

    /// HTTP status a server responds with for this code.
    pub const fn http_status(self) -> StatusCode {
        match self {
            Self::Canceled => StatusCode::REQUEST_TIMEOUT,
            Self::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidArgument => StatusCode::BAD_REQUEST,
            Self::Malformed => StatusCode::BAD_REQUEST,
            Self::DeadlineExceeded => StatusCode::REQUEST_TIMEOUT,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::BadRoute => StatusCode::NOT_FOUND,
            Self::AlreadyExists => StatusCode::CONFLICT,
            Self::PermissionDenied => StatusCode::FORBIDDEN,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::ResourceExhausted => StatusCode::FORBIDDEN,
            Self::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
            Self::Aborted => StatusCode::CONFLICT,
            Self::OutOfRange => StatusCode::BAD_REQUEST,
            Self::Unimplemented => StatusCode::NOT_IMPLEMENTED,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Code synthesized for a non-Twirp response from an intermediary
    /// (proxy, load balancer) that carries the given HTTP status.
    pub fn from_intermediary_status(status: StatusCode) -> Self {
        match status.as_u16() {
            300..=399 | 400 => Self::Internal,
            401 => Self::Unauthenticated,
            403 => Self::PermissionDenied,
            404 => Self::BadRoute,
            429 | 502 | 503 | 504 => Self::Unavailable,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not one of the canonical codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid error code: {0:?}")]
pub struct InvalidErrorCode(pub String);

impl FromStr for ErrorCode {
    type Err = InvalidErrorCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCode::ALL
            .into_iter()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| InvalidErrorCode(s.to_string()))
    }
}

/// Returns true if `code` is one of the canonical wire codes.
pub fn is_valid_error_code(code: &str) -> bool {
    code.parse::<ErrorCode>().is_ok()
}

/// A Twirp error: code, message, metadata and an optional local cause.
///
/// The cause is never serialized. It is reachable through
/// [`std::error::Error::source`] so callers can introspect what went wrong
/// (for example a cancelled request context on the client).
#[derive(Debug, Clone, Error)]
#[error("twirp error {code}: {msg}")]
pub struct Error {
    code: ErrorCode,
    msg: String,
    meta: Arc<BTreeMap<String, String>>,
    #[source]
    cause: Option<Cause>,
}

impl Error {
    /// Creates an error with the given code and message.
    pub fn new(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            meta: Arc::default(),
            cause: None,
        }
    }

    /// Creates an error that wraps an underlying cause. The cause is kept
    /// for local introspection only; `msg` is what goes on the wire.
    pub fn wrap(code: ErrorCode, msg: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self {
            cause: Some(Arc::from(cause.into())),
            ..Self::new(code, msg)
        }
    }

    /// `NotFound` with the given message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, msg)
    }

    /// `InvalidArgument` for a named argument, e.g. `"Inches I can't make a
    /// hat that small!"`. The argument name is recorded under `argument`.
    pub fn invalid_argument(argument: &str, reason: &str) -> Self {
        Self::new(ErrorCode::InvalidArgument, format!("{argument} {reason}"))
            .with_meta("argument", argument)
    }

    /// `InvalidArgument` for a required argument that was not provided.
    pub fn required_argument(argument: &str) -> Self {
        Self::invalid_argument(argument, "is required")
    }

    /// `Internal` with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, msg)
    }

    /// `Internal` carrying `cause`, using the cause text as message.
    ///
    /// Only for errors whose text is safe to expose, such as client-side
    /// failures that never leave the process.
    pub fn internal_with(cause: impl Into<BoxError>) -> Self {
        let cause = cause.into();
        let msg = cause.to_string();
        Self::wrap(ErrorCode::Internal, msg, cause)
    }

    /// `Malformed` with the given message.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Malformed, msg)
    }

    /// `Unimplemented` with the given message.
    pub fn unimplemented(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unimplemented, msg)
    }

    /// `BadRoute` tagged with the offending verb and path.
    pub fn bad_route(msg: impl Into<String>, method: &str, path: &str) -> Self {
        Self::new(ErrorCode::BadRoute, msg).with_meta("twirp_invalid_route", format!("{method} {path}"))
    }

    /// Recovers a Twirp error from a boxed error, or wraps anything else as
    /// `Internal` with a generic message so the cause never reaches the wire.
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<Error>() {
            Ok(twerr) => *twerr,
            Err(other) => Self::wrap(ErrorCode::Internal, "internal error", other),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }

    /// Returns a copy of this error with `key` set to `value`.
    ///
    /// The receiver and every copy previously derived from it are left
    /// untouched; the metadata map is copied before the insert.
    #[must_use]
    pub fn with_meta(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut meta = BTreeMap::clone(&self.meta);
        meta.insert(key.into(), value.into());
        Self {
            code: self.code,
            msg: self.msg.clone(),
            meta: Arc::new(meta),
            cause: self.cause.clone(),
        }
    }

    /// Metadata value for `key`, or the empty string if absent.
    pub fn meta(&self, key: &str) -> &str {
        self.meta.get(key).map(String::as_str).unwrap_or("")
    }

    /// Snapshot of all metadata.
    pub fn meta_map(&self) -> BTreeMap<String, String> {
        BTreeMap::clone(&self.meta)
    }

    /// The wrapped cause, if any.
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Hint set by services through the `retryable` metadata key. The runtime
    /// itself never retries.
    pub fn is_retryable(&self) -> bool {
        self.meta("retryable") == "true"
    }

    /// HTTP status for this error's code.
    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    /// `Internal` reading `"{desc}: {cause}"`, keeping the cause. Used for
    /// local failures on the client side.
    pub(crate) fn wrapped(desc: &str, cause: impl Into<BoxError>) -> Self {
        let cause = cause.into();
        Self::wrap(ErrorCode::Internal, format!("{desc}: {cause}"), cause)
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.msg == other.msg && self.meta == other.meta
    }
}

/// Shorthand for results carrying a Twirp [`Error`].
pub type TwirpResult<T> = Result<T, Error>;
