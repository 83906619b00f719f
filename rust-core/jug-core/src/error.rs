//! # Error Handling
//!
//! Centralized error types for jug.
//! Uses `thiserror` for ergonomic error definitions.
//!
//! Two families live here:
//!
//! - [`Error`] covers failures of the library itself (binding a socket,
//!   compiling the route table, parsing a query value).
//! - [`ResponseStatusError`] and [`ValidationError`] are meant to travel out of
//!   handlers and be turned into HTTP responses by
//!   [`Context::handle_error`](crate::Context::handle_error).

use hyper::StatusCode;
use thiserror::Error;

/// Result type alias for jug operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the jug runtime
#[derive(Error, Debug)]
pub enum Error {
    /// Server failed to bind to the specified address
    #[error("Failed to bind server to {address}: {source}")]
    BindError {
        /// The address we tried to bind to
        address: String,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Invalid route pattern provided, or two routes conflict in the tree
    #[error("Invalid route pattern: {pattern}: {reason}")]
    InvalidRoutePattern {
        /// The invalid pattern
        pattern: String,
        /// Reason for invalidity
        reason: String,
    },

    /// A query value could not be converted to the requested type
    #[error("Invalid query parameter {key}={value:?}: {reason}")]
    InvalidQuery {
        /// Query key
        key: String,
        /// Raw value as received
        value: String,
        /// Why the conversion failed
        reason: String,
    },

    /// A path parameter could not be converted to the requested type
    #[error("Invalid path parameter {key}={value:?}: {reason}")]
    InvalidParam {
        /// Parameter name
        key: String,
        /// Raw value as matched
        value: String,
        /// Why the conversion failed
        reason: String,
    },

    /// HTTP protocol error
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A value expected in the request key store was absent or of another type
    #[error("Key {key:?} does not exist")]
    MissingKey {
        /// The key looked up
        key: String,
    },

    /// A cookie name or attribute cannot be rendered safely
    #[error("Invalid cookie {name:?}: {reason}")]
    InvalidCookie {
        /// Cookie name
        name: String,
        /// Which part was rejected
        reason: &'static str,
    },

    /// Request payload too large
    #[error("Payload too large: limit={limit} bytes")]
    PayloadTooLarge {
        /// Max allowed size
        limit: usize,
        /// `Content-Length` of the request, when it declared one
        declared: Option<usize>,
    },
}

/// An error that knows which HTTP status it should be reported with.
///
/// Return it (directly or wrapped in `anyhow`) from a handler and
/// [`Context::handle_error`](crate::Context::handle_error) writes
/// `{"error": message}` with [`status`](Self::status).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ResponseStatusError {
    /// Status code the error maps to
    pub status: StatusCode,
    /// Human-readable message, sent to the client
    pub message: String,
}

impl ResponseStatusError {
    /// Create an error with an arbitrary status
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// 400 Bad Request
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// 401 Unauthorized
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    /// 403 Forbidden
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    /// 404 Not Found
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// 409 Conflict
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

/// Joined validation failure messages produced by
/// [`Validator::validate`](crate::Validator::validate).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    /// The joined message
    #[must_use]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<ValidationError> for ResponseStatusError {
    fn from(err: ValidationError) -> Self {
        Self::bad_request(err.0)
    }
}

/// A request that failed JSON binding.
///
/// The `400` response has already been written when a binding method returns
/// this, so a handler only needs to return.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct Rejection {
    /// Status that was written
    pub status: StatusCode,
    /// Message sent in the `{"error": ...}` body
    pub message: String,
}
