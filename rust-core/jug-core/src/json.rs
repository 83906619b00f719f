//! # JSON Serialization Module
//!
//! Request bodies are parsed with simd-json; responses are written with
//! serde_json.
//!
//! ## Body classification
//!
//! Binding needs to tell an absent body apart from a broken one, so
//! [`parse_body`] reports [`BodyError::Missing`] for an empty (or
//! whitespace-only) body before the parser ever runs.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Why a request body could not be bound
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    /// The body was empty
    #[error("request body is missing")]
    Missing,
    /// The body was present but not valid JSON for the target type
    #[error("{0}")]
    Malformed(String),
}

/// Parse a request body into `T`.
///
/// simd-json parses in place, so the body is copied into a scratch buffer
/// first; the request keeps its original bytes for `raw_data`.
///
/// # Errors
///
/// Returns [`BodyError::Missing`] for an empty body and
/// [`BodyError::Malformed`] when parsing fails.
pub fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, BodyError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(BodyError::Missing);
    }
    let mut scratch = body.to_vec();
    parse_json_bytes(&mut scratch)
}

/// Parse JSON bytes to a typed value using simd-json
///
/// # Errors
///
/// Returns [`BodyError::Malformed`] with the parser's message if parsing fails.
pub fn parse_json_bytes<T: DeserializeOwned>(bytes: &mut [u8]) -> Result<T, BodyError> {
    simd_json::from_slice(bytes).map_err(|e| BodyError::Malformed(e.to_string()))
}

/// Serialize a value to JSON bytes
///
/// # Errors
///
/// Returns the serde_json error if `T`'s `Serialize` impl fails.
pub fn to_json_vec<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(value)
}

/// The `{"error": "<message>"}` body used by every error response
#[must_use]
pub fn error_body(message: &str) -> serde_json::Value {
    serde_json::json!({ "error": message })
}
