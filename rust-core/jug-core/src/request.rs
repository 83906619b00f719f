//! # HTTP Request
//!
//! Request wrapper with lazy parsing.
//!
//! - Headers and body are stored as received
//! - Query string is parsed on first access and kept in arrival order, so
//!   repeated keys (`?tag=a&tag=b`) survive for `query_array`

use crate::error::{Error, Result};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, CONTENT_LENGTH};
use std::net::SocketAddr;
use std::sync::OnceLock;

/// An incoming request with its body fully collected
#[derive(Debug)]
pub struct Request {
    method: hyper::Method,
    uri: hyper::Uri,
    headers: HeaderMap,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
    query: OnceLock<Vec<(String, String)>>,
}

impl Request {
    /// Wrap a request whose body is already in memory
    #[must_use]
    pub fn new(req: hyper::Request<Bytes>, remote_addr: Option<SocketAddr>) -> Self {
        let (parts, body) = req.into_parts();
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            remote_addr,
            query: OnceLock::new(),
        }
    }

    /// HTTP method as received
    #[must_use]
    pub const fn method(&self) -> &hyper::Method {
        &self.method
    }

    /// Request path (without query string)
    #[must_use]
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Raw query string (e.g. `page=1&limit=10`)
    #[must_use]
    pub fn query_string(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Request URI
    #[must_use]
    pub const fn uri(&self) -> &hyper::Uri {
        &self.uri
    }

    /// All request headers
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a header value by name (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The request body
    #[must_use]
    pub const fn body(&self) -> &Bytes {
        &self.body
    }

    /// Peer address of the connection, when served from a socket
    #[must_use]
    pub const fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Decoded query pairs in arrival order
    pub fn query_pairs(&self) -> &[(String, String)] {
        self.query
            .get_or_init(|| parse_query_string(self.uri.query()))
    }

    /// First value for `key`
    #[must_use]
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query_pairs()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `key`, in arrival order
    #[must_use]
    pub fn query_values(&self, key: &str) -> Vec<String> {
        self.query_pairs()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

/// Collect a hyper request body, enforcing `max_body_size`.
///
/// A declared `Content-Length` over the limit is refused before any of the
/// body is read. Otherwise the body is read through [`Limited`], so a chunked
/// upload stops as soon as it crosses the limit.
///
/// # Errors
///
/// Returns `Error::PayloadTooLarge` when the body exceeds the limit,
/// `Error::Http` when the body stream fails.
pub async fn collect_body(
    req: hyper::Request<hyper::body::Incoming>,
    max_body_size: usize,
) -> Result<hyper::Request<Bytes>> {
    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|len| len.to_str().ok())
        .and_then(|len| len.parse::<usize>().ok());
    let too_large = || Error::PayloadTooLarge {
        limit: max_body_size,
        declared,
    };
    if declared.is_some_and(|len| len > max_body_size) {
        return Err(too_large());
    }

    let (parts, body) = req.into_parts();
    let bytes = match Limited::new(body, max_body_size).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) if err.is::<LengthLimitError>() => return Err(too_large()),
        Err(err) => {
            return Err(match err.downcast::<hyper::Error>() {
                Ok(err) => Error::Http(*err),
                Err(err) => Error::Io(std::io::Error::other(err)),
            })
        }
    };
    Ok(hyper::Request::from_parts(parts, bytes))
}

/// Parse query string into ordered pairs
///
/// Handles URL decoding; keys without `=` get an empty value.
fn parse_query_string(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|q| {
            q.split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| {
                    let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                    (url_decode(key), url_decode(value))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Lenient URL decoding: malformed escapes are kept verbatim
pub(crate) fn url_decode(s: &str) -> String {
    decode(s, false).unwrap_or_else(|| s.to_string())
}

/// Strict URL decoding: `None` on a malformed `%` escape
pub(crate) fn url_unescape(s: &str) -> Option<String> {
    decode(s, true)
}

fn decode(s: &str, strict: bool) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .filter(|h| h.iter().all(u8::is_ascii_hexdigit))
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None if strict => return None,
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    Some(String::from_utf8_lossy(&out).into_owned())
}

/// Form-style escaping: unreserved bytes pass, space becomes `+`
pub(crate) fn query_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
