//! # Request Context
//!
//! The per-request handle every handler receives. It bundles:
//!
//! - the collected [`Request`] plus the matched path parameters
//! - typed accessors for query values, path parameters, headers and cookies
//! - JSON binding with validation
//! - the response under construction and its helpers
//! - the handler chain cursor ([`next`](Context::next), [`abort`](Context::abort))
//!
//! `Context` is an `Arc` inside, so clones are cheap and all refer to the same
//! request. That is what lets middleware hold on to the context across
//! `ctx.next().await` and inspect the response afterwards.
//!
//! ## Response lifecycle
//!
//! Responses are buffered until the chain finishes. The status may change
//! freely until the first body byte is written; after that the head counts as
//! written and later status changes are ignored with a warning.
//! [`stream`](Context::stream) commits the head immediately and switches the
//! body to a channel so chunks reach the client while the handler runs.

use crate::body::ResponseBody;
use crate::cookie::{find_cookie, Cookie};
use crate::error::{Error, Rejection, ResponseStatusError, Result, ValidationError};
use crate::handler::BoxedHandler;
use crate::json::{self, BodyError};
use crate::request::{url_unescape, Request};
use crate::state::Keys;
use crate::validation::Validatable;
use chrono::{DateTime, FixedOffset, NaiveDate};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE, SET_COOKIE};
use hyper::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::{self, Display, Write as _};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

const MIME_JSON: &str = "application/json; charset=utf-8";
const MIME_PLAIN: &str = "text/plain; charset=utf-8";
const MIME_EVENT_STREAM: &str = "text/event-stream";

/// The per-request handle passed to every handler
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    request: Request,
    params: Vec<(String, String)>,
    full_path: Option<String>,
    chain: Arc<[BoxedHandler]>,
    index: AtomicUsize,
    aborted: AtomicBool,
    keys: Keys,
    errors: Mutex<Vec<String>>,
    response: Mutex<ResponseState>,
}

struct ResponseState {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    written: bool,
    sink: Sink,
}

/// Where the response goes once it leaves the context
enum Sink {
    /// Nothing sent yet; the dispatcher waits on the other end
    Pending(oneshot::Sender<hyper::Response<ResponseBody>>),
    /// Head sent, body chunks flow through the channel
    Streaming(mpsc::UnboundedSender<Bytes>),
    /// Response handed off
    Closed,
}

impl ResponseState {
    fn take_response(&mut self) -> hyper::Response<ResponseBody> {
        let mut response =
            hyper::Response::new(ResponseBody::full(std::mem::take(&mut self.body)));
        *response.status_mut() = self.status;
        *response.headers_mut() = std::mem::take(&mut self.headers);
        response
    }
}

impl Context {
    pub(crate) fn new(
        request: Request,
        params: Vec<(String, String)>,
        full_path: Option<String>,
        chain: Arc<[BoxedHandler]>,
        sink: oneshot::Sender<hyper::Response<ResponseBody>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                request,
                params,
                full_path,
                chain,
                index: AtomicUsize::new(0),
                aborted: AtomicBool::new(false),
                keys: Keys::new(),
                errors: Mutex::new(Vec::new()),
                response: Mutex::new(ResponseState {
                    status: StatusCode::OK,
                    headers: HeaderMap::new(),
                    body: Vec::new(),
                    written: false,
                    sink: Sink::Pending(sink),
                }),
            }),
        }
    }

    fn response(&self) -> MutexGuard<'_, ResponseState> {
        self.inner
            .response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ---------------------------------------------------------------------
    // Flow
    // ---------------------------------------------------------------------

    /// Run the pending handlers of the chain.
    ///
    /// Middleware calls this to hand control to the rest of the chain and
    /// regains control when they are done.
    pub async fn next(&self) {
        while let Some(handler) = self.next_handler() {
            handler.call(self.clone()).await;
        }
    }

    fn next_handler(&self) -> Option<BoxedHandler> {
        if self.is_aborted() {
            return None;
        }
        let index = self.inner.index.fetch_add(1, Ordering::SeqCst);
        self.inner.chain.get(index).cloned()
    }

    /// Stop the remaining handlers from running.
    ///
    /// The current handler keeps running until it returns.
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
    }

    /// Whether [`abort`](Self::abort) was called
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Abort and write `code` with an empty body
    pub fn abort_with_status(&self, code: StatusCode) {
        self.status(code);
        self.response().written = true;
        self.abort();
    }

    /// Abort and write `{"error": err}` with `code`.
    ///
    /// The message is also recorded in [`errors`](Self::errors).
    pub fn abort_with_error(&self, code: StatusCode, err: impl Display) {
        let message = err.to_string();
        self.push_error(&message);
        self.abort();
        self.json(code, &json::error_body(&message));
    }

    /// Record an error message for the logger
    pub fn push_error(&self, err: impl Display) {
        self.inner
            .errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(err.to_string());
    }

    /// Messages recorded during this request
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.inner
            .errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Turn a handler error into a response.
    ///
    /// - a [`Rejection`] anywhere in the chain: the response was already
    ///   written, nothing more happens
    /// - a [`ResponseStatusError`]: its status and message
    /// - a [`ValidationError`]: 400 with the joined messages
    /// - anything else: 500 with the error's message
    pub fn handle_error(&self, err: impl Into<anyhow::Error>) {
        let err: anyhow::Error = err.into();

        if err.chain().any(|e| e.downcast_ref::<Rejection>().is_some()) {
            return;
        }
        if let Some(status_err) = err
            .chain()
            .find_map(|e| e.downcast_ref::<ResponseStatusError>())
        {
            self.abort_with_error(status_err.status, &status_err.message);
            return;
        }
        if let Some(validation) = err.chain().find_map(|e| e.downcast_ref::<ValidationError>()) {
            self.abort_with_error(StatusCode::BAD_REQUEST, validation.message());
            return;
        }

        error!(
            method = %self.method(),
            path = %self.path(),
            error = %format!("{err:#}"),
            "Handler failed"
        );
        self.abort_with_error(StatusCode::INTERNAL_SERVER_ERROR, &err);
    }

    // ---------------------------------------------------------------------
    // Key store
    // ---------------------------------------------------------------------

    /// Store a value for later handlers in this request
    pub fn set<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.inner.keys.set(key, value);
    }

    /// Read a stored value; `None` when absent or of another type
    #[must_use]
    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        self.inner.keys.get(key)
    }

    /// Read a stored value, aborting with 500 when it is absent.
    ///
    /// Use this for values an earlier middleware is required to set; a miss
    /// is a wiring bug, so the client gets an internal error.
    pub fn must_get<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        let value = self.get(key);
        if value.is_none() {
            let err = Error::MissingKey {
                key: key.to_string(),
            };
            error!(key, "Required context key missing");
            self.abort_with_error(StatusCode::INTERNAL_SERVER_ERROR, err);
        }
        value
    }

    // ---------------------------------------------------------------------
    // Request data
    // ---------------------------------------------------------------------

    /// The underlying request
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// HTTP method as received
    #[must_use]
    pub fn method(&self) -> &hyper::Method {
        self.inner.request.method()
    }

    /// Request path (without query string)
    #[must_use]
    pub fn path(&self) -> &str {
        self.inner.request.path()
    }

    /// The pattern of the matched route, e.g. `/users/{id}`.
    ///
    /// `None` when no route matched.
    #[must_use]
    pub fn full_path(&self) -> Option<&str> {
        self.inner.full_path.as_deref()
    }

    /// Request header by name (case-insensitive)
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.inner.request.header(key)
    }

    /// Raw request body
    #[must_use]
    pub fn raw_data(&self) -> &Bytes {
        self.inner.request.body()
    }

    /// Path parameter captured by the route pattern
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.inner
            .params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Path parameter parsed into `T`.
    ///
    /// # Errors
    ///
    /// `Error::InvalidParam` when the parameter is missing or does not parse.
    pub fn param_as<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let value = self.param(key).ok_or_else(|| Error::InvalidParam {
            key: key.to_string(),
            value: String::new(),
            reason: "missing".to_string(),
        })?;
        value.parse().map_err(|e: T::Err| Error::InvalidParam {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
    }

    /// Cookie value sent by the client
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<String> {
        find_cookie(self.inner.request.headers(), name)
    }

    /// Best guess at the client's address.
    ///
    /// The first hop of `X-Forwarded-For` that parses as an IP address, then
    /// `X-Real-Ip`, then the peer address of the connection.
    #[must_use]
    pub fn client_ip(&self) -> Option<String> {
        let forwarded = self.header("X-Forwarded-For").and_then(|v| {
            v.split(',')
                .find_map(|hop| hop.trim().parse::<IpAddr>().ok())
        });
        let real = || {
            self.header("X-Real-Ip")
                .and_then(|v| v.trim().parse::<IpAddr>().ok())
        };

        forwarded
            .or_else(real)
            .map(|ip| ip.to_string())
            .or_else(|| self.remote_ip())
    }

    /// Peer address of the connection, ignoring proxy headers
    #[must_use]
    pub fn remote_ip(&self) -> Option<String> {
        self.inner
            .request
            .remote_addr()
            .map(|addr| addr.ip().to_string())
    }

    // ---------------------------------------------------------------------
    // Query
    // ---------------------------------------------------------------------

    /// First value of query parameter `key`
    #[must_use]
    pub fn query(&self, key: &str) -> Option<&str> {
        self.inner.request.query_value(key)
    }

    /// Every value of query parameter `key`, in arrival order
    #[must_use]
    pub fn query_array(&self, key: &str) -> Vec<String> {
        self.inner.request.query_values(key)
    }

    /// Query value, or `default` when absent or empty
    #[must_use]
    pub fn default_query(&self, key: &str, default: &str) -> String {
        self.query(key)
            .filter(|v| !v.is_empty())
            .unwrap_or(default)
            .to_string()
    }

    /// Query value parsed as an integer.
    ///
    /// # Errors
    ///
    /// `Error::InvalidQuery` when a non-empty value is not an integer.
    pub fn int_query(&self, key: &str) -> Result<Option<i64>> {
        self.parse_query(key, |v| v.parse::<i64>().map_err(|e| e.to_string()))
    }

    /// Like [`int_query`](Self::int_query) with a fallback for absent values
    ///
    /// # Errors
    ///
    /// `Error::InvalidQuery` when a non-empty value is not an integer.
    pub fn default_int_query(&self, key: &str, default: i64) -> Result<i64> {
        Ok(self.int_query(key)?.unwrap_or(default))
    }

    /// Query value parsed as a boolean.
    ///
    /// Accepts `1 t T TRUE true True` and `0 f F FALSE false False`.
    ///
    /// # Errors
    ///
    /// `Error::InvalidQuery` for any other non-empty value.
    pub fn bool_query(&self, key: &str) -> Result<Option<bool>> {
        self.parse_query(key, |v| {
            parse_bool(v).ok_or_else(|| "invalid boolean literal".to_string())
        })
    }

    /// Like [`bool_query`](Self::bool_query) with a fallback for absent values
    ///
    /// # Errors
    ///
    /// `Error::InvalidQuery` for a non-empty value that is not a boolean.
    pub fn default_bool_query(&self, key: &str, default: bool) -> Result<bool> {
        Ok(self.bool_query(key)?.unwrap_or(default))
    }

    /// Query value parsed as an ISO 8601 calendar date (`YYYY-MM-DD`)
    ///
    /// # Errors
    ///
    /// `Error::InvalidQuery` when the value is not a valid date.
    pub fn iso8601_date_query(&self, key: &str) -> Result<Option<NaiveDate>> {
        self.parse_query(key, |v| {
            NaiveDate::parse_from_str(v, "%Y-%m-%d").map_err(|e| e.to_string())
        })
    }

    /// Query value parsed as an RFC 3339 timestamp
    ///
    /// # Errors
    ///
    /// `Error::InvalidQuery` when the value is not a valid timestamp.
    pub fn iso8601_date_time_query(&self, key: &str) -> Result<Option<DateTime<FixedOffset>>> {
        self.parse_query(key, |v| {
            DateTime::parse_from_rfc3339(v).map_err(|e| e.to_string())
        })
    }

    /// Query value with one more round of percent-unescaping.
    ///
    /// For clients that encode values twice.
    ///
    /// # Errors
    ///
    /// `Error::InvalidQuery` when the value holds a malformed escape.
    pub fn string_query(&self, key: &str) -> Result<Option<String>> {
        self.parse_query(key, |v| {
            url_unescape(v).ok_or_else(|| "invalid URL escape".to_string())
        })
    }

    /// Like [`string_query`](Self::string_query) with a fallback for absent values
    ///
    /// # Errors
    ///
    /// `Error::InvalidQuery` when the value holds a malformed escape.
    pub fn default_string_query(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .string_query(key)?
            .unwrap_or_else(|| default.to_string()))
    }

    fn parse_query<T>(
        &self,
        key: &str,
        parse: impl FnOnce(&str) -> std::result::Result<T, String>,
    ) -> Result<Option<T>> {
        match self.query(key) {
            None | Some("") => Ok(None),
            Some(value) => parse(value).map(Some).map_err(|reason| Error::InvalidQuery {
                key: key.to_string(),
                value: value.to_string(),
                reason,
            }),
        }
    }

    // ---------------------------------------------------------------------
    // JSON binding
    // ---------------------------------------------------------------------

    /// Bind an optional JSON body and run its [`Validatable`] impl.
    ///
    /// An empty body gives `Ok(None)`.
    ///
    /// # Errors
    ///
    /// On malformed JSON or failed validation a 400 has been written and the
    /// [`Rejection`] describes it.
    pub fn may_bind_json<T>(&self) -> std::result::Result<Option<T>, Rejection>
    where
        T: DeserializeOwned + Validatable,
    {
        self.may_bind_json_with(T::validate)
    }

    /// Bind an optional JSON body and check it with `validator`
    ///
    /// # Errors
    ///
    /// On malformed JSON or failed validation a 400 has been written.
    pub fn may_bind_json_with<T, V>(&self, validator: V) -> std::result::Result<Option<T>, Rejection>
    where
        T: DeserializeOwned,
        V: FnOnce(&T) -> std::result::Result<(), ValidationError>,
    {
        match json::parse_body::<T>(self.raw_data()) {
            Ok(value) => {
                self.check_bound(&value, validator)?;
                Ok(Some(value))
            }
            Err(BodyError::Missing) => Ok(None),
            Err(err @ BodyError::Malformed(_)) => Err(self.reject(&err)),
        }
    }

    /// Bind a required JSON body and run its [`Validatable`] impl.
    ///
    /// ```
    /// use jug_core::{Context, Validatable, ValidationError, Validator};
    /// use serde::Deserialize;
    ///
    /// #[derive(Deserialize)]
    /// struct CreateUser {
    ///     name: String,
    /// }
    ///
    /// impl Validatable for CreateUser {
    ///     fn validate(&self) -> Result<(), ValidationError> {
    ///         Validator::new()
    ///             .require_not_empty(&self.name, "name is required")
    ///             .validate()
    ///     }
    /// }
    ///
    /// async fn create_user(ctx: Context) {
    ///     let Ok(user) = ctx.must_bind_json::<CreateUser>() else {
    ///         return;
    ///     };
    ///     ctx.respond_created(&serde_json::json!({ "name": user.name }));
    /// }
    /// ```
    ///
    /// # Errors
    ///
    /// On an empty body, malformed JSON or failed validation a 400 has been
    /// written and the [`Rejection`] describes it.
    pub fn must_bind_json<T>(&self) -> std::result::Result<T, Rejection>
    where
        T: DeserializeOwned + Validatable,
    {
        self.must_bind_json_with(T::validate)
    }

    /// Bind a required JSON body and check it with `validator`
    ///
    /// # Errors
    ///
    /// On an empty body, malformed JSON or failed validation a 400 has been
    /// written.
    pub fn must_bind_json_with<T, V>(&self, validator: V) -> std::result::Result<T, Rejection>
    where
        T: DeserializeOwned,
        V: FnOnce(&T) -> std::result::Result<(), ValidationError>,
    {
        let value = json::parse_body::<T>(self.raw_data()).map_err(|err| self.reject(&err))?;
        self.check_bound(&value, validator)?;
        Ok(value)
    }

    fn check_bound<T, V>(&self, value: &T, validator: V) -> std::result::Result<(), Rejection>
    where
        V: FnOnce(&T) -> std::result::Result<(), ValidationError>,
    {
        validator(value).map_err(|err| self.reject(&err))
    }

    fn reject(&self, err: &dyn Display) -> Rejection {
        let message = err.to_string();
        self.respond_bad_request_error(&message);
        Rejection {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }

    // ---------------------------------------------------------------------
    // Response primitives
    // ---------------------------------------------------------------------

    /// Set the response status.
    ///
    /// Ignored with a warning once the head has been written.
    pub fn status(&self, code: StatusCode) -> &Self {
        let mut response = self.response();
        if response.written {
            if response.status != code {
                warn!(
                    current = response.status.as_u16(),
                    ignored = code.as_u16(),
                    path = %self.path(),
                    "Response head already written, status change ignored"
                );
            }
        } else {
            response.status = code;
        }
        self
    }

    /// Current response status
    #[must_use]
    pub fn response_status(&self) -> StatusCode {
        self.response().status
    }

    /// Whether the response head has been written
    #[must_use]
    pub fn is_written(&self) -> bool {
        self.response().written
    }

    /// A header already set on the response
    #[must_use]
    pub fn response_header(&self, key: &str) -> Option<String> {
        self.response()
            .headers
            .get(key)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// Set a response header; an empty value removes it
    pub fn set_header(&self, key: &str, value: &str) {
        let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
            warn!(header = key, "Invalid response header name");
            return;
        };
        let mut response = self.response();
        if !matches!(response.sink, Sink::Pending(_)) {
            warn!(header = key, "Response already sent, header ignored");
            return;
        }
        if value.is_empty() {
            response.headers.remove(name);
            return;
        }
        match HeaderValue::from_str(value) {
            Ok(value) => {
                response.headers.insert(name, value);
            }
            Err(_) => warn!(header = key, "Invalid response header value"),
        }
    }

    /// Set the `Content-Type` of the response
    pub fn set_content_type(&self, content_type: &str) {
        self.set_header(CONTENT_TYPE.as_str(), content_type);
    }

    fn ensure_content_type(&self, content_type: &'static str) {
        let mut response = self.response();
        if matches!(response.sink, Sink::Pending(_)) && !response.headers.contains_key(CONTENT_TYPE) {
            response
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
    }

    /// Append a `Set-Cookie` header.
    ///
    /// Cookies that cannot be rendered safely are dropped with a warning.
    pub fn set_cookie(&self, cookie: &Cookie) {
        let value = match cookie.to_header_value() {
            Ok(rendered) => HeaderValue::from_str(&rendered),
            Err(err) => {
                warn!(error = %err, "Invalid cookie, not sent");
                return;
            }
        };
        let Ok(value) = value else {
            warn!(cookie = %cookie.name, "Invalid cookie, not sent");
            return;
        };
        let mut response = self.response();
        if !matches!(response.sink, Sink::Pending(_)) {
            warn!(cookie = %cookie.name, "Response already sent, cookie ignored");
            return;
        }
        response.headers.append(SET_COOKIE, value);
    }

    /// Append bytes to the response body.
    ///
    /// The first write marks the head as written.
    pub fn write(&self, bytes: impl AsRef<[u8]>) {
        let bytes = bytes.as_ref();
        let mut response = self.response();
        response.written = true;
        match &response.sink {
            Sink::Streaming(sender) => {
                // A closed channel means the client is gone
                let _ = sender.send(Bytes::copy_from_slice(bytes));
            }
            Sink::Pending(_) => response.body.extend_from_slice(bytes),
            Sink::Closed => warn!(path = %self.path(), "Write after response was sent"),
        }
    }

    /// Write `bytes` with `code` and `content_type`
    pub fn data(&self, code: StatusCode, content_type: &'static str, bytes: impl AsRef<[u8]>) {
        self.status(code);
        self.ensure_content_type(content_type);
        self.write(bytes);
    }

    /// Write a plain-text body
    pub fn string(&self, code: StatusCode, body: impl AsRef<str>) {
        self.data(code, MIME_PLAIN, body.as_ref());
    }

    /// Serialize `obj` as JSON and write it with `code`.
    ///
    /// A serialization failure is logged and answered with 500.
    pub fn json<T: Serialize + ?Sized>(&self, code: StatusCode, obj: &T) {
        match json::to_json_vec(obj) {
            Ok(body) => self.data(code, MIME_JSON, body),
            Err(err) => {
                error!(error = %err, path = %self.path(), "Failed to serialize response");
                self.push_error(&err);
                self.data(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    MIME_JSON,
                    error_json(&err.to_string()),
                );
            }
        }
    }

    // ---------------------------------------------------------------------
    // Response helpers
    // ---------------------------------------------------------------------

    /// 200 with a JSON body
    pub fn respond_ok<T: Serialize + ?Sized>(&self, obj: &T) {
        self.json(StatusCode::OK, obj);
    }

    /// 201 with a JSON body
    pub fn respond_created<T: Serialize + ?Sized>(&self, obj: &T) {
        self.json(StatusCode::CREATED, obj);
    }

    /// 204 without a body
    pub fn respond_no_content(&self) {
        self.status(StatusCode::NO_CONTENT);
    }

    /// 400 with a JSON body
    pub fn respond_bad_request<T: Serialize + ?Sized>(&self, obj: &T) {
        self.json(StatusCode::BAD_REQUEST, obj);
    }

    /// 400 with `{"error": err}`
    pub fn respond_bad_request_error(&self, err: impl Display) {
        self.respond_error(StatusCode::BAD_REQUEST, err);
    }

    /// 400 for a request that should have carried a body
    pub fn respond_missing_request_body(&self) {
        self.respond_bad_request_error(BodyError::Missing);
    }

    /// 401 with a JSON body
    pub fn respond_unauthorized<T: Serialize + ?Sized>(&self, obj: &T) {
        self.json(StatusCode::UNAUTHORIZED, obj);
    }

    /// 401 with `{"error": err}`
    pub fn respond_unauthorized_error(&self, err: impl Display) {
        self.respond_error(StatusCode::UNAUTHORIZED, err);
    }

    /// 403 with a JSON body
    pub fn respond_forbidden<T: Serialize + ?Sized>(&self, obj: &T) {
        self.json(StatusCode::FORBIDDEN, obj);
    }

    /// 403 with `{"error": err}`
    pub fn respond_forbidden_error(&self, err: impl Display) {
        self.respond_error(StatusCode::FORBIDDEN, err);
    }

    /// 404 with a JSON body
    pub fn respond_not_found<T: Serialize + ?Sized>(&self, obj: &T) {
        self.json(StatusCode::NOT_FOUND, obj);
    }

    /// 404 with `{"error": err}`
    pub fn respond_not_found_error(&self, err: impl Display) {
        self.respond_error(StatusCode::NOT_FOUND, err);
    }

    /// 409 with a JSON body
    pub fn respond_conflict<T: Serialize + ?Sized>(&self, obj: &T) {
        self.json(StatusCode::CONFLICT, obj);
    }

    /// 409 with `{"error": err}`
    pub fn respond_conflict_error(&self, err: impl Display) {
        self.respond_error(StatusCode::CONFLICT, err);
    }

    /// 500 with a JSON body
    pub fn respond_internal_server_error<T: Serialize + ?Sized>(&self, obj: &T) {
        self.json(StatusCode::INTERNAL_SERVER_ERROR, obj);
    }

    /// 500 with `{"error": err}`; the error is also logged
    pub fn respond_internal_server_error_error(&self, err: impl Display) {
        error!(error = %err, path = %self.path(), "Internal server error");
        self.respond_error(StatusCode::INTERNAL_SERVER_ERROR, err);
    }

    fn respond_error(&self, code: StatusCode, err: impl Display) {
        self.json(code, &json::error_body(&err.to_string()));
    }

    // ---------------------------------------------------------------------
    // Streaming
    // ---------------------------------------------------------------------

    /// Stream the body chunk by chunk.
    ///
    /// The response head is sent right away. `step` fills one chunk per call
    /// and returns whether to keep going. Returns `true` if the client went
    /// away before `step` finished.
    pub async fn stream<F>(&self, mut step: F) -> bool
    where
        F: FnMut(&mut Vec<u8>) -> bool + Send,
    {
        let Some(sender) = self.commit_stream() else {
            return true;
        };
        loop {
            let mut chunk = Vec::new();
            let keep_going = step(&mut chunk);
            if !chunk.is_empty() && sender.send(Bytes::from(chunk)).is_err() {
                return true;
            }
            if sender.is_closed() {
                return true;
            }
            if !keep_going {
                return false;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Write one server-sent event.
    ///
    /// Multi-line messages become one `data:` line each.
    pub fn sse_event(&self, name: &str, message: impl Display) {
        self.ensure_content_type(MIME_EVENT_STREAM);
        if self.response_header(CACHE_CONTROL.as_str()).is_none() {
            self.set_header(CACHE_CONTROL.as_str(), "no-cache");
        }
        self.write(render_event(name, &message));
    }

    /// Send the head now and switch the body to a channel
    fn commit_stream(&self) -> Option<mpsc::UnboundedSender<Bytes>> {
        let mut response = self.response();
        match std::mem::replace(&mut response.sink, Sink::Closed) {
            Sink::Pending(tx) => {
                let (sender, body) = ResponseBody::channel();
                let buffered = std::mem::take(&mut response.body);
                if !buffered.is_empty() {
                    let _ = sender.send(Bytes::from(buffered));
                }
                let mut head = hyper::Response::new(body);
                *head.status_mut() = response.status;
                *head.headers_mut() = std::mem::take(&mut response.headers);
                if tx.send(head).is_err() {
                    return None;
                }
                response.written = true;
                response.sink = Sink::Streaming(sender.clone());
                Some(sender)
            }
            Sink::Streaming(sender) => {
                response.sink = Sink::Streaming(sender.clone());
                Some(sender)
            }
            Sink::Closed => None,
        }
    }

    /// Hand the buffered response to the dispatcher, or end the stream
    pub(crate) fn finish(&self) {
        let mut response = self.response();
        if let Sink::Pending(tx) = std::mem::replace(&mut response.sink, Sink::Closed) {
            let _ = tx.send(response.take_response());
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", self.method())
            .field("path", &self.path())
            .field("full_path", &self.full_path())
            .field("params", &self.inner.params)
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

/// Boolean literals as accepted by Go's `strconv.ParseBool`
fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

fn render_event(name: &str, message: &dyn Display) -> String {
    let mut out = String::new();
    if !name.is_empty() {
        let _ = writeln!(out, "event:{name}");
    }
    let message = message.to_string();
    for line in message.split('\n') {
        let _ = writeln!(out, "data:{line}");
    }
    out.push('\n');
    out
}

fn error_json(message: &str) -> Vec<u8> {
    json::to_json_vec(&json::error_body(message)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use serde::Deserialize;
    use std::net::SocketAddr;

    type Response = hyper::Response<ResponseBody>;

    fn context_with(
        req: hyper::Request<Bytes>,
        params: Vec<(String, String)>,
        chain: Vec<BoxedHandler>,
    ) -> (Context, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        let remote: SocketAddr = "10.0.0.7:5000".parse().unwrap();
        let ctx = Context::new(
            Request::new(req, Some(remote)),
            params,
            Some("/test".to_string()),
            chain.into(),
            tx,
        );
        (ctx, rx)
    }

    fn get(uri: &str) -> (Context, oneshot::Receiver<Response>) {
        let req = hyper::Request::builder()
            .uri(uri)
            .body(Bytes::new())
            .unwrap();
        context_with(req, Vec::new(), Vec::new())
    }

    fn post(body: &'static str) -> (Context, oneshot::Receiver<Response>) {
        let req = hyper::Request::builder()
            .method("POST")
            .uri("/items")
            .body(Bytes::from_static(body.as_bytes()))
            .unwrap();
        context_with(req, Vec::new(), Vec::new())
    }

    fn finish(ctx: &Context, mut rx: oneshot::Receiver<Response>) -> (StatusCode, HeaderMap, String) {
        ctx.finish();
        let response = rx.try_recv().unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = tokio_test::block_on(response.into_body().into_bytes());
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    #[derive(Debug, Deserialize)]
    struct Item {
        name: String,
    }

    impl Validatable for Item {
        fn validate(&self) -> std::result::Result<(), ValidationError> {
            crate::Validator::new()
                .require_not_empty(&self.name, "name is required")
                .validate()
        }
    }

    #[test]
    fn test_typed_queries() {
        let (ctx, _rx) = get(
            "/?page=3&flag=T&off=False&day=2024-02-29&at=2024-02-29T10:00:00%2B02:00&bad=x&empty=",
        );

        assert_eq!(ctx.int_query("page").unwrap(), Some(3));
        assert_eq!(ctx.int_query("missing").unwrap(), None);
        assert_eq!(ctx.int_query("empty").unwrap(), None);
        assert!(matches!(ctx.int_query("bad"), Err(Error::InvalidQuery { .. })));

        assert_eq!(ctx.bool_query("flag").unwrap(), Some(true));
        assert_eq!(ctx.bool_query("off").unwrap(), Some(false));
        assert!(ctx.bool_query("bad").is_err());

        assert_eq!(
            ctx.iso8601_date_query("day").unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29)
        );
        let at = ctx.iso8601_date_time_query("at").unwrap().unwrap();
        assert_eq!(at.offset().local_minus_utc(), 2 * 3600);
        assert!(ctx.iso8601_date_query("bad").is_err());
    }

    #[test]
    fn test_default_queries() {
        let (ctx, _rx) = get("/?limit=&name=bob");

        assert_eq!(ctx.default_query("name", "anon"), "bob");
        assert_eq!(ctx.default_query("limit", "10"), "10");
        assert_eq!(ctx.default_int_query("limit", 25).unwrap(), 25);
        assert!(ctx.default_bool_query("verbose", true).unwrap());
        assert_eq!(ctx.default_string_query("q", "all").unwrap(), "all");
    }

    #[test]
    fn test_string_query_unescapes_again() {
        let (ctx, _rx) = get("/?path=a%252Fb&broken=%25zz");

        assert_eq!(ctx.query("path"), Some("a%2Fb"));
        assert_eq!(ctx.string_query("path").unwrap().as_deref(), Some("a/b"));
        assert!(ctx.string_query("broken").is_err());
    }

    #[test]
    fn test_query_array() {
        let (ctx, _rx) = get("/?id=1&id=2&id=3");
        assert_eq!(ctx.query_array("id"), vec!["1", "2", "3"]);
        assert!(ctx.query_array("none").is_empty());
    }

    #[test]
    fn test_param_as() {
        let req = hyper::Request::builder()
            .uri("/users/42")
            .body(Bytes::new())
            .unwrap();
        let params = vec![
            ("id".to_string(), "42".to_string()),
            ("slug".to_string(), "abc".to_string()),
        ];
        let (ctx, _rx) = context_with(req, params, Vec::new());

        assert_eq!(ctx.param("id"), Some("42"));
        assert_eq!(ctx.param_as::<u64>("id").unwrap(), 42);
        assert!(matches!(
            ctx.param_as::<u64>("slug"),
            Err(Error::InvalidParam { .. })
        ));
        assert!(ctx.param_as::<u64>("missing").is_err());
    }

    #[test]
    fn test_client_ip() {
        let req = hyper::Request::builder()
            .uri("/")
            .header("X-Forwarded-For", " 203.0.113.9 , 10.0.0.1")
            .body(Bytes::new())
            .unwrap();
        let (ctx, _rx) = context_with(req, Vec::new(), Vec::new());
        assert_eq!(ctx.client_ip().as_deref(), Some("203.0.113.9"));
        assert_eq!(ctx.remote_ip().as_deref(), Some("10.0.0.7"));

        let req = hyper::Request::builder()
            .uri("/")
            .header("X-Real-Ip", "198.51.100.4")
            .body(Bytes::new())
            .unwrap();
        let (ctx, _rx) = context_with(req, Vec::new(), Vec::new());
        assert_eq!(ctx.client_ip().as_deref(), Some("198.51.100.4"));

        let req = hyper::Request::builder()
            .uri("/")
            .header("X-Forwarded-For", "unknown, 192.0.2.33")
            .header("X-Real-Ip", "198.51.100.4")
            .body(Bytes::new())
            .unwrap();
        let (ctx, _rx) = context_with(req, Vec::new(), Vec::new());
        assert_eq!(ctx.client_ip().as_deref(), Some("192.0.2.33"));

        let (ctx, _rx) = get("/");
        assert_eq!(ctx.client_ip().as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn test_must_bind_json_ok() {
        let (ctx, rx) = post(r#"{"name":"widget"}"#);
        let item: Item = ctx.must_bind_json().unwrap();
        assert_eq!(item.name, "widget");

        let (status, _, body) = finish(&ctx, rx);
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[test]
    fn test_must_bind_json_missing_body() {
        let (ctx, rx) = post("");
        let rejection = ctx.must_bind_json::<Item>().unwrap_err();
        assert_eq!(rejection.status, StatusCode::BAD_REQUEST);

        let (status, headers, body) = finish(&ctx, rx);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(headers[CONTENT_TYPE], MIME_JSON);
        assert_eq!(body, r#"{"error":"request body is missing"}"#);
    }

    #[test]
    fn test_must_bind_json_validation_failure() {
        let (ctx, rx) = post(r#"{"name":""}"#);
        let rejection = ctx.must_bind_json::<Item>().unwrap_err();
        assert_eq!(rejection.message, "name is required");

        let (status, _, body) = finish(&ctx, rx);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, r#"{"error":"name is required"}"#);
    }

    #[test]
    fn test_may_bind_json() {
        let (ctx, rx) = post("");
        assert!(ctx.may_bind_json::<Item>().unwrap().is_none());
        assert_eq!(finish(&ctx, rx).0, StatusCode::OK);

        let (ctx, rx) = post("{not json");
        assert!(ctx.may_bind_json::<Item>().is_err());
        assert_eq!(finish(&ctx, rx).0, StatusCode::BAD_REQUEST);

        let (ctx, rx) = post(r#"{"name":"gadget"}"#);
        let item = ctx.may_bind_json::<Item>().unwrap().unwrap();
        assert_eq!(item.name, "gadget");
        assert_eq!(finish(&ctx, rx).0, StatusCode::OK);
    }

    #[test]
    fn test_may_bind_json_validation_failure() {
        let (ctx, rx) = post(r#"{"name":""}"#);
        let rejection = ctx.may_bind_json::<Item>().unwrap_err();
        assert_eq!(rejection.status, StatusCode::BAD_REQUEST);
        assert!(ctx.is_aborted());

        let (status, _, body) = finish(&ctx, rx);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, r#"{"error":"name is required"}"#);
    }

    #[test]
    fn test_bind_with_custom_validator() {
        let (ctx, rx) = post(r#"{"name":"x"}"#);
        let result = ctx.must_bind_json_with(|item: &Item| {
            crate::Validator::new()
                .require_min_length(&item.name, 3, "name too short")
                .validate()
        });
        assert!(result.is_err());
        assert_eq!(finish(&ctx, rx).2, r#"{"error":"name too short"}"#);
    }

    #[test]
    fn test_respond_helpers() {
        let (ctx, rx) = get("/");
        ctx.respond_created(&serde_json::json!({"id": 1}));
        let (status, _, body) = finish(&ctx, rx);
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, r#"{"id":1}"#);

        let (ctx, rx) = get("/");
        ctx.respond_conflict_error("already exists");
        let (status, _, body) = finish(&ctx, rx);
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body, r#"{"error":"already exists"}"#);

        let (ctx, rx) = get("/");
        ctx.respond_no_content();
        let (status, _, body) = finish(&ctx, rx);
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());
    }

    #[test]
    fn test_status_ignored_after_write() {
        let (ctx, rx) = get("/");
        ctx.string(StatusCode::ACCEPTED, "queued");
        ctx.status(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ctx.response_status(), StatusCode::ACCEPTED);

        let (status, headers, body) = finish(&ctx, rx);
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(headers[CONTENT_TYPE], MIME_PLAIN);
        assert_eq!(body, "queued");
    }

    #[test]
    fn test_headers_and_cookies() {
        let req = hyper::Request::builder()
            .uri("/")
            .header("Cookie", "session=abc")
            .body(Bytes::new())
            .unwrap();
        let (ctx, rx) = context_with(req, Vec::new(), Vec::new());
        assert_eq!(ctx.cookie("session").as_deref(), Some("abc"));

        ctx.set_header("X-Request-Id", "r-1");
        ctx.set_header("X-Temp", "1");
        ctx.set_header("X-Temp", "");
        ctx.set_cookie(&Cookie::new("a", "1"));
        ctx.set_cookie(&Cookie::new("b", "2"));

        let (_, headers, _) = finish(&ctx, rx);
        assert_eq!(headers["x-request-id"], "r-1");
        assert!(!headers.contains_key("x-temp"));
        assert_eq!(headers.get_all(SET_COOKIE).iter().count(), 2);
    }

    #[test]
    fn test_keys_and_must_get() {
        let (ctx, rx) = get("/");
        ctx.set("user", "alice".to_string());
        assert_eq!(ctx.get::<String>("user").as_deref(), Some("alice"));
        assert_eq!(ctx.must_get::<String>("user").as_deref(), Some("alice"));
        assert!(!ctx.is_aborted());

        assert_eq!(ctx.must_get::<u32>("tenant"), None);
        assert!(ctx.is_aborted());
        let (status, _, body) = finish(&ctx, rx);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, r#"{"error":"Key \"tenant\" does not exist"}"#);
    }

    #[test]
    fn test_handle_error_mapping() {
        let (ctx, rx) = get("/");
        ctx.handle_error(
            anyhow::Error::new(ResponseStatusError::forbidden("not yours")).context("loading doc"),
        );
        let (status, _, body) = finish(&ctx, rx);
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, r#"{"error":"not yours"}"#);

        let (ctx, rx) = get("/");
        ctx.handle_error(ValidationError("a is required, b is required".into()));
        let (status, _, body) = finish(&ctx, rx);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, r#"{"error":"a is required, b is required"}"#);

        let (ctx, rx) = get("/");
        ctx.handle_error(anyhow::anyhow!("database unavailable"));
        let (status, _, body) = finish(&ctx, rx);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, r#"{"error":"database unavailable"}"#);
        assert_eq!(ctx.errors(), vec!["database unavailable"]);
    }

    #[test]
    fn test_handle_error_skips_rejection() {
        let (ctx, rx) = post("");
        let rejection = ctx.must_bind_json::<Item>().unwrap_err();
        ctx.handle_error(rejection);
        let (status, _, body) = finish(&ctx, rx);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, r#"{"error":"request body is missing"}"#);
    }

    #[test]
    fn test_sse_event_sets_stream_headers() {
        let (ctx, rx) = get("/");
        ctx.sse_event("tick", 1);
        ctx.sse_event("tick", 2);

        let (status, headers, body) = finish(&ctx, rx);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_TYPE], MIME_EVENT_STREAM);
        assert_eq!(headers[CACHE_CONTROL], "no-cache");
        assert_eq!(body, "event:tick\ndata:1\n\nevent:tick\ndata:2\n\n");
    }

    #[test]
    fn test_sse_event_keeps_explicit_cache_control() {
        let (ctx, rx) = get("/");
        ctx.set_header("Cache-Control", "no-store");
        ctx.sse_event("", "hello");

        let (_, headers, body) = finish(&ctx, rx);
        assert_eq!(headers[CACHE_CONTROL], "no-store");
        assert_eq!(body, "data:hello\n\n");
    }

    #[test]
    fn test_render_event() {
        assert_eq!(render_event("tick", &1), "event:tick\ndata:1\n\n");
        assert_eq!(render_event("msg", &"a\nb"), "event:msg\ndata:a\ndata:b\n\n");
    }

    #[tokio::test]
    async fn test_next_runs_chain_in_order_and_abort_stops_it() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let order = order.clone();
            move |ctx: Context| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push("first:before");
                    ctx.next().await;
                    order.lock().unwrap().push("first:after");
                }
            }
        };
        let second = {
            let order = order.clone();
            move |ctx: Context| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push("second");
                    ctx.abort_with_status(StatusCode::UNAUTHORIZED);
                }
            }
        };
        let third = {
            let order = order.clone();
            move |_ctx: Context| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push("third");
                }
            }
        };

        let req = hyper::Request::builder().uri("/").body(Bytes::new()).unwrap();
        let (ctx, rx) = context_with(req, Vec::new(), vec![first.boxed(), second.boxed(), third.boxed()]);
        ctx.next().await;
        ctx.finish();

        assert_eq!(
            *order.lock().unwrap(),
            vec!["first:before", "second", "first:after"]
        );
        assert_eq!(rx.await.unwrap().status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_stream_sends_head_then_chunks() {
        let (ctx, rx) = get("/");
        ctx.set_content_type("text/plain");

        let mut remaining = 3;
        let gone = ctx
            .stream(|chunk| {
                chunk.extend_from_slice(format!("{remaining};").as_bytes());
                remaining -= 1;
                remaining > 0
            })
            .await;
        assert!(!gone);
        assert!(ctx.is_written());

        ctx.status(StatusCode::NOT_FOUND);
        ctx.finish();

        let response = rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.into_body().into_bytes().await, Bytes::from("3;2;1;"));
    }

    #[tokio::test]
    async fn test_cookie_after_stream_commit_is_ignored() {
        let (ctx, rx) = get("/");
        ctx.set_cookie(&Cookie::new("before", "1"));
        let gone = ctx
            .stream(|chunk| {
                chunk.extend_from_slice(b"x");
                false
            })
            .await;
        assert!(!gone);
        ctx.set_cookie(&Cookie::new("after", "2"));
        ctx.finish();

        let response = rx.await.unwrap();
        let cookies: Vec<_> = response.headers().get_all(SET_COOKIE).iter().collect();
        assert_eq!(cookies.len(), 1);
        assert!(cookies[0].to_str().unwrap().starts_with("before=1"));
        assert!(ctx.response_header(SET_COOKIE.as_str()).is_none());
    }

    #[test]
    fn test_invalid_cookie_is_not_sent() {
        let (ctx, rx) = get("/");
        ctx.set_cookie(&Cookie {
            domain: "example.com; SameSite=None".into(),
            ..Cookie::new("sid", "x")
        });
        let (_, headers, _) = finish(&ctx, rx);
        assert!(!headers.contains_key(SET_COOKIE));
    }

    #[tokio::test]
    async fn test_stream_reports_client_gone() {
        let (ctx, rx) = get("/");
        drop(rx);
        assert!(ctx.stream(|_| true).await);
    }
}
