//! # Engine
//!
//! The top-level router and its compiled, servable form.
//!
//! [`Engine`] collects routes, groups and fallbacks. [`Engine::build`]
//! compiles everything into an [`App`], whose [`App::handle`] turns one
//! request into one response and is what the server calls per request.
//!
//! ## Dispatch
//!
//! 1. Exact match in the request verb's tree runs the route chain.
//! 2. Otherwise, with method-not-allowed detection on, a match in another
//!    verb's tree runs engine middleware plus the `no_method` handlers with
//!    status 405.
//! 3. Otherwise engine middleware plus the `no_route` handlers run with 404.
//!
//! In the fallback cases a plain-text default body is written if the chain
//! neither wrote anything nor changed the status.
//!
//! Every chain runs on its own task, so a panicking handler only costs that
//! request a 500.

use crate::body::ResponseBody;
use crate::context::Context;
use crate::error::Result;
use crate::handler::{BoxedHandler, Handler};
use crate::method::Method;
use crate::middleware::logger;
use crate::request::Request;
use crate::route::RouteInfo;
use crate::router::{RouteTable, Router, RouterGroup};
use crate::server::{self, ServerConfig};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::StatusCode;
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

const DEFAULT_404_BODY: &str = "404 page not found";
const DEFAULT_405_BODY: &str = "405 method not allowed";

/// Environment variable selecting the initial [`Mode`]
pub const MODE_ENV: &str = "JUG_MODE";

/// Engine mode.
///
/// Debug mode logs every route at build time and warns when serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Verbose, for development
    Debug,
    /// Quiet, for production
    Release,
    /// Quiet, for tests
    Test,
}

impl Mode {
    /// Read [`MODE_ENV`]; `None` when unset or unrecognized
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var(MODE_ENV).ok()?;
        match raw.parse() {
            Ok(mode) => Some(mode),
            Err(()) => {
                warn!(value = %raw, "Unknown {MODE_ENV}, using the default mode");
                None
            }
        }
    }

    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "release",
            Self::Test => "test",
        }
    }
}

impl FromStr for Mode {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "release" => Ok(Self::Release),
            "test" => Ok(Self::Test),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The top-level router.
///
/// ```
/// use jug_core::{Context, Engine, Router};
/// use hyper::StatusCode;
///
/// let mut engine = Engine::default();
/// engine.get("/ping", |ctx: Context| async move {
///     ctx.string(StatusCode::OK, "pong");
/// });
/// let api = engine.group("/api", Vec::new());
/// api.post("/items", |ctx: Context| async move {
///     ctx.respond_created(&serde_json::json!({ "ok": true }));
/// });
/// engine.expand_methods();
///
/// let app = engine.build().unwrap();
/// ```
pub struct Engine {
    root: RouterGroup,
    no_route: Vec<BoxedHandler>,
    no_method: Vec<BoxedHandler>,
    handle_method_not_allowed: bool,
    mode: Mode,
}

impl Engine {
    /// A bare engine without middleware, in release mode unless `JUG_MODE`
    /// says otherwise
    #[must_use]
    pub fn new() -> Self {
        Self::with_mode(Mode::from_env().unwrap_or(Mode::Release))
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            root: RouterGroup::root(),
            no_route: Vec::new(),
            no_method: Vec::new(),
            handle_method_not_allowed: false,
            mode,
        }
    }

    /// Create a route group under the engine root
    pub fn group(&mut self, relative_path: &str, middleware: Vec<BoxedHandler>) -> &mut RouterGroup {
        self.root.group(relative_path, middleware)
    }

    /// Handlers run when no route matches, after the engine middleware
    pub fn no_route(&mut self, chain: Vec<BoxedHandler>) -> &mut Self {
        self.no_route = chain;
        self
    }

    /// Handlers run when the path exists under another verb.
    ///
    /// Also turns on method-not-allowed detection.
    pub fn no_method(&mut self, chain: Vec<BoxedHandler>) -> &mut Self {
        self.no_method = chain;
        self.handle_method_not_allowed = true;
        self
    }

    /// Toggle method-not-allowed detection without changing the handlers
    pub fn handle_method_not_allowed(&mut self, enabled: bool) -> &mut Self {
        self.handle_method_not_allowed = enabled;
        self
    }

    /// Register a 405 route for every verb a recorded path lacks.
    ///
    /// Walks the engine's registry and every nested group's, registering
    /// [`method_not_allowed`](crate::method_not_allowed) through the group that
    /// recorded the path so its middleware runs too. Call it once all routes
    /// are registered; running it again adds nothing.
    pub fn expand_methods(&mut self) -> &mut Self {
        self.root.expand_methods();
        self
    }

    /// Switch to debug mode
    pub fn enable_debug_mode(&mut self) -> &mut Self {
        self.mode = Mode::Debug;
        self
    }

    /// Current mode
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Every registered route, including those in nested groups
    #[must_use]
    pub fn routes(&self) -> Vec<RouteInfo> {
        let mut routes = Vec::new();
        self.root.collect_routes(&mut routes);
        routes
    }

    /// Compile the routes into a servable [`App`]
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` when a pattern is malformed or
    /// two routes of the same verb conflict.
    pub fn build(&self) -> Result<App> {
        let mut table = RouteTable::new();
        for route in self.routes() {
            if self.mode == Mode::Debug {
                info!(
                    method = %route.method,
                    path = %route.path_pattern,
                    handlers = route.handler_count(),
                    "Route registered"
                );
            }
            table.add_route(route)?;
        }

        let middleware = self.root.middleware();
        Ok(App {
            inner: Arc::new(AppInner {
                table,
                no_route: combine(middleware, &self.no_route),
                no_method: combine(middleware, &self.no_method),
                handle_method_not_allowed: self.handle_method_not_allowed,
            }),
        })
    }

    /// Serve on `address` with the remaining settings from the environment
    ///
    /// # Errors
    ///
    /// Fails when the routes do not compile or the address cannot be bound.
    pub async fn run(&self, address: SocketAddr) -> Result<()> {
        let config = ServerConfig {
            address,
            ..ServerConfig::from_env()
        };
        self.serve(config).await
    }

    /// Serve with an explicit configuration until Ctrl-C
    ///
    /// # Errors
    ///
    /// Fails when the routes do not compile or the address cannot be bound.
    pub async fn serve(&self, config: ServerConfig) -> Result<()> {
        let app = self.build()?;
        if self.mode == Mode::Debug {
            warn!("Running in debug mode, set {MODE_ENV}=release in production");
        }
        server::serve(app, config).await
    }
}

impl Default for Engine {
    /// An engine with the [`logger`] middleware, in debug mode unless
    /// `JUG_MODE` says otherwise
    fn default() -> Self {
        let mut engine = Self::with_mode(Mode::from_env().unwrap_or(Mode::Debug));
        engine.use_middleware(logger());
        engine
    }
}

impl Router for Engine {
    fn use_middleware(&mut self, middleware: impl Handler) -> &mut Self {
        self.root.use_middleware(middleware);
        self
    }

    fn handle(&mut self, methods: &[Method], path: &str, chain: Vec<BoxedHandler>) -> &mut Self {
        self.root.handle(methods, path, chain);
        self
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("root", &self.root)
            .field("mode", &self.mode)
            .field("handle_method_not_allowed", &self.handle_method_not_allowed)
            .finish_non_exhaustive()
    }
}

fn combine(middleware: &[BoxedHandler], handlers: &[BoxedHandler]) -> Arc<[BoxedHandler]> {
    middleware.iter().chain(handlers).cloned().collect()
}

/// A compiled engine, cheap to clone and shared by every connection
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

struct AppInner {
    table: RouteTable,
    no_route: Arc<[BoxedHandler]>,
    no_method: Arc<[BoxedHandler]>,
    handle_method_not_allowed: bool,
}

/// Status and default body of a 404/405 fallback
#[derive(Clone, Copy)]
struct Fallback {
    status: StatusCode,
    body: &'static str,
}

impl App {
    /// Serve one request.
    ///
    /// Usable without a socket, which is how the tests drive it.
    pub async fn handle(
        &self,
        req: hyper::Request<Bytes>,
        remote_addr: Option<SocketAddr>,
    ) -> hyper::Response<ResponseBody> {
        let request = Request::new(req, remote_addr);
        let method = Method::try_from(request.method()).ok();
        let inner = &self.inner;

        let matched = method.and_then(|m| inner.table.match_route(m, request.path()));
        if let Some(matched) = matched {
            let chain = matched.route.chain.clone();
            let full_path = Some(matched.route.path_pattern.clone());
            let params = matched.params;
            return dispatch(request, params, full_path, chain, None, None).await;
        }

        if inner.handle_method_not_allowed {
            let allowed = inner.table.allowed_methods(method, request.path());
            if !allowed.is_empty() {
                let allow = allowed
                    .iter()
                    .map(|m| m.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                let fallback = Fallback {
                    status: StatusCode::METHOD_NOT_ALLOWED,
                    body: DEFAULT_405_BODY,
                };
                return dispatch(
                    request,
                    Vec::new(),
                    None,
                    inner.no_method.clone(),
                    Some(fallback),
                    Some(allow),
                )
                .await;
            }
        }

        let fallback = Fallback {
            status: StatusCode::NOT_FOUND,
            body: DEFAULT_404_BODY,
        };
        dispatch(
            request,
            Vec::new(),
            None,
            inner.no_route.clone(),
            Some(fallback),
            None,
        )
        .await
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("handle_method_not_allowed", &self.inner.handle_method_not_allowed)
            .finish_non_exhaustive()
    }
}

/// Run a chain on its own task and wait for the response head
async fn dispatch(
    request: Request,
    params: Vec<(String, String)>,
    full_path: Option<String>,
    chain: Arc<[BoxedHandler]>,
    fallback: Option<Fallback>,
    allow: Option<String>,
) -> hyper::Response<ResponseBody> {
    let (tx, rx) = oneshot::channel();
    let ctx = Context::new(request, params, full_path, chain, tx);
    let method = ctx.method().clone();
    let path = ctx.path().to_string();

    if let Some(fallback) = fallback {
        ctx.status(fallback.status);
    }
    if let Some(allow) = allow {
        ctx.set_header(ALLOW.as_str(), &allow);
    }

    let task = tokio::spawn(async move {
        ctx.next().await;
        if let Some(fallback) = fallback {
            if !ctx.is_written() && ctx.response_status() == fallback.status {
                ctx.set_content_type("text/plain");
                ctx.write(fallback.body);
            }
        }
        ctx.finish();
    });

    match rx.await {
        Ok(response) => response,
        Err(_) => {
            // The chain ended without handing over a response, so it panicked
            let reason = match task.await {
                Err(err) if err.is_panic() => panic_message(err.into_panic().as_ref()),
                Err(err) => err.to_string(),
                Ok(()) => "response dropped".to_string(),
            };
            error!(method = %method, path = %path, panic = %reason, "Handler panicked, recovered");
            internal_server_error()
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn internal_server_error() -> hyper::Response<ResponseBody> {
    let mut response = hyper::Response::new(ResponseBody::empty());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
