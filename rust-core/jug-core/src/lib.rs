//! # Jug Core
//!
//! An ergonomic web layer on top of Hyper and Tokio.
//! Provides routing with groups and middleware, a request context with typed
//! accessors and JSON binding, a fluent validator, and automatic
//! `405 Method Not Allowed` routes.
//!
//! ## Architecture
//!
//! Handlers are async functions taking a [`Context`]. Routes, groups and
//! middleware are registered on an [`Engine`] through the [`Router`] trait;
//! [`Engine::build`] compiles them into an [`App`] with one radix tree per
//! verb, and the server hands every request to [`App::handle`].
//!
//! ```no_run
//! use jug_core::{Context, Engine, Router};
//! use hyper::StatusCode;
//!
//! #[tokio::main]
//! async fn main() -> jug_core::Result<()> {
//!     let mut engine = Engine::default();
//!     engine.get("/ping", |ctx: Context| async move {
//!         ctx.string(StatusCode::OK, "pong");
//!     });
//!     engine.expand_methods();
//!     engine.run(([127, 0, 0, 1], 8080).into()).await
//! }
//! ```
//!
//! ## Modules
//!
//! - `engine` - Engine, compiled App and request dispatch
//! - `router` - Router trait, route groups and the per-verb route table
//! - `context` - Per-request context: accessors, binding, responses, flow
//! - `handler` - Handler trait and type erasure
//! - `middleware` - Access log middleware
//! - `server` - HTTP server built on Hyper
//! - `route` - Route metadata and path joining
//! - `path_registry` - Record of registered paths and verbs
//! - `method` - Supported HTTP verbs
//! - `request` - HTTP request wrapper with lazy query parsing
//! - `body` - Response body (buffered or streamed)
//! - `cookie` - Cookie parsing and rendering via the `cookie` crate
//! - `json` - JSON parsing with simd-json
//! - `validation` - Fluent validator
//! - `state` - Request-scoped key/value store
//! - `error` - Error types and handling

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod body;
pub mod context;
pub mod cookie;
pub mod engine;
pub mod error;
pub mod handler;
pub mod json;
pub mod method;
pub mod middleware;
pub mod path_registry;
pub mod request;
pub mod route;
pub mod router;
pub mod server;
pub mod state;
pub mod validation;

pub use body::ResponseBody;
pub use context::Context;
pub use self::cookie::{Cookie, SameSite};
pub use engine::{App, Engine, Mode};
pub use error::{Error, Rejection, ResponseStatusError, Result, ValidationError};
pub use handler::{fallible, method_not_allowed, BoxedHandler, Handler};
pub use method::Method;
pub use middleware::{logger, logger_with_config, LoggerConfig};
pub use path_registry::PathRegistry;
pub use request::Request;
pub use route::{join_paths, RouteInfo};
pub use router::{Router, RouterGroup};
pub use server::ServerConfig;
pub use validation::{Validatable, Validator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
