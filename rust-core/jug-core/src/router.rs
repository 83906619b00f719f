//! # Router
//!
//! Route registration and the compiled lookup table.
//!
//! ## Registration
//!
//! [`Router`] is the registration surface shared by [`Engine`](crate::Engine)
//! and [`RouterGroup`]. A group owns a base path, a snapshot of middleware,
//! the routes registered through it, its nested groups and a
//! [`PathRegistry`] of every `(relative path, verbs)` pair it has seen.
//! That registry is what lets
//! [`Engine::expand_methods`](crate::Engine::expand_methods) fill in `405`
//! handlers for verbs a path never registered.
//!
//! A route's chain is fixed when it is registered: the group's middleware at
//! that moment followed by the route's own handlers.
//!
//! ## Matching
//!
//! [`RouteTable`] holds one `matchit` radix tree per verb, so a lookup is a
//! hash of the method plus an O(path length) tree walk.

use crate::error::{Error, Result};
use crate::handler::{method_not_allowed, BoxedHandler, Handler};
use crate::method::Method;
use crate::path_registry::PathRegistry;
use crate::route::{join_paths, normalize_pattern, RouteInfo};
use matchit::Router as MatchitRouter;
use std::collections::HashMap;
use std::sync::Arc;

/// Route registration, implemented by [`Engine`](crate::Engine) and
/// [`RouterGroup`]
pub trait Router {
    /// Append middleware to this router.
    ///
    /// Applies to routes and groups registered afterwards.
    fn use_middleware(&mut self, middleware: impl Handler) -> &mut Self;

    /// Register `chain` for every verb in `methods` at `path`.
    ///
    /// `path` is relative to the router's base path and is recorded in the
    /// router's registry.
    fn handle(&mut self, methods: &[Method], path: &str, chain: Vec<BoxedHandler>) -> &mut Self;

    /// Register `handler` for all seven verbs
    fn any(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.handle(&Method::ALL, path, vec![handler.boxed()])
    }

    /// Register a GET route
    fn get(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.handle(&[Method::Get], path, vec![handler.boxed()])
    }

    /// Register a POST route
    fn post(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.handle(&[Method::Post], path, vec![handler.boxed()])
    }

    /// Register a PUT route
    fn put(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.handle(&[Method::Put], path, vec![handler.boxed()])
    }

    /// Register a DELETE route
    fn delete(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.handle(&[Method::Delete], path, vec![handler.boxed()])
    }

    /// Register a PATCH route
    fn patch(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.handle(&[Method::Patch], path, vec![handler.boxed()])
    }

    /// Register an OPTIONS route
    fn options(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.handle(&[Method::Options], path, vec![handler.boxed()])
    }

    /// Register a HEAD route
    fn head(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.handle(&[Method::Head], path, vec![handler.boxed()])
    }
}

/// A set of routes sharing a path prefix and middleware
#[derive(Default)]
pub struct RouterGroup {
    base_path: String,
    handlers: Vec<BoxedHandler>,
    registry: PathRegistry,
    routes: Vec<RouteInfo>,
    groups: Vec<RouterGroup>,
}

impl RouterGroup {
    pub(crate) fn root() -> Self {
        Self {
            base_path: "/".to_string(),
            ..Self::default()
        }
    }

    /// Create a nested group.
    ///
    /// The child's base path is `relative_path` joined onto this group's, and
    /// its middleware is this group's current middleware followed by
    /// `middleware`.
    pub fn group(&mut self, relative_path: &str, middleware: Vec<BoxedHandler>) -> &mut Self {
        let mut handlers = self.handlers.clone();
        handlers.extend(middleware);
        self.groups.push(Self {
            base_path: join_paths(&self.base_path, relative_path),
            handlers,
            ..Self::default()
        });
        let last = self.groups.len() - 1;
        &mut self.groups[last]
    }

    /// Absolute path prefix of this group
    #[must_use]
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// `(relative path, verbs)` pairs registered through this group, with
    /// paths in matchit syntax
    #[must_use]
    pub const fn registry(&self) -> &PathRegistry {
        &self.registry
    }

    /// Middleware attached to this group
    pub(crate) fn middleware(&self) -> &[BoxedHandler] {
        &self.handlers
    }

    /// Register `method_not_allowed` for every verb a recorded path lacks.
    ///
    /// Recurses into nested groups. Each 405 route runs the middleware of the
    /// group that recorded the path.
    pub(crate) fn expand_methods(&mut self) {
        let missing: Vec<(String, Vec<Method>)> = self
            .registry
            .paths()
            .into_iter()
            .map(|path| (path.to_string(), self.registry.missing(path)))
            .filter(|(_, methods)| !methods.is_empty())
            .collect();

        for (path, methods) in missing {
            self.handle(&methods, &path, vec![method_not_allowed.boxed()]);
        }
        for group in &mut self.groups {
            group.expand_methods();
        }
    }

    /// Every route of this group and its descendants, in registration order
    pub(crate) fn collect_routes(&self, out: &mut Vec<RouteInfo>) {
        out.extend(self.routes.iter().cloned());
        for group in &self.groups {
            group.collect_routes(out);
        }
    }
}

impl Router for RouterGroup {
    fn use_middleware(&mut self, middleware: impl Handler) -> &mut Self {
        self.handlers.push(middleware.boxed());
        self
    }

    fn handle(&mut self, methods: &[Method], path: &str, chain: Vec<BoxedHandler>) -> &mut Self {
        // `/users/:id` and `/users/{id}` are one route
        self.registry.add(&normalize_pattern(path), methods.iter().copied());

        let absolute = join_paths(&self.base_path, path);
        let mut full_chain = self.handlers.clone();
        full_chain.extend(chain);

        for &method in methods {
            self.routes
                .push(RouteInfo::new(method, &absolute, full_chain.clone()));
        }
        self
    }
}

impl std::fmt::Debug for RouterGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterGroup")
            .field("base_path", &self.base_path)
            .field("middleware", &self.handlers.len())
            .field("routes", &self.routes.len())
            .field("groups", &self.groups)
            .finish()
    }
}

/// Matched route with extracted path parameters
#[derive(Debug)]
pub struct Match<'a> {
    /// The route that matched
    pub route: &'a Arc<RouteInfo>,
    /// Path parameters in pattern order
    pub params: Vec<(String, String)>,
}

/// Compiled per-verb radix trees
#[derive(Clone, Default)]
pub struct RouteTable {
    method_routes: HashMap<Method, MatchitRouter<Arc<RouteInfo>>>,
}

impl RouteTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a route into its verb's tree
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if the pattern is malformed or
    /// conflicts with a route already in the tree
    pub fn add_route(&mut self, route: RouteInfo) -> Result<()> {
        let pattern = route.path_pattern.clone();
        let match_pattern = route.match_pattern.clone();

        self.method_routes
            .entry(route.method)
            .or_insert_with(MatchitRouter::new)
            .insert(match_pattern, Arc::new(route))
            .map_err(|e| Error::InvalidRoutePattern {
                pattern,
                reason: e.to_string(),
            })
    }

    /// Match a request path within one verb's tree
    #[must_use]
    pub fn match_route(&self, method: Method, path: &str) -> Option<Match<'_>> {
        let matched = self.method_routes.get(&method)?.at(path).ok()?;
        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Some(Match {
            route: matched.value,
            params,
        })
    }

    /// Verbs other than `method` whose tree matches `path`, in canonical order
    #[must_use]
    pub fn allowed_methods(&self, method: Option<Method>, path: &str) -> Vec<Method> {
        Method::ALL
            .into_iter()
            .filter(|m| Some(*m) != method)
            .filter(|m| {
                self.method_routes
                    .get(m)
                    .is_some_and(|tree| tree.at(path).is_ok())
            })
            .collect()
    }
}
