//! # Route Metadata
//!
//! One registered route: its verb, the absolute path pattern it was
//! registered under, the normalized pattern handed to matchit, and the
//! handler chain that serves it.
//!
//! Patterns may use matchit's own syntax (`/users/{id}`, `/files/{*path}`)
//! or the colon/star style (`/users/:id`, `/files/*path`); the latter is
//! rewritten to the former.

use crate::handler::BoxedHandler;
use crate::method::Method;
use std::fmt;
use std::sync::Arc;

/// A registered route
#[derive(Clone)]
pub struct RouteInfo {
    /// HTTP verb
    pub method: Method,
    /// Absolute path pattern as registered (e.g. `/api/users/:id`)
    pub path_pattern: String,
    /// Pattern in matchit syntax (e.g. `/api/users/{id}`)
    pub match_pattern: String,
    /// Middleware followed by the route's own handlers
    pub chain: Arc<[BoxedHandler]>,
}

impl RouteInfo {
    /// Create route metadata, normalizing the pattern for matchit
    #[must_use]
    pub fn new(method: Method, path: &str, chain: Vec<BoxedHandler>) -> Self {
        Self {
            method,
            path_pattern: path.to_string(),
            match_pattern: normalize_pattern(path),
            chain: chain.into(),
        }
    }

    /// Number of handlers in the chain
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.chain.len()
    }
}

impl fmt::Debug for RouteInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteInfo")
            .field("method", &self.method)
            .field("path_pattern", &self.path_pattern)
            .field("match_pattern", &self.match_pattern)
            .field("handlers", &self.chain.len())
            .finish()
    }
}

/// Rewrite `:name` and `*name` segments into matchit's `{name}` and `{*name}`
pub(crate) fn normalize_pattern(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{name}}}")
            } else if let Some(name) = segment.strip_prefix('*') {
                format!("{{*{name}}}")
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a group's base path and a relative route path.
///
/// An empty relative path yields the base path unchanged. Duplicate slashes
/// are collapsed, and a trailing slash on `relative` is preserved.
#[must_use]
pub fn join_paths(base: &str, relative: &str) -> String {
    if relative.is_empty() {
        return base.to_string();
    }

    let segments: Vec<&str> = base
        .split('/')
        .chain(relative.split('/'))
        .filter(|s| !s.is_empty())
        .collect();

    let mut joined = format!("/{}", segments.join("/"));
    if relative.ends_with('/') && !joined.ends_with('/') {
        joined.push('/');
    }
    joined
}
