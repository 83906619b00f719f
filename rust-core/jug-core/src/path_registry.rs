//! # Path Registry
//!
//! Records which verbs were registered for which path on a router, so that
//! [`Engine::expand_methods`](crate::Engine::expand_methods) can answer the
//! remaining verbs with `405 Method Not Allowed` instead of `404`.
//!
//! Paths are kept in a `BTreeMap` so expansion registers routes in a stable
//! order from one run to the next.

use crate::method::Method;
use std::collections::{BTreeMap, BTreeSet};

/// Two-level set of `(path, method)` pairs
#[derive(Debug, Clone, Default)]
pub struct PathRegistry {
    paths: BTreeMap<String, BTreeSet<Method>>,
}

impl PathRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `methods` for `path`.
    ///
    /// The path is recorded even when `methods` is empty.
    pub fn add<I>(&mut self, path: &str, methods: I)
    where
        I: IntoIterator<Item = Method>,
    {
        self.paths
            .entry(path.to_string())
            .or_default()
            .extend(methods);
    }

    /// Whether `method` was recorded for `path`
    #[must_use]
    pub fn contains(&self, path: &str, method: Method) -> bool {
        self.paths
            .get(path)
            .is_some_and(|methods| methods.contains(&method))
    }

    /// Every recorded path, sorted
    #[must_use]
    pub fn paths(&self) -> Vec<&str> {
        self.paths.keys().map(String::as_str).collect()
    }

    /// Verbs recorded for `path`, in [`Method::ALL`] order
    #[must_use]
    pub fn methods(&self, path: &str) -> Vec<Method> {
        self.paths
            .get(path)
            .map(|methods| methods.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Verbs from [`Method::ALL`] not recorded for `path`
    #[must_use]
    pub fn missing(&self, path: &str) -> Vec<Method> {
        Method::ALL
            .into_iter()
            .filter(|m| !self.contains(path, *m))
            .collect()
    }

    /// Number of recorded paths
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether nothing was recorded yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
