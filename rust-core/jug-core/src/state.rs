//! # Request State
//!
//! Thread-safe key/value storage scoped to one request, used by middleware to
//! hand values (an authenticated user, a tenant id) to later handlers through
//! [`Context::set`](crate::Context::set) and
//! [`Context::get`](crate::Context::get).

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Type-erased storage for named values
#[derive(Clone, Default)]
pub struct Keys {
    data: Arc<RwLock<HashMap<String, Box<dyn Any + Send + Sync>>>>,
}

impl Keys {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value with a string key
    ///
    /// Overwrites any existing value with the same key.
    pub fn set<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data.insert(key.into(), Box::new(value));
    }

    /// Get a cloned value by key
    ///
    /// Returns `None` if key doesn't exist or type doesn't match.
    #[must_use]
    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        data.get(key)
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Keys")
            .field("keys", &data.keys().collect::<Vec<_>>())
            .finish()
    }
}
