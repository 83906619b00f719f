//! # Middleware
//!
//! Built-in middleware. Anything implementing [`Handler`] can be middleware;
//! it only has to call [`Context::next`] to let the rest of the chain run.

use crate::context::Context;
use crate::handler::Handler;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Options for [`logger_with_config`]
#[derive(Debug, Clone, Default)]
pub struct LoggerConfig {
    /// Request paths that are never logged (health checks and the like)
    pub skip_paths: Vec<String>,
}

/// Access log middleware.
///
/// Logs method, path, status, latency, client IP and any errors recorded on
/// the context once the rest of the chain has run. Server errors log at
/// `error`, client errors at `warn`, everything else at `info`.
#[must_use]
pub fn logger() -> impl Handler {
    logger_with_config(LoggerConfig::default())
}

/// [`logger`] with options
#[must_use]
pub fn logger_with_config(config: LoggerConfig) -> impl Handler {
    let skip: Arc<HashSet<String>> = Arc::new(config.skip_paths.into_iter().collect());

    move |ctx: Context| {
        let skip = skip.clone();
        async move {
            let start = Instant::now();
            ctx.next().await;

            if skip.contains(ctx.path()) {
                return;
            }

            let status = ctx.response_status();
            let latency_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
            let client_ip = ctx.client_ip().unwrap_or_default();
            let errors = ctx.errors().join("; ");
            let route = ctx.full_path().unwrap_or("");

            if status.is_server_error() {
                error!(
                    method = %ctx.method(),
                    path = %ctx.path(),
                    route,
                    status = status.as_u16(),
                    latency_us,
                    client_ip = %client_ip,
                    errors = %errors,
                    "Request served"
                );
            } else if status.is_client_error() {
                warn!(
                    method = %ctx.method(),
                    path = %ctx.path(),
                    route,
                    status = status.as_u16(),
                    latency_us,
                    client_ip = %client_ip,
                    errors = %errors,
                    "Request served"
                );
            } else {
                info!(
                    method = %ctx.method(),
                    path = %ctx.path(),
                    route,
                    status = status.as_u16(),
                    latency_us,
                    client_ip = %client_ip,
                    "Request served"
                );
            }
        }
    }
}
