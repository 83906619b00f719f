//! # HTTP Server
//!
//! HTTP/1 server built on Hyper and Tokio.
//! Implements graceful shutdown with signal handling.
//!
//! ## Key Features
//!
//! - Async request handling with Tokio runtime
//! - Graceful shutdown on SIGINT/SIGTERM with a drain timeout
//! - Connection keep-alive support
//! - Body size limit enforced before the handler chain runs (413)

use crate::body::ResponseBody;
use crate::engine::App;
use crate::error::{Error, Result};
use crate::request::collect_body;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::StatusCode;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Environment variable overriding the listening port
pub const PORT_ENV: &str = "PORT";
/// Environment variable overriding [`ServerConfig::max_body_size`]
pub const MAX_BODY_SIZE_ENV: &str = "JUG_MAX_BODY_SIZE";
/// Environment variable overriding [`ServerConfig::shutdown_timeout`], in seconds
pub const SHUTDOWN_TIMEOUT_ENV: &str = "JUG_SHUTDOWN_TIMEOUT_SECS";

/// HTTP Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub address: SocketAddr,
    /// How long in-flight requests may run after shutdown starts
    pub shutdown_timeout: Duration,
    /// Max request body size in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ([0, 0, 0, 0], 8080).into(),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Defaults with environment overrides applied.
    ///
    /// Unparsable values are logged and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(port) = env_parse::<u16>(PORT_ENV) {
            config.address.set_port(port);
        }
        if let Some(size) = env_parse::<usize>(MAX_BODY_SIZE_ENV) {
            config.max_body_size = size;
        }
        if let Some(secs) = env_parse::<u64>(SHUTDOWN_TIMEOUT_ENV) {
            config.shutdown_timeout = Duration::from_secs(secs);
        }
        config
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable environment variable");
            None
        }
    }
}

/// Serve `app` until Ctrl-C or SIGTERM
///
/// # Errors
///
/// Returns `Error::BindError` when the address cannot be bound and
/// `Error::Io` when accepting connections fails.
pub async fn serve(app: App, config: ServerConfig) -> Result<()> {
    let listener = bind(config.address)?;
    info!("Server listening on http://{}", config.address);
    serve_with_shutdown(listener, app, &config, shutdown_signal()).await
}

fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let bind_error = |source| Error::BindError {
        address: addr.to_string(),
        source,
    };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_error)?;
    socket.set_reuseaddr(true).map_err(bind_error)?;
    #[cfg(not(windows))]
    {
        socket.set_reuseport(true).map_err(bind_error)?;
    }
    socket.bind(addr).map_err(bind_error)?;
    socket.listen(1024).map_err(bind_error)
}

/// Accept connections on `listener` until `signal` resolves, then drain.
///
/// # Errors
///
/// Returns `Error::Io` when accepting a connection fails.
pub async fn serve_with_shutdown(
    listener: TcpListener,
    app: App,
    config: &ServerConfig,
    signal: impl Future<Output = ()>,
) -> Result<()> {
    let active = Arc::new(AtomicUsize::new(0));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let max_body_size = config.max_body_size;
    tokio::pin!(signal);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, remote_addr) = accept_result?;
                let io = TokioIo::new(stream);
                let app = app.clone();
                let active = active.clone();
                let mut shutdown_rx = shutdown_rx.clone();

                active.fetch_add(1, Ordering::Relaxed);
                tokio::task::spawn(async move {
                    let service = service_fn(move |req| {
                        let app = app.clone();
                        async move {
                            Ok::<_, Infallible>(
                                handle_request(req, &app, remote_addr, max_body_size).await,
                            )
                        }
                    });
                    let conn = http1::Builder::new().serve_connection(io, service);
                    tokio::pin!(conn);

                    let result = tokio::select! {
                        result = conn.as_mut() => result,
                        _ = shutdown_rx.changed() => {
                            conn.as_mut().graceful_shutdown();
                            conn.as_mut().await
                        }
                    };
                    if let Err(err) = result {
                        debug!(remote = %remote_addr, error = %err, "Error serving connection");
                    }
                    active.fetch_sub(1, Ordering::Relaxed);
                });
            }
            () = &mut signal => {
                info!("Shutdown signal received, stopping server...");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let drain = async {
        while active.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    if tokio::time::timeout(config.shutdown_timeout, drain).await.is_err() {
        warn!(
            remaining = active.load(Ordering::Relaxed),
            "Shutdown timeout elapsed with connections still open"
        );
    }
    Ok(())
}

async fn handle_request(
    req: hyper::Request<Incoming>,
    app: &App,
    remote_addr: SocketAddr,
    max_body_size: usize,
) -> hyper::Response<ResponseBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let version = req.version();

    let response = match collect_body(req, max_body_size).await {
        Ok(req) => app.handle(req, Some(remote_addr)).await,
        Err(err @ Error::PayloadTooLarge { .. }) => {
            warn!(remote = %remote_addr, method = %method, path = %path, error = %err, "Request rejected");
            plain_response(StatusCode::PAYLOAD_TOO_LARGE, "413 payload too large")
        }
        Err(err) => {
            error!(remote = %remote_addr, method = %method, path = %path, error = %err, "Failed to read request");
            plain_response(StatusCode::BAD_REQUEST, "400 bad request")
        }
    };

    debug!(
        "{} - \"{} {} {:?}\" {}",
        remote_addr,
        method,
        path,
        version,
        response.status().as_u16()
    );
    response
}

fn plain_response(status: StatusCode, body: &'static str) -> hyper::Response<ResponseBody> {
    let mut response = hyper::Response::new(ResponseBody::full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::engine::Engine;
    use crate::router::Router;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.address.port(), 8080);
        assert!(config.address.ip().is_unspecified());
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.max_body_size, 1024 * 1024);
    }

    #[test]
    fn test_server_config_from_env() {
        std::env::set_var(PORT_ENV, "9090");
        std::env::set_var(MAX_BODY_SIZE_ENV, "2048");
        std::env::set_var(SHUTDOWN_TIMEOUT_ENV, "5");
        let config = ServerConfig::from_env();
        std::env::remove_var(PORT_ENV);
        std::env::remove_var(MAX_BODY_SIZE_ENV);
        std::env::remove_var(SHUTDOWN_TIMEOUT_ENV);

        assert_eq!(config.address.port(), 9090);
        assert!(config.address.ip().is_unspecified());
        assert_eq!(config.max_body_size, 2048);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_env_parse() {
        std::env::set_var("JUG_TEST_ENV_PARSE_OK", " 42 ");
        std::env::set_var("JUG_TEST_ENV_PARSE_BAD", "forty-two");

        assert_eq!(env_parse::<u16>("JUG_TEST_ENV_PARSE_OK"), Some(42));
        assert_eq!(env_parse::<u16>("JUG_TEST_ENV_PARSE_BAD"), None);
        assert_eq!(env_parse::<u16>("JUG_TEST_ENV_PARSE_UNSET"), None);
    }

    async fn roundtrip(addr: SocketAddr, raw: String) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let mut engine = Engine::new();
        engine.get("/ping", |ctx: Context| async move {
            ctx.string(StatusCode::OK, "pong");
        });
        engine.post("/echo", |ctx: Context| async move {
            let body = ctx.raw_data().clone();
            ctx.data(StatusCode::OK, "application/octet-stream", body);
        });
        let app = engine.build().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ServerConfig {
            address: addr,
            shutdown_timeout: Duration::from_secs(1),
            max_body_size: 8,
        };
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            serve_with_shutdown(listener, app, &config, async {
                let _ = stop_rx.await;
            })
            .await
        });

        let response = roundtrip(
            addr,
            "GET /ping HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n".to_string(),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("pong"));

        let response = roundtrip(
            addr,
            "POST /echo HTTP/1.1\r\nHost: test\r\nContent-Length: 4\r\nConnection: close\r\n\r\nabcd"
                .to_string(),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("abcd"));

        let response = roundtrip(
            addr,
            "POST /echo HTTP/1.1\r\nHost: test\r\nContent-Length: 16\r\nConnection: close\r\n\r\n0123456789abcdef"
                .to_string(),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 413"));

        // No Content-Length: the limit trips while the chunks are read
        let response = roundtrip(
            addr,
            "POST /echo HTTP/1.1\r\nHost: test\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n4\r\nabcd\r\n0\r\n\r\n"
                .to_string(),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("abcd"));

        let response = roundtrip(
            addr,
            "POST /echo HTTP/1.1\r\nHost: test\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n8\r\n01234567\r\n8\r\n89abcdef\r\n0\r\n\r\n"
                .to_string(),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 413"));
        assert!(response.ends_with("413 payload too large"));

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
