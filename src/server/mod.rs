pub mod bootstrap;
pub mod runtime;

use crate::frontend::context::{full_body, BoxBody};
use crate::metrics::Metrics;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Grace period for in-flight requests after the shutdown signal.
const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Bound on how long a client may dribble request headers.
const HEADER_READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Run one HTTP server with graceful shutdown support.
///
/// When `shutdown` is notified the server stops accepting new connections
/// and waits up to `DRAIN_TIMEOUT` for in-flight connections to complete
/// before dropping them. The handler is invoked per request with the TCP
/// peer address.
pub async fn run_server<F, Fut>(
    name: &'static str,
    listen: &str,
    shutdown: Arc<Notify>,
    handler: F,
) -> Result<()>
where
    F: Fn(Request<Incoming>, SocketAddr) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<BoxBody>, hyper::Error>> + Send + 'static,
{
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: {} listening, addr={}", name, addr);

    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: {}: stop accepting new connections, draining...", name);
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!(
                    "lb_connections_total",
                    "server" => name,
                    "status" => "accepted",
                )
                .increment(1);
                v
            }
            Err(e) => {
                error!("server: {}: accept failed, error={}", name, e);
                metrics::counter!(
                    "lb_connections_total",
                    "server" => name,
                    "status" => "error",
                )
                .increment(1);
                continue;
            }
        };

        metrics::gauge!("lb_connections_active", "server" => name).increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let handler = handler.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| handler(req, peer_addr));

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .timer(TokioTimer::new())
                .header_read_timeout(HEADER_READ_TIMEOUT)
                .keep_alive(true)
                .http2()
                .timer(TokioTimer::new())
                .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!(
                        "server: {}: connection error, peer={}, error={}",
                        name, peer_addr, e
                    );
                }
            }

            metrics::gauge!("lb_connections_active", "server" => name).decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain phase: wait for in-flight connections to finish (or timeout).
    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!(
            "server: {}: waiting for {} active connections to drain",
            name, active
        );
        let drain = async {
            loop {
                if active_conns.load(Ordering::Relaxed) == 0 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(_) => info!("server: {}: all connections drained", name),
            Err(_) => {
                let remaining = active_conns.load(Ordering::Relaxed);
                info!(
                    "server: {}: drain timeout ({}s), {} connections still active",
                    name,
                    DRAIN_TIMEOUT.as_secs(),
                    remaining
                );
            }
        }
    }

    Ok(())
}

/// Run the admin server for health checks and metrics scraping.
pub async fn run_admin_server(listen: &str, metrics_handle: Metrics) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let metrics_handle = metrics_handle.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let metrics_handle = metrics_handle.clone();
                async move { handle_admin(req, metrics_handle) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}

fn handle_admin(
    req: Request<Incoming>,
    metrics_handle: Metrics,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/metrics" => {
            let body = metrics_handle.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
