use crate::backend::server::Backend;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Fixed probe cadence; the monitor runs one round immediately at startup,
/// then ticks at this interval.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(20);

/// Per-probe TCP dial timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Probes issued concurrently per round. Probing is semantically
/// sequential-per-round; this just bounds the round's wall-clock.
const PROBE_CONCURRENCY: usize = 16;

/// Run a single round of liveness probes across the given backends.
///
/// The caller owns the loop / scheduling. A probe is one TCP dial to the
/// backend's host:port; any error marks the backend dead until a later
/// round succeeds.
pub async fn run_health_checks(backends: &[Arc<Backend>]) {
    stream::iter(backends.iter().cloned())
        .map(|backend| async move {
            probe_one(&backend).await;
        })
        .buffer_unordered(PROBE_CONCURRENCY)
        .collect::<()>()
        .await;
}

async fn probe_one(backend: &Backend) {
    let addr = backend.dial_addr();

    let result = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await;
    let alive = matches!(result, Ok(Ok(_)));

    let was_alive = backend.is_alive();
    backend.set_alive(alive);

    metrics::gauge!(
        "lb_backend_health_status",
        "backend" => addr.to_owned(),
    )
    .set(if alive { 1.0 } else { 0.0 });
    metrics::counter!(
        "lb_health_check_total",
        "backend" => addr.to_owned(),
        "result" => if alive { "success" } else { "failure" },
    )
    .increment(1);

    if alive {
        debug!("health: probe passed, backend={}", addr);
    } else if was_alive {
        warn!("health: backend marked dead, backend={}", addr);
    } else {
        debug!("health: probe failed, backend={}", addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::server::test_backend;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_marks_reachable_backend_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let backend = test_backend(&format!("http://{}", addr));
        backend.set_alive(false);

        run_health_checks(&[backend.clone()]).await;
        assert!(backend.is_alive());
    }

    #[tokio::test]
    async fn test_probe_marks_unreachable_backend_dead() {
        // Bind then drop to get a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = test_backend(&format!("http://{}", addr));
        assert!(backend.is_alive());

        run_health_checks(&[backend.clone()]).await;
        assert!(!backend.is_alive());
    }
}
