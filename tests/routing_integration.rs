//! End-to-end tests: real listeners, mock backends, the full middleware and
//! dispatch path.

use ceems_lb::backend::{run_health_checks, Backend, Manager, Strategy};
use ceems_lb::ceems::{Database, Verifier};
use ceems_lb::config::WebConfig;
use ceems_lb::frontend::{self, FrontendKind, FrontendState};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const DAY: u64 = 86400;

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

fn backend_for(addr: SocketAddr) -> Arc<Backend> {
    Arc::new(
        Backend::new(&WebConfig {
            url: format!("http://{}", addr),
            tls_verify: false,
            basic_auth: None,
        })
        .unwrap(),
    )
}

/// Minimal upstream that answers every request with 200 and an identifying
/// header, so tests can observe which backend served.
async fn spawn_mock_backend(name: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }
                let body = r#"{"status":"success"}"#;
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\nx-served-by: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    name,
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
            });
        }
    });
    addr
}

/// Serve a frontend on an ephemeral port, routing through the real handler.
async fn spawn_frontend(state: FrontendState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                return;
            };
            let state = state.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = service_fn(move |req| frontend::handle_request(req, state.clone(), peer));
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, svc)
                    .await;
            });
        }
    });
    addr
}

fn tsdb_state(manager: Manager, verifier: Verifier) -> FrontendState {
    FrontendState::new(FrontendKind::Tsdb, Arc::new(manager), Arc::new(verifier))
}

#[tokio::test]
async fn retention_routing_picks_hottest_satisfying_backend() {
    let hot_addr = spawn_mock_backend("hot").await;
    let cold_addr = spawn_mock_backend("cold").await;

    let hot = backend_for(hot_addr);
    let cold = backend_for(cold_addr);
    hot.set_retention(Duration::from_secs(15 * DAY));
    cold.set_retention(Duration::from_secs(365 * DAY));

    let mut manager = Manager::new(Strategy::ResourceBased);
    manager.add("c", hot);
    manager.add("c", cold);

    let lb_addr = spawn_frontend(tsdb_state(manager, Verifier::Disabled)).await;
    let client = reqwest::Client::new();

    // A 5-day-old range query fits the hot backend.
    let resp = client
        .get(format!("http://{}/api/v1/query_range", lb_addr))
        .query(&[
            ("query", "up"),
            ("start", &(now_secs() - 5 * DAY).to_string()),
            ("end", &now_secs().to_string()),
        ])
        .header("x-ceems-cluster-id", "c")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-served-by"], "hot");

    // A 30-day-old query outlives the hot retention window.
    let resp = client
        .get(format!("http://{}/api/v1/query_range", lb_addr))
        .query(&[
            ("query", "up"),
            ("start", &(now_secs() - 30 * DAY).to_string()),
            ("end", &now_secs().to_string()),
        ])
        .header("x-ceems-cluster-id", "c")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-served-by"], "cold");
}

#[tokio::test]
async fn dead_backend_yields_service_unavailable() {
    // Bind then drop so the port refuses connections.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);

    let backend = backend_for(dead_addr);
    let mut manager = Manager::new(Strategy::RoundRobin);
    manager.add("c", backend.clone());

    // One monitor round flips the backend dead without waiting for a tick.
    run_health_checks(&[backend]).await;

    let lb_addr = spawn_frontend(tsdb_state(manager, Verifier::Disabled)).await;
    let resp = reqwest::Client::new()
        .get(format!("http://{}/api/v1/query", lb_addr))
        .query(&[("query", "up")])
        .header("x-ceems-cluster-id", "c")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
}

#[tokio::test]
async fn transport_failure_retries_onto_live_backend() {
    let live_addr = spawn_mock_backend("live").await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);

    // The dead backend has not been probed yet, so the first selection may
    // pick it; the dispatcher must recover within the single retry.
    let mut manager = Manager::new(Strategy::RoundRobin);
    manager.add("c", backend_for(dead_addr));
    manager.add("c", backend_for(live_addr));

    let lb_addr = spawn_frontend(tsdb_state(manager, Verifier::Disabled)).await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let resp = client
            .get(format!("http://{}/api/v1/query", lb_addr))
            .query(&[("query", "up")])
            .header("x-ceems-cluster-id", "c")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["x-served-by"], "live");
    }
}

#[tokio::test]
async fn unknown_cluster_id_is_bad_request() {
    let backend_addr = spawn_mock_backend("only").await;
    let mut manager = Manager::new(Strategy::RoundRobin);
    manager.add("c", backend_for(backend_addr));

    let lb_addr = spawn_frontend(tsdb_state(manager, Verifier::Disabled)).await;
    let resp = reqwest::Client::new()
        .get(format!("http://{}/api/v1/query", lb_addr))
        .query(&[("query", "up")])
        .header("x-ceems-cluster-id", "nope")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "error");
    assert_eq!(body["errorType"], "bad_request");
}

#[tokio::test]
async fn health_endpoint_always_succeeds() {
    let mut manager = Manager::new(Strategy::RoundRobin);
    // Backend down, no cluster header, no user — /health still answers.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);
    manager.add("c", backend_for(dead_addr));

    let lb_addr = spawn_frontend(tsdb_state(manager, Verifier::Disabled)).await;
    let resp = reqwest::Client::new()
        .get(format!("http://{}/health", lb_addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

fn seeded_database(dir: &std::path::Path) -> Database {
    let conn = rusqlite::Connection::open(dir.join("ceems.db")).unwrap();
    conn.execute_batch(
        r#"
        CREATE TABLE units (
            id INTEGER PRIMARY KEY,
            cluster_id TEXT NOT NULL,
            uuid TEXT NOT NULL,
            project TEXT,
            usr TEXT NOT NULL,
            started_at_ts INTEGER NOT NULL
        );
        CREATE TABLE users (cluster_id TEXT, name TEXT, projects TEXT);
        CREATE TABLE admin_users (source TEXT, users TEXT);

        INSERT INTO units (cluster_id, uuid, project, usr, started_at_ts)
            VALUES ('rm-0', '1479763', 'p1', 'usr1', 1735045414000);
        INSERT INTO admin_users (source, users) VALUES ('ceems', '["adm1"]');
        "#,
    )
    .unwrap();
    drop(conn);
    Database::open(dir).unwrap()
}

#[tokio::test]
async fn ownership_verification_over_http() {
    let tmp = tempfile::tempdir().unwrap();
    let db = seeded_database(tmp.path());

    let backend_addr = spawn_mock_backend("tsdb").await;
    let mut manager = Manager::new(Strategy::RoundRobin);
    manager.add("rm-0", backend_for(backend_addr));

    let lb_addr = spawn_frontend(tsdb_state(manager, Verifier::Db(db))).await;
    let client = reqwest::Client::new();
    let base = format!("http://{}/api/v1/query_range", lb_addr);

    // Owner sees their unit.
    let resp = client
        .get(&base)
        .query(&[("query", r#"foo{uuid="1479763"}"#), ("start", "1735045414")])
        .header("x-ceems-cluster-id", "rm-0")
        .header("x-grafana-user", "usr1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // A stranger does not.
    let resp = client
        .get(&base)
        .query(&[
            ("query", r#"foo{uuid=~"1479765|1481510"}"#),
            ("start", "1735045414"),
        ])
        .header("x-ceems-cluster-id", "rm-0")
        .header("x-grafana-user", "usr1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    // Admins see everything.
    let resp = client
        .get(&base)
        .query(&[
            ("query", r#"foo{uuid=~"1479765|1481510"}"#),
            ("start", "1735045414"),
        ])
        .header("x-ceems-cluster-id", "rm-0")
        .header("x-grafana-user", "adm1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // No user header at all.
    let resp = client
        .get(&base)
        .query(&[("query", r#"foo{uuid="1479763"}"#), ("start", "1735045414")])
        .header("x-ceems-cluster-id", "rm-0")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}
