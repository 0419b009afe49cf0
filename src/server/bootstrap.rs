use crate::backend::{self, health, retention, Backend, Manager, Strategy};
use crate::ceems::Verifier;
use crate::config::LbConfig;
use crate::error::LbError;
use crate::frontend::{self, FrontendKind, FrontendState};
use crate::metrics::Metrics;
use crate::redfish::{self, RedfishState};
use crate::server;
use anyhow::Result;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: PathBuf,
    pub tsdb_listen: String,
    pub pyroscope_listen: String,
    pub redfish_listen: String,
    pub admin_listen: String,
    pub web_config_path: Option<PathBuf>,
}

/// LB lifecycle: init → validate → monitor → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    // Phase 1: configuration and the verification path.
    let config = LbConfig::load(&args.config_path)?;
    if let Some(ref path) = args.web_config_path {
        tracing::info!(
            "config: web config {} accepted; inbound TLS and basic auth are handled by the terminating gateway",
            path.display()
        );
    }

    let metrics = Metrics::install();
    let verifier = Arc::new(Verifier::from_config(&config)?);

    // Phase 2: configured cluster ids must be known to the authorisation
    // source before any traffic is accepted.
    validate_cluster_ids(&config, &verifier).await?;

    // Phase 3: backend managers, one per frontend.
    let strategy = Strategy::from_str(&config.ceems_lb.strategy)?;
    let (tsdb_manager, pyroscope_manager) = build_managers(&config, strategy)?;

    let tsdb_backends: Vec<Arc<Backend>> = tsdb_manager.all_backends().cloned().collect();
    let mut all_backends = tsdb_backends.clone();
    if let Some(ref m) = pyroscope_manager {
        all_backends.extend(m.all_backends().cloned());
    }

    // Phase 4: background monitor and auxiliary servers.
    let shutdown = Arc::new(Notify::new());
    start_health_monitor(all_backends, tsdb_backends, &shutdown);
    start_admin_server(&args.admin_listen, metrics);

    if let Some(ref redfish_config) = config.redfish_proxy {
        let state = RedfishState::from_config(redfish_config)?;
        let listen = args.redfish_listen.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let handler = move |req, peer| redfish::handle_request(req, state.clone(), peer);
            if let Err(e) = server::run_server("redfish", &listen, shutdown, handler).await {
                tracing::error!("server: redfish failed, error={}", e);
            }
        });
    }

    if let Some(manager) = pyroscope_manager {
        let state = FrontendState::new(FrontendKind::Pyroscope, manager, verifier.clone());
        let listen = args.pyroscope_listen.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let handler = move |req, peer| frontend::handle_request(req, state.clone(), peer);
            if let Err(e) = server::run_server("pyroscope", &listen, shutdown, handler).await {
                tracing::error!("server: pyroscope failed, error={}", e);
            }
        });
    }

    // Phase 5: the TSDB frontend is the primary server.
    let tsdb_state = FrontendState::new(FrontendKind::Tsdb, tsdb_manager, verifier.clone());
    let proxy_handle = tokio::spawn({
        let listen = args.tsdb_listen.clone();
        let shutdown = shutdown.clone();
        async move {
            let handler = move |req, peer| frontend::handle_request(req, tsdb_state.clone(), peer);
            server::run_server("tsdb", &listen, shutdown, handler).await
        }
    });

    // Phase 6: block until signal, then drain.
    wait_for_shutdown(&shutdown).await;

    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server: tsdb frontend error: {}", e),
        Err(e) => tracing::error!("server: tsdb task error: {}", e),
    }

    // Release our verifier handle; the read-only database closes once the
    // drained frontends drop their clones.
    drop(verifier);
    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

fn build_managers(
    config: &LbConfig,
    strategy: Strategy,
) -> Result<(Arc<Manager>, Option<Arc<Manager>>)> {
    let mut tsdb_manager = Manager::new(strategy);
    let mut pyroscope_manager = Manager::new(strategy);

    for entry in &config.ceems_lb.backends {
        for upstream in &entry.tsdb {
            tsdb_manager.add(&entry.id, Arc::new(Backend::new(&upstream.web)?));
        }
        for upstream in &entry.pyroscope {
            pyroscope_manager.add(&entry.id, Arc::new(Backend::new(&upstream.web)?));
        }
    }

    tracing::info!(
        "config: managers ready, strategy={:?}, tsdb_clusters={}, pyroscope_clusters={}",
        strategy,
        tsdb_manager.cluster_ids().count(),
        pyroscope_manager.cluster_ids().count()
    );

    let pyroscope_manager = if pyroscope_manager.is_empty() {
        None
    } else {
        Some(Arc::new(pyroscope_manager))
    };
    Ok((Arc::new(tsdb_manager), pyroscope_manager))
}

/// Cross-check configured cluster ids against the authorisation source.
/// Runs under a short timeout; an id the source does not know aborts
/// startup.
async fn validate_cluster_ids(config: &LbConfig, verifier: &Verifier) -> Result<()> {
    const VALIDATION_TIMEOUT: Duration = Duration::from_secs(1);

    let known = match tokio::time::timeout(VALIDATION_TIMEOUT, verifier.cluster_ids()).await {
        Ok(Ok(Some(ids))) => ids,
        Ok(Ok(None)) => return Ok(()), // access control disabled
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => anyhow::bail!("cluster id validation timed out"),
    };

    for id in config.cluster_ids() {
        if !known.contains(&id) {
            return Err(LbError::UnknownClusterId(id).into());
        }
    }

    tracing::info!(
        "config: cluster ids validated against authorisation source, known={}",
        known.len()
    );
    Ok(())
}

/// One probe round immediately, then a fixed-interval loop until shutdown.
/// Retention refresh piggybacks on each round for backends that are alive.
fn start_health_monitor(
    all_backends: Vec<Arc<Backend>>,
    tsdb_backends: Vec<Arc<Backend>>,
    shutdown: &Arc<Notify>,
) {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        let probe_client = retention::build_probe_client();
        loop {
            backend::run_health_checks(&all_backends).await;
            retention::refresh_retentions(&probe_client, &tsdb_backends).await;

            if sleep_or_shutdown(health::PROBE_INTERVAL, &shutdown).await {
                return;
            }
        }
    });
}

fn start_admin_server(listen: &str, metrics: Metrics) {
    let listen = listen.to_string();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&listen, metrics).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

/// Sleep for `duration`, but return `true` immediately if shutdown is
/// signalled. Returns `false` if the full duration elapsed normally.
async fn sleep_or_shutdown(duration: Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
