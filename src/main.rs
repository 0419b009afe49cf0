#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use ceems_lb::server;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ceems-lb", about = "Retention-aware load balancer for compute-unit monitoring backends")]
struct Cli {
    /// Path to the load balancer config file
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,

    /// Listen address for the TSDB query frontend
    #[arg(long, default_value = "0.0.0.0:9030")]
    tsdb_listen: String,

    /// Listen address for the Pyroscope query frontend
    /// (served only when pyroscope backends are configured)
    #[arg(long, default_value = "0.0.0.0:9040")]
    pyroscope_listen: String,

    /// Listen address for the Redfish/BMC proxy
    /// (served only when redfish_proxy is configured)
    #[arg(long, default_value = "0.0.0.0:5000")]
    redfish_listen: String,

    /// Admin API listen address (for health/metrics)
    #[arg(long, default_value = "0.0.0.0:9091")]
    admin_listen: String,

    /// Web config file with inbound TLS/basic-auth settings. Accepted for
    /// operator compatibility; inbound TLS is terminated upstream.
    #[arg(long)]
    web_config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = server::runtime::get_container_cpu_limit();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        tsdb_listen: cli.tsdb_listen,
        pyroscope_listen: cli.pyroscope_listen,
        redfish_listen: cli.redfish_listen,
        admin_listen: cli.admin_listen,
        web_config_path: cli.web_config,
    }))
}
