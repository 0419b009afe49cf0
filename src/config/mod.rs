pub mod types;


pub use types::*;

use crate::backend::Strategy;
use anyhow::{bail, Context, Result};
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

impl LbConfig {
    /// Load configuration from a YAML (or JSON) file, expand `${VAR}`
    /// environment references, and validate. Config errors are fatal; the
    /// LB never starts with a partial backend set.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("config file not found: {}", path.display());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let content = expand_env_vars(&content);

        let config: LbConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => serde_yaml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            Some(ext) => bail!("unsupported config format: .{ext}, use .yml or .json"),
            None => bail!("config file has no extension, use .yml or .json"),
        };

        config.validate()?;
        tracing::info!(
            "config: loaded, strategy={}, backends={}",
            config.ceems_lb.strategy,
            config.ceems_lb.backends.len()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        Strategy::from_str(&self.ceems_lb.strategy)
            .map_err(|e| anyhow::anyhow!("invalid strategy: {}", e))?;

        if self.ceems_lb.backends.is_empty() {
            bail!("no backends configured");
        }

        for backend in &self.ceems_lb.backends {
            if backend.id.is_empty() {
                bail!("backend with empty id");
            }
            if backend.tsdb.is_empty() && backend.pyroscope.is_empty() {
                bail!("backend {} has no upstreams", backend.id);
            }
            for upstream in backend.tsdb.iter().chain(backend.pyroscope.iter()) {
                validate_url(&upstream.web.url)
                    .with_context(|| format!("backend {}", backend.id))?;
                if let Some(ref auth) = upstream.web.basic_auth {
                    if auth.username.is_empty() {
                        bail!("backend {} has basic_auth with empty username", backend.id);
                    }
                }
            }
        }

        // When a clusters section exists, every backend id must be listed.
        if !self.clusters.is_empty() {
            for backend in &self.ceems_lb.backends {
                if !self.clusters.iter().any(|c| c.id == backend.id) {
                    bail!("backend id {} not present in clusters", backend.id);
                }
            }
        }

        if let Some(ref api) = self.ceems_api_server {
            if let Some(ref web) = api.web {
                validate_url(&web.url).context("ceems_api_server.web")?;
            }
        }

        if let Some(ref redfish) = self.redfish_proxy {
            for pattern in &redfish.allowed_api_resources {
                regex::Regex::new(pattern)
                    .with_context(|| format!("invalid allowed resource pattern {pattern:?}"))?;
            }
            for target in &redfish.targets {
                validate_url(&target.url).context("redfish_proxy target")?;
                for ip in &target.host_ips {
                    ip.parse::<IpAddr>()
                        .map_err(|_| anyhow::anyhow!("invalid redfish host ip: {}", ip))?;
                }
            }
        }

        Ok(())
    }

    /// All configured cluster ids, in backend order.
    pub fn cluster_ids(&self) -> Vec<String> {
        self.ceems_lb
            .backends
            .iter()
            .map(|b| b.id.clone())
            .collect()
    }
}

fn validate_url(raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw).with_context(|| format!("malformed url {raw:?}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => bail!("unsupported url scheme {other:?} in {raw:?}"),
    }
}

/// Replace `${NAME}` occurrences with the environment variable's value.
/// Unset variables are left untouched so that non-expansion uses of the
/// syntax survive round-trips.
fn expand_env_vars(content: &str) -> String {
    let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures<'_>| {
        match std::env::var(&caps[1]) {
            Ok(val) => val,
            Err(_) => caps[0].to_string(),
        }
    })
    .into_owned()
}
