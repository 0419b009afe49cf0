use crate::backend::server::Backend;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

/// TSDB runtime-info envelope; only the retention field is of interest.
#[derive(Debug, Deserialize)]
struct RuntimeInfoResponse {
    #[serde(default)]
    data: RuntimeInfoData,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimeInfoData {
    #[serde(rename = "storageRetention", default)]
    storage_retention: String,
}

/// Shared HTTP client for retention probes.
pub fn build_probe_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .danger_accept_invalid_certs(true)
        .no_proxy()
        .build()
        .expect("failed to build retention probe client")
}

/// Refresh the advertised retention window of every alive backend from its
/// runtime-info endpoint. Called once per monitor round; a backend that
/// fails to answer keeps its previous value (0 until the first success).
pub async fn refresh_retentions(client: &reqwest::Client, backends: &[Arc<Backend>]) {
    for backend in backends {
        if !backend.is_alive() {
            continue;
        }
        refresh_one(client, backend).await;
    }
}

async fn refresh_one(client: &reqwest::Client, backend: &Backend) {
    let url = format!(
        "{}/api/v1/status/runtimeinfo",
        backend.url().as_str().trim_end_matches('/')
    );

    let info: RuntimeInfoResponse = match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => match resp.json().await {
            Ok(info) => info,
            Err(e) => {
                debug!("retention: bad runtime-info body, backend={}, error={}", backend, e);
                return;
            }
        },
        Ok(resp) => {
            debug!(
                "retention: runtime-info status {}, backend={}",
                resp.status(),
                backend
            );
            return;
        }
        Err(e) => {
            debug!("retention: probe failed, backend={}, error={}", backend, e);
            return;
        }
    };

    match parse_retention(&info.data.storage_retention) {
        Some(retention) => {
            backend.set_retention(retention);
            metrics::gauge!(
                "lb_backend_retention_seconds",
                "backend" => backend.dial_addr().to_owned(),
            )
            .set(retention.as_secs_f64());
            debug!(
                "retention: refreshed, backend={}, retention={}s",
                backend,
                retention.as_secs()
            );
        }
        None => {
            warn!(
                "retention: unparseable storageRetention {:?}, backend={}",
                info.data.storage_retention, backend
            );
        }
    }
}

/// Parse a TSDB retention advertisement.
///
/// The field is either a plain duration ("15d") or a compound like
/// "30d or 512MB"; the first token that parses as a duration wins. Size
/// limits carry no age information and are ignored.
pub fn parse_retention(s: &str) -> Option<Duration> {
    s.split_whitespace().find_map(parse_prometheus_duration)
}

/// Prometheus duration syntax: one or more `<number><unit>` groups, units
/// ms/s/m/h/d/w/y, e.g. "2h45m".
fn parse_prometheus_duration(s: &str) -> Option<Duration> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let group_re = RE.get_or_init(|| {
        regex::Regex::new(r"^(?:[0-9]+(?:ms|s|m|h|d|w|y))+$").unwrap()
    });
    if s.is_empty() || !group_re.is_match(s) {
        return None;
    }

    static PART: OnceLock<regex::Regex> = OnceLock::new();
    let part_re = PART.get_or_init(|| regex::Regex::new(r"([0-9]+)(ms|s|m|h|d|w|y)").unwrap());

    let mut total_ms: u64 = 0;
    for caps in part_re.captures_iter(s) {
        let value: u64 = caps[1].parse().ok()?;
        let unit_ms: u64 = match &caps[2] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "w" => 7 * 86_400_000,
            "y" => 365 * 86_400_000,
            _ => return None,
        };
        total_ms = total_ms.checked_add(value.checked_mul(unit_ms)?)?;
    }
    Some(Duration::from_millis(total_ms))
}
