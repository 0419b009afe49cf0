use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

/// Deserialize a `T` that implements `Default` — treats YAML/JSON `null` the
/// same as a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level load balancer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LbConfig {
    #[serde(default)]
    pub ceems_lb: LbSection,

    /// Authorisation source. `data.path` selects the direct database path,
    /// `web.url` the remote verification path; both absent disables access
    /// control.
    #[serde(default)]
    pub ceems_api_server: Option<ApiServerConfig>,

    /// Known clusters. When present, every backend id must be listed here.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub clusters: Vec<ClusterEntry>,

    /// Companion Redfish/BMC reverse proxy. Served only when present.
    #[serde(default)]
    pub redfish_proxy: Option<RedfishProxyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbSection {
    /// "round-robin", "least-connection", "resource-based".
    #[serde(default = "default_strategy")]
    pub strategy: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub backends: Vec<BackendEntry>,
}

impl Default for LbSection {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            backends: Vec::new(),
        }
    }
}

fn default_strategy() -> String {
    "round-robin".to_string()
}

/// One cluster's replicated backends. `id` is the cluster id matched against
/// the cluster-id request header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendEntry {
    pub id: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub tsdb: Vec<WebBackend>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub pyroscope: Vec<WebBackend>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebBackend {
    pub web: WebConfig,
}

/// Upstream transport settings for one backend. Beyond these configured
/// credentials the LB adds no authentication headers of its own to backend
/// traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub url: String,

    /// Default `false` — typical for internal backends with self-signed certs.
    #[serde(default)]
    pub tls_verify: bool,

    #[serde(default)]
    pub basic_auth: Option<BasicAuthConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiServerConfig {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub web: Option<ApiWebConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory holding the API server's SQLite database (`ceems.db`).
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiWebConfig {
    /// Base URL of the API server, e.g. "http://ceems-api:9020".
    pub url: String,

    #[serde(default)]
    pub http_client_config: HttpClientConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpClientConfig {
    #[serde(default)]
    pub tls_verify: bool,

    #[serde(default)]
    pub basic_auth: Option<BasicAuthConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicAuthConfig {
    pub username: String,

    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEntry {
    pub id: String,

    /// Resource manager behind this cluster ("slurm", "k8s", ...).
    /// Informational; the LB does not interpret it.
    #[serde(default)]
    pub manager: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedfishProxyConfig {
    /// Regular expressions over the request path; anything not matching is
    /// rejected. The default list covers the service root, sessions, and
    /// chassis (including chassis power) resources.
    #[serde(default = "default_allowed_api_resources")]
    pub allowed_api_resources: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub targets: Vec<RedfishTargetEntry>,

    #[serde(default)]
    pub web: RedfishWebConfig,
}

impl Default for RedfishProxyConfig {
    fn default() -> Self {
        Self {
            allowed_api_resources: default_allowed_api_resources(),
            targets: Vec::new(),
            web: RedfishWebConfig::default(),
        }
    }
}

fn default_allowed_api_resources() -> Vec<String> {
    vec![
        r"^/redfish/v1/?$".to_string(),
        r"^/redfish/v1/SessionService/Sessions/?".to_string(),
        r"^/redfish/v1/Sessions/?".to_string(),
        r"^/redfish/v1/Chassis(/.*)?$".to_string(),
    ]
}

/// Static client-IP → BMC URL mapping seeded from config. The proxy can
/// amend the runtime map from the desired-upstream request header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedfishTargetEntry {
    pub host_ips: Vec<String>,
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedfishWebConfig {
    #[serde(default)]
    pub tls_verify: bool,
}
