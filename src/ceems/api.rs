use crate::config::{ApiWebConfig, BasicAuthConfig};
use crate::error::LbError;
use crate::frontend::GRAFANA_USER_HEADER;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// Client for the API server's verification and admin endpoints.
///
/// Shared across requests; reqwest clients are internally pooled and safe
/// for concurrent use.
pub struct ApiClient {
    base: String,
    client: reqwest::Client,
    basic_auth: Option<BasicAuthConfig>,
}

impl ApiClient {
    pub fn new(cfg: &ApiWebConfig) -> Result<Self, LbError> {
        let parsed = url::Url::parse(&cfg.url)
            .map_err(|e| LbError::Config(format!("malformed api server url {:?}: {}", cfg.url, e)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .danger_accept_invalid_certs(!cfg.http_client_config.tls_verify)
            .no_proxy()
            .build()
            .map_err(|e| LbError::Config(format!("failed to build api client: {}", e)))?;

        Ok(Self {
            base: parsed.as_str().trim_end_matches('/').to_string(),
            client,
            basic_auth: cfg.http_client_config.basic_auth.clone(),
        })
    }

    /// Ask the API server whether `user` may see `uuids` in `cluster_id` at
    /// the reference time. Any non-2xx answer or transport failure denies:
    /// an API outage must not open access.
    pub async fn verify_ownership(
        &self,
        user: &str,
        cluster_id: &str,
        uuids: &[String],
        time_secs: u64,
    ) -> bool {
        let url = format!("{}/api/v1/units/verify", self.base);
        let time_millis = (time_secs as i64).saturating_mul(1000).to_string();

        let mut query: Vec<(&str, &str)> = Vec::with_capacity(uuids.len() + 2);
        for uuid in uuids {
            query.push(("uuid", uuid.as_str()));
        }
        query.push(("cluster_id", cluster_id));
        query.push(("time", time_millis.as_str()));

        let mut req = self
            .client
            .get(&url)
            .query(&query)
            .header(GRAFANA_USER_HEADER, user);
        if let Some(ref auth) = self.basic_auth {
            req = req.basic_auth(&auth.username, Some(&auth.password));
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(
                    "verify: api denied, user={}, cluster={}, status={}",
                    user,
                    cluster_id,
                    resp.status()
                );
                false
            }
            Err(e) => {
                warn!(
                    "verify: api unreachable (failing closed), user={}, cluster={}, error={}",
                    user, cluster_id, e
                );
                false
            }
        }
    }

    /// Cluster ids the API server knows about, fetched with a
    /// service-account identity. Used for startup validation only.
    pub async fn admin_clusters(&self, service_user: &str) -> Result<Vec<String>, LbError> {
        let url = format!("{}/api/v1/clusters/admin", self.base);

        let mut req = self.client.get(&url).header(GRAFANA_USER_HEADER, service_user);
        if let Some(ref auth) = self.basic_auth {
            req = req.basic_auth(&auth.username, Some(&auth.password));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| LbError::Verification(format!("clusters query failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(LbError::Verification(format!(
                "clusters query returned {}",
                resp.status()
            )));
        }

        let body: ClustersResponse = resp
            .json()
            .await
            .map_err(|e| LbError::Verification(format!("bad clusters response: {}", e)))?;
        Ok(body.data.into_iter().map(|c| c.id).collect())
    }
}

#[derive(Debug, Deserialize)]
struct ClustersResponse {
    #[serde(default)]
    data: Vec<ClusterItem>,
}

#[derive(Debug, Deserialize)]
struct ClusterItem {
    id: String,
}
