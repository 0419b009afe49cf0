pub mod api;
pub mod db;

pub use api::ApiClient;
pub use db::Database;

use crate::config::LbConfig;
use crate::error::LbError;
use crate::frontend::context::ReqParams;
use tracing::info;

/// Identity the LB presents when calling the API server's admin endpoints
/// during startup validation.
pub const SERVICE_ACCOUNT_USER: &str = "ceems_lb";

/// Active verification path: direct database, remote API, or none at all.
/// Exactly one is selected at startup from the config.
pub enum Verifier {
    Db(Database),
    Api(ApiClient),
    Disabled,
}

impl Verifier {
    pub fn from_config(config: &LbConfig) -> Result<Self, LbError> {
        let Some(ref api_server) = config.ceems_api_server else {
            info!("verify: no api server configured, access control disabled");
            return Ok(Self::Disabled);
        };

        if let Some(ref dir) = api_server.data.path {
            return Ok(Self::Db(Database::open(dir)?));
        }
        if let Some(ref web) = api_server.web {
            info!("verify: using api server at {}", web.url);
            return Ok(Self::Api(ApiClient::new(web)?));
        }

        info!("verify: api server section empty, access control disabled");
        Ok(Self::Disabled)
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Allow/deny for one request. Database errors and API outages deny.
    pub async fn verify(&self, user: &str, params: &ReqParams) -> bool {
        match self {
            Self::Disabled => true,
            Self::Db(db) => db
                .verify_ownership(user, &params.cluster_id, &params.uuids, params.start)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!("verify: db query failed (failing closed): {}", e);
                    false
                }),
            Self::Api(api) => {
                api.verify_ownership(user, &params.cluster_id, &params.uuids, params.start)
                    .await
            }
        }
    }

    /// Cluster ids known to the authorisation source, or `None` when
    /// verification is disabled. Used by startup validation.
    pub async fn cluster_ids(&self) -> Result<Option<Vec<String>>, LbError> {
        match self {
            Self::Disabled => Ok(None),
            Self::Db(db) => db.cluster_ids().await.map(Some),
            Self::Api(api) => api.admin_clusters(SERVICE_ACCOUNT_USER).await.map(Some),
        }
    }
}
