use crate::frontend::context::{BoxBody, ErrorType, ReqParams, RequestContext};
use crate::frontend::parser::{parse_tsdb_params, tsdb_family};
use crate::frontend::profiling::{parse_pyroscope_params, profiling_family};
use crate::frontend::{
    FrontendKind, FrontendState, ADMIN_USER_HEADER, CLUSTER_ID_HEADER, GRAFANA_USER_HEADER,
    LOGGED_USER_HEADER,
};
use http::{HeaderMap, HeaderValue, Method, Uri};
use hyper::Response;
use tracing::{debug, warn};

/// Outcome of the authorisation middleware: either dispatch with the
/// request's parameters, or short-circuit with an error response.
pub enum AuthDecision {
    Proceed(ReqParams),
    Reject(Response<BoxBody>),
}

/// Remove the trust headers the LB owns. Untrusted clients must never be
/// able to smuggle an identity past verification; this runs on every
/// request regardless of whether access control is enabled.
pub fn strip_untrusted_headers(headers: &mut HeaderMap) {
    headers.remove(ADMIN_USER_HEADER);
    headers.remove(LOGGED_USER_HEADER);
}

/// The authorisation middleware.
///
/// Requires a configured cluster id; parses query parameters for the
/// endpoint families; requires and propagates the user identity; verifies
/// ownership of the queried compute units. Paths outside the families and
/// deployments without a verification source pass through with parameters
/// attached.
pub async fn authorize(
    state: &FrontendState,
    ctx: &mut RequestContext,
    method: &Method,
    uri: &Uri,
    headers: &mut HeaderMap,
    body: &[u8],
) -> AuthDecision {
    let cluster_id = headers
        .get(CLUSTER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if !state.manager.has_cluster(&cluster_id) {
        debug!(
            "auth: unknown cluster id, frontend={}, cluster={:?}, path={}",
            ctx.frontend, cluster_id, ctx.uri_path
        );
        return AuthDecision::Reject(ctx.api_error(
            ErrorType::BadRequest,
            &format!("invalid cluster id: {:?}", cluster_id),
        ));
    }
    ctx.cluster_id = cluster_id.clone();

    // Paths outside the query endpoint families (runtime info, federate,
    // ...) are proxied without verification.
    let in_family = match state.kind {
        FrontendKind::Tsdb => tsdb_family(uri.path()).is_some(),
        FrontendKind::Pyroscope => profiling_family(uri.path()).is_some(),
    };
    if !in_family {
        return AuthDecision::Proceed(ReqParams::passthrough(&cluster_id));
    }

    let params = match state.kind {
        FrontendKind::Tsdb => {
            parse_tsdb_params(&state.parsers, &cluster_id, method, uri, headers, body)
        }
        FrontendKind::Pyroscope => {
            parse_pyroscope_params(&state.parsers, &cluster_id, uri.path(), body)
        }
    }
    // Family membership was just checked; the parsers only return None for
    // non-family paths.
    .unwrap_or_else(|| ReqParams::passthrough(&cluster_id));

    if params.uuids.is_empty() {
        // Not an error by itself: verification decides what an empty unit
        // list means for this user.
        debug!(
            "auth: no unit uuids parsed, frontend={}, path={}",
            ctx.frontend, ctx.uri_path
        );
    }

    // Operator chose to run without access control.
    if !state.verifier.is_enabled() {
        return AuthDecision::Proceed(params);
    }

    let user = match headers
        .get(GRAFANA_USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|u| !u.is_empty())
        .map(str::to_string)
    {
        Some(user) => user,
        None => {
            debug!(
                "auth: missing user header, frontend={}, path={}",
                ctx.frontend, ctx.uri_path
            );
            return AuthDecision::Reject(
                ctx.api_error(ErrorType::Unauthorized, "user header missing"),
            );
        }
    };

    if let Ok(value) = HeaderValue::from_str(&user) {
        headers.insert(LOGGED_USER_HEADER, value);
    }

    if !state.verifier.verify(&user, &params).await {
        warn!(
            "auth: ownership denied, frontend={}, user={}, cluster={}, uuids={}",
            ctx.frontend,
            user,
            params.cluster_id,
            params.uuids.len()
        );
        metrics::counter!(
            "lb_auth_denied_total",
            "frontend" => ctx.frontend,
            "cluster" => params.cluster_id.clone(),
        )
        .increment(1);
        return AuthDecision::Reject(ctx.api_error(
            ErrorType::Forbidden,
            "user does not have permissions to view unit metrics",
        ));
    }

    AuthDecision::Proceed(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::server::test_backend;
    use crate::backend::{Manager, Strategy};
    use crate::ceems::{Database, Verifier};
    use http::StatusCode;
    use std::sync::Arc;

    const SCHEMA: &str = r#"
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
    "#;

    fn state_with_db() -> FrontendState {
        let mut manager = Manager::new(Strategy::RoundRobin);
        manager.add("rm-0", test_backend("http://tsdb:9090"));
        FrontendState::new(
            FrontendKind::Tsdb,
            Arc::new(manager),
            Arc::new(Verifier::Db(Database::open_in_memory_with(SCHEMA))),
        )
    }

    fn ctx() -> RequestContext {
        RequestContext::new("tsdb", "GET".into(), "/api/v1/query".into())
    }

    fn query_uri(query: &str, time: u64) -> Uri {
        format!(
            "/api/v1/query?query={}&time={}",
            url::form_urlencoded::byte_serialize(query.as_bytes()).collect::<String>(),
            time
        )
        .parse()
        .unwrap()
    }

    fn headers(cluster: Option<&str>, user: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(c) = cluster {
            h.insert(CLUSTER_ID_HEADER, c.parse().unwrap());
        }
        if let Some(u) = user {
            h.insert(GRAFANA_USER_HEADER, u.parse().unwrap());
        }
        h
    }

    #[test]
    fn test_strip_untrusted_headers() {
        let mut h = HeaderMap::new();
        h.insert(ADMIN_USER_HEADER, "evil".parse().unwrap());
        h.insert(LOGGED_USER_HEADER, "evil".parse().unwrap());
        h.insert(GRAFANA_USER_HEADER, "usr1".parse().unwrap());
        strip_untrusted_headers(&mut h);
        assert!(h.get(ADMIN_USER_HEADER).is_none());
        assert!(h.get(LOGGED_USER_HEADER).is_none());
        assert!(h.get(GRAFANA_USER_HEADER).is_some());
    }

    #[tokio::test]
    async fn test_missing_cluster_id_rejected() {
        let state = state_with_db();
        let mut c = ctx();
        let mut h = headers(None, Some("usr1"));
        let uri = query_uri(r#"foo{uuid="1479763"}"#, 1735045414);
        match authorize(&state, &mut c, &Method::GET, &uri, &mut h, b"").await {
            AuthDecision::Reject(resp) => assert_eq!(resp.status(), StatusCode::BAD_REQUEST),
            AuthDecision::Proceed(_) => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn test_unknown_cluster_id_rejected() {
        let state = state_with_db();
        let mut c = ctx();
        let mut h = headers(Some("rm-9"), Some("usr1"));
        let uri = query_uri("up", 1735045414);
        match authorize(&state, &mut c, &Method::GET, &uri, &mut h, b"").await {
            AuthDecision::Reject(resp) => assert_eq!(resp.status(), StatusCode::BAD_REQUEST),
            AuthDecision::Proceed(_) => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn test_missing_user_header_unauthorized() {
        let state = state_with_db();
        let mut c = ctx();
        let mut h = headers(Some("rm-0"), None);
        let uri = query_uri(r#"foo{uuid="1479763"}"#, 1735045414);
        match authorize(&state, &mut c, &Method::GET, &uri, &mut h, b"").await {
            AuthDecision::Reject(resp) => assert_eq!(resp.status(), StatusCode::UNAUTHORIZED),
            AuthDecision::Proceed(_) => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn test_owner_allowed_and_logged_user_set() {
        let state = state_with_db();
        let mut c = ctx();
        let mut h = headers(Some("rm-0"), Some("usr1"));
        let uri = query_uri(r#"foo{uuid="1479763"}"#, 1735045414);
        match authorize(&state, &mut c, &Method::GET, &uri, &mut h, b"").await {
            AuthDecision::Proceed(params) => {
                assert_eq!(params.uuids, vec!["1479763"]);
                assert_eq!(h.get(LOGGED_USER_HEADER).unwrap(), "usr1");
            }
            AuthDecision::Reject(_) => panic!("expected proceed"),
        }
    }

    #[tokio::test]
    async fn test_non_owner_forbidden() {
        let state = state_with_db();
        let mut c = ctx();
        let mut h = headers(Some("rm-0"), Some("usr2"));
        let uri = query_uri(r#"foo{uuid="1479763"}"#, 1735045414);
        match authorize(&state, &mut c, &Method::GET, &uri, &mut h, b"").await {
            AuthDecision::Reject(resp) => assert_eq!(resp.status(), StatusCode::FORBIDDEN),
            AuthDecision::Proceed(_) => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn test_admin_override_allowed() {
        let state = state_with_db();
        let mut c = ctx();
        let mut h = headers(Some("rm-0"), Some("adm1"));
        let uri = query_uri(r#"foo{uuid=~"1479765|1481510"}"#, 1735045414);
        match authorize(&state, &mut c, &Method::GET, &uri, &mut h, b"").await {
            AuthDecision::Proceed(params) => {
                assert_eq!(params.uuids, vec!["1479765", "1481510"]);
            }
            AuthDecision::Reject(_) => panic!("expected proceed"),
        }
    }

    #[tokio::test]
    async fn test_non_family_path_passes_through() {
        let state = state_with_db();
        let mut c = ctx();
        // No user header at all; still passes because the path is outside
        // the query families.
        let mut h = headers(Some("rm-0"), None);
        let uri: Uri = "/api/v1/status/runtimeinfo".parse().unwrap();
        match authorize(&state, &mut c, &Method::GET, &uri, &mut h, b"").await {
            AuthDecision::Proceed(params) => {
                assert_eq!(params.cluster_id, "rm-0");
                assert!(params.uuids.is_empty());
            }
            AuthDecision::Reject(_) => panic!("expected pass-through"),
        }
    }

    #[tokio::test]
    async fn test_disabled_verifier_passes_through() {
        let mut manager = Manager::new(Strategy::RoundRobin);
        manager.add("rm-0", test_backend("http://tsdb:9090"));
        let state = FrontendState::new(
            FrontendKind::Tsdb,
            Arc::new(manager),
            Arc::new(Verifier::Disabled),
        );

        let mut c = ctx();
        let mut h = headers(Some("rm-0"), None);
        let uri = query_uri(r#"foo{uuid="1479763"}"#, 1735045414);
        match authorize(&state, &mut c, &Method::GET, &uri, &mut h, b"").await {
            AuthDecision::Proceed(params) => assert_eq!(params.uuids, vec!["1479763"]),
            AuthDecision::Reject(_) => panic!("expected pass-through"),
        }
    }
}
