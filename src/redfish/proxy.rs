use crate::config::RedfishProxyConfig;
use crate::error::LbError;
use crate::frontend::context::{full_body, BoxBody};
use crate::redfish::targets::TargetMap;
use http::header::{AUTHORIZATION, CONNECTION, HOST, TRANSFER_ENCODING};
use http::{HeaderName, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Multi-valued header carrying the original client IPs when the proxy
/// sits behind another hop.
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// Fallback header naming the desired BMC upstream when the client IP has
/// no mapping yet. Stripped before forwarding.
pub const TARGET_URL_HEADER: &str = "x-redfish-url";

/// Shared state of the BMC proxy: compiled path allow-list, the IP→URL
/// target map, and one upstream client.
#[derive(Clone)]
pub struct RedfishState {
    allow_list: Arc<Vec<Regex>>,
    targets: Arc<TargetMap>,
    client: Client<HttpsConnector<HttpConnector>, BoxBody>,
}

impl RedfishState {
    pub fn from_config(config: &RedfishProxyConfig) -> Result<Self, LbError> {
        let mut allow_list = Vec::with_capacity(config.allowed_api_resources.len());
        for pattern in &config.allowed_api_resources {
            allow_list.push(Regex::new(pattern).map_err(|e| {
                LbError::Config(format!("invalid allowed resource pattern {pattern:?}: {e}"))
            })?);
        }

        Ok(Self {
            allow_list: Arc::new(allow_list),
            targets: Arc::new(TargetMap::from_entries(&config.targets)?),
            client: crate::backend::server::build_backend_client(config.web.tls_verify),
        })
    }

    pub fn targets(&self) -> &TargetMap {
        &self.targets
    }

    fn path_allowed(&self, path: &str) -> bool {
        self.allow_list.iter().any(|re| re.is_match(path))
    }
}

/// Handle one BMC request: allow-list filter, target resolution, forward.
pub async fn handle_request(
    req: Request<Incoming>,
    state: RedfishState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let path = req.uri().path().to_string();

    if !state.path_allowed(&path) {
        debug!("redfish: path not allowed, path={}, peer={}", path, peer_addr);
        metrics::counter!("lb_redfish_requests_total", "result" => "denied").increment(1);
        return Ok(text_response(
            StatusCode::FORBIDDEN,
            "access to resource not allowed",
        ));
    }

    let candidates = client_ip_candidates(req.headers(), peer_addr.ip());
    let Some(target) = resolve_target(&state, req.headers(), &candidates) else {
        warn!(
            "redfish: no target, peer={}, candidates={:?}",
            peer_addr, candidates
        );
        metrics::counter!("lb_redfish_requests_total", "result" => "no_target").increment(1);
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            "failed to find redfish target",
        ));
    };

    let (mut parts, body) = req.into_parts();

    // The fallback header is proxy-internal and credentials never travel
    // to a device the client did not authenticate against directly.
    parts.headers.remove(TARGET_URL_HEADER);
    parts.headers.remove(AUTHORIZATION);
    remove_hop_headers(&mut parts.headers);

    let upstream_uri = match join_target_uri(&target, &parts.uri) {
        Ok(uri) => uri,
        Err(e) => {
            warn!("redfish: bad upstream uri, target={}, error={}", target, e);
            return Ok(text_response(StatusCode::BAD_GATEWAY, "bad redfish target"));
        }
    };

    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(upstream_uri);
    for (name, value) in &parts.headers {
        builder = builder.header(name, value);
    }
    let upstream_req = builder
        .body(body.boxed())
        .expect("request parts were already valid");

    match state.client.request(upstream_req).await {
        Ok(resp) => {
            metrics::counter!("lb_redfish_requests_total", "result" => "proxied").increment(1);
            let (resp_parts, resp_body) = resp.into_parts();
            let mut builder = Response::builder().status(resp_parts.status);
            for (name, value) in &resp_parts.headers {
                builder = builder.header(name, value);
            }
            Ok(builder.body(resp_body.boxed()).unwrap())
        }
        Err(e) => {
            warn!("redfish: upstream error, target={}, error={}", target, e);
            metrics::counter!("lb_redfish_requests_total", "result" => "upstream_error")
                .increment(1);
            Ok(text_response(StatusCode::BAD_GATEWAY, "bmc unreachable"))
        }
    }
}

/// Candidate client IPs, in trust order: every real-IP header value
/// (comma-splitting multi-entry values), then the TCP peer.
fn client_ip_candidates(headers: &http::HeaderMap, peer_ip: IpAddr) -> Vec<IpAddr> {
    let mut candidates: Vec<IpAddr> = Vec::new();
    for value in headers.get_all(REAL_IP_HEADER) {
        let Ok(value) = value.to_str() else { continue };
        for part in value.split(',') {
            if let Ok(ip) = part.trim().parse::<IpAddr>() {
                if !candidates.contains(&ip) {
                    candidates.push(ip);
                }
            }
        }
    }
    if !candidates.contains(&peer_ip) {
        candidates.push(peer_ip);
    }
    candidates
}

/// Resolution order: mapped candidate IP first; otherwise a valid absolute
/// URL in the fallback header, persisted into the map for the candidates.
fn resolve_target(
    state: &RedfishState,
    headers: &http::HeaderMap,
    candidates: &[IpAddr],
) -> Option<Url> {
    if let Some(target) = state.targets.lookup(candidates) {
        return Some(target);
    }

    let desired = headers.get(TARGET_URL_HEADER)?.to_str().ok()?;
    let url = Url::parse(desired).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }

    state.targets.amend(candidates, &url);
    debug!("redfish: target learned from header, target={}", url);
    Some(url)
}

/// "{scheme}://{host:port}{target_path}{inbound_path_and_query}". The raw
/// inbound path and query are appended verbatim so escaping survives.
fn join_target_uri(target: &Url, inbound: &Uri) -> Result<Uri, LbError> {
    let host = target
        .host_str()
        .ok_or_else(|| LbError::Internal("redfish target has no host".to_string()))?;
    let port = target
        .port_or_known_default()
        .ok_or_else(|| LbError::Internal("redfish target has no port".to_string()))?;
    let base_path = target.path().trim_end_matches('/');
    let path_and_query = inbound
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    format!(
        "{}://{}:{}{}{}",
        target.scheme(),
        host,
        port,
        base_path,
        path_and_query
    )
    .parse::<Uri>()
    .map_err(|e| LbError::Internal(format!("failed to build redfish uri: {}", e)))
}

fn text_response(status: StatusCode, msg: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full_body(msg.to_string()))
        .unwrap()
}

fn remove_hop_headers(headers: &mut http::HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
    headers.remove(HOST);
}
