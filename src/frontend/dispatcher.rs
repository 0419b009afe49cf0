use crate::frontend::context::{full_body, BoxBody, RequestContext};
use crate::frontend::middleware::{self, AuthDecision};
use crate::frontend::FrontendState;
use bytes::Bytes;
use http::header::{CONNECTION, HOST, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Handle one inbound request through the frontend lifecycle:
///
/// 1. health shortcut
/// 2. body buffering (restored for dispatch)
/// 3. trust-header hygiene
/// 4. authorisation middleware
/// 5. backend selection + proxy, single-shot retry on transport failure
/// 6. access log
pub async fn handle_request(
    req: Request<Incoming>,
    state: FrontendState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let (mut parts, body) = req.into_parts();

    let mut ctx = RequestContext::new(
        state.kind.label(),
        parts.method.as_str().to_string(),
        parts.uri.path().to_string(),
    );

    if parts.uri.path() == "/health" {
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap());
    }

    // Buffer the body once: the parser reads it, and a retry replays it.
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(
                "proxy: failed to read request body, frontend={}, error={}",
                ctx.frontend, e
            );
            return Ok(ctx.api_error(
                crate::frontend::context::ErrorType::BadRequest,
                "failed to read request body",
            ));
        }
    };

    middleware::strip_untrusted_headers(&mut parts.headers);

    let params = match middleware::authorize(
        &state,
        &mut ctx,
        &parts.method,
        &parts.uri,
        &mut parts.headers,
        &body_bytes,
    )
    .await
    {
        AuthDecision::Proceed(params) => params,
        AuthDecision::Reject(resp) => return Ok(resp),
    };

    append_forwarded_for(&mut parts.headers, peer_addr);
    remove_hop_headers(&mut parts.headers);

    let upstream_resp = match dispatch(&state, &mut ctx, &parts, &body_bytes, &params).await {
        Ok(resp) => resp,
        Err(resp) => return Ok(resp),
    };

    let resp = build_downstream_response(upstream_resp);
    phase_log(&ctx, resp.status().as_u16(), peer_addr);
    ctx.finalize_metrics(resp.status().as_u16());
    Ok(resp)
}

/// Backend selection and forwarding with the at-most-once retry policy: a
/// transport failure marks the backend dead and re-selects exactly once;
/// the second failure, or no live backend at all, is a 503.
async fn dispatch(
    state: &FrontendState,
    ctx: &mut RequestContext,
    parts: &http::request::Parts,
    body: &Bytes,
    params: &crate::frontend::ReqParams,
) -> Result<Response<Incoming>, Response<BoxBody>> {
    let mut retried = false;
    loop {
        let Some(backend) = state.manager.target(&params.cluster_id, params.query_period) else {
            warn!(
                "proxy: no live backend, frontend={}, cluster={}, query_period={}s",
                ctx.frontend,
                params.cluster_id,
                params.query_period.as_secs()
            );
            return Err(ctx.proxy_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "no available backend to serve the query",
            ));
        };

        ctx.backend_addr.clear();
        ctx.backend_addr.push_str(backend.dial_addr());

        let upstream_req = build_upstream_request(parts, body.clone());
        match backend.serve(upstream_req).await {
            Ok(resp) => return Ok(resp),
            Err(e) => {
                // Dead until the health monitor hears otherwise; the fresh
                // selection below cannot pick it again.
                backend.set_alive(false);
                warn!(
                    "proxy: backend failed, frontend={}, backend={}, retried={}, error={}",
                    ctx.frontend, backend, retried, e
                );
                metrics::counter!(
                    "lb_retries_total",
                    "frontend" => ctx.frontend,
                    "cluster" => params.cluster_id.clone(),
                )
                .increment(1);

                if retried {
                    return Err(ctx.proxy_error(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "backend failed after retry",
                    ));
                }
                retried = true;
            }
        }
    }
}

/// Rebuild the buffered request for one dispatch attempt. The URI keeps the
/// inbound path and query; the selected backend rewrites authority and
/// scheme in `serve`.
fn build_upstream_request(parts: &http::request::Parts, body: Bytes) -> Request<BoxBody> {
    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(parts.uri.clone());
    for (name, value) in &parts.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(full_body(body))
        .expect("request parts were already valid")
}

fn build_downstream_response(upstream_resp: Response<Incoming>) -> Response<BoxBody> {
    let (parts, body) = upstream_resp.into_parts();
    let mut builder = Response::builder().status(parts.status);
    for (name, value) in &parts.headers {
        builder = builder.header(name, value);
    }
    builder.body(body.boxed()).unwrap()
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
    // Host is re-derived by the client from the rewritten URI.
    headers.remove(HOST);
}

/// Append the TCP peer IP to X-Forwarded-For (comma-separated, RFC 7239
/// semantics) so backends can identify the original client.
fn append_forwarded_for(headers: &mut http::HeaderMap, peer_addr: SocketAddr) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");

    let peer_ip = peer_addr.ip().to_string();
    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let mut combined = String::with_capacity(existing.len() + 2 + peer_ip.len());
        combined.push_str(existing);
        combined.push_str(", ");
        combined.push_str(&peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }
}

fn phase_log(ctx: &RequestContext, resp_status: u16, peer_addr: SocketAddr) {
    let total_ms = ctx.start.elapsed().as_millis();
    debug!(
        "proxy: served, frontend={}, cluster={}, backend={}",
        ctx.frontend, ctx.cluster_id, ctx.backend_addr
    );
    tracing::info!(
        client = %peer_addr.ip(),
        method = %ctx.method,
        path = %ctx.uri_path,
        status = resp_status,
        frontend = %ctx.frontend,
        cluster = %ctx.cluster_id,
        backend = %ctx.backend_addr,
        latency_ms = %total_ms,
        "access"
    );
}
