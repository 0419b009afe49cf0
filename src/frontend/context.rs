use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::time::{Duration, Instant};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Parameters extracted from one request; immutable once built, consumed by
/// the authorisation middleware and the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqParams {
    pub cluster_id: String,
    /// Compute-unit UUIDs named by the query, input order, deduplicated.
    pub uuids: Vec<String>,
    /// Query reference time, seconds since the epoch.
    pub start: u64,
    /// now − start; zero when the request carries no usable time.
    pub query_period: Duration,
}

impl ReqParams {
    /// Minimal params for requests outside the query endpoint families.
    pub fn passthrough(cluster_id: &str) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            uuids: Vec::new(),
            start: unix_now(),
            query_period: Duration::ZERO,
        }
    }
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Error taxonomy for the structured JSON envelope the LB emits on requests
/// it rejects itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Unauthorized,
    Forbidden,
    BadRequest,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::BadRequest => "bad_request",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::BadRequest => StatusCode::BAD_REQUEST,
        }
    }
}

/// Per-request context flowing through the middleware and dispatch phases.
/// Single exit point for error responses so that metrics stay consistent.
pub struct RequestContext {
    pub frontend: &'static str,
    pub method: String,
    pub uri_path: String,
    pub cluster_id: String,
    pub backend_addr: String,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(frontend: &'static str, method: String, uri_path: String) -> Self {
        Self {
            frontend,
            method,
            uri_path,
            cluster_id: String::new(),
            backend_addr: String::new(),
            start: Instant::now(),
        }
    }

    /// Structured JSON error envelope:
    /// `{"status":"error","errorType":...,"error":...}`.
    pub fn api_error(&self, kind: ErrorType, msg: &str) -> hyper::Response<BoxBody> {
        let body = serde_json::json!({
            "status": "error",
            "errorType": kind.as_str(),
            "error": msg,
        });

        self.record_metrics(kind.status().as_u16());

        hyper::Response::builder()
            .status(kind.status())
            .header("content-type", "application/json")
            .body(full_body(body.to_string()))
            .unwrap()
    }

    /// Short text body for proxy-level failures (no live backend, retry
    /// exhausted). These are 5xx pass-through-style errors, not envelope
    /// rejections.
    pub fn proxy_error(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        self.record_metrics(status.as_u16());

        hyper::Response::builder()
            .status(status)
            .header("content-type", "text/plain; charset=utf-8")
            .body(full_body(msg.to_string()))
            .unwrap()
    }

    pub fn finalize_metrics(&self, resp_status: u16) {
        self.record_metrics(resp_status);
    }

    fn record_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "lb_http_requests_total",
            "frontend" => self.frontend,
            "cluster" => self.cluster_id.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "lb_http_request_duration_seconds",
            "frontend" => self.frontend,
            "backend" => self.backend_addr.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}
