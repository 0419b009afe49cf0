use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the `/metrics`
/// endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called **once** at startup.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // request path
        describe_counter!(
            "lb_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed per frontend"
        );
        describe_histogram!(
            "lb_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );
        describe_counter!(
            "lb_retries_total",
            Unit::Count,
            "Backend dispatch failures that triggered a re-selection"
        );
        describe_counter!(
            "lb_auth_denied_total",
            Unit::Count,
            "Requests denied by ownership verification"
        );

        // backend health & retention
        describe_gauge!(
            "lb_backend_health_status",
            Unit::Count,
            "Backend liveness: 1=alive 0=dead"
        );
        describe_counter!(
            "lb_health_check_total",
            Unit::Count,
            "Total liveness probe attempts"
        );
        describe_gauge!(
            "lb_backend_retention_seconds",
            Unit::Seconds,
            "Advertised retention window per backend"
        );

        // connections
        describe_gauge!(
            "lb_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "lb_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        // redfish proxy
        describe_counter!(
            "lb_redfish_requests_total",
            Unit::Count,
            "Redfish proxy requests by outcome"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
