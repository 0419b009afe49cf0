pub mod context;
pub mod dispatcher;
pub mod middleware;
pub mod parser;
pub mod profiling;

pub use context::{BoxBody, ReqParams};
pub use dispatcher::handle_request;

use crate::backend::Manager;
use crate::ceems::Verifier;
use self::parser::QueryParsers;
use std::sync::Arc;

/// User identity header set by the upstream dashboard gateway.
pub const GRAFANA_USER_HEADER: &str = "x-grafana-user";

/// Cluster the query targets.
pub const CLUSTER_ID_HEADER: &str = "x-ceems-cluster-id";

/// Trust headers owned by the LB. Client-supplied values are stripped on
/// every request before dispatch.
pub const LOGGED_USER_HEADER: &str = "x-logged-user";
pub const ADMIN_USER_HEADER: &str = "x-admin-user";

/// The two frontends share everything except request parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendKind {
    Tsdb,
    Pyroscope,
}

impl FrontendKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tsdb => "tsdb",
            Self::Pyroscope => "pyroscope",
        }
    }
}

/// Shared per-frontend state, cheaply cloneable into connection tasks.
#[derive(Clone)]
pub struct FrontendState {
    pub kind: FrontendKind,
    pub manager: Arc<Manager>,
    pub verifier: Arc<Verifier>,
    pub parsers: Arc<QueryParsers>,
}

impl FrontendState {
    pub fn new(kind: FrontendKind, manager: Arc<Manager>, verifier: Arc<Verifier>) -> Self {
        Self {
            kind,
            manager,
            verifier,
            parsers: Arc::new(QueryParsers::new()),
        }
    }
}
