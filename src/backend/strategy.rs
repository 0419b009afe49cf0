use crate::backend::pool::BackendGroup;
use crate::backend::server::Backend;
use crate::error::LbError;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Backend selection strategy, fixed per manager at construction.
/// Enum-based: no trait objects, no dynamic dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    LeastConnection,
    /// Fit the query to the "hottest" backend whose retention window still
    /// covers the query's age.
    ResourceBased,
}

impl FromStr for Strategy {
    type Err = LbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(Self::RoundRobin),
            "least-connection" => Ok(Self::LeastConnection),
            "resource-based" => Ok(Self::ResourceBased),
            other => Err(LbError::Config(format!(
                "unknown strategy {:?}, expected round-robin, least-connection or resource-based",
                other
            ))),
        }
    }
}

impl Strategy {
    /// Select a live backend from the group, or `None` when nothing can
    /// answer. Dead backends are never returned.
    pub fn select(&self, group: &BackendGroup, query_period: Duration) -> Option<Arc<Backend>> {
        match self {
            Self::RoundRobin => round_robin(group),
            Self::LeastConnection => least_connection(group),
            Self::ResourceBased => resource_based(group, query_period),
        }
    }
}

/// Advance the per-group cursor and return the next live backend.
fn round_robin(group: &BackendGroup) -> Option<Arc<Backend>> {
    let backends = group.backends();
    let n = backends.len();
    if n == 0 {
        return None;
    }
    let start = group.cursor().fetch_add(1, Ordering::Relaxed);
    for i in 0..n {
        let backend = &backends[start.wrapping_add(i) % n];
        if backend.is_alive() {
            return Some(backend.clone());
        }
    }
    None
}

/// Minimum active-connection count among live backends; ties broken by
/// insertion order.
fn least_connection(group: &BackendGroup) -> Option<Arc<Backend>> {
    group
        .backends()
        .iter()
        .filter(|b| b.is_alive())
        .min_by_key(|b| b.active_connections())
        .cloned()
}

/// Among live backends whose retention covers `query_period`, prefer the
/// smallest satisfying retention. A retention of 0 means "unknown" and
/// matches any age, but loses to any backend with a known, satisfying
/// retention. Remaining ties go to least-connection, then insertion order.
fn resource_based(group: &BackendGroup, query_period: Duration) -> Option<Arc<Backend>> {
    group
        .backends()
        .iter()
        .enumerate()
        .filter(|(_, b)| b.is_alive())
        .filter(|(_, b)| {
            let retention = b.retention();
            retention.is_zero() || retention >= query_period
        })
        .min_by_key(|(idx, b)| {
            let retention = b.retention();
            let rank = if retention.is_zero() {
                (1u8, u64::MAX)
            } else {
                (0u8, retention.as_secs())
            };
            (rank, b.active_connections(), *idx)
        })
        .map(|(_, b)| b.clone())
}
