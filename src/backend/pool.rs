use crate::backend::server::Backend;
use crate::backend::strategy::Strategy;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

/// Insertion-ordered backends of one cluster plus the round-robin cursor.
/// Insertion order matters only for round-robin and tie-breaks.
pub struct BackendGroup {
    backends: Vec<Arc<Backend>>,
    cursor: AtomicUsize,
}

impl Default for BackendGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendGroup {
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn push(&mut self, backend: Arc<Backend>) {
        self.backends.push(backend);
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub(crate) fn cursor(&self) -> &AtomicUsize {
        &self.cursor
    }
}

/// Per-frontend collection of backend groups keyed by cluster id, with the
/// selection strategy fixed at construction. The group set is immutable
/// after startup; all runtime mutation lives inside the backends themselves.
pub struct Manager {
    groups: HashMap<String, BackendGroup>,
    strategy: Strategy,
}

impl Manager {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            groups: HashMap::new(),
            strategy,
        }
    }

    /// Register a backend under a cluster id. Startup-only.
    pub fn add(&mut self, cluster_id: &str, backend: Arc<Backend>) {
        self.groups
            .entry(cluster_id.to_string())
            .or_default()
            .push(backend);
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn has_cluster(&self, cluster_id: &str) -> bool {
        self.groups.contains_key(cluster_id)
    }

    pub fn cluster_ids(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Cluster id → backend group view.
    pub fn groups(&self) -> impl Iterator<Item = (&str, &BackendGroup)> {
        self.groups.iter().map(|(id, g)| (id.as_str(), g))
    }

    /// Every backend of every cluster, for the health monitor.
    pub fn all_backends(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.groups.values().flat_map(|g| g.backends().iter())
    }

    /// The best live backend for (cluster, query age), or `None` when the
    /// cluster is unknown or nothing live can cover the query.
    pub fn target(&self, cluster_id: &str, query_period: Duration) -> Option<Arc<Backend>> {
        let group = self.groups.get(cluster_id)?;
        self.strategy.select(group, query_period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::server::test_backend;

    #[test]
    fn test_target_unknown_cluster() {
        let manager = Manager::new(Strategy::RoundRobin);
        assert!(manager.target("nope", Duration::ZERO).is_none());
    }

    #[test]
    fn test_target_only_own_cluster_backends() {
        let mut manager = Manager::new(Strategy::RoundRobin);
        manager.add("c0", test_backend("http://c0-a:1"));
        manager.add("c1", test_backend("http://c1-a:1"));

        for _ in 0..4 {
            let b = manager.target("c0", Duration::ZERO).unwrap();
            assert_eq!(b.url().host_str(), Some("c0-a"));
        }
    }

    #[test]
    fn test_target_never_returns_dead() {
        let mut manager = Manager::new(Strategy::LeastConnection);
        manager.add("c0", test_backend("http://a:1"));
        manager.add("c0", test_backend("http://b:1"));

        for b in manager.all_backends() {
            b.set_alive(false);
        }
        assert!(manager.target("c0", Duration::ZERO).is_none());
    }

    #[test]
    fn test_all_backends_spans_clusters() {
        let mut manager = Manager::new(Strategy::RoundRobin);
        manager.add("c0", test_backend("http://a:1"));
        manager.add("c1", test_backend("http://b:1"));
        assert_eq!(manager.all_backends().count(), 2);
    }
}
