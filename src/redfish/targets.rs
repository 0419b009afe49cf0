use crate::config::RedfishTargetEntry;
use crate::error::LbError;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use url::Url;

/// Client-IP → BMC URL mapping.
///
/// Read-mostly: every request takes the read lock; amendments from the
/// desired-upstream header take the write lock. The map only grows for the
/// process lifetime.
pub struct TargetMap {
    inner: RwLock<HashMap<IpAddr, Url>>,
}

impl TargetMap {
    pub fn from_entries(entries: &[RedfishTargetEntry]) -> Result<Self, LbError> {
        let mut map = HashMap::new();
        for entry in entries {
            let url = Url::parse(&entry.url).map_err(|e| {
                LbError::Config(format!("malformed redfish target url {:?}: {}", entry.url, e))
            })?;
            for ip in &entry.host_ips {
                let ip: IpAddr = ip
                    .parse()
                    .map_err(|_| LbError::Config(format!("invalid redfish host ip: {}", ip)))?;
                map.insert(ip, url.clone());
            }
        }
        Ok(Self {
            inner: RwLock::new(map),
        })
    }

    /// First candidate with a mapping wins.
    pub fn lookup(&self, candidates: &[IpAddr]) -> Option<Url> {
        let map = self.inner.read().expect("target map lock poisoned");
        candidates.iter().find_map(|ip| map.get(ip).cloned())
    }

    /// Record `url` for every candidate IP so subsequent requests from the
    /// same client resolve without the fallback header.
    pub fn amend(&self, candidates: &[IpAddr], url: &Url) {
        let mut map = self.inner.write().expect("target map lock poisoned");
        for ip in candidates {
            map.insert(*ip, url.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("target map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
