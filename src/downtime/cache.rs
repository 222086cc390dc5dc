use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::DowntimeLookup;

/// Host → service → downtime start (seconds). The empty service stands for
/// the host itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DowntimeCache {
    hosts: HashMap<String, HashMap<String, u64>>,
}

impl DowntimeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a downtime. With several downtimes for the same entry the
    /// earliest start is kept.
    pub fn insert(&mut self, host: &str, service: &str, start_secs: u64) {
        let services = self.hosts.entry(host.to_string()).or_default();
        services
            .entry(service.to_string())
            .and_modify(|t| *t = (*t).min(start_secs))
            .or_insert(start_secs);
    }

    pub fn get(&self, host: &str, service: &str) -> Option<u64> {
        self.hosts.get(host)?.get(service).copied()
    }

    /// Number of (host, service) entries.
    pub fn len(&self) -> usize {
        self.hosts.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl DowntimeLookup for DowntimeCache {
    fn in_downtime(&self, host: &str, service: &str, time_secs: u64) -> bool {
        self.get(host, service)
            .is_some_and(|start| start <= time_secs)
    }
}

/// The currently published cache.
///
/// Builders replace the whole cache; a published cache is never modified.
#[derive(Debug, Default)]
pub struct SharedDowntimeCache {
    current: Mutex<Arc<DowntimeCache>>,
}

impl SharedDowntimeCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the published cache.
    pub fn publish(&self, cache: DowntimeCache) {
        *self.current.lock() = Arc::new(cache);
    }

    /// The cache published last.
    pub fn current(&self) -> Arc<DowntimeCache> {
        self.current.lock().clone()
    }
}

impl DowntimeLookup for SharedDowntimeCache {
    fn in_downtime(&self, host: &str, service: &str, time_secs: u64) -> bool {
        self.current().in_downtime(host, service, time_secs)
    }
}
