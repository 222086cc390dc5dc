use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use perfflux_adapters::livestatus::Row;
use perfflux_adapters::AdapterError;

use super::{DowntimeCache, SharedDowntimeCache, StatusQuery};
use crate::task::{stopped, TaskHandle};

const QUERY_DOWNTIMES: &str = "GET downtimes\nColumns: id start_time entry_time\nOutputFormat: csv\n";
const QUERY_HOSTS: &str = "GET hosts\nColumns: downtimes name\n\
                           Filter: scheduled_downtime_depth > 0\nOutputFormat: csv\n";
const QUERY_SERVICES: &str = "GET services\nColumns: downtimes host_name description\n\
                              Filter: scheduled_downtime_depth > 0\nOutputFormat: csv\n";

/// Lifecycle of the cache builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Building,
    Ready,
    Stopped,
}

/// Rebuilds the downtime cache on a fixed interval.
#[derive(Debug)]
pub struct DowntimeCacheBuilder {
    status: Arc<dyn StatusQuery>,
    cache: Arc<SharedDowntimeCache>,
    interval: Duration,
}

impl DowntimeCacheBuilder {
    pub fn new(status: Arc<dyn StatusQuery>, interval: Duration) -> Self {
        Self {
            status,
            cache: SharedDowntimeCache::new(),
            interval,
        }
    }

    /// The cache this builder publishes to.
    pub fn cache(&self) -> Arc<SharedDowntimeCache> {
        self.cache.clone()
    }

    /// Per-query read budget.
    fn query_timeout(&self) -> Duration {
        self.interval / 3
    }

    /// Run the three queries concurrently and merge them into a fresh cache.
    ///
    /// A query that fails or runs out of time contributes the rows it
    /// delivered so far.
    pub async fn build_once(&self) -> DowntimeCache {
        let deadline = Instant::now() + self.query_timeout();
        let (downtimes, hosts, services) = tokio::join!(
            collect_rows(self.status.query_stream(QUERY_DOWNTIMES), deadline, "downtimes"),
            collect_rows(self.status.query_stream(QUERY_HOSTS), deadline, "hosts"),
            collect_rows(self.status.query_stream(QUERY_SERVICES), deadline, "services"),
        );

        let starts: HashMap<&str, u64> = downtimes
            .iter()
            .filter_map(|row| {
                let [id, start, entry] = row.as_slice() else {
                    return None;
                };
                let start: u64 = start.trim().parse().ok()?;
                let entry: u64 = entry.trim().parse().ok()?;
                Some((id.trim(), start.max(entry)))
            })
            .collect();

        let mut cache = DowntimeCache::new();
        for row in &hosts {
            if let [ids, host, ..] = row.as_slice() {
                add_entries(&mut cache, &starts, ids, host, "");
            }
        }
        for row in &services {
            if let [ids, host, service, ..] = row.as_slice() {
                add_entries(&mut cache, &starts, ids, host, service);
            }
        }
        cache
    }

    /// Start the rebuild loop.
    pub fn start(self) -> DowntimeHandle {
        let (state_tx, state_rx) = watch::channel(CacheState::Building);
        let cache = self.cache.clone();

        let task = TaskHandle::spawn("downtime-cache", move |mut stop_rx| async move {
            loop {
                state_tx.send_replace(CacheState::Building);
                let started = Instant::now();
                let fresh = self.build_once().await;
                debug!(
                    entries = fresh.len(),
                    elapsed = ?started.elapsed(),
                    "Downtime cache rebuilt"
                );
                self.cache.publish(fresh);
                state_tx.send_replace(CacheState::Ready);

                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    _ = stopped(&mut stop_rx) => break,
                }
            }
            state_tx.send_replace(CacheState::Stopped);
            info!("Downtime cache builder stopped");
        });

        DowntimeHandle {
            task,
            state: state_rx,
            cache,
        }
    }
}

/// Handle of a running cache builder.
#[derive(Debug)]
pub struct DowntimeHandle {
    task: TaskHandle,
    state: watch::Receiver<CacheState>,
    cache: Arc<SharedDowntimeCache>,
}

impl DowntimeHandle {
    pub fn state(&self) -> CacheState {
        *self.state.borrow()
    }

    pub fn cache(&self) -> Arc<SharedDowntimeCache> {
        self.cache.clone()
    }

    /// Wait until the first cache is published. Returns false on timeout.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        tokio::time::timeout(timeout, state.wait_for(|s| *s != CacheState::Building))
            .await
            .map(|r| r.is_ok_and(|s| *s == CacheState::Ready))
            .unwrap_or(false)
    }

    /// Stop the builder after the cycle in progress.
    pub async fn stop(self) {
        self.task.stop().await;
    }
}

fn add_entries(
    cache: &mut DowntimeCache,
    starts: &HashMap<&str, u64>,
    ids: &str,
    host: &str,
    service: &str,
) {
    for id in ids.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        if let Some(start) = starts.get(id) {
            cache.insert(host, service, *start);
        }
    }
}

pub(crate) async fn collect_rows(
    mut rx: mpsc::Receiver<Result<Row, AdapterError>>,
    deadline: Instant,
    what: &str,
) -> Vec<Row> {
    let mut rows = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(Ok(row))) => rows.push(row),
            Ok(Some(Err(e))) => {
                warn!(query = what, error = %e, rows = rows.len(), "Status query failed");
                return rows;
            }
            Ok(None) => return rows,
            Err(_) => {
                warn!(query = what, rows = rows.len(), "Status query timed out, using partial result");
                return rows;
            }
        }
    }
}
