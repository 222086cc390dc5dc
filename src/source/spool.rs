//! Spool directory collector.
//!
//! The monitoring core writes perfdata files into a spool directory. A
//! watcher lists the directory on an interval and queues files that have
//! not been touched for `min_file_age`; a set of workers parses each file
//! and deletes it once every point was queued.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{Ingest, SourceHandle};
use crate::config::MainConfig;
use crate::dispatch::DispatchError;
use crate::stats::Stats;
use crate::task::{stopped, StopSignal, TaskHandle};

type InFlight = Arc<Mutex<HashSet<PathBuf>>>;

/// Watches a spool directory.
#[derive(Debug, Clone)]
pub struct SpoolSource {
    dir: PathBuf,
    workers: usize,
    min_file_age: Duration,
    scan_interval: Duration,
}

impl SpoolSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            workers: 1,
            min_file_age: Duration::from_secs(10),
            scan_interval: Duration::from_secs(5),
        }
    }

    /// Settings from `[main]`. `None` when no spool directory is set.
    pub fn from_config(config: &MainConfig) -> Option<Self> {
        let dir = config.spool_dir.as_ref()?;
        Some(
            Self::new(dir)
                .workers(config.spool_workers)
                .min_file_age(config.min_file_age)
                .scan_interval(config.scan_interval),
        )
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn min_file_age(mut self, age: Duration) -> Self {
        self.min_file_age = age;
        self
    }

    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start the watcher and the workers.
    pub fn start(self, ingest: Ingest) -> SourceHandle {
        let (file_tx, file_rx) = flume::unbounded::<PathBuf>();
        let in_flight: InFlight = Arc::new(Mutex::new(HashSet::new()));
        let mut tasks = Vec::with_capacity(self.workers + 1);

        let watcher = {
            let source = self.clone();
            let in_flight = in_flight.clone();
            TaskHandle::spawn("spool-watcher", move |mut stop_rx| async move {
                loop {
                    for path in source.ready_files(&in_flight).await {
                        if file_tx.send_async(path).await.is_err() {
                            return;
                        }
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(source.scan_interval) => {}
                        _ = stopped(&mut stop_rx) => return,
                    }
                }
            })
        };
        tasks.push(watcher);

        for id in 0..self.workers {
            let files = file_rx.clone();
            let ingest = ingest.clone();
            let in_flight = in_flight.clone();
            tasks.push(TaskHandle::spawn(
                format!("spool-worker-{}", id),
                move |mut stop_rx| async move {
                    loop {
                        let path = tokio::select! {
                            path = files.recv_async() => match path {
                                Ok(path) => path,
                                Err(_) => return,
                            },
                            _ = stopped(&mut stop_rx) => return,
                        };
                        process_file(&path, &ingest, &stop_rx).await;
                        in_flight.lock().remove(&path);
                    }
                },
            ));
        }

        info!(
            dir = %self.dir.display(),
            workers = self.workers,
            "Spool collector started"
        );
        SourceHandle::new(format!("spool: {}", self.dir.display()), tasks)
    }

    /// Files old enough to process that no worker holds yet. Marks them
    /// as in flight.
    async fn ready_files(&self, in_flight: &InFlight) -> Vec<PathBuf> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Could not list spool directory");
                return Vec::new();
            }
        };

        let now = SystemTime::now();
        let mut ready = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(dir = %self.dir.display(), error = %e, "Spool listing interrupted");
                    break;
                }
            };
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let old_enough = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age >= self.min_file_age);
            if !old_enough {
                continue;
            }

            let path = entry.path();
            if in_flight.lock().insert(path.clone()) {
                ready.push(path);
            }
        }
        ready.sort();
        ready
    }
}

async fn process_file(path: &Path, ingest: &Ingest, stop: &StopSignal) {
    let content = match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read spool file");
            return;
        }
    };

    match ingest.lines(&content, stop).await {
        Ok(points) => {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), error = %e, "Could not delete spool file");
            }
            Stats::add(&ingest.stats().files_processed, 1);
            debug!(path = %path.display(), points, "Spool file processed");
        }
        Err(DispatchError::Stopped) => {
            info!(path = %path.display(), "Shutdown while processing, keeping spool file");
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Spool file not fully queued, keeping it");
        }
    }
}
