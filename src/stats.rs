//! Pipeline counters.
//!
//! A [`Stats`] registry is created by the caller and handed to every
//! component that records something; there is no global instance.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

/// Counters for one backend target.
#[derive(Debug, Default)]
pub struct TargetStats {
    pub batches: AtomicU64,
    pub records_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub failures: AtomicU64,
    pub spilled: AtomicU64,
    pub poison: AtomicU64,
    pub workers: AtomicU64,
    /// Microseconds spent in `send` since the last scaling decision.
    send_time_us: AtomicU64,
}

impl TargetStats {
    /// Record one completed send attempt.
    pub fn record_send(&self, elapsed: Duration, records: usize, bytes: usize) {
        self.send_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.records_sent.fetch_add(records as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record time spent in a send that failed.
    pub fn record_failure(&self, elapsed: Duration) {
        self.send_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Return the accumulated send time and reset it to zero.
    pub fn take_send_time(&self) -> Duration {
        Duration::from_micros(self.send_time_us.swap(0, Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> TargetSnapshot {
        TargetSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            records_sent: self.records_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            spilled: self.spilled.load(Ordering::Relaxed),
            poison: self.poison.load(Ordering::Relaxed),
            workers: self.workers.load(Ordering::Relaxed),
        }
    }
}

/// Registry shared by the whole pipeline.
#[derive(Debug, Default)]
pub struct Stats {
    pub records_parsed: AtomicU64,
    pub records_skipped: AtomicU64,
    pub points_emitted: AtomicU64,
    pub files_processed: AtomicU64,
    pub events_collected: AtomicU64,
    targets: RwLock<BTreeMap<String, Arc<TargetStats>>>,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get or create the counters of a target.
    pub fn target(&self, name: &str) -> Arc<TargetStats> {
        // Fast path
        {
            let targets = self.targets.read();
            if let Some(stats) = targets.get(name) {
                return stats.clone();
            }
        }

        // Slow path
        let mut targets = self.targets.write();
        targets
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TargetStats::default()))
            .clone()
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            records_parsed: self.records_parsed.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            points_emitted: self.points_emitted.load(Ordering::Relaxed),
            files_processed: self.files_processed.load(Ordering::Relaxed),
            events_collected: self.events_collected.load(Ordering::Relaxed),
            targets: self
                .targets
                .read()
                .iter()
                .map(|(name, stats)| (name.clone(), stats.snapshot()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetSnapshot {
    pub batches: u64,
    pub records_sent: u64,
    pub bytes_sent: u64,
    pub failures: u64,
    pub spilled: u64,
    pub poison: u64,
    pub workers: u64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub records_parsed: u64,
    pub records_skipped: u64,
    pub points_emitted: u64,
    pub files_processed: u64,
    pub events_collected: u64,
    pub targets: BTreeMap<String, TargetSnapshot>,
}
