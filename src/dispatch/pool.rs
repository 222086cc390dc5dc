use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use perfflux_adapters::Backend;
use perfflux_types::DispatchJob;

use super::scaling::{idle_fraction, ScalingDecision, ScalingPolicy};
use super::worker::{WorkerHandle, WorkerShared, WorkerSignal};
use super::{JobQueue, SpillFile, WorkerConfig};
use crate::config::PoolSettings;
use crate::stats::{Stats, TargetStats};
use crate::task::{stopped, StopSignal, TaskHandle};

const STARTUP_POLL: Duration = Duration::from_millis(500);

/// Queue, workers and supervisor of one backend target.
#[derive(Debug)]
pub struct TargetPool {
    name: String,
    queue: JobQueue,
    supervisor: TaskHandle,
}

impl TargetPool {
    /// Bring a target up.
    ///
    /// Waits up to `startup_wait` for the backend, prepares it, queues the
    /// spill file of a previous run as a single raw job, then starts
    /// `min_workers` workers and the scaling supervisor.
    pub async fn start(
        backend: Arc<dyn Backend>,
        settings: &PoolSettings,
        queue_capacity: usize,
        dump_file: &Path,
        stats: &Stats,
    ) -> Self {
        let name = backend.name().to_string();
        let queue = JobQueue::new(name.clone(), queue_capacity);
        let spill = Arc::new(SpillFile::new(dump_file, backend.kind(), &name));
        let target_stats = stats.target(&name);

        let alive = wait_alive(backend.as_ref(), settings.startup_wait).await;
        if alive {
            if let Err(e) = backend.prepare().await {
                warn!(target_name = %name, error = %e, "Backend preparation failed");
            }
        } else {
            warn!(
                target_name = %name,
                waited = ?settings.startup_wait,
                "Backend not reachable at startup"
            );
        }

        replay(&spill, &queue).await;

        let policy = ScalingPolicy::new(settings.min_workers, settings.max_workers);
        let shared = WorkerShared {
            backend,
            jobs: queue.receiver(),
            config: WorkerConfig {
                batch_size: settings.batch_size.max(1),
                flush_interval: settings.flush_interval,
                stop_reading_if_down: settings.stop_reading_if_down,
                ..WorkerConfig::default()
            },
            spill,
            stats: target_stats.clone(),
            alive: Arc::new(AtomicBool::new(alive)),
        };

        let mut supervisor = Supervisor {
            name: name.clone(),
            shared,
            queue: queue.clone(),
            policy,
            stats: target_stats,
            workers: Vec::new(),
            next_id: 0,
        };
        for _ in 0..policy.min_workers() {
            supervisor.add_worker();
        }

        let interval = settings.scaling_interval;
        let supervisor = TaskHandle::spawn(format!("pool-{}", name), move |stop_rx| {
            supervisor.run(interval, stop_rx)
        });

        info!(
            target_name = %name,
            workers = policy.min_workers(),
            max_workers = policy.max_workers(),
            "Target pool started"
        );

        Self {
            name,
            queue,
            supervisor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Producer side of the target queue.
    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    /// Shut every worker down and wait until each has sent or spilled
    /// its records.
    pub async fn stop(self) {
        self.supervisor.stop().await;
        info!(target_name = %self.name, "Target pool stopped");
    }
}

async fn wait_alive(backend: &dyn Backend, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if backend.is_alive().await {
            return true;
        }
        if Instant::now() + STARTUP_POLL > deadline {
            return false;
        }
        tokio::time::sleep(STARTUP_POLL).await;
    }
}

async fn replay(spill: &SpillFile, queue: &JobQueue) {
    match spill.take().await {
        Ok(Some(payload)) => {
            let job = DispatchJob::Raw(payload);
            if let Err(e) = queue.send_timeout(job, Duration::from_secs(1)).await {
                // Put it back for the next run.
                if let Some(DispatchJob::Raw(payload)) = e.into_job() {
                    if let Err(e) = spill.append(&[payload]).await {
                        warn!(path = %spill.path().display(), error = %e, "Could not restore spill file");
                    }
                }
            }
        }
        Ok(None) => {}
        Err(e) => warn!(path = %spill.path().display(), error = %e, "Could not read spill file"),
    }
}

/// Sole owner of a target's worker handles.
struct Supervisor {
    name: String,
    shared: WorkerShared,
    queue: JobQueue,
    policy: ScalingPolicy,
    stats: Arc<TargetStats>,
    workers: Vec<WorkerHandle>,
    next_id: usize,
}

impl Supervisor {
    async fn run(mut self, interval: Duration, mut stop_rx: StopSignal) {
        let mut last_check = Instant::now();
        // Discard send time accumulated before the first interval.
        self.stats.take_send_time();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let elapsed = last_check.elapsed();
                    last_check = Instant::now();
                    self.rebalance(elapsed).await;
                }
                _ = stopped(&mut stop_rx) => break,
            }
        }

        self.shutdown().await;
    }

    fn add_worker(&mut self) {
        let handle = WorkerHandle::spawn(self.next_id, self.shared.clone());
        self.next_id += 1;
        self.workers.push(handle);
        self.publish_count();
    }

    async fn retire_worker(&mut self) {
        if let Some(handle) = self.workers.pop() {
            let id = handle.id();
            handle.signal(WorkerSignal::Retire);
            handle.finished().await;
            debug!(target_name = %self.name, worker = id, "Worker retired");
        }
        self.publish_count();
    }

    async fn rebalance(&mut self, elapsed: Duration) {
        let workers = self.workers.len();
        let idle = idle_fraction(self.stats.take_send_time(), elapsed, workers);
        let occupancy = self.queue.occupancy();

        match self.policy.decide(workers, idle, occupancy) {
            ScalingDecision::Grow => {
                info!(target_name = %self.name, workers = workers + 1, idle, occupancy, "Adding worker");
                self.add_worker();
            }
            ScalingDecision::Shrink => {
                info!(target_name = %self.name, workers = workers - 1, idle, occupancy, "Removing worker");
                self.retire_worker().await;
            }
            ScalingDecision::Hold => {}
        }
    }

    async fn shutdown(&mut self) {
        for handle in &self.workers {
            handle.signal(WorkerSignal::Shutdown);
        }
        for handle in self.workers.drain(..) {
            handle.finished().await;
        }
        self.publish_count();
    }

    fn publish_count(&self) {
        self.stats
            .workers
            .store(self.workers.len() as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeBackend;
    use tempfile::TempDir;

    fn settings() -> PoolSettings {
        PoolSettings {
            min_workers: 1,
            max_workers: 3,
            batch_size: 10,
            scaling_interval: Duration::from_secs(1),
            startup_wait: Duration::from_secs(2),
            ..PoolSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn replays_spill_before_traffic() {
        let dir = TempDir::new().unwrap();
        let dump = dir.path().join("dump");
        std::fs::write(dir.path().join("dump-fake-t"), "old 1\nold 2\n").unwrap();

        let backend = FakeBackend::new("t");
        let stats = Stats::default();
        let pool = TargetPool::start(backend.clone(), &settings(), 16, &dump, &stats).await;
        assert!(backend.was_prepared());
        assert!(!dir.path().join("dump-fake-t").exists());

        backend.wait_for_payloads(1).await;
        assert_eq!(backend.payloads()[0], "old 1\nold 2\n");

        pool.stop().await;
        assert_eq!(stats.target("t").snapshot().workers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_spills_when_backend_down() {
        let dir = TempDir::new().unwrap();
        let dump = dir.path().join("dump");

        let backend = FakeBackend::new("t");
        backend.set_alive(false);
        let stats = Stats::default();
        let pool = TargetPool::start(backend.clone(), &settings(), 16, &dump, &stats).await;
        assert!(!backend.was_prepared());

        let queue = pool.queue();
        for r in ["a 1", "b 2"] {
            queue
                .send_timeout(DispatchJob::Raw(r.into()), Duration::from_secs(1))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        pool.stop().await;

        let spilled = std::fs::read_to_string(dir.path().join("dump-fake-t")).unwrap();
        assert_eq!(spilled, "a 1\nb 2\n");
        assert_eq!(stats.target("t").snapshot().spilled, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_pool_never_drops_below_minimum() {
        let dir = TempDir::new().unwrap();
        let backend = FakeBackend::new("t");
        let stats = Stats::default();
        let mut s = settings();
        s.min_workers = 2;
        let pool =
            TargetPool::start(backend, &s, 16, &dir.path().join("dump"), &stats).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(stats.target("t").snapshot().workers, 2);
        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_grows_and_shrinks() {
        let dir = TempDir::new().unwrap();
        let backend = FakeBackend::new("t");
        let stats = Stats::default();
        let target_stats = stats.target("t");
        let queue = JobQueue::new("t", 10);
        let shared = WorkerShared {
            backend: backend.clone(),
            jobs: queue.receiver(),
            config: WorkerConfig::default(),
            spill: Arc::new(SpillFile::new(&dir.path().join("dump"), "fake", "t")),
            stats: target_stats.clone(),
            alive: Arc::new(AtomicBool::new(false)),
        };
        let mut supervisor = Supervisor {
            name: "t".into(),
            shared,
            queue: queue.clone(),
            policy: ScalingPolicy::new(1, 2),
            stats: target_stats.clone(),
            workers: Vec::new(),
            next_id: 0,
        };
        supervisor.add_worker();

        // Busy workers and a nearly full queue.
        for i in 0..9 {
            queue
                .send_timeout(DispatchJob::Raw(i.to_string()), Duration::ZERO)
                .await
                .unwrap();
        }
        target_stats.record_send(Duration::from_secs(1), 1, 1);
        supervisor.rebalance(Duration::from_secs(1)).await;
        assert_eq!(supervisor.workers.len(), 2);

        // At the maximum.
        target_stats.record_send(Duration::from_secs(2), 1, 1);
        supervisor.rebalance(Duration::from_secs(1)).await;
        assert_eq!(supervisor.workers.len(), 2);

        // Idle.
        supervisor.rebalance(Duration::from_secs(1)).await;
        assert_eq!(supervisor.workers.len(), 1);
        supervisor.rebalance(Duration::from_secs(1)).await;
        assert_eq!(supervisor.workers.len(), 1);
        assert_eq!(target_stats.snapshot().workers, 1);

        supervisor.shutdown().await;
        assert!(supervisor.workers.is_empty());
    }
}
