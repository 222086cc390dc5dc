use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use perfflux_adapters::{AdapterError, Backend};
use perfflux_types::DispatchJob;

use super::SpillFile;
use crate::stats::TargetStats;

const BACKOFF_START: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(10);
const LIVENESS_POLL: Duration = Duration::from_secs(1);

/// What the supervisor wants a worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    Running,
    /// Flush the current batch and exit. The queue is left to the others.
    Retire,
    /// Stop retrying, drain the queue, send or spill everything and exit.
    Shutdown,
}

/// Batching settings of the workers of one target.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub stop_reading_if_down: bool,
    /// Per-item wait when draining the queue at shutdown.
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_millis(200),
            stop_reading_if_down: true,
            drain_timeout: Duration::from_millis(200),
        }
    }
}

/// Everything the workers of one target share.
#[derive(Debug, Clone)]
pub(crate) struct WorkerShared {
    pub backend: Arc<dyn Backend>,
    pub jobs: flume::Receiver<DispatchJob>,
    pub config: WorkerConfig,
    pub spill: Arc<SpillFile>,
    pub stats: Arc<TargetStats>,
    pub alive: Arc<AtomicBool>,
}

/// Supervisor side of a running worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    id: usize,
    signal: watch::Sender<WorkerSignal>,
    done: oneshot::Receiver<()>,
}

impl WorkerHandle {
    pub fn spawn(id: usize, shared: WorkerShared) -> Self {
        let (signal_tx, signal_rx) = watch::channel(WorkerSignal::Running);
        let (done_tx, done_rx) = oneshot::channel();

        let worker = Worker {
            id,
            shared,
            signal: signal_rx,
            batch: Vec::new(),
        };
        tokio::spawn(async move {
            worker.run().await;
            let _ = done_tx.send(());
        });

        Self {
            id,
            signal: signal_tx,
            done: done_rx,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn signal(&self, signal: WorkerSignal) {
        let _ = self.signal.send(signal);
    }

    /// Wait for the worker's acknowledgement.
    pub async fn finished(self) {
        if self.done.await.is_err() {
            error!(worker = self.id, "Worker ended without acknowledging");
        }
    }
}

enum Attempt {
    Sent,
    Rejected(AdapterError),
    Interrupted,
}

struct Worker {
    id: usize,
    shared: WorkerShared,
    signal: watch::Receiver<WorkerSignal>,
    batch: Vec<String>,
}

impl Worker {
    async fn run(mut self) {
        let target = self.shared.backend.name().to_string();
        debug!(target_name = %target, worker = self.id, "Worker started");
        let mut last_flush = Instant::now();

        loop {
            let signal = *self.signal.borrow_and_update();
            match signal {
                WorkerSignal::Shutdown => {
                    self.shutdown().await;
                    break;
                }
                WorkerSignal::Retire => {
                    self.flush().await;
                    self.release().await;
                    break;
                }
                WorkerSignal::Running => {}
            }

            if self.shared.config.stop_reading_if_down && !self.is_alive() {
                self.wait_until_alive().await;
                continue;
            }

            let deadline = last_flush + self.shared.config.flush_interval;
            tokio::select! {
                changed = self.signal.changed() => {
                    if changed.is_err() {
                        self.shutdown().await;
                        break;
                    }
                }
                job = self.shared.jobs.recv_async() => match job {
                    Ok(job) => {
                        self.push(&job);
                        if self.batch.len() >= self.shared.config.batch_size {
                            self.flush().await;
                            last_flush = Instant::now();
                        }
                    }
                    Err(_) => {
                        self.shutdown().await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    self.flush().await;
                    last_flush = Instant::now();
                }
            }
        }

        debug!(target_name = %target, worker = self.id, "Worker stopped");
    }

    fn push(&mut self, job: &DispatchJob) {
        if let Some(record) = self.shared.backend.render(job) {
            self.batch.push(record);
        }
    }

    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Relaxed)
    }

    fn shutting_down(&self) -> bool {
        *self.signal.borrow() == WorkerSignal::Shutdown
    }

    /// A retiring worker gets one try per batch.
    fn retiring(&self) -> bool {
        *self.signal.borrow() == WorkerSignal::Retire
    }

    /// Send the batch, retrying until it is accepted. A shutdown during the
    /// retries leaves the unsent records in the batch.
    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let records = std::mem::take(&mut self.batch);
        if let Err(unsent) = self.deliver(records).await {
            self.batch = unsent;
        }
    }

    async fn deliver(&mut self, records: Vec<String>) -> Result<(), Vec<String>> {
        let payload = records.concat();
        match self.attempt(&payload, records.len()).await {
            Attempt::Sent => Ok(()),
            Attempt::Interrupted => Err(records),
            Attempt::Rejected(e) => {
                warn!(
                    target_name = self.shared.backend.name(),
                    records = records.len(),
                    error = %e,
                    "Backend rejected batch, resending records one by one"
                );
                self.isolate(records, e).await
            }
        }
    }

    /// Resend records individually so only the refused ones are dumped.
    async fn isolate(
        &mut self,
        records: Vec<String>,
        batch_error: AdapterError,
    ) -> Result<(), Vec<String>> {
        let singles: Vec<String> = records
            .iter()
            .flat_map(|r| self.shared.backend.split_records(r))
            .collect();

        if singles.len() == 1 {
            self.poison(&singles, &batch_error).await;
            return Ok(());
        }

        let mut pending = singles.into_iter();
        while let Some(record) = pending.next() {
            match self.attempt(&record, 1).await {
                Attempt::Sent => {}
                Attempt::Rejected(e) => self.poison(std::slice::from_ref(&record), &e).await,
                Attempt::Interrupted => {
                    let mut rest = vec![record];
                    rest.extend(pending);
                    return Err(rest);
                }
            }
        }
        Ok(())
    }

    async fn poison(&self, records: &[String], error: &AdapterError) {
        let name = self.shared.backend.name();
        warn!(target_name = name, records = records.len(), error = %error, "Dropping refused records");
        self.shared
            .stats
            .poison
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        self.shared
            .spill
            .dump_errors(name, &error.to_string(), records)
            .await;
    }

    /// Send one payload, retrying transient failures with backoff and a
    /// liveness check before each retry.
    async fn attempt(&mut self, payload: &str, records: usize) -> Attempt {
        let mut backoff = BACKOFF_START;
        loop {
            if self.shutting_down() {
                return Attempt::Interrupted;
            }

            if !self.is_alive() {
                if self.shared.backend.is_alive().await {
                    self.mark_alive(true);
                } else {
                    if self.retiring() || !self.pause(backoff).await {
                        return Attempt::Interrupted;
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                    continue;
                }
            }

            let started = Instant::now();
            let result = self.shared.backend.send(payload.to_string()).await;
            let elapsed = started.elapsed();

            match result {
                Ok(()) => {
                    self.shared
                        .stats
                        .record_send(elapsed, records, payload.len());
                    return Attempt::Sent;
                }
                Err(e) if e.is_rejected() => {
                    self.shared.stats.record_failure(elapsed);
                    return Attempt::Rejected(e);
                }
                Err(e) => {
                    self.shared.stats.record_failure(elapsed);
                    warn!(
                        target_name = self.shared.backend.name(),
                        worker = self.id,
                        error = %e,
                        retry_in = ?backoff,
                        "Send failed"
                    );
                    if e.is_backend_down() {
                        self.mark_alive(false);
                    }
                    if self.retiring() || !self.pause(backoff).await {
                        return Attempt::Interrupted;
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }
    }

    fn mark_alive(&self, alive: bool) {
        let was = self.shared.alive.swap(alive, Ordering::Relaxed);
        if was != alive {
            let name = self.shared.backend.name();
            if alive {
                info!(target_name = name, "Backend is reachable again");
            } else {
                warn!(target_name = name, "Backend marked down");
            }
        }
    }

    /// Sleep, returning false early if shutdown is requested.
    async fn pause(&mut self, duration: Duration) -> bool {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                changed = self.signal.changed() => {
                    if changed.is_err() || self.shutting_down() {
                        return false;
                    }
                }
            }
        }
    }

    /// Poll liveness once a second until the backend answers or the
    /// supervisor signals.
    async fn wait_until_alive(&mut self) {
        loop {
            if self.shared.backend.is_alive().await {
                self.mark_alive(true);
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(LIVENESS_POLL) => {}
                _ = self.signal.changed() => return,
            }
        }
    }

    /// Drain what is left in the queue, then release the batch.
    async fn shutdown(&mut self) {
        let drain_timeout = self.shared.config.drain_timeout;
        while let Ok(Ok(job)) =
            tokio::time::timeout(drain_timeout, self.shared.jobs.recv_async()).await
        {
            self.push(&job);
        }
        self.release().await;
    }

    /// Try one final send of the batch and spill it if that fails.
    async fn release(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let records = std::mem::take(&mut self.batch);
        let name = self.shared.backend.name().to_string();
        if self.is_alive() {
            let payload = records.concat();
            let started = Instant::now();
            match self.shared.backend.send(payload.clone()).await {
                Ok(()) => {
                    self.shared
                        .stats
                        .record_send(started.elapsed(), records.len(), payload.len());
                    return;
                }
                Err(e) => warn!(target_name = %name, error = %e, "Final send failed"),
            }
        }

        match self.shared.spill.append(&records).await {
            Ok(written) => {
                self.shared
                    .stats
                    .spilled
                    .fetch_add(written as u64, Ordering::Relaxed);
                info!(
                    target_name = %name,
                    records = written,
                    path = %self.shared.spill.path().display(),
                    "Spilled undelivered records"
                );
            }
            Err(e) => error!(
                target_name = %name,
                records = records.len(),
                error = %e,
                "Could not write spill file, records lost"
            ),
        }
    }
}
