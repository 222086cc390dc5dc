use std::time::Duration;

use flume::TrySendError;
use tracing::warn;

use perfflux_types::DispatchJob;

use super::DispatchError;

/// Bounded multi-producer multi-consumer job channel of one target.
#[derive(Debug, Clone)]
pub struct JobQueue {
    target: String,
    capacity: usize,
    tx: flume::Sender<DispatchJob>,
    rx: flume::Receiver<DispatchJob>,
}

impl JobQueue {
    pub fn new(target: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = flume::bounded(capacity);
        Self {
            target: target.into(),
            capacity,
            tx,
            rx,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Fill level between 0 and 1.
    pub fn occupancy(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    /// Consumer side for workers.
    pub fn receiver(&self) -> flume::Receiver<DispatchJob> {
        self.rx.clone()
    }

    /// Queue a job, waiting at most `timeout` for room. On timeout the job
    /// is handed back inside the error.
    pub async fn send_timeout(
        &self,
        job: DispatchJob,
        timeout: Duration,
    ) -> Result<(), DispatchError> {
        let job = match self.tx.try_send(job) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Disconnected(job)) => return Err(self.closed(job)),
            Err(TrySendError::Full(job)) => job,
        };

        // A dropped send future never delivers, so keep a copy to return.
        match tokio::time::timeout(timeout, self.tx.send_async(job.clone())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(flume::SendError(job))) => Err(self.closed(job)),
            Err(_) => {
                warn!(
                    target_name = %self.target,
                    capacity = self.capacity,
                    ?timeout,
                    "Job queue full, send timed out"
                );
                Err(DispatchError::Timeout {
                    target: self.target.clone(),
                    job,
                })
            }
        }
    }

    fn closed(&self, job: DispatchJob) -> DispatchError {
        DispatchError::Closed {
            target: self.target.clone(),
            job,
        }
    }
}
