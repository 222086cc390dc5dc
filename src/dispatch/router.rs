use std::time::Duration;

use tracing::debug;

use perfflux_types::DispatchJob;

use super::{DispatchError, JobQueue};
use crate::task::{is_stopped, StopSignal};

/// Fans every job out to all target queues.
#[derive(Debug, Clone)]
pub struct Router {
    queues: Vec<JobQueue>,
    send_timeout: Duration,
}

impl Router {
    pub fn new(queues: Vec<JobQueue>, send_timeout: Duration) -> Self {
        Self {
            queues,
            send_timeout,
        }
    }

    /// Queue `job` on every target, retrying full queues until they take
    /// it or `stop` fires.
    ///
    /// Returns `DispatchError::Stopped` when stopped before every target
    /// accepted the job.
    pub async fn dispatch(&self, job: DispatchJob, stop: &StopSignal) -> Result<(), DispatchError> {
        let Some((last, rest)) = self.queues.split_last() else {
            return Ok(());
        };
        for queue in rest {
            self.deliver(queue, job.clone(), stop).await?;
        }
        self.deliver(last, job, stop).await
    }

    /// Queue many jobs in order.
    pub async fn dispatch_all<I>(&self, jobs: I, stop: &StopSignal) -> Result<(), DispatchError>
    where
        I: IntoIterator<Item = DispatchJob>,
    {
        for job in jobs {
            self.dispatch(job, stop).await?;
        }
        Ok(())
    }

    async fn deliver(
        &self,
        queue: &JobQueue,
        mut job: DispatchJob,
        stop: &StopSignal,
    ) -> Result<(), DispatchError> {
        loop {
            if is_stopped(stop) {
                return Err(DispatchError::Stopped);
            }
            match queue.send_timeout(job, self.send_timeout).await {
                Ok(()) => return Ok(()),
                Err(DispatchError::Timeout { job: returned, .. }) => {
                    debug!(target_name = queue.target(), "Retrying job on full queue");
                    job = returned;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
