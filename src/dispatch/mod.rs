//! Per-target job queues and the worker pools that drain them.
//!
//! ```text
//!  producers ──▶ Router ──▶ JobQueue (bounded, one per target)
//!                               │
//!                     ┌─────────┼─────────┐
//!                     ▼         ▼         ▼
//!                  Worker    Worker    Worker  ◀── supervisor scales
//!                     │         │         │
//!                     └──── Backend::send ┘──▶ spill file on shutdown
//! ```

mod pool;
mod queue;
mod router;
mod scaling;
mod spill;
mod worker;

pub use pool::TargetPool;
pub use queue::JobQueue;
pub use router::Router;
pub use scaling::{idle_fraction, ScalingDecision, ScalingPolicy};
pub use spill::SpillFile;
pub use worker::{WorkerConfig, WorkerSignal};

use thiserror::Error;

use perfflux_types::DispatchJob;

/// Errors handing a job to a target queue. The job is returned to the
/// caller, which decides whether to retry.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Queue for target '{target}' stayed full")]
    Timeout { target: String, job: DispatchJob },

    #[error("Queue for target '{target}' is closed")]
    Closed { target: String, job: DispatchJob },

    #[error("Dispatch stopped")]
    Stopped,
}

impl DispatchError {
    /// Take back the job that could not be queued.
    pub fn into_job(self) -> Option<DispatchJob> {
        match self {
            DispatchError::Timeout { job, .. } | DispatchError::Closed { job, .. } => Some(job),
            DispatchError::Stopped => None,
        }
    }
}
