use std::time::Duration;

use thiserror::Error;

use crate::job::JobId;
use crate::runtime::{PoolState, WorkerId};

/// Terminal failure of a submitted job, or refusal to accept one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool is shutting down or stopped and accepts no new jobs.
    #[error("worker pool is {state} and not accepting jobs")]
    Unavailable { state: PoolState },

    /// The job was queued or still running when the pool shut down.
    #[error("job {job_id} was cancelled by pool shutdown")]
    ShutDown { job_id: JobId },

    /// The job exceeded its deadline and its worker was terminated.
    #[error("job {job_id} timed out after {}ms", .timeout.as_millis())]
    Timeout { job_id: JobId, timeout: Duration },

    /// The job's worker kept crashing until the retry ceiling was hit.
    #[error(
        "job {job_id} abandoned after worker {worker_id} crashed \
         ({attempts} attempts): {reason}"
    )]
    WorkerCrashed {
        job_id: JobId,
        worker_id: WorkerId,
        attempts: u32,
        reason: String,
    },

    /// The worker ran the job and reported failure.
    #[error("job {job_id} failed: {message}")]
    Execution { job_id: JobId, message: String },
}

impl PoolError {
    /// The job this error belongs to, if it was ever accepted.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            PoolError::Unavailable { .. } => None,
            PoolError::ShutDown { job_id }
            | PoolError::Timeout { job_id, .. }
            | PoolError::WorkerCrashed { job_id, .. }
            | PoolError::Execution { job_id, .. } => Some(*job_id),
        }
    }

    /// True for errors caused by the pool leaving the running state.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            PoolError::Unavailable { .. } | PoolError::ShutDown { .. }
        )
    }

    /// True when resubmitting the same job to a running pool may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::Timeout { .. } | PoolError::WorkerCrashed { .. }
        )
    }

    /// Short label used for log fields and metric labels.
    pub fn status(&self) -> &'static str {
        match self {
            PoolError::Unavailable { .. } => "unavailable",
            PoolError::ShutDown { .. } => "shutdown",
            PoolError::Timeout { .. } => "timeout",
            PoolError::WorkerCrashed { .. } => "crashed",
            PoolError::Execution { .. } => "failed",
        }
    }
}
