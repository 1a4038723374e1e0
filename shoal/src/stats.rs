use serde::Serialize;

use crate::runtime::PoolState;

/// Point-in-time snapshot returned by
/// [`WorkerPool::stats`](crate::WorkerPool::stats).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub state: PoolState,
    /// Configured number of workers.
    pub pool_size: usize,
    /// Live workers without a job.
    pub available_workers: usize,
    /// Workers holding a job, including ones being terminated.
    pub busy_workers: usize,
    /// Jobs accepted but not yet resolved, queued or running.
    pub active_jobs: usize,
    pub queue_depth: usize,
    pub peak_queue_depth: usize,
    /// Jobs resolved with a result.
    pub total_processed: u64,
    /// Jobs resolved with an error of any kind.
    pub total_failed: u64,
    /// Subset of `total_failed` that hit their deadline.
    pub total_timed_out: u64,
    /// Crash recoveries that put a job back on the queue.
    pub total_requeued: u64,
    pub worker_restarts: u64,
}

impl PoolStats {
    /// Jobs that have reached a terminal outcome.
    pub fn total_resolved(&self) -> u64 {
        self.total_processed + self.total_failed
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Counters {
    pub processed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub requeued: u64,
    pub restarts: u64,
}
