//! Tracing spans and recording helpers for pool operations.
//!
//! Every `record_*` helper logs through `tracing` and, with the `metrics`
//! feature enabled, updates the matching Prometheus series.
//!
//! # Example
//!
//! ```ignore
//! use shoal::telemetry::{job_dispatch_span, record_job_submitted};
//!
//! record_job_submitted(job_id, "analyze");
//! let span = job_dispatch_span(job_id, worker_id, "analyze");
//! ```

use std::fmt::Display;
use std::time::Duration;

use tracing::{info_span, Span};

use crate::job::JobId;
use crate::runtime::{PoolState, WorkerId};

/// Span covering the acceptance of a job by `submit`.
#[must_use]
pub fn job_submit_span(job_type: impl AsRef<str>) -> Span {
    info_span!("shoal.submit", job_type = %job_type.as_ref())
}

/// Span covering the hand-off of a job to a worker.
#[must_use]
pub fn job_dispatch_span(
    job_id: JobId,
    worker_id: WorkerId,
    job_type: impl AsRef<str>,
) -> Span {
    info_span!(
        "shoal.dispatch",
        %job_id,
        %worker_id,
        job_type = %job_type.as_ref(),
    )
}

/// Span covering resolution of a job.
#[must_use]
pub fn job_complete_span(job_id: JobId, status: impl AsRef<str>) -> Span {
    info_span!("shoal.complete", %job_id, status = %status.as_ref())
}

/// Span a worker task runs inside for its whole life.
#[must_use]
pub fn worker_span(worker_id: WorkerId, generation: u64) -> Span {
    info_span!("shoal.worker", %worker_id, generation)
}

pub fn record_job_submitted(job_id: JobId, job_type: impl AsRef<str>) {
    tracing::debug!(%job_id, job_type = %job_type.as_ref(), "job submitted");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_submitted(job_type.as_ref());
}

/// Record a resolved job with its submit-to-resolution latency.
pub fn record_job_completed(
    job_id: JobId,
    job_type: impl AsRef<str>,
    status: impl AsRef<str>,
    elapsed: Duration,
) {
    let elapsed_ms = elapsed.as_millis() as u64;
    if status.as_ref() == "success" {
        tracing::debug!(
            %job_id,
            job_type = %job_type.as_ref(),
            elapsed_ms,
            "job completed"
        );
    } else {
        tracing::info!(
            %job_id,
            job_type = %job_type.as_ref(),
            status = %status.as_ref(),
            elapsed_ms,
            "job did not complete successfully"
        );
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_completed(
        job_type.as_ref(),
        status.as_ref(),
        elapsed.as_secs_f64(),
    );
}

/// Record that a worker exited and is being replaced.
pub fn record_worker_restart(
    worker_id: WorkerId,
    reason: impl AsRef<str>,
    detail: impl Display,
    delay: Duration,
) {
    tracing::warn!(
        %worker_id,
        reason = %reason.as_ref(),
        detail = %detail,
        delay_ms = delay.as_millis() as u64,
        "restarting worker"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_worker_restart(reason.as_ref());
}

/// Publish the current queue depth and busy worker count.
pub fn set_pool_load(queue_depth: usize, busy_workers: usize) {
    tracing::trace!(queue_depth, busy_workers, "pool load updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_pool_load(queue_depth, busy_workers);
}

pub fn record_state_change(from: PoolState, to: PoolState) {
    tracing::info!(%from, %to, "pool state changed");
}
