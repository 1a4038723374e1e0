//! Prometheus metrics for the worker pool.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `shoal_jobs_submitted_total` - Jobs accepted by `submit`
//! - `shoal_jobs_completed_total` - Jobs resolved, labelled by outcome
//! - `shoal_worker_restarts_total` - Worker replacements, labelled by exit reason
//!
//! ## Gauges
//! - `shoal_queue_depth` - Jobs waiting for a free worker
//! - `shoal_busy_workers` - Workers currently holding a job
//!
//! ## Histograms
//! - `shoal_job_duration_seconds` - Submit-to-resolution latency
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, CounterVec, Gauge, HistogramVec, Opts, Registry,
};
use std::sync::LazyLock;

/// Registry holding every shoal metric.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels:
/// - `job_type`: the job's `type` discriminator
pub static JOBS_SUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "shoal_jobs_submitted_total",
        "Total number of jobs accepted by the pool",
    );
    CounterVec::new(opts, &["job_type"])
        .expect("shoal_jobs_submitted_total metric creation failed")
});

/// Labels:
/// - `job_type`: the job's `type` discriminator
/// - `status`: success, failed, timeout, crashed or shutdown
pub static JOBS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "shoal_jobs_completed_total",
        "Total number of jobs resolved by the pool",
    );
    CounterVec::new(opts, &["job_type", "status"])
        .expect("shoal_jobs_completed_total metric creation failed")
});

/// Labels:
/// - `reason`: finished, failed, panicked or terminated
pub static WORKER_RESTARTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "shoal_worker_restarts_total",
        "Total number of workers replaced after exiting",
    );
    CounterVec::new(opts, &["reason"])
        .expect("shoal_worker_restarts_total metric creation failed")
});

pub static QUEUE_DEPTH: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("shoal_queue_depth", "Jobs waiting for a free worker")
        .expect("shoal_queue_depth metric creation failed")
});

pub static BUSY_WORKERS: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("shoal_busy_workers", "Workers currently holding a job")
        .expect("shoal_busy_workers metric creation failed")
});

/// Labels:
/// - `job_type`: the job's `type` discriminator
/// - `status`: same values as `shoal_jobs_completed_total`
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets =
        exponential_buckets(0.001, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "shoal_job_duration_seconds",
        "Time from submission to resolution in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["job_type", "status"])
        .expect("shoal_job_duration_seconds metric creation failed")
});

/// Register every metric with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_SUBMITTED_TOTAL.clone())
            as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_COMPLETED_TOTAL.clone()),
        Box::new(WORKER_RESTARTS_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(BUSY_WORKERS.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_submitted(job_type: &str) {
    JOBS_SUBMITTED_TOTAL.with_label_values(&[job_type]).inc();
}

pub fn record_job_completed(job_type: &str, status: &str, duration_secs: f64) {
    JOBS_COMPLETED_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[job_type, status])
        .observe(duration_secs);
}

pub fn record_worker_restart(reason: &str) {
    WORKER_RESTARTS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn set_pool_load(queue_depth: usize, busy_workers: usize) {
    QUEUE_DEPTH.set(queue_depth as f64);
    BUSY_WORKERS.set(busy_workers as f64);
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_metrics().expect("first registration should succeed");
        init_metrics().expect("second registration should be a no-op");
    }

    #[test]
    fn gathered_output_names_recorded_series() {
        init_metrics().expect("metrics initialization should succeed");

        record_job_submitted("analyze");
        record_job_completed("analyze", "success", 0.25);
        record_worker_restart("failed");
        set_pool_load(3, 2);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("shoal_jobs_submitted_total"));
        assert!(output.contains("shoal_jobs_completed_total"));
        assert!(output.contains("shoal_worker_restarts_total"));
        assert!(output.contains("shoal_queue_depth"));
        assert!(output.contains("shoal_job_duration_seconds"));
    }
}
