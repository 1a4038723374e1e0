//! Shoal - a supervised worker pool for blocking document-analysis jobs.
//!
//! Callers submit JSON jobs and get back a future; the pool runs each job on
//! one of a fixed number of isolated workers, so CPU-heavy parsing never
//! stalls the task that handles the request.
//!
//! # Core Concepts
//!
//! - **Job**: a [`JobRequest`] with a `type` discriminator and an opaque JSON
//!   payload. The pool stamps it with a [`JobId`] and forwards it as a
//!   [`JobMessage`].
//!
//! - **Worker**: one session of a [`WorkerProgram`]. [`BlockingProgram`] runs
//!   a synchronous function on tokio's blocking pool; [`CommandProgram`] runs
//!   a child process speaking JSON lines.
//!
//! - **Pool**: [`WorkerPool`] dispatches jobs to free workers or queues them
//!   FIFO, enforces per-job deadlines by terminating the worker, replaces
//!   crashed workers and requeues their job at the front.
//!
//! - **Shutdown**: [`WorkerPool::shutdown`] rejects queued jobs, gives
//!   running jobs a grace period, then terminates every worker.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use shoal::*;
//! use serde_json::json;
//!
//! let program = BlockingProgram::new(|job| Ok(json!({"type": job.kind})));
//! let pool = WorkerPool::start(PoolConfig::new(4), program)?;
//!
//! let output = pool.submit_json("analyze", json!({"documentId": "a1"}))?.await?;
//! pool.shutdown(std::time::Duration::from_secs(5)).await;
//! ```

/// Pool configuration.
///
/// [`PoolConfig`] carries the pool size, deadlines, shutdown timing and the
/// crash-restart policy.
pub mod config;

/// Caller-facing errors.
///
/// Every job resolves to either a [`JobOutput`] or exactly one [`PoolError`].
pub mod error;

/// Lifecycle events broadcast by the pool.
pub mod events;

/// Job requests, wire messages and results.
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// Worker programs: the code each worker runs.
pub mod program;

/// FIFO of jobs waiting for a worker.
pub mod queue;

/// Pool runtime: dispatch, supervision and shutdown.
///
/// - [`WorkerPool`] - the pool itself
/// - [`WorkerPoolBuilder`] - builder with program validation
/// - [`PendingJob`] - future for one job's outcome
/// - [`ShutdownReport`] - what shutdown did
pub mod runtime;

/// Pool statistics snapshot.
pub mod stats;

/// Tracing spans and metric recording helpers.
pub mod telemetry;

pub use config::*;
pub use error::PoolError;
pub use events::*;
pub use job::*;
pub use program::*;
pub use queue::*;
pub use runtime::*;
pub use stats::PoolStats;
