//! What a worker actually runs.
//!
//! A [`WorkerProgram`] is started once per worker slot and yields a
//! [`WorkerSession`] that executes jobs one at a time. When the session
//! reports a [`JobFault::Fatal`] error, or its task panics, the pool treats the
//! worker as crashed and replaces it with a fresh session.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::job::JobMessage;
use crate::runtime::WorkerId;

mod process;

pub use process::CommandProgram;

/// Why a session could not produce a result for a job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobFault {
    /// The job failed; the worker is healthy and stays in service.
    Failed(String),
    /// The worker itself is broken and must be replaced.
    Fatal(String),
}

impl std::fmt::Display for JobFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobFault::Failed(msg) => write!(f, "job failed: {msg}"),
            JobFault::Fatal(msg) => write!(f, "worker failed: {msg}"),
        }
    }
}

/// Factory for worker sessions.
#[async_trait]
pub trait WorkerProgram: Send + Sync + 'static {
    /// Bring up a new worker for slot `worker_id`.
    ///
    /// An error here counts as an abnormal exit of the slot.
    async fn start(
        &self,
        worker_id: WorkerId,
    ) -> anyhow::Result<Box<dyn WorkerSession>>;
}

/// A running worker. Receives one job at a time.
#[async_trait]
pub trait WorkerSession: Send {
    async fn execute(&mut self, job: JobMessage) -> Result<Value, JobFault>;

    /// Resolves with a reason once the worker dies while idle.
    ///
    /// Polled only between jobs and must be cancel safe. Sessions with
    /// nothing to watch never resolve.
    async fn closed(&mut self) -> String {
        std::future::pending().await
    }
}

type BlockingFn =
    dyn Fn(&JobMessage) -> Result<Value, JobFault> + Send + Sync + 'static;

/// Runs a synchronous function on tokio's blocking thread pool.
///
/// Suited to CPU-bound parsing that must stay off the async executor. A
/// blocking call cannot be interrupted: when its job times out the pool
/// abandons the thread and starts a new session, but the old call runs to
/// completion in the background.
#[derive(Clone)]
pub struct BlockingProgram {
    handler: Arc<BlockingFn>,
}

impl BlockingProgram {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&JobMessage) -> Result<Value, JobFault> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl std::fmt::Debug for BlockingProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingProgram").finish_non_exhaustive()
    }
}

#[async_trait]
impl WorkerProgram for BlockingProgram {
    async fn start(
        &self,
        _worker_id: WorkerId,
    ) -> anyhow::Result<Box<dyn WorkerSession>> {
        Ok(Box::new(BlockingSession {
            handler: Arc::clone(&self.handler),
        }))
    }
}

struct BlockingSession {
    handler: Arc<BlockingFn>,
}

#[async_trait]
impl WorkerSession for BlockingSession {
    async fn execute(&mut self, job: JobMessage) -> Result<Value, JobFault> {
        let handler = Arc::clone(&self.handler);
        match tokio::task::spawn_blocking(move || handler(&job)).await {
            Ok(outcome) => outcome,
            // A panic inside the handler takes the worker down with it.
            Err(err) if err.is_panic() => {
                std::panic::resume_unwind(err.into_panic())
            }
            Err(err) => Err(JobFault::Fatal(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, JobRequest};
    use serde_json::json;

    fn message(kind: &str, value: i64) -> JobMessage {
        JobMessage::new(
            JobId(1),
            JobRequest::new(kind).with_field("value", value),
        )
    }

    #[tokio::test]
    async fn blocking_program_runs_handler() {
        let program = BlockingProgram::new(|job| {
            let value = job
                .field("value")
                .and_then(Value::as_i64)
                .ok_or_else(|| JobFault::Failed("missing value".into()))?;
            Ok(json!({"doubled": value * 2}))
        });

        let mut session = program.start(WorkerId(0)).await.unwrap();
        let result = session.execute(message("double", 21)).await.unwrap();
        assert_eq!(result, json!({"doubled": 42}));

        let fault = session
            .execute(JobMessage::new(JobId(2), JobRequest::new("double")))
            .await
            .unwrap_err();
        assert_eq!(fault, JobFault::Failed("missing value".into()));
    }

    #[test]
    fn fault_display_distinguishes_scope() {
        assert_eq!(
            JobFault::Failed("bad pdf".into()).to_string(),
            "job failed: bad pdf"
        );
        assert_eq!(
            JobFault::Fatal("pipe closed".into()).to_string(),
            "worker failed: pipe closed"
        );
    }
}
