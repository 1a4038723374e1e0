use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::Instrument;

use crate::job::{JobMessage, WorkerReply};
use crate::program::{JobFault, WorkerProgram};
use crate::telemetry;

/// Slot index of a worker. Stable across restarts of that slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub usize);

impl Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a worker task ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// The job channel closed and the worker returned normally.
    Finished,
    /// The program failed to start or reported a fatal fault.
    Failed(String),
    /// The worker task panicked.
    Panicked(String),
    /// The pool aborted the worker.
    Terminated,
}

impl WorkerExit {
    /// Short label for log fields and metric labels.
    pub fn label(&self) -> &'static str {
        match self {
            WorkerExit::Finished => "finished",
            WorkerExit::Failed(_) => "failed",
            WorkerExit::Panicked(_) => "panicked",
            WorkerExit::Terminated => "terminated",
        }
    }

    pub fn is_abnormal(&self) -> bool {
        matches!(self, WorkerExit::Failed(_) | WorkerExit::Panicked(_))
    }

    fn from_join(result: Result<Result<(), String>, JoinError>) -> Self {
        match result {
            Ok(Ok(())) => WorkerExit::Finished,
            Ok(Err(reason)) => WorkerExit::Failed(reason),
            Err(err) if err.is_cancelled() => WorkerExit::Terminated,
            Err(err) => {
                let panic = err.into_panic();
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                WorkerExit::Panicked(message)
            }
        }
    }
}

impl Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Finished => write!(f, "worker finished"),
            WorkerExit::Failed(reason) => write!(f, "{reason}"),
            WorkerExit::Panicked(msg) => write!(f, "worker panicked: {msg}"),
            WorkerExit::Terminated => write!(f, "worker terminated"),
        }
    }
}

/// Messages from workers to the supervisor loop.
///
/// `generation` identifies which incarnation of a slot sent the message, so
/// reports from a replaced worker can be discarded.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Reply {
        worker_id: WorkerId,
        generation: u64,
        reply: WorkerReply,
    },
    Exited {
        worker_id: WorkerId,
        generation: u64,
        exit: WorkerExit,
    },
}

/// Owner-side handle of one running worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    pub jobs: mpsc::UnboundedSender<JobMessage>,
    pub abort: AbortHandle,
    pub watcher: JoinHandle<()>,
}

impl WorkerHandle {
    /// Hand a job to the worker. Fails if the worker has already gone.
    pub fn send(&self, job: JobMessage) -> bool {
        self.jobs.send(job).is_ok()
    }

    /// Kill the worker. Its exit is still reported through the watcher.
    pub fn terminate(&self) {
        self.abort.abort();
    }
}

/// Spawn a worker task for `worker_id` plus a watcher that reports its exit.
pub(crate) fn spawn_worker(
    runtime: &Handle,
    worker_id: WorkerId,
    generation: u64,
    start_delay: Duration,
    program: Arc<dyn WorkerProgram>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> WorkerHandle {
    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();

    let task = runtime.spawn(
        worker_loop(
            worker_id,
            generation,
            start_delay,
            program,
            jobs_rx,
            events.clone(),
        )
        .instrument(telemetry::worker_span(worker_id, generation)),
    );
    let abort = task.abort_handle();

    let watcher = runtime.spawn(async move {
        let exit = WorkerExit::from_join(task.await);
        let _ = events.send(WorkerEvent::Exited {
            worker_id,
            generation,
            exit,
        });
    });

    WorkerHandle {
        jobs: jobs_tx,
        abort,
        watcher,
    }
}

async fn worker_loop(
    worker_id: WorkerId,
    generation: u64,
    start_delay: Duration,
    program: Arc<dyn WorkerProgram>,
    mut jobs: mpsc::UnboundedReceiver<JobMessage>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> Result<(), String> {
    if !start_delay.is_zero() {
        tokio::time::sleep(start_delay).await;
    }

    let mut session = program
        .start(worker_id)
        .await
        .map_err(|err| format!("worker failed to start: {err:#}"))?;
    tracing::debug!("worker ready");

    loop {
        let job = tokio::select! {
            biased;
            reason = session.closed() => {
                tracing::warn!(%reason, "worker died while idle");
                return Err(reason);
            }
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let job_id = job.job_id;
        let started = Instant::now();
        let reply = match session.execute(job).await {
            Ok(result) => WorkerReply::success(job_id, result, started.elapsed()),
            Err(JobFault::Failed(message)) => {
                WorkerReply::failure(job_id, message, started.elapsed())
            }
            Err(JobFault::Fatal(reason)) => {
                tracing::warn!(%job_id, %reason, "worker crashed while running job");
                return Err(reason);
            }
        };

        if events
            .send(WorkerEvent::Reply {
                worker_id,
                generation,
                reply,
            })
            .is_err()
        {
            break;
        }
    }

    tracing::debug!("worker channel closed");
    Ok(())
}
