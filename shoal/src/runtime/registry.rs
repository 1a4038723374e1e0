use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::PoolError;
use crate::job::{JobId, JobMessage, JobOutput};
use crate::runtime::WorkerId;

pub(crate) type Responder = oneshot::Sender<Result<JobOutput, PoolError>>;

/// Book-keeping for one unresolved job.
#[derive(Debug)]
pub(crate) struct PendingCall {
    pub message: JobMessage,
    pub timeout: Duration,
    pub submitted_at: Instant,
    pub responder: Responder,
    pub timer: AbortHandle,
    /// Dispatches so far, including the one in progress.
    pub attempts: u32,
    /// Workers that died while holding this job.
    pub crashes: u32,
    pub worker: Option<WorkerId>,
}

impl PendingCall {
    /// Settle the job. Consumes the entry, so a job resolves at most once.
    pub fn resolve(self, outcome: Result<JobOutput, PoolError>) {
        self.timer.abort();
        if self.responder.send(outcome).is_err() {
            tracing::trace!(
                job_id = %self.message.job_id,
                "submitter dropped before resolution"
            );
        }
    }
}

/// Every job that has been accepted and not yet resolved.
#[derive(Debug, Default)]
pub(crate) struct JobRegistry {
    calls: HashMap<JobId, PendingCall>,
}

impl JobRegistry {
    pub fn insert(&mut self, call: PendingCall) {
        self.calls.insert(call.message.job_id, call);
    }

    pub fn take(&mut self, job_id: JobId) -> Option<PendingCall> {
        self.calls.remove(&job_id)
    }

    pub fn get_mut(&mut self, job_id: JobId) -> Option<&mut PendingCall> {
        self.calls.get_mut(&job_id)
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.calls.contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Remove every entry, in job id order.
    pub fn drain(&mut self) -> Vec<PendingCall> {
        let mut calls: Vec<_> = self.calls.drain().map(|(_, call)| call).collect();
        calls.sort_by_key(|call| call.message.job_id);
        calls
    }
}

/// Future returned by [`WorkerPool::submit`](crate::WorkerPool::submit).
///
/// Resolves exactly once with the job's result or its terminal error.
/// Dropping it does not cancel the job.
#[derive(Debug)]
#[must_use = "the job result is only observable by awaiting PendingJob"]
pub struct PendingJob {
    job_id: JobId,
    rx: oneshot::Receiver<Result<JobOutput, PoolError>>,
}

impl PendingJob {
    pub(crate) fn new(
        job_id: JobId,
        rx: oneshot::Receiver<Result<JobOutput, PoolError>>,
    ) -> Self {
        Self { job_id, rx }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl Future for PendingJob {
    type Output = Result<JobOutput, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let job_id = self.job_id;
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            // The pool itself was dropped with the job still registered.
            received.unwrap_or(Err(PoolError::ShutDown { job_id }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRequest;
    use serde_json::json;

    fn call(id: u64) -> (PendingCall, PendingJob) {
        let (tx, rx) = oneshot::channel();
        let timer = tokio::spawn(std::future::pending::<()>());
        let call = PendingCall {
            message: JobMessage::new(JobId(id), JobRequest::new("analyze")),
            timeout: Duration::from_secs(1),
            submitted_at: Instant::now(),
            responder: tx,
            timer: timer.abort_handle(),
            attempts: 0,
            crashes: 0,
            worker: None,
        };
        (call, PendingJob::new(JobId(id), rx))
    }

    #[tokio::test]
    async fn resolve_delivers_outcome_to_pending_job() {
        let (call, pending) = call(1);
        call.resolve(Ok(JobOutput {
            job_id: JobId(1),
            result: json!({"pages": 3}),
            processing_time: Duration::from_millis(5),
            attempts: 1,
        }));

        let output = pending.await.unwrap();
        assert_eq!(output.result, json!({"pages": 3}));
    }

    #[tokio::test]
    async fn dropped_registry_reports_shutdown() {
        let mut registry = JobRegistry::default();
        let (call, pending) = call(5);
        registry.insert(call);
        drop(registry);

        assert_eq!(pending.await, Err(PoolError::ShutDown { job_id: JobId(5) }));
    }

    #[tokio::test]
    async fn take_removes_entry_once() {
        let mut registry = JobRegistry::default();
        let (first, _p1) = call(2);
        let (second, _p2) = call(1);
        registry.insert(first);
        registry.insert(second);

        assert!(registry.take(JobId(2)).is_some());
        assert!(registry.take(JobId(2)).is_none());
        assert!(registry.contains(JobId(1)));

        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn drain_orders_by_job_id() {
        let mut registry = JobRegistry::default();
        let mut pending = Vec::new();
        for id in [3, 1, 2] {
            let (entry, job) = call(id);
            registry.insert(entry);
            pending.push(job);
        }

        let ids: Vec<_> = registry
            .drain()
            .iter()
            .map(|call| call.message.job_id)
            .collect();
        assert_eq!(ids, vec![JobId(1), JobId(2), JobId(3)]);
    }
}
