use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::events::{EventBus, PoolEvent, PoolEventKind};
use crate::job::{JobId, JobMessage, JobOutput, JobRequest, WorkerReply};
use crate::program::WorkerProgram;
use crate::queue::JobQueue;
use crate::stats::{Counters, PoolStats};
use crate::telemetry;

use super::registry::{JobRegistry, PendingCall, PendingJob};
use super::worker::{spawn_worker, WorkerEvent, WorkerExit, WorkerHandle, WorkerId};

/// How long shutdown waits for each terminated worker to report its exit.
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Lifecycle of a pool. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PoolState::Running => "running",
            PoolState::ShuttingDown => "shutting down",
            PoolState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Outcome of [`WorkerPool::shutdown`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// False when this call found the pool already shutting down or stopped.
    pub initiated: bool,
    /// Every in-flight job resolved before the grace period ran out.
    pub drained: bool,
    /// Queued jobs rejected as shutdown began.
    pub rejected_queued: usize,
    /// In-flight jobs rejected when the grace period ran out.
    pub abandoned: usize,
    pub workers_terminated: usize,
    /// Workers that failed to stop cleanly. Shutdown completes regardless.
    pub failures: Vec<String>,
}

/// A fixed-size pool of workers executing jobs off the caller's task.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    program: Arc<dyn WorkerProgram>,
    runtime: Handle,
    core: Mutex<PoolCore>,
    events: EventBus,
    worker_events: mpsc::UnboundedSender<WorkerEvent>,
    /// Signalled whenever the registry becomes empty.
    idle: Notify,
}

struct PoolCore {
    state: PoolState,
    workers: Vec<WorkerSlot>,
    queue: JobQueue,
    registry: JobRegistry,
    next_job_id: u64,
    counters: Counters,
}

struct WorkerSlot {
    id: WorkerId,
    generation: u64,
    /// Set from dispatch until the reply is accepted or the worker exits.
    current_job: Option<JobId>,
    handle: Option<WorkerHandle>,
    consecutive_failures: u32,
}

impl WorkerSlot {
    fn is_available(&self) -> bool {
        self.handle.is_some() && self.current_job.is_none()
    }
}

impl PoolCore {
    fn free_slot(&self) -> Option<usize> {
        self.workers.iter().position(WorkerSlot::is_available)
    }

    fn busy_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|slot| slot.current_job.is_some())
            .count()
    }
}

impl WorkerPool {
    /// Start a pool running `program` in `config.size` workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<P>(config: PoolConfig, program: P) -> anyhow::Result<Self>
    where
        P: WorkerProgram,
    {
        Self::start_shared(config, Arc::new(program))
    }

    /// Like [`start`](Self::start) for a program that is already shared.
    pub fn start_shared(
        config: PoolConfig,
        program: Arc<dyn WorkerProgram>,
    ) -> anyhow::Result<Self> {
        config.validate().context("invalid pool configuration")?;
        let runtime = Handle::try_current()
            .context("worker pool must be started inside a tokio runtime")?;

        let (worker_events, worker_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            events: EventBus::new(config.event_capacity),
            core: Mutex::new(PoolCore {
                state: PoolState::Running,
                workers: Vec::with_capacity(config.size),
                queue: JobQueue::new(),
                registry: JobRegistry::default(),
                next_job_id: 1,
                counters: Counters::default(),
            }),
            config,
            program,
            runtime,
            worker_events,
            idle: Notify::new(),
        });

        inner
            .runtime
            .spawn(supervise(Arc::downgrade(&inner), worker_rx));

        {
            let mut core = inner.core.lock();
            for index in 0..inner.config.size {
                let id = WorkerId(index);
                core.workers.push(WorkerSlot {
                    id,
                    generation: 0,
                    current_job: None,
                    handle: Some(inner.spawn(id, 0, Duration::ZERO)),
                    consecutive_failures: 0,
                });
                inner.events.publish(PoolEventKind::WorkerStarted {
                    worker_id: id,
                    generation: 0,
                });
            }
        }

        tracing::info!(
            size = inner.config.size,
            default_timeout_ms = inner.config.default_timeout.as_millis() as u64,
            "worker pool started"
        );
        Ok(Self { inner })
    }

    /// Accept a job and return a future for its outcome.
    ///
    /// The job is dispatched at once if a worker is free and queued
    /// otherwise. Fails synchronously only when the pool is not running.
    pub fn submit(&self, request: JobRequest) -> Result<PendingJob, PoolError> {
        self.inner.submit(request)
    }

    /// Convenience for `submit(JobRequest::new(kind).with_payload(payload))`.
    pub fn submit_json(
        &self,
        kind: impl Into<String>,
        payload: Value,
    ) -> Result<PendingJob, PoolError> {
        self.submit(JobRequest::new(kind).with_payload(payload))
    }

    pub fn stats(&self) -> PoolStats {
        let core = self.inner.core.lock();
        let busy_workers = core.busy_workers();
        PoolStats {
            state: core.state,
            pool_size: self.inner.config.size,
            available_workers: core
                .workers
                .iter()
                .filter(|slot| slot.is_available())
                .count(),
            busy_workers,
            active_jobs: core.registry.len(),
            queue_depth: core.queue.len(),
            peak_queue_depth: core.queue.peak(),
            total_processed: core.counters.processed,
            total_failed: core.counters.failed,
            total_timed_out: core.counters.timed_out,
            total_requeued: core.counters.requeued,
            worker_restarts: core.counters.restarts,
        }
    }

    pub fn state(&self) -> PoolState {
        self.inner.core.lock().state
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Receive lifecycle events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Shut down using the configured grace period.
    pub async fn close(&self) -> ShutdownReport {
        self.shutdown(self.inner.config.shutdown_grace).await
    }

    /// Stop accepting jobs, wait up to `grace` for in-flight jobs, then
    /// terminate every worker.
    ///
    /// Queued jobs are rejected immediately with [`PoolError::ShutDown`].
    /// Calling this again while shutdown is in progress or finished returns
    /// at once with `initiated: false`.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let inner = &self.inner;
        let mut report = ShutdownReport {
            initiated: true,
            ..ShutdownReport::default()
        };

        {
            let mut guard = inner.core.lock();
            let core = &mut *guard;
            if core.state != PoolState::Running {
                return ShutdownReport::default();
            }
            core.state = PoolState::ShuttingDown;
            telemetry::record_state_change(
                PoolState::Running,
                PoolState::ShuttingDown,
            );

            for job_id in core.queue.drain() {
                if let Some(call) = core.registry.take(job_id) {
                    inner.reject_for_shutdown(&mut core.counters, call);
                    report.rejected_queued += 1;
                }
            }
            inner.events.publish(PoolEventKind::ShutdownStarted {
                active_jobs: core.registry.len(),
            });
            tracing::info!(
                rejected_queued = report.rejected_queued,
                active_jobs = core.registry.len(),
                grace_ms = grace.as_millis() as u64,
                "worker pool shutting down"
            );
            inner.after_change(core);
        }

        report.drained = tokio::time::timeout(grace, inner.wait_idle())
            .await
            .is_ok();

        let handles: Vec<(WorkerId, WorkerHandle)> = {
            let mut guard = inner.core.lock();
            let core = &mut *guard;
            for call in core.registry.drain() {
                inner.reject_for_shutdown(&mut core.counters, call);
                report.abandoned += 1;
            }
            if report.abandoned > 0 {
                tracing::warn!(
                    abandoned = report.abandoned,
                    "grace period elapsed with jobs still running"
                );
            }
            core.workers
                .iter_mut()
                .filter_map(|slot| {
                    slot.current_job = None;
                    slot.handle.take().map(|handle| (slot.id, handle))
                })
                .collect()
        };

        for (_, handle) in &handles {
            handle.terminate();
        }
        for (worker_id, handle) in handles {
            drop(handle.jobs);
            match tokio::time::timeout(WORKER_STOP_TIMEOUT, handle.watcher).await
            {
                Ok(Ok(())) => report.workers_terminated += 1,
                Ok(Err(err)) => {
                    report.failures.push(format!("worker {worker_id}: {err}"))
                }
                Err(_) => report.failures.push(format!(
                    "worker {worker_id}: did not stop within {}s",
                    WORKER_STOP_TIMEOUT.as_secs()
                )),
            }
        }
        for failure in &report.failures {
            tracing::warn!(%failure, "worker did not shut down cleanly");
        }

        {
            let mut core = inner.core.lock();
            core.state = PoolState::Stopped;
            inner.after_change(&core);
        }
        telemetry::record_state_change(PoolState::ShuttingDown, PoolState::Stopped);
        inner.events.publish(PoolEventKind::Stopped);
        tracing::info!(
            drained = report.drained,
            workers_terminated = report.workers_terminated,
            "worker pool stopped"
        );
        report
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolInner {
    fn spawn(
        &self,
        worker_id: WorkerId,
        generation: u64,
        start_delay: Duration,
    ) -> WorkerHandle {
        spawn_worker(
            &self.runtime,
            worker_id,
            generation,
            start_delay,
            Arc::clone(&self.program),
            self.worker_events.clone(),
        )
    }

    fn submit(
        self: &Arc<Self>,
        request: JobRequest,
    ) -> Result<PendingJob, PoolError> {
        let _span = telemetry::job_submit_span(&request.kind).entered();
        let mut guard = self.core.lock();
        let core = &mut *guard;
        if core.state != PoolState::Running {
            return Err(PoolError::Unavailable { state: core.state });
        }

        let job_id = JobId(core.next_job_id);
        core.next_job_id += 1;
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let message = JobMessage::new(job_id, request);
        telemetry::record_job_submitted(job_id, &message.kind);
        self.events.publish(PoolEventKind::Submitted {
            job_id,
            job_type: message.kind.clone(),
        });

        let weak = Arc::downgrade(self);
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_timeout(job_id);
            }
        });

        let (responder, rx) = oneshot::channel();
        core.registry.insert(PendingCall {
            message,
            timeout,
            submitted_at: Instant::now(),
            responder,
            timer: timer.abort_handle(),
            attempts: 0,
            crashes: 0,
            worker: None,
        });

        match core.free_slot() {
            Some(slot) => self.assign(core, slot, job_id),
            None => {
                core.queue.push_back(job_id);
                tracing::debug!(
                    %job_id,
                    queue_depth = core.queue.len(),
                    "no free worker, job queued"
                );
            }
        }
        self.after_change(core);

        Ok(PendingJob::new(job_id, rx))
    }

    fn assign(&self, core: &mut PoolCore, slot: usize, job_id: JobId) {
        let Some(call) = core.registry.get_mut(job_id) else {
            return;
        };
        let worker = &mut core.workers[slot];
        call.attempts += 1;
        call.worker = Some(worker.id);
        worker.current_job = Some(job_id);

        let _span =
            telemetry::job_dispatch_span(job_id, worker.id, &call.message.kind)
                .entered();
        let delivered = worker
            .handle
            .as_ref()
            .is_some_and(|handle| handle.send(call.message.clone()));
        if delivered {
            tracing::debug!(attempt = call.attempts, "job dispatched");
        } else {
            // Recovered through the exit path once the watcher reports.
            tracing::debug!("worker already gone, job held until its exit");
        }
        self.events.publish(PoolEventKind::Dispatched {
            job_id,
            worker_id: worker.id,
            attempt: call.attempts,
        });
    }

    /// Hand queued jobs to free workers until one side runs out.
    fn drain(&self, core: &mut PoolCore) {
        while !core.queue.is_empty() {
            let Some(slot) = core.free_slot() else {
                break;
            };
            let Some(job_id) = core.queue.pop_front() else {
                break;
            };
            if core.registry.contains(job_id) {
                self.assign(core, slot, job_id);
            }
        }
    }

    fn after_change(&self, core: &PoolCore) {
        telemetry::set_pool_load(core.queue.len(), core.busy_workers());
        if core.registry.is_empty() {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.core.lock().registry.is_empty() {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.config.drain_poll_interval) => {}
            }
        }
    }

    fn on_reply(&self, worker_id: WorkerId, generation: u64, reply: WorkerReply) {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        let job_id = reply.job_id;
        let Some(slot) = core.workers.get_mut(worker_id.0) else {
            return;
        };
        if slot.generation != generation || slot.current_job != Some(job_id) {
            tracing::warn!(
                %job_id,
                %worker_id,
                generation,
                "discarding reply from a worker not holding this job"
            );
            return;
        }
        let Some(call) = core.registry.take(job_id) else {
            // Already resolved by its timeout; the worker is being terminated
            // and stays busy until its exit is reported.
            tracing::warn!(%job_id, %worker_id, "discarding stale result");
            return;
        };
        slot.current_job = None;
        slot.consecutive_failures = 0;

        let elapsed = call.submitted_at.elapsed();
        let job_type = call.message.kind.clone();
        if reply.success {
            core.counters.processed += 1;
            let _span = telemetry::job_complete_span(job_id, "success").entered();
            telemetry::record_job_completed(job_id, &job_type, "success", elapsed);
            self.events.publish(PoolEventKind::Completed { job_id, worker_id });
            let output = JobOutput {
                job_id,
                processing_time: reply.processing_time(),
                result: reply.result.unwrap_or(Value::Null),
                attempts: call.attempts,
            };
            call.resolve(Ok(output));
        } else {
            core.counters.failed += 1;
            let message = reply
                .error
                .unwrap_or_else(|| "worker reported failure".to_string());
            let _span = telemetry::job_complete_span(job_id, "failed").entered();
            telemetry::record_job_completed(job_id, &job_type, "failed", elapsed);
            self.events.publish(PoolEventKind::Failed {
                job_id,
                worker_id,
                error: message.clone(),
            });
            call.resolve(Err(PoolError::Execution { job_id, message }));
        }

        self.drain(core);
        self.after_change(core);
    }

    fn on_timeout(&self, job_id: JobId) {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        let Some(call) = core.registry.take(job_id) else {
            return;
        };
        core.queue.remove(job_id);
        core.counters.failed += 1;
        core.counters.timed_out += 1;

        let holder = core
            .workers
            .iter()
            .find(|slot| slot.current_job == Some(job_id));
        let worker_id = holder.map(|slot| slot.id);
        if let Some(handle) = holder.and_then(|slot| slot.handle.as_ref()) {
            // The slot stays busy until the exit is reported.
            handle.terminate();
        }

        let _span = telemetry::job_complete_span(job_id, "timeout").entered();
        tracing::warn!(
            worker_id = ?worker_id,
            timeout_ms = call.timeout.as_millis() as u64,
            "job timed out"
        );
        telemetry::record_job_completed(
            job_id,
            &call.message.kind,
            "timeout",
            call.submitted_at.elapsed(),
        );
        self.events
            .publish(PoolEventKind::TimedOut { job_id, worker_id });
        let timeout = call.timeout;
        call.resolve(Err(PoolError::Timeout { job_id, timeout }));

        self.after_change(core);
    }

    fn on_exit(&self, worker_id: WorkerId, generation: u64, exit: WorkerExit) {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        let Some(slot) = core.workers.get_mut(worker_id.0) else {
            return;
        };
        if slot.generation != generation {
            return;
        }
        slot.handle = None;
        let held = slot.current_job.take();
        self.events.publish(PoolEventKind::WorkerExited {
            worker_id,
            generation,
            reason: exit.to_string(),
        });

        if core.state != PoolState::Running {
            tracing::debug!(%worker_id, %exit, "worker exited during shutdown");
            if let Some(call) = held.and_then(|job_id| core.registry.take(job_id))
            {
                self.reject_for_shutdown(&mut core.counters, call);
            }
            self.after_change(core);
            return;
        }

        if exit.is_abnormal() {
            slot.consecutive_failures += 1;
        }
        core.counters.restarts += 1;

        if let Some(job_id) = held {
            self.recover_job(core, job_id, worker_id, &exit);
        }

        let slot = &mut core.workers[worker_id.0];
        let delay = self.config.restart_delay(slot.consecutive_failures);
        slot.generation += 1;
        slot.handle = Some(self.spawn(worker_id, slot.generation, delay));
        telemetry::record_worker_restart(worker_id, exit.label(), &exit, delay);
        self.events.publish(PoolEventKind::WorkerStarted {
            worker_id,
            generation: slot.generation,
        });

        self.drain(core);
        self.after_change(core);
    }

    /// Requeue a job whose worker died under it, or fail it once it has
    /// crashed too many workers.
    fn recover_job(
        &self,
        core: &mut PoolCore,
        job_id: JobId,
        worker_id: WorkerId,
        exit: &WorkerExit,
    ) {
        let Some(call) = core.registry.get_mut(job_id) else {
            // Resolved by its timeout before the worker went down.
            return;
        };
        call.crashes += 1;
        call.worker = None;

        if call.crashes <= self.config.max_crash_retries {
            let crashes = call.crashes;
            core.queue.push_front(job_id);
            core.counters.requeued += 1;
            tracing::info!(%job_id, %worker_id, crashes, "requeued job after worker crash");
            self.events
                .publish(PoolEventKind::Requeued { job_id, crashes });
            return;
        }

        let Some(call) = core.registry.take(job_id) else {
            return;
        };
        core.counters.failed += 1;
        let error = PoolError::WorkerCrashed {
            job_id,
            worker_id,
            attempts: call.attempts,
            reason: exit.to_string(),
        };
        tracing::warn!(%job_id, %worker_id, crashes = call.crashes, "giving up on job");
        telemetry::record_job_completed(
            job_id,
            &call.message.kind,
            error.status(),
            call.submitted_at.elapsed(),
        );
        self.events.publish(PoolEventKind::Rejected {
            job_id,
            reason: error.to_string(),
        });
        call.resolve(Err(error));
    }

    fn reject_for_shutdown(&self, counters: &mut Counters, call: PendingCall) {
        let job_id = call.message.job_id;
        counters.failed += 1;
        let error = PoolError::ShutDown { job_id };
        telemetry::record_job_completed(
            job_id,
            &call.message.kind,
            error.status(),
            call.submitted_at.elapsed(),
        );
        self.events.publish(PoolEventKind::Rejected {
            job_id,
            reason: error.to_string(),
        });
        call.resolve(Err(error));
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        for call in core.registry.drain() {
            call.timer.abort();
        }
        for slot in &mut core.workers {
            if let Some(handle) = slot.handle.take() {
                handle.terminate();
            }
        }
    }
}

/// Apply worker reports to the pool, one at a time, until every worker
/// event sender is gone.
async fn supervise(
    pool: Weak<PoolInner>,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = pool.upgrade() else {
            break;
        };
        match event {
            WorkerEvent::Reply {
                worker_id,
                generation,
                reply,
            } => inner.on_reply(worker_id, generation, reply),
            WorkerEvent::Exited {
                worker_id,
                generation,
                exit,
            } => inner.on_exit(worker_id, generation, exit),
        }
    }
    tracing::debug!("pool supervisor finished");
}
