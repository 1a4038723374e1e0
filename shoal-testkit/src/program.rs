use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use shoal::{
    JobFault, JobId, JobMessage, WorkerId, WorkerProgram, WorkerSession,
};

use crate::job::TestAction;

/// Worker program driven by [`TestJob`](crate::TestJob) payloads.
///
/// Runs every action on the async executor, so terminating a worker stops
/// its job immediately. All sessions share one [`ScriptLog`].
#[derive(Clone, Debug, Default)]
pub struct ScriptedProgram {
    log: ScriptLog,
    start_failures: Arc<Mutex<u32>>,
}

impl ScriptedProgram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` worker starts fail.
    pub fn fail_next_starts(self, count: u32) -> Self {
        *self.start_failures.lock() = count;
        self
    }

    pub fn log(&self) -> ScriptLog {
        self.log.clone()
    }
}

#[async_trait]
impl WorkerProgram for ScriptedProgram {
    async fn start(
        &self,
        worker_id: WorkerId,
    ) -> anyhow::Result<Box<dyn WorkerSession>> {
        {
            let mut failures = self.start_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("scripted start failure on worker {worker_id}");
            }
        }
        self.log.inner.lock().sessions.push(worker_id);
        Ok(Box::new(ScriptedSession {
            worker_id,
            log: self.log.clone(),
        }))
    }
}

struct ScriptedSession {
    worker_id: WorkerId,
    log: ScriptLog,
}

#[async_trait]
impl WorkerSession for ScriptedSession {
    async fn execute(&mut self, job: JobMessage) -> Result<Value, JobFault> {
        let mut fields = job.payload.clone();
        fields.insert("type".to_string(), Value::String(job.kind.clone()));
        let action: TestAction = serde_json::from_value(Value::Object(fields))
            .map_err(|err| JobFault::Failed(format!("unknown test job: {err}")))?;
        let tag = job
            .field("tag")
            .and_then(Value::as_str)
            .map(str::to_string);

        let _active = self.log.begin(job.job_id, tag, self.worker_id);
        match action {
            TestAction::Echo { value } => Ok(value),
            TestAction::Sleep { ms } => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({"sleptMs": ms}))
            }
            TestAction::Fail { error } => Err(JobFault::Failed(error)),
            TestAction::Crash { after_ms } => {
                tokio::time::sleep(Duration::from_millis(after_ms)).await;
                Err(JobFault::Fatal("scripted crash".to_string()))
            }
            TestAction::CrashOnce { after_ms, ms } => {
                if self.log.first_crash(job.job_id) {
                    tokio::time::sleep(Duration::from_millis(after_ms)).await;
                    return Err(JobFault::Fatal("scripted crash".to_string()));
                }
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({"sleptMs": ms, "recovered": true}))
            }
            TestAction::Hang => std::future::pending().await,
            TestAction::Panic { message } => panic!("{message}"),
        }
    }
}

/// One job start observed by a scripted worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobStart {
    pub job_id: JobId,
    pub tag: Option<String>,
    pub worker_id: WorkerId,
    pub at: Instant,
}

/// Shared record of what scripted workers did.
#[derive(Clone, Debug, Default)]
pub struct ScriptLog {
    inner: Arc<Mutex<LogInner>>,
}

#[derive(Debug, Default)]
struct LogInner {
    starts: Vec<JobStart>,
    sessions: Vec<WorkerId>,
    crashed: HashSet<JobId>,
    active: usize,
    peak: usize,
}

impl ScriptLog {
    fn begin(
        &self,
        job_id: JobId,
        tag: Option<String>,
        worker_id: WorkerId,
    ) -> ActiveGuard {
        let mut inner = self.inner.lock();
        inner.starts.push(JobStart {
            job_id,
            tag,
            worker_id,
            at: Instant::now(),
        });
        inner.active += 1;
        inner.peak = inner.peak.max(inner.active);
        ActiveGuard { log: self.clone() }
    }

    fn first_crash(&self, job_id: JobId) -> bool {
        self.inner.lock().crashed.insert(job_id)
    }

    /// Every job start, in the order workers began them.
    pub fn starts(&self) -> Vec<JobStart> {
        self.inner.lock().starts.clone()
    }

    /// Tags of started jobs, in start order. Untagged jobs are skipped.
    pub fn started_tags(&self) -> Vec<String> {
        self.inner
            .lock()
            .starts
            .iter()
            .filter_map(|start| start.tag.clone())
            .collect()
    }

    /// Number of times each job was started.
    pub fn attempts(&self) -> HashMap<JobId, usize> {
        let mut counts = HashMap::new();
        for start in &self.inner.lock().starts {
            *counts.entry(start.job_id).or_insert(0) += 1;
        }
        counts
    }

    /// Worker sessions brought up so far, in start order.
    pub fn sessions(&self) -> Vec<WorkerId> {
        self.inner.lock().sessions.clone()
    }

    /// Jobs currently executing.
    pub fn active(&self) -> usize {
        self.inner.lock().active
    }

    /// Most jobs ever executing at once.
    pub fn peak_concurrency(&self) -> usize {
        self.inner.lock().peak
    }
}

/// Decrements the active count when a job ends, including by abort.
struct ActiveGuard {
    log: ScriptLog,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut inner = self.log.inner.lock();
        inner.active = inner.active.saturating_sub(1);
    }
}
