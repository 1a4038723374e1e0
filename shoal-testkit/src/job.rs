use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shoal::JobRequest;

/// What a [`ScriptedProgram`](crate::ScriptedProgram) worker does with a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestAction {
    /// Reply immediately with `value`.
    Echo { value: Value },
    /// Sleep, then reply with `{"sleptMs": ms}`.
    Sleep { ms: u64 },
    /// Reply `success: false` with `error`.
    Fail { error: String },
    /// Take the worker down after `after_ms`.
    Crash { after_ms: u64 },
    /// Crash on the first attempt, then sleep `ms` and succeed.
    CrashOnce { after_ms: u64, ms: u64 },
    /// Never reply.
    Hang,
    /// Panic inside the worker.
    Panic { message: String },
}

/// Builder for jobs understood by [`ScriptedProgram`](crate::ScriptedProgram).
#[derive(Clone, Debug)]
pub struct TestJob {
    pub action: TestAction,
    pub tag: Option<String>,
    pub timeout: Option<Duration>,
}

impl TestJob {
    pub fn new(action: TestAction) -> Self {
        Self {
            action,
            tag: None,
            timeout: None,
        }
    }

    pub fn echo(value: impl Into<Value>) -> Self {
        Self::new(TestAction::Echo {
            value: value.into(),
        })
    }

    pub fn sleep(ms: u64) -> Self {
        Self::new(TestAction::Sleep { ms })
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self::new(TestAction::Fail {
            error: error.into(),
        })
    }

    pub fn crash(after_ms: u64) -> Self {
        Self::new(TestAction::Crash { after_ms })
    }

    pub fn crash_once(after_ms: u64, ms: u64) -> Self {
        Self::new(TestAction::CrashOnce { after_ms, ms })
    }

    pub fn hang() -> Self {
        Self::new(TestAction::Hang)
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self::new(TestAction::Panic {
            message: message.into(),
        })
    }

    /// Label the job so its start can be found in the
    /// [`ScriptLog`](crate::ScriptLog).
    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn request(&self) -> JobRequest {
        self.clone().into()
    }
}

impl From<TestJob> for JobRequest {
    fn from(job: TestJob) -> Self {
        let mut encoded = match serde_json::to_value(&job.action) {
            Ok(value) => value,
            Err(_) => json!({"type": "hang"}),
        };
        if let (Some(tag), Some(fields)) = (job.tag, encoded.as_object_mut()) {
            fields.insert("tag".to_string(), Value::String(tag));
        }

        let kind = encoded
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("hang")
            .to_string();
        let mut request = JobRequest::new(kind).with_payload(encoded);
        request.timeout = job.timeout;
        request
    }
}
