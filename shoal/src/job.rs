use std::fmt::{self, Display};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field names the pool owns on the wire. Caller payloads may not set them.
const RESERVED_FIELDS: [&str; 2] = ["jobId", "type"];

/// Pool-assigned job identifier.
///
/// Ids increase monotonically for the lifetime of a pool and are never
/// reused, so a late reply can always be told apart from a newer job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job as submitted by a caller.
///
/// `kind` is the `type` discriminator understood by the worker program; the
/// payload is opaque to the pool and is forwarded as-is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
    /// Deadline for this job. Falls back to the pool default when unset.
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl JobRequest {
    /// Create a request with an empty payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Map::new(),
            timeout: None,
        }
    }

    /// Parse a raw JSON object carrying a `type` field.
    pub fn from_value(value: Value) -> anyhow::Result<Self> {
        let Value::Object(mut fields) = value else {
            anyhow::bail!("job payload must be a JSON object");
        };
        let kind = match fields.remove("type") {
            Some(Value::String(kind)) if !kind.is_empty() => kind,
            Some(_) => anyhow::bail!("job `type` must be a non-empty string"),
            None => anyhow::bail!("job payload is missing a `type` field"),
        };
        let timeout = match fields.remove("timeoutMs") {
            Some(raw) => Some(Duration::from_millis(
                raw.as_u64().ok_or_else(|| {
                    anyhow::anyhow!("`timeoutMs` must be a positive integer")
                })?,
            )),
            None => None,
        };
        fields.remove("jobId");
        Ok(Self {
            kind,
            payload: fields,
            timeout,
        })
    }

    /// Merge the fields of a JSON object into the payload.
    ///
    /// Non-object values are stored under `data`.
    pub fn with_payload(mut self, payload: Value) -> Self {
        match payload {
            Value::Object(fields) => {
                for (key, value) in fields {
                    self = self.with_field(key, value);
                }
            }
            other => {
                self.payload.insert("data".to_string(), other);
            }
        }
        self
    }

    /// Set a single payload field. Reserved wire fields are ignored.
    pub fn with_field(
        mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        let key = key.into();
        if !RESERVED_FIELDS.contains(&key.as_str()) {
            self.payload.insert(key, value.into());
        }
        self
    }

    /// Set the per-job deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The message a worker receives: `{jobId, type, ...payload}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl JobMessage {
    pub(crate) fn new(job_id: JobId, request: JobRequest) -> Self {
        let mut payload = request.payload;
        for field in RESERVED_FIELDS {
            payload.remove(field);
        }
        Self {
            job_id,
            kind: request.kind,
            payload,
        }
    }

    /// Look up a payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// The single reply a worker sends per job:
/// `{jobId, success, result | error, processingTimeMs}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerReply {
    pub job_id: JobId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub processing_time_ms: u64,
}

impl WorkerReply {
    pub fn success(job_id: JobId, result: Value, elapsed: Duration) -> Self {
        Self {
            job_id,
            success: true,
            result: Some(result),
            error: None,
            processing_time_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn failure(
        job_id: JobId,
        error: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            job_id,
            success: false,
            result: None,
            error: Some(error.into()),
            processing_time_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn processing_time(&self) -> Duration {
        Duration::from_millis(self.processing_time_ms)
    }
}

/// Successful outcome handed back to the submitter.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutput {
    pub job_id: JobId,
    pub result: Value,
    /// Time the worker reported spending on the job.
    #[serde(
        rename = "processingTimeMs",
        serialize_with = "crate::config::serde_millis::serialize"
    )]
    pub processing_time: Duration,
    /// Number of times the job was dispatched, including crash retries.
    pub attempts: u32,
}
