use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::{JobFault, WorkerProgram, WorkerSession};
use crate::job::{JobMessage, WorkerReply};
use crate::runtime::WorkerId;

/// Runs each worker as a child process speaking JSON lines.
///
/// Every job is written to the child's stdin as one `JobMessage` line and
/// the child answers with one `WorkerReply` line on stdout. The child's
/// stderr is inherited. Closing stdout, exiting, or writing an unparseable
/// line is treated as a crash. The child is killed when its session is
/// dropped, which is how timeouts and shutdown terminate it.
#[derive(Clone, Debug)]
pub struct CommandProgram {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
}

impl CommandProgram {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(
        mut self,
        key: impl Into<OsString>,
        value: impl Into<OsString>,
    ) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    fn command(&self, worker_id: WorkerId) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env("SHOAL_WORKER_ID", worker_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
    }
}

#[async_trait]
impl WorkerProgram for CommandProgram {
    async fn start(
        &self,
        worker_id: WorkerId,
    ) -> anyhow::Result<Box<dyn WorkerSession>> {
        let mut child = self.command(worker_id).spawn().with_context(|| {
            format!("failed to spawn worker process {:?}", self.program)
        })?;
        let stdin = child
            .stdin
            .take()
            .context("worker process has no stdin pipe")?;
        let stdout = child
            .stdout
            .take()
            .context("worker process has no stdout pipe")?;

        tracing::debug!(
            %worker_id,
            pid = child.id(),
            "worker process spawned"
        );

        Ok(Box::new(ProcessSession {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        }))
    }
}

struct ProcessSession {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl ProcessSession {
    async fn send(&mut self, job: &JobMessage) -> Result<(), JobFault> {
        let mut line = serde_json::to_vec(job)
            .map_err(|err| JobFault::Failed(format!("unencodable job: {err}")))?;
        line.push(b'\n');
        self.stdin
            .write_all(&line)
            .await
            .map_err(|err| JobFault::Fatal(format!("write to worker: {err}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|err| JobFault::Fatal(format!("flush to worker: {err}")))
    }

    fn exit_description(&mut self) -> String {
        match self.child.try_wait() {
            Ok(Some(status)) => format!("worker process exited: {status}"),
            _ => "worker process closed its output".to_string(),
        }
    }
}

#[async_trait]
impl WorkerSession for ProcessSession {
    async fn execute(&mut self, job: JobMessage) -> Result<Value, JobFault> {
        self.send(&job).await?;

        loop {
            let line = match self.stdout.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Err(JobFault::Fatal(self.exit_description())),
                Err(err) => {
                    return Err(JobFault::Fatal(format!(
                        "read from worker: {err}"
                    )))
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let reply: WorkerReply = serde_json::from_str(line).map_err(
                |err| JobFault::Fatal(format!("malformed worker reply: {err}")),
            )?;
            if reply.job_id != job.job_id {
                tracing::warn!(
                    expected = %job.job_id,
                    received = %reply.job_id,
                    "ignoring reply for another job"
                );
                continue;
            }

            return if reply.success {
                Ok(reply.result.unwrap_or(Value::Null))
            } else {
                Err(JobFault::Failed(reply.error.unwrap_or_else(|| {
                    "worker reported failure without a message".to_string()
                })))
            };
        }
    }

    async fn closed(&mut self) -> String {
        match self.child.wait().await {
            Ok(status) => format!("worker process exited while idle: {status}"),
            Err(err) => format!("wait on worker process: {err}"),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::job::{JobId, JobRequest};
    use serde_json::json;

    const ECHO_WORKER: &str = r#"
while read line; do
  id=$(echo "$line" | sed 's/.*"jobId":\([0-9]*\).*/\1/')
  case "$line" in
    *'"type":"fail"'*) echo "{\"jobId\":$id,\"success\":false,\"error\":\"unreadable\"}" ;;
    *) echo "{\"jobId\":$id,\"success\":true,\"result\":{\"worker\":\"$SHOAL_WORKER_ID\"}}" ;;
  esac
done
"#;

    fn job(id: u64, kind: &str) -> JobMessage {
        JobMessage::new(JobId(id), JobRequest::new(kind))
    }

    #[tokio::test]
    async fn exchanges_json_lines_with_child() {
        let program = CommandProgram::new("sh").arg("-c").arg(ECHO_WORKER);
        let mut session = program.start(WorkerId(2)).await.unwrap();

        let result = session.execute(job(1, "analyze")).await.unwrap();
        assert_eq!(result, json!({"worker": "2"}));

        let fault = session.execute(job(2, "fail")).await.unwrap_err();
        assert_eq!(fault, JobFault::Failed("unreadable".into()));

        let result = session.execute(job(3, "analyze")).await.unwrap();
        assert_eq!(result, json!({"worker": "2"}));
    }

    #[tokio::test]
    async fn child_exit_is_fatal() {
        let program = CommandProgram::new("sh")
            .arg("-c")
            .arg("read line; exit 3");
        let mut session = program.start(WorkerId(0)).await.unwrap();

        let fault = session.execute(job(1, "analyze")).await.unwrap_err();
        assert!(matches!(fault, JobFault::Fatal(_)), "got {fault:?}");
    }

    #[tokio::test]
    async fn idle_exit_resolves_closed() {
        let program = CommandProgram::new("sh").arg("-c").arg("exit 4");
        let mut session = program.start(WorkerId(0)).await.unwrap();

        let reason = tokio::time::timeout(std::time::Duration::from_secs(5), session.closed())
            .await
            .expect("closed should resolve once the child exits");
        assert!(reason.contains("exited while idle"), "got {reason}");
        assert!(reason.contains('4'), "got {reason}");
    }

    #[tokio::test]
    async fn garbage_output_is_fatal() {
        let program = CommandProgram::new("sh")
            .arg("-c")
            .arg("read line; echo not-json; sleep 5");
        let mut session = program.start(WorkerId(0)).await.unwrap();

        let fault = session.execute(job(1, "analyze")).await.unwrap_err();
        match fault {
            JobFault::Fatal(msg) => assert!(msg.contains("malformed")),
            other => panic!("expected fatal fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_fails_to_start() {
        let program = CommandProgram::new("/nonexistent/shoal-worker");
        let err = program.start(WorkerId(0)).await.err().unwrap();
        assert!(err.to_string().contains("failed to spawn"));
    }
}
