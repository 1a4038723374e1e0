use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use serde_json::{json, Value};
use shoal::{CommandProgram, JobId, JobOutput, PoolConfig, PoolError};

/// Run a pool of line-protocol worker processes fed from stdin.
///
/// Each stdin line is a JSON job `{"type": ..., ...}`. Each result is
/// written to stdout as one JSON line once the job resolves.
#[derive(Parser, Debug)]
#[command(name = "shoal", version, about)]
pub struct CliArgs {
    /// JSON file with a pool configuration (env: SHOAL_CONFIG). Flags below
    /// override its values.
    #[arg(long, env = "SHOAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of worker processes (env: SHOAL_WORKERS)
    #[arg(long, short = 'w', env = "SHOAL_WORKERS")]
    pub workers: Option<usize>,

    /// Default per-job timeout in milliseconds (env: SHOAL_JOB_TIMEOUT_MS)
    #[arg(long, env = "SHOAL_JOB_TIMEOUT_MS")]
    pub job_timeout_ms: Option<u64>,

    /// Shutdown grace period in milliseconds (env: SHOAL_SHUTDOWN_GRACE_MS)
    #[arg(long, env = "SHOAL_SHUTDOWN_GRACE_MS")]
    pub shutdown_grace_ms: Option<u64>,

    /// Requeues allowed after worker crashes before a job fails
    /// (env: SHOAL_MAX_CRASH_RETRIES)
    #[arg(long, env = "SHOAL_MAX_CRASH_RETRIES")]
    pub max_crash_retries: Option<u32>,

    /// Working directory for worker processes (env: SHOAL_WORKER_DIR)
    #[arg(long, env = "SHOAL_WORKER_DIR")]
    pub worker_dir: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log: String,

    /// Worker command and its arguments
    #[arg(required = true, trailing_var_arg = true, num_args = 1..)]
    pub command: Vec<String>,
}

/// Everything the binary needs to start a pool.
#[derive(Debug)]
pub struct RunConfig {
    pub pool: PoolConfig,
    pub program: CommandProgram,
}

impl TryFrom<CliArgs> for RunConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> anyhow::Result<Self> {
        let mut pool = match &args.config {
            Some(path) => load_config(path)?,
            None => PoolConfig::default(),
        };
        if let Some(workers) = args.workers {
            pool.size = workers;
        }
        if let Some(ms) = args.job_timeout_ms {
            pool.default_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = args.shutdown_grace_ms {
            pool.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(retries) = args.max_crash_retries {
            pool.max_crash_retries = retries;
        }
        pool.validate()?;

        let Some((program, rest)) = args.command.split_first() else {
            bail!("a worker command is required");
        };
        if program.trim().is_empty() {
            bail!("worker command must not be empty");
        }
        let mut command = CommandProgram::new(program).args(rest);
        if let Some(dir) = args.worker_dir {
            command = command.current_dir(dir);
        }

        Ok(Self {
            pool,
            program: command,
        })
    }
}

fn load_config(path: &PathBuf) -> anyhow::Result<PoolConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid pool configuration in {}", path.display()))
}

/// Output line for a resolved job.
pub fn outcome_line(job_id: JobId, outcome: Result<JobOutput, PoolError>) -> Value {
    match outcome {
        Ok(output) => json!({
            "jobId": output.job_id,
            "success": true,
            "result": output.result,
            "processingTimeMs": output.processing_time.as_millis() as u64,
            "attempts": output.attempts,
        }),
        Err(err) => error_line(Some(job_id), err.status(), &err.to_string()),
    }
}

/// Output line for a job that failed before or after submission.
pub fn error_line(job_id: Option<JobId>, status: &str, error: &str) -> Value {
    json!({
        "jobId": job_id,
        "success": false,
        "status": status,
        "error": error,
    })
}
