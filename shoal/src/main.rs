mod cli;

use anyhow::Context;
use clap::Parser;
use serde_json::{json, Value};
use shoal::{JobRequest, WorkerPool};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{error_line, outcome_line, CliArgs, RunConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&args.log)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = RunConfig::try_from(args)?;
    #[cfg(feature = "metrics")]
    shoal::metrics::init_metrics()?;

    info!(
        workers = config.pool.size,
        timeout_ms = config.pool.default_timeout.as_millis() as u64,
        "Starting worker pool"
    );
    let grace = config.pool.shutdown_grace;
    let pool = WorkerPool::start(config.pool, config.program)?;

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_lines(out_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut interrupted = false;
    loop {
        tokio::select! {
            () = &mut shutdown => {
                interrupted = true;
                break;
            }
            line = lines.next_line() => {
                match line.context("failed to read job from stdin")? {
                    Some(line) => submit_line(&pool, &line, &out_tx, &mut in_flight),
                    None => {
                        info!("stdin closed");
                        break;
                    }
                }
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(err) = joined {
                    warn!(error = %err, "result task failed");
                }
            }
        }
    }

    let report = pool.shutdown(grace).await;
    while let Some(joined) = in_flight.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "result task failed");
        }
    }

    let _ = out_tx.send(json!({ "stats": pool.stats(), "shutdown": report }));
    drop(out_tx);
    writer.await.context("stdout writer panicked")??;

    #[cfg(feature = "metrics")]
    info!(metrics = %shoal::metrics::gather_metrics()?, "Final metrics");

    if interrupted {
        // The blocking stdin read cannot be cancelled and would hold the
        // runtime open until the next line arrives.
        std::process::exit(0);
    }
    Ok(())
}

/// Parse one stdin line and submit it. Its outcome is written when the job
/// resolves.
fn submit_line(
    pool: &WorkerPool,
    line: &str,
    out: &mpsc::UnboundedSender<Value>,
    in_flight: &mut JoinSet<()>,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let request = serde_json::from_str::<Value>(line)
        .map_err(anyhow::Error::from)
        .and_then(JobRequest::from_value);
    let request = match request {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "Ignoring malformed job");
            let _ = out.send(error_line(None, "invalid", &format!("{err:#}")));
            return;
        }
    };

    match pool.submit(request) {
        Ok(pending) => {
            let out = out.clone();
            in_flight.spawn(async move {
                let job_id = pending.job_id();
                let _ = out.send(outcome_line(job_id, pending.await));
            });
        }
        Err(err) => {
            let _ = out.send(error_line(err.job_id(), err.status(), &err.to_string()));
        }
    }
}

async fn write_lines(mut lines: mpsc::UnboundedReceiver<Value>) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.recv().await {
        let mut encoded = serde_json::to_vec(&line)?;
        encoded.push(b'\n');
        stdout.write_all(&encoded).await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
