//! Basic worker pool example.
//!
//! Runs a synchronous "document parser" on two workers and shows:
//! - queuing when every worker is busy
//! - per-job timeouts replacing the stuck worker
//! - execution errors surfacing to the caller
//! - graceful shutdown with a final report
//!
//! For external worker processes see the `shoal` binary.

use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use shoal::{BlockingProgram, JobFault, JobRequest, PoolConfig, PoolEventKind, WorkerPool};

fn parse_document(job: &shoal::JobMessage) -> Result<serde_json::Value, JobFault> {
    let pages = job.field("pages").and_then(|v| v.as_u64()).unwrap_or(1);
    if pages == 0 {
        return Err(JobFault::Failed("document has no pages".to_string()));
    }
    std::thread::sleep(Duration::from_millis(50 * pages));
    Ok(json!({ "type": job.kind, "pages": pages, "words": pages * 320 }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("=== Shoal Worker Pool Example ===\n");

    let config = PoolConfig::new(2)
        .with_default_timeout(Duration::from_secs(2))
        .with_shutdown_grace(Duration::from_secs(5));
    let pool = WorkerPool::start(config, BlockingProgram::new(parse_document))?;

    let mut events = pool.subscribe();
    let watcher = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event.kind {
                PoolEventKind::TimedOut { job_id, .. } => {
                    println!("   [event] job {job_id} timed out")
                }
                PoolEventKind::WorkerExited { worker_id, reason, .. } => {
                    println!("   [event] worker {worker_id} exited: {reason}")
                }
                PoolEventKind::Stopped => break,
                _ => {}
            }
        }
    });

    println!("1. Submitting four documents to two workers...");
    let pending: Vec<_> = (1..=4)
        .map(|pages| {
            pool.submit(JobRequest::new("parse").with_field("pages", pages))
        })
        .collect::<Result<_, _>>()?;
    println!("   Queue depth right after submit: {}", pool.stats().queue_depth);

    for result in join_all(pending).await {
        let output = result?;
        println!(
            "   Job {} parsed in {:?}: {}",
            output.job_id, output.processing_time, output.result
        );
    }

    println!("\n2. Submitting a document that outlives its timeout...");
    let slow = JobRequest::new("parse")
        .with_field("pages", 20)
        .with_timeout(Duration::from_millis(200));
    match pool.submit(slow)?.await {
        Ok(output) => println!("   Unexpected success: {}", output.result),
        Err(err) => println!("   Rejected ({}): {err}", err.status()),
    }

    println!("\n3. Submitting an empty document...");
    match pool.submit(JobRequest::new("parse").with_field("pages", 0))?.await {
        Ok(output) => println!("   Unexpected success: {}", output.result),
        Err(err) => println!("   Rejected ({}): {err}", err.status()),
    }

    println!("\n4. Shutting down...");
    let report = pool.close().await;
    println!("   Drained: {}", report.drained);
    println!("   Workers terminated: {}", report.workers_terminated);
    println!("   Final stats: {}", serde_json::to_string_pretty(&pool.stats())?);

    watcher.await?;
    println!("\n=== Example Complete ===");
    Ok(())
}
