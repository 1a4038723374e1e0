//! End-to-end pool behaviour against scripted workers.
//!
//! Covers dispatch and queueing, deadlines, crash recovery, shutdown
//! draining and the counters exposed through `stats()`.

use std::time::{Duration, Instant};

use serde_json::json;
use shoal::{
    PoolConfig, PoolError, PoolEventKind, PoolState, PoolStats, WorkerPool,
};
use shoal_testkit::{ScriptLog, ScriptedProgram, TestJob};
use tokio::time::timeout;

fn start_pool(config: PoolConfig) -> (WorkerPool, ScriptLog) {
    let program = ScriptedProgram::new();
    let log = program.log();
    let pool = WorkerPool::start(config, program).expect("pool should start");
    (pool, log)
}

async fn wait_for_stats(
    pool: &WorkerPool,
    condition: impl Fn(&PoolStats) -> bool,
) -> PoolStats {
    let wait = timeout(Duration::from_secs(5), async {
        loop {
            let stats = pool.stats();
            if condition(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });
    match wait.await {
        Ok(stats) => stats,
        Err(_) => panic!("condition not reached, last stats: {:?}", pool.stats()),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn third_job_waits_for_a_free_worker() {
    let (pool, log) = start_pool(PoolConfig::new(2));
    let started = Instant::now();

    let a = pool.submit(TestJob::sleep(100).tagged("a").request()).unwrap();
    let b = pool.submit(TestJob::sleep(100).tagged("b").request()).unwrap();
    let c = pool.submit(TestJob::sleep(100).tagged("c").request()).unwrap();

    let stats = pool.stats();
    assert_eq!(stats.busy_workers, 2);
    assert_eq!(stats.queue_depth, 1);
    assert_eq!(stats.active_jobs, 3);

    let (a, b, c) = tokio::join!(a, b, c);
    let elapsed = started.elapsed();
    for output in [a, b, c] {
        assert_eq!(output.unwrap().result, json!({"sleptMs": 100}));
    }
    assert!(elapsed >= Duration::from_millis(190), "elapsed {elapsed:?}");

    let stats = pool.stats();
    assert_eq!(stats.total_processed, 3);
    assert_eq!(stats.total_failed, 0);
    assert_eq!(stats.peak_queue_depth, 1);
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(log.started_tags().last().map(String::as_str), Some("c"));
    assert_eq!(log.peak_concurrency(), 2);

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timed_out_job_is_rejected_and_worker_replaced() {
    let (pool, log) = start_pool(PoolConfig::new(2));
    let started = Instant::now();

    let err = pool
        .submit(
            TestJob::sleep(200)
                .with_timeout(Duration::from_millis(50))
                .request(),
        )
        .unwrap()
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, PoolError::Timeout { .. }), "got {err:?}");
    assert!(err.is_retryable());
    assert!(elapsed >= Duration::from_millis(50), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(180), "elapsed {elapsed:?}");

    let stats = pool.stats();
    assert_eq!(stats.total_failed, 1);
    assert_eq!(stats.total_timed_out, 1);

    let stats = wait_for_stats(&pool, |s| {
        s.worker_restarts == 1 && s.available_workers == 2
    })
    .await;
    assert_eq!(stats.busy_workers, 0);
    assert_eq!(stats.total_requeued, 0);
    assert_eq!(log.attempts().len(), 1);

    let output = pool.submit(TestJob::echo("after").request()).unwrap().await;
    assert_eq!(output.unwrap().result, json!("after"));

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crashed_job_is_requeued_and_completes() {
    let (pool, log) = start_pool(PoolConfig::new(2));
    let started = Instant::now();

    let output = pool
        .submit(TestJob::crash_once(30, 100).request())
        .unwrap()
        .await
        .expect("job should survive one crash");

    assert!(started.elapsed() >= Duration::from_millis(130));
    assert_eq!(output.attempts, 2);
    assert_eq!(output.result["recovered"], json!(true));
    assert_eq!(log.attempts()[&output.job_id], 2);

    let stats = pool.stats();
    assert_eq!(stats.total_processed, 1);
    assert_eq!(stats.total_failed, 0);
    assert_eq!(stats.total_requeued, 1);
    assert_eq!(stats.worker_restarts, 1);
    assert_eq!(log.sessions().len(), 3);

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_rejects_queued_and_finishes_active() {
    let (pool, _log) = start_pool(PoolConfig::new(1));

    let active = pool.submit(TestJob::sleep(100).request()).unwrap();
    let queued_a = pool.submit(TestJob::sleep(100).request()).unwrap();
    let queued_b = pool.submit(TestJob::sleep(100).request()).unwrap();
    let queued_ids = [queued_a.job_id(), queued_b.job_id()];

    let shutdown = tokio::spawn({
        let pool = pool.clone();
        async move { pool.shutdown(Duration::from_secs(2)).await }
    });

    for (queued, job_id) in [queued_a, queued_b].into_iter().zip(queued_ids) {
        let result = timeout(Duration::from_millis(80), queued)
            .await
            .expect("queued job should be rejected immediately");
        assert_eq!(result.unwrap_err(), PoolError::ShutDown { job_id });
    }

    let refused = pool.submit(TestJob::echo(1).request()).unwrap_err();
    assert!(refused.is_unavailable());

    let output = active.await.expect("active job finishes within grace");
    assert_eq!(output.result, json!({"sleptMs": 100}));

    let report = shutdown.await.unwrap();
    assert!(report.initiated);
    assert!(report.drained);
    assert_eq!(report.rejected_queued, 2);
    assert_eq!(report.abandoned, 0);
    assert_eq!(report.workers_terminated, 1);
    assert!(report.failures.is_empty());

    let stats = pool.stats();
    assert_eq!(stats.state, PoolState::Stopped);
    assert_eq!(stats.total_processed, 1);
    assert_eq!(stats.total_failed, 2);
    assert_eq!(stats.available_workers, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn grace_period_bounds_shutdown() {
    let (pool, _log) = start_pool(PoolConfig::new(1));
    let stuck = pool.submit(TestJob::hang().request()).unwrap();
    let job_id = stuck.job_id();

    let started = Instant::now();
    let report = pool.shutdown(Duration::from_millis(100)).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!report.drained);
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.workers_terminated, 1);
    assert_eq!(stuck.await.unwrap_err(), PoolError::ShutDown { job_id });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crash_during_shutdown_rejects_without_requeue() {
    let (pool, log) = start_pool(PoolConfig::new(1));
    let crashing = pool.submit(TestJob::crash(50).request()).unwrap();
    let job_id = crashing.job_id();

    let started = Instant::now();
    let report = pool.shutdown(Duration::from_secs(2)).await;

    assert!(started.elapsed() < Duration::from_secs(1), "waited {:?}", started.elapsed());
    assert!(report.drained);
    assert_eq!(report.abandoned, 0);
    assert_eq!(crashing.await.unwrap_err(), PoolError::ShutDown { job_id });

    let stats = pool.stats();
    assert_eq!(stats.state, PoolState::Stopped);
    assert_eq!(stats.total_requeued, 0);
    assert_eq!(stats.worker_restarts, 0);
    assert_eq!(stats.total_failed, 1);
    assert_eq!(log.sessions().len(), 1, "no replacement worker may start");
    assert_eq!(log.attempts()[&job_id], 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn busy_workers_never_exceed_pool_size() {
    let (pool, log) = start_pool(PoolConfig::new(3));

    let pending: Vec<_> = (0..12)
        .map(|_| pool.submit(TestJob::sleep(20).request()).unwrap())
        .collect();
    assert!(pool.stats().busy_workers <= 3);

    for result in futures::future::join_all(pending).await {
        result.unwrap();
    }

    assert_eq!(log.peak_concurrency(), 3);
    let stats = pool.stats();
    assert_eq!(stats.total_processed, 12);
    assert_eq!(stats.peak_queue_depth, 9);

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_jobs_start_in_submission_order() {
    let (pool, log) = start_pool(PoolConfig::new(1));

    let mut pending = vec![pool
        .submit(TestJob::sleep(50).tagged("blocker").request())
        .unwrap()];
    for tag in ["a", "b", "c", "d"] {
        pending.push(
            pool.submit(TestJob::sleep(1).tagged(tag).request())
                .unwrap(),
        );
    }
    for result in futures::future::join_all(pending).await {
        result.unwrap();
    }

    assert_eq!(log.started_tags(), vec!["blocker", "a", "b", "c", "d"]);
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crash_loop_stops_at_retry_ceiling() {
    let (pool, log) = start_pool(
        PoolConfig::new(1)
            .with_max_crash_retries(2)
            .with_restart_backoff(Duration::from_millis(5), Duration::from_millis(20)),
    );

    let err = pool
        .submit(TestJob::crash(5).request())
        .unwrap()
        .await
        .unwrap_err();

    match err {
        PoolError::WorkerCrashed { attempts, ref reason, .. } => {
            assert_eq!(attempts, 3);
            assert!(reason.contains("scripted crash"), "reason {reason}");
        }
        other => panic!("expected crash error, got {other:?}"),
    }
    assert_eq!(log.attempts().values().copied().collect::<Vec<_>>(), vec![3]);

    let stats = wait_for_stats(&pool, |s| s.available_workers == 1).await;
    assert_eq!(stats.total_requeued, 2);
    assert_eq!(stats.worker_restarts, 3);
    assert_eq!(stats.total_failed, 1);

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_panic_counts_as_crash() {
    let (pool, _log) = start_pool(PoolConfig::new(1).with_max_crash_retries(0));

    let err = pool
        .submit(TestJob::panic("parser blew up").request())
        .unwrap()
        .await
        .unwrap_err();

    match err {
        PoolError::WorkerCrashed { attempts, reason, .. } => {
            assert_eq!(attempts, 1);
            assert!(reason.contains("parser blew up"), "reason {reason}");
        }
        other => panic!("expected crash error, got {other:?}"),
    }

    wait_for_stats(&pool, |s| s.available_workers == 1).await;
    let output = pool.submit(TestJob::echo(5).request()).unwrap().await;
    assert_eq!(output.unwrap().result, json!(5));

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_job_can_time_out_without_a_worker() {
    let (pool, log) = start_pool(PoolConfig::new(1));

    let blocker = pool.submit(TestJob::sleep(150).request()).unwrap();
    let waiting = pool
        .submit(
            TestJob::echo("late")
                .with_timeout(Duration::from_millis(40))
                .request(),
        )
        .unwrap();

    assert!(matches!(
        waiting.await.unwrap_err(),
        PoolError::Timeout { .. }
    ));
    assert_eq!(pool.stats().queue_depth, 0);

    blocker.await.unwrap();
    let stats = pool.stats();
    assert_eq!(stats.worker_restarts, 0);
    assert_eq!(stats.total_processed, 1);
    assert_eq!(stats.total_timed_out, 1);
    assert_eq!(log.attempts().len(), 1);

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn execution_errors_surface_verbatim() {
    let (pool, _log) = start_pool(PoolConfig::new(2));

    let err = pool
        .submit(TestJob::fail("encrypted pdf").request())
        .unwrap()
        .await
        .unwrap_err();

    let job_id = err.job_id().expect("execution errors carry a job id");
    assert_eq!(err.to_string(), format!("job {job_id} failed: encrypted pdf"));
    assert!(!err.is_retryable());

    let stats = pool.stats();
    assert_eq!(stats.total_failed, 1);
    assert_eq!(stats.worker_restarts, 0);
    assert_eq!(stats.available_workers, 2);

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn counters_match_resolved_jobs() {
    let (pool, _log) = start_pool(PoolConfig::new(2));

    let jobs = vec![
        TestJob::echo(1),
        TestJob::fail("bad"),
        TestJob::sleep(10),
        TestJob::hang().with_timeout(Duration::from_millis(30)),
        TestJob::crash_once(5, 5),
        TestJob::echo(2),
    ];
    let pending: Vec<_> = jobs
        .iter()
        .map(|job| pool.submit(job.request()).unwrap())
        .collect();
    let results = futures::future::join_all(pending).await;

    let succeeded = results.iter().filter(|r| r.is_ok()).count() as u64;
    let failed = results.iter().filter(|r| r.is_err()).count() as u64;
    assert_eq!(succeeded, 4);
    assert_eq!(failed, 2);

    let stats = pool.stats();
    assert_eq!(stats.total_processed, succeeded);
    assert_eq!(stats.total_failed, failed);
    assert_eq!(stats.total_resolved(), jobs.len() as u64);
    assert_eq!(stats.active_jobs, 0);

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_worker_starts_are_retried_with_backoff() {
    let program = ScriptedProgram::new().fail_next_starts(2);
    let log = program.log();
    let pool = WorkerPool::start(
        PoolConfig::new(1)
            .with_restart_backoff(Duration::from_millis(10), Duration::from_millis(50)),
        program,
    )
    .unwrap();

    wait_for_stats(&pool, |s| s.worker_restarts == 2).await;
    let output = pool.submit(TestJob::echo("ok").request()).unwrap().await;
    assert_eq!(output.unwrap().result, json!("ok"));

    let stats = pool.stats();
    assert_eq!(stats.worker_restarts, 2);
    assert_eq!(stats.total_requeued, 0);
    assert_eq!(log.sessions().len(), 1);

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lifecycle_events_follow_a_job() {
    let (pool, _log) = start_pool(PoolConfig::new(1));
    let mut events = pool.subscribe();

    let output = pool.submit(TestJob::echo("hi").request()).unwrap().await.unwrap();
    let job_id = output.job_id;

    let mut kinds = Vec::new();
    while kinds.len() < 3 {
        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event should arrive")
            .expect("bus open");
        kinds.push(event.kind);
    }

    assert!(matches!(
        kinds[0],
        PoolEventKind::Submitted { job_id: id, .. } if id == job_id
    ));
    assert!(matches!(
        kinds[1],
        PoolEventKind::Dispatched { job_id: id, attempt: 1, .. } if id == job_id
    ));
    assert!(matches!(
        kinds[2],
        PoolEventKind::Completed { job_id: id, .. } if id == job_id
    ));

    pool.shutdown(Duration::from_secs(1)).await;
    let mut saw_stopped = false;
    while let Ok(Ok(event)) =
        timeout(Duration::from_millis(200), events.recv()).await
    {
        if event.kind == PoolEventKind::Stopped {
            saw_stopped = true;
            break;
        }
    }
    assert!(saw_stopped);
}
