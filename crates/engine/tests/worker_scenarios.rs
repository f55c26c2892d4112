//! End-to-end worker scenarios against the in-memory store: success,
//! retries, exhaustion, recurrence, dependencies, timeouts, and drain.
//!
//! Timings are short but real; every wait polls the store with a generous
//! deadline instead of assuming exact schedules.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use chronos_core::{
    BackoffStrategy, ErrorCode, ExecutionStatus, JobId, JobStatus, NewJob, RetryPolicy, Schedule,
    WorkerId,
};
use chronos_engine::{
    HandlerContext, HandlerError, HandlerRegistry, Worker, WorkerConfig, WorkerEvent,
};
use chronos_store::{JobStore, MemoryJobStore};

fn test_registry() -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("echo", |ctx: HandlerContext| async move { Ok(ctx.payload) });
    registry.register_fn("delay", |ctx: HandlerContext| async move {
        let ms = ctx.payload.get("ms").and_then(|v| v.as_u64()).unwrap_or(100);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(ctx.payload)
    });
    registry.register_fn("always-fail", |_ctx: HandlerContext| async move {
        Err(HandlerError::new("boom: downstream exploded"))
    });
    // Fails while attempt < payload.failures, then succeeds.
    registry.register_fn("fail-n-times", |ctx: HandlerContext| async move {
        let failures = ctx.payload.get("failures").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
        if ctx.attempt < failures {
            Err(HandlerError::new(format!("transient failure on attempt {}", ctx.attempt)))
        } else {
            Ok(serde_json::json!({"recovered_after": ctx.attempt}))
        }
    });
    registry.register_fn("bad-input", |_ctx: HandlerContext| async move {
        Err(HandlerError::new("validation failed: payload is missing 'to'"))
    });
    registry.register_fn("never-returns", |_ctx: HandlerContext| async move {
        std::future::pending::<()>().await;
        unreachable!()
    });
    Arc::new(registry)
}

fn fast_config(id: &str) -> WorkerConfig {
    WorkerConfig {
        worker_id: WorkerId::new(id),
        poll_interval: Duration::from_millis(50),
        concurrency: 5,
        lock_timeout_ms: 300_000,
        stale_sweep_interval: Duration::from_secs(3600),
        drain_timeout: Duration::from_secs(2),
    }
}

fn start_worker(store: &Arc<MemoryJobStore>, id: &str) -> Arc<Worker> {
    let worker = Worker::new(store.clone(), store.clone(), test_registry(), fast_config(id));
    worker.start();
    worker
}

fn one_time(name: &str, task_type: &str, in_ms: i64) -> NewJob {
    NewJob::new(
        name,
        task_type,
        Schedule::Once {
            at: Utc::now() + ChronoDuration::milliseconds(in_ms),
        },
    )
    .with_retry(RetryPolicy::no_retry())
}

async fn wait_until<F, Fut>(deadline: Duration, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = tokio::time::Instant::now();
    loop {
        if probe().await {
            return;
        }
        if started.elapsed() > deadline {
            panic!("condition not reached within {deadline:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_for_status(
    store: &Arc<MemoryJobStore>,
    job_id: JobId,
    status: JobStatus,
    deadline: Duration,
) {
    let store = store.clone();
    wait_until(deadline, move || {
        let store = store.clone();
        async move {
            store
                .get_job(job_id)
                .await
                .unwrap()
                .is_some_and(|j| j.status == status)
        }
    })
    .await;
}

#[tokio::test]
async fn one_time_job_runs_once_and_completes() {
    let store = Arc::new(MemoryJobStore::new());
    let job = store
        .insert_job(one_time("echo-once", "echo", 100).with_payload(serde_json::json!({"x": 1})))
        .await
        .unwrap();

    let worker = start_worker(&store, "w1");
    wait_for_status(&store, job.id, JobStatus::Completed, Duration::from_secs(5)).await;
    worker.stop().await;

    let done = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(done.retry_count, 0);
    assert_eq!(done.last_result, Some(serde_json::json!({"x": 1})));
    assert!(done.last_error.is_none());
    assert!(done.locked_by.is_none() && done.locked_at.is_none());
    assert!(done.expire_at.is_some());
    assert!(done.next_run_at.is_none());

    let logs = store.logs_for_job(job.id, 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, ExecutionStatus::Success);
    assert_eq!(logs[0].result, Some(serde_json::json!({"x": 1})));
    assert_eq!(logs[0].attempt, 0);
    assert!(!logs[0].is_retry);
    assert!(logs[0].finished_at.is_some());

    let stats = worker.stats();
    assert_eq!(stats.jobs_processed, 1);
    assert_eq!(stats.jobs_succeeded, 1);
    assert_eq!(stats.active_jobs, 0);
}

#[tokio::test]
async fn transient_failures_retry_then_succeed() {
    let store = Arc::new(MemoryJobStore::new());
    let job = store
        .insert_job(
            one_time("flaky", "fail-n-times", 50)
                .with_payload(serde_json::json!({"failures": 2}))
                .with_retry(RetryPolicy {
                    max_retries: 5,
                    base_delay_ms: 1_000,
                    max_delay_ms: 3_600_000,
                    strategy: BackoffStrategy::Exponential,
                    jitter: false,
                    jitter_factor: 0.0,
                }),
        )
        .await
        .unwrap();

    let worker = start_worker(&store, "w1");
    // Attempts land at roughly t, t+1s, t+3s.
    wait_for_status(&store, job.id, JobStatus::Completed, Duration::from_secs(15)).await;
    worker.stop().await;

    let done = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(done.retry_count, 2);
    assert_eq!(done.last_result, Some(serde_json::json!({"recovered_after": 2})));

    let mut logs = store.logs_for_job(job.id, 10).await.unwrap();
    logs.reverse(); // oldest first
    assert_eq!(logs.len(), 3);
    let attempts: Vec<u32> = logs.iter().map(|l| l.attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2]);
    assert_eq!(logs[0].status, ExecutionStatus::Failed);
    assert_eq!(logs[1].status, ExecutionStatus::Failed);
    assert_eq!(logs[2].status, ExecutionStatus::Success);
    assert!(!logs[0].is_retry);
    assert!(logs[1].is_retry && logs[2].is_retry);
    assert_eq!(logs[0].metadata["willRetry"], serde_json::json!(true));
    assert_eq!(logs[0].metadata["remainingRetries"], serde_json::json!(4));

    let stats = worker.stats();
    assert_eq!(stats.total_retries, 2);
    assert_eq!(stats.successful_retries, 1);
}

#[tokio::test]
async fn retries_exhaust_into_failed() {
    let store = Arc::new(MemoryJobStore::new());
    let job = store
        .insert_job(
            one_time("doomed", "always-fail", 50).with_retry(RetryPolicy {
                max_retries: 2,
                base_delay_ms: 1_000,
                max_delay_ms: 1_000,
                strategy: BackoffStrategy::Fixed,
                jitter: false,
                jitter_factor: 0.0,
            }),
        )
        .await
        .unwrap();

    let worker = start_worker(&store, "w1");
    wait_for_status(&store, job.id, JobStatus::Failed, Duration::from_secs(15)).await;
    worker.stop().await;

    let done = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(done.retry_count, 2);
    assert!(done.last_error.as_deref().unwrap().contains("boom"));
    assert!(done.locked_by.is_none());

    // Retry bound: maxRetries + 1 attempts, no more.
    let logs = store.logs_for_job(job.id, 10).await.unwrap();
    assert_eq!(logs.len(), 3);
    assert!(logs.iter().all(|l| l.status == ExecutionStatus::Failed));
    let last = &logs[0];
    assert_eq!(last.metadata["willRetry"], serde_json::json!(false));
    assert_eq!(last.metadata["reason"], serde_json::json!("retries_exhausted"));
}

#[tokio::test]
async fn non_retryable_errors_skip_the_retry_budget() {
    let store = Arc::new(MemoryJobStore::new());
    let job = store
        .insert_job(
            one_time("rejected", "bad-input", 50).with_retry(RetryPolicy {
                max_retries: 5,
                base_delay_ms: 1_000,
                ..RetryPolicy::default()
            }),
        )
        .await
        .unwrap();

    let worker = start_worker(&store, "w1");
    wait_for_status(&store, job.id, JobStatus::Failed, Duration::from_secs(5)).await;
    worker.stop().await;

    let logs = store.logs_for_job(job.id, 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].error_code, Some(ErrorCode::ValidationError));
    assert_eq!(logs[0].metadata["reason"], serde_json::json!("non_retryable"));
}

#[tokio::test]
async fn missing_handler_fails_without_retry() {
    let store = Arc::new(MemoryJobStore::new());
    let job = store
        .insert_job(
            one_time("orphan", "no-such-task", 50).with_retry(RetryPolicy {
                max_retries: 3,
                ..RetryPolicy::default()
            }),
        )
        .await
        .unwrap();

    let worker = start_worker(&store, "w1");
    wait_for_status(&store, job.id, JobStatus::Failed, Duration::from_secs(5)).await;
    worker.stop().await;

    let logs = store.logs_for_job(job.id, 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].error_code, Some(ErrorCode::HandlerError));
    assert!(logs[0].error.as_deref().unwrap().contains("no handler registered"));
}

#[tokio::test]
async fn recurring_interval_job_advances_monotonically() {
    let store = Arc::new(MemoryJobStore::new());
    let job = store
        .insert_job(
            NewJob::new("heartbeat", "echo", Schedule::Every { interval_ms: 1_000 })
                .with_retry(RetryPolicy::no_retry()),
        )
        .await
        .unwrap();

    let worker = start_worker(&store, "w1");
    let probe_store = store.clone();
    let job_id = job.id;
    wait_until(Duration::from_secs(15), move || {
        let store = probe_store.clone();
        async move { store.logs_for_job(job_id, 10).await.unwrap().len() >= 3 }
    })
    .await;
    worker.stop().await;

    let current = store.get_job(job.id).await.unwrap().unwrap();
    // Still recurring: back to SCHEDULED with a future occurrence.
    assert_eq!(current.status, JobStatus::Scheduled);
    let next = current.next_run_at.expect("recurring job keeps a next run");
    assert!(next > current.last_run_at.unwrap());

    let mut logs = store.logs_for_job(job.id, 10).await.unwrap();
    logs.reverse();
    assert!(logs.iter().all(|l| l.status == ExecutionStatus::Success));
    // Successive occurrences are strictly increasing.
    for pair in logs.windows(2) {
        assert!(pair[1].scheduled_for.unwrap() > pair[0].scheduled_for.unwrap());
    }
}

#[tokio::test]
async fn recurring_job_completes_past_end_time() {
    let store = Arc::new(MemoryJobStore::new());
    let job = store
        .insert_job(
            NewJob::new("bounded", "echo", Schedule::Every { interval_ms: 1_000 })
                .with_end_time(Utc::now() + ChronoDuration::milliseconds(1_500))
                .with_retry(RetryPolicy::no_retry()),
        )
        .await
        .unwrap();

    let worker = start_worker(&store, "w1");
    // One occurrence fits before end_time; the recomputed next one does not.
    wait_for_status(&store, job.id, JobStatus::Completed, Duration::from_secs(10)).await;
    worker.stop().await;

    let done = store.get_job(job.id).await.unwrap().unwrap();
    assert!(done.next_run_at.is_none());
    assert!(done.expire_at.is_some());
}

#[tokio::test]
async fn two_workers_never_run_the_same_occurrence_twice() {
    let store = Arc::new(MemoryJobStore::new());
    let job = store
        .insert_job(
            one_time("contended", "delay", 100).with_payload(serde_json::json!({"ms": 200})),
        )
        .await
        .unwrap();

    let w1 = start_worker(&store, "w1");
    let w2 = start_worker(&store, "w2");
    wait_for_status(&store, job.id, JobStatus::Completed, Duration::from_secs(5)).await;
    w1.stop().await;
    w2.stop().await;

    let logs = store.logs_for_job(job.id, 10).await.unwrap();
    assert_eq!(logs.len(), 1, "exactly one worker may run the job");

    let total = w1.stats().jobs_processed + w2.stats().jobs_processed;
    assert_eq!(total, 1);
}

#[tokio::test]
async fn dependent_job_runs_after_parent_completes() {
    let store = Arc::new(MemoryJobStore::new());
    let parent = store
        .insert_job(one_time("parent", "echo", 100).with_payload(serde_json::json!({"p": true})))
        .await
        .unwrap();
    let child = store
        .insert_job(one_time("child", "echo", 100).depends_on(parent.id))
        .await
        .unwrap();
    assert_eq!(child.status, JobStatus::Waiting);

    let worker = start_worker(&store, "w1");
    wait_for_status(&store, child.id, JobStatus::Completed, Duration::from_secs(10)).await;
    worker.stop().await;

    let parent_logs = store.logs_for_job(parent.id, 10).await.unwrap();
    let child_logs = store.logs_for_job(child.id, 10).await.unwrap();
    assert_eq!(parent_logs.len(), 1);
    assert_eq!(child_logs.len(), 1);
    // The child was only scheduled after the parent finished.
    assert!(child_logs[0].started_at >= parent_logs[0].finished_at.unwrap());
}

#[tokio::test]
async fn dependent_job_is_blocked_when_parent_fails() {
    let store = Arc::new(MemoryJobStore::new());
    let parent = store
        .insert_job(one_time("failing-parent", "always-fail", 50))
        .await
        .unwrap();
    let child = store
        .insert_job(one_time("blocked-child", "echo", 50).depends_on(parent.id))
        .await
        .unwrap();

    let worker = start_worker(&store, "w1");
    wait_for_status(&store, child.id, JobStatus::Blocked, Duration::from_secs(5)).await;
    worker.stop().await;

    let blocked = store.get_job(child.id).await.unwrap().unwrap();
    assert!(blocked
        .last_error
        .as_deref()
        .unwrap()
        .contains(&parent.id.to_string()));
    // The child never ran.
    assert!(store.logs_for_job(child.id, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn hung_handler_times_out_and_releases_the_lock() {
    let store = Arc::new(MemoryJobStore::new());
    let job = store
        .insert_job(one_time("hung", "never-returns", 50).with_lock_timeout_ms(500))
        .await
        .unwrap();

    let worker = start_worker(&store, "w1");
    wait_for_status(&store, job.id, JobStatus::Failed, Duration::from_secs(5)).await;
    worker.stop().await;

    let done = store.get_job(job.id).await.unwrap().unwrap();
    assert!(done.locked_by.is_none());
    assert!(done.last_error.as_deref().unwrap().contains("timeout"));

    let logs = store.logs_for_job(job.id, 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, ExecutionStatus::Timeout);
    assert_eq!(logs[0].error_code, Some(ErrorCode::Timeout));
    assert!(logs[0].finished_at.is_some());
}

#[tokio::test]
async fn stop_drains_and_releases_unfinished_work() {
    let store = Arc::new(MemoryJobStore::new());
    let job = store
        .insert_job(
            one_time("long-haul", "delay", 50).with_payload(serde_json::json!({"ms": 30_000})),
        )
        .await
        .unwrap();

    let mut config = fast_config("w1");
    config.drain_timeout = Duration::from_millis(300);
    let worker = Worker::new(store.clone(), store.clone(), test_registry(), config);
    worker.start();

    // Wait for the claim, then stop mid-execution.
    wait_for_status(&store, job.id, JobStatus::Running, Duration::from_secs(5)).await;
    worker.stop().await;

    let released = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(released.status, JobStatus::Scheduled);
    assert!(released.locked_by.is_none());
}

#[tokio::test]
async fn paused_worker_stops_picking_until_resumed() {
    let store = Arc::new(MemoryJobStore::new());
    let worker = start_worker(&store, "w1");
    worker.pause();

    let job = store.insert_job(one_time("held-back", "echo", 50)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        store.get_job(job.id).await.unwrap().unwrap().status,
        JobStatus::Scheduled
    );

    worker.resume();
    wait_for_status(&store, job.id, JobStatus::Completed, Duration::from_secs(5)).await;
    worker.stop().await;
}

#[tokio::test]
async fn lifecycle_events_are_emitted_in_order() {
    let store = Arc::new(MemoryJobStore::new());
    let worker = Worker::new(store.clone(), store.clone(), test_registry(), fast_config("w1"));
    let mut events = worker.subscribe();
    worker.start();

    let job = store
        .insert_job(one_time("observed", "echo", 50).with_payload(serde_json::json!({"ok": 1})))
        .await
        .unwrap();
    wait_for_status(&store, job.id, JobStatus::Completed, Duration::from_secs(5)).await;
    worker.stop().await;

    let mut saw_started = false;
    let mut saw_job_start = false;
    let mut saw_job_complete = false;
    let mut saw_stopped = false;
    while let Ok(event) = events.try_recv() {
        match event {
            WorkerEvent::Started { .. } => saw_started = true,
            WorkerEvent::JobStart { job_id, attempt, .. } => {
                assert_eq!(job_id, job.id);
                assert_eq!(attempt, 0);
                assert!(saw_started);
                saw_job_start = true;
            }
            WorkerEvent::JobComplete { job_id, result, .. } => {
                assert_eq!(job_id, job.id);
                assert_eq!(result, serde_json::json!({"ok": 1}));
                assert!(saw_job_start);
                saw_job_complete = true;
            }
            WorkerEvent::Stopped { .. } => saw_stopped = true,
            _ => {}
        }
    }
    assert!(saw_started && saw_job_start && saw_job_complete && saw_stopped);
}
