//! Claim-protocol properties exercised directly against the picker and the
//! in-memory store: exclusive pickup, ordering, voluntary release, and
//! stale-lock recovery.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use chronos_core::{JobStatus, NewJob, RetryPolicy, Schedule, WorkerId};
use chronos_engine::JobPicker;
use chronos_store::{JobFilter, JobStore, JobUpdate, MemoryJobStore};

fn due_shortly(name: &str) -> NewJob {
    NewJob::new(
        name,
        "echo",
        Schedule::Once {
            at: Utc::now() + ChronoDuration::milliseconds(50),
        },
    )
    .with_retry(RetryPolicy::no_retry())
}

async fn make_due(store: &MemoryJobStore, job_id: chronos_core::JobId) {
    // Pull next_run_at into the past instead of sleeping.
    store
        .find_one_and_update(
            JobFilter::by_id(job_id),
            JobUpdate::new().set_next_run_at(Some(Utc::now() - ChronoDuration::seconds(1))),
            None,
        )
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() {
    let store = Arc::new(MemoryJobStore::new());
    let picker_a = JobPicker::new(store.clone(), WorkerId::new("a"));
    let picker_b = JobPicker::new(store.clone(), WorkerId::new("b"));

    for round in 0..20 {
        let job = store
            .insert_job(due_shortly(&format!("contended-{round}")))
            .await
            .unwrap();
        make_due(&store, job.id).await;

        let (a, b) = tokio::join!(picker_a.pick_one(), picker_b.pick_one());
        let a = a.unwrap();
        let b = b.unwrap();
        assert!(
            a.is_some() ^ b.is_some(),
            "round {round}: expected exactly one winner, got a={:?} b={:?}",
            a.map(|j| j.id),
            b.map(|j| j.id)
        );
    }
}

#[tokio::test]
async fn claim_order_is_priority_then_oldest_due() {
    let store = Arc::new(MemoryJobStore::new());
    let picker = JobPicker::new(store.clone(), WorkerId::new("w"));

    let late_low = store
        .insert_job(due_shortly("late-low").with_priority(8))
        .await
        .unwrap();
    let early_low = store
        .insert_job(due_shortly("early-low").with_priority(8))
        .await
        .unwrap();
    let high = store
        .insert_job(due_shortly("high").with_priority(2))
        .await
        .unwrap();

    // Stagger due times: early_low due before late_low.
    for (id, secs_ago) in [(late_low.id, 1), (early_low.id, 30), (high.id, 10)] {
        store
            .find_one_and_update(
                JobFilter::by_id(id),
                JobUpdate::new()
                    .set_next_run_at(Some(Utc::now() - ChronoDuration::seconds(secs_ago))),
                None,
            )
            .await
            .unwrap();
    }

    let order: Vec<_> = picker
        .pick_many(3)
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(order, vec![high.id, early_low.id, late_low.id]);
}

#[tokio::test]
async fn pick_many_stops_at_first_empty_pick() {
    let store = Arc::new(MemoryJobStore::new());
    let picker = JobPicker::new(store.clone(), WorkerId::new("w"));

    let job = store.insert_job(due_shortly("single")).await.unwrap();
    make_due(&store, job.id).await;

    let picked = picker.pick_many(5).await.unwrap();
    assert_eq!(picked.len(), 1);
    assert_eq!(picker.count_due().await.unwrap(), 0);
}

#[tokio::test]
async fn paused_jobs_are_not_claimable() {
    let store = Arc::new(MemoryJobStore::new());
    let picker = JobPicker::new(store.clone(), WorkerId::new("w"));

    let job = store.insert_job(due_shortly("paused")).await.unwrap();
    make_due(&store, job.id).await;
    store
        .find_one_and_update(
            JobFilter::by_id_in_status(job.id, JobStatus::Scheduled),
            JobUpdate::new()
                .set_status(JobStatus::Paused)
                .set_paused_at(Some(Utc::now())),
            None,
        )
        .await
        .unwrap()
        .unwrap();

    assert!(picker.pick_one().await.unwrap().is_none());

    // Resume puts it back on the claim path.
    store
        .find_one_and_update(
            JobFilter::by_id_in_status(job.id, JobStatus::Paused),
            JobUpdate::new()
                .set_status(JobStatus::Scheduled)
                .set_paused_at(None),
            None,
        )
        .await
        .unwrap()
        .unwrap();
    assert!(picker.pick_one().await.unwrap().is_some());
}

#[tokio::test]
async fn release_returns_claim_to_scheduled() {
    let store = Arc::new(MemoryJobStore::new());
    let picker = JobPicker::new(store.clone(), WorkerId::new("w"));

    let job = store.insert_job(due_shortly("released")).await.unwrap();
    make_due(&store, job.id).await;
    let claimed = picker.pick_one().await.unwrap().unwrap();

    assert!(picker.release(&claimed).await.unwrap());
    let reread = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(reread.status, JobStatus::Scheduled);
    assert!(reread.locked_by.is_none());
    // Voluntary release is not an attempt.
    assert_eq!(reread.retry_count, 0);
}

#[tokio::test]
async fn release_is_gated_on_ownership() {
    let store = Arc::new(MemoryJobStore::new());
    let owner = JobPicker::new(store.clone(), WorkerId::new("owner"));
    let thief = JobPicker::new(store.clone(), WorkerId::new("thief"));

    let job = store.insert_job(due_shortly("owned")).await.unwrap();
    make_due(&store, job.id).await;
    let claimed = owner.pick_one().await.unwrap().unwrap();

    assert!(!thief.release(&claimed).await.unwrap());
    let reread = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(reread.status, JobStatus::Queued);
    assert_eq!(reread.locked_by, Some(WorkerId::new("owner")));
}

#[tokio::test]
async fn stale_recovery_reclaims_crashed_claims() {
    let store = Arc::new(MemoryJobStore::new());
    let picker = JobPicker::new(store.clone(), WorkerId::new("survivor"));

    let job = store.insert_job(due_shortly("crashed")).await.unwrap();
    // A worker claimed it and died; the lock is far past the job's 300s
    // timeout.
    store
        .find_one_and_update(
            JobFilter::by_id(job.id),
            JobUpdate::new()
                .set_status(JobStatus::Running)
                .set_lock(WorkerId::new("dead"), Utc::now() - ChronoDuration::seconds(600)),
            None,
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(picker.recover_stale(None).await.unwrap(), 1);

    let reread = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(reread.status, JobStatus::Scheduled);
    assert!(reread.locked_by.is_none());
    assert!(reread.locked_at.is_none());
    // The crash counts as an attempt.
    assert_eq!(reread.retry_count, 1);
}

#[tokio::test]
async fn stale_recovery_is_idempotent_under_concurrency() {
    let store = Arc::new(MemoryJobStore::new());

    for i in 0..3 {
        let job = store.insert_job(due_shortly(&format!("stale-{i}"))).await.unwrap();
        store
            .find_one_and_update(
                JobFilter::by_id(job.id),
                JobUpdate::new()
                    .set_status(JobStatus::Queued)
                    .set_lock(WorkerId::new("dead"), Utc::now() - ChronoDuration::seconds(600)),
                None,
            )
            .await
            .unwrap()
            .unwrap();
    }

    let p1 = JobPicker::new(store.clone(), WorkerId::new("s1"));
    let p2 = JobPicker::new(store.clone(), WorkerId::new("s2"));
    let p3 = JobPicker::new(store.clone(), WorkerId::new("s3"));

    let (a, b, c) = tokio::join!(
        p1.recover_stale(None),
        p2.recover_stale(None),
        p3.recover_stale(None)
    );
    // Each job is recovered exactly once across all concurrent sweeps.
    assert_eq!(a.unwrap() + b.unwrap() + c.unwrap(), 3);

    // A repeat sweep finds nothing; the recovered set is unchanged.
    assert_eq!(p1.recover_stale(None).await.unwrap(), 0);
    let scheduled = store
        .count_jobs(JobFilter::default().with_status_in(vec![JobStatus::Scheduled]))
        .await
        .unwrap();
    assert_eq!(scheduled, 3);
}

#[tokio::test]
async fn fresh_claims_survive_the_sweep() {
    let store = Arc::new(MemoryJobStore::new());
    let picker = JobPicker::new(store.clone(), WorkerId::new("w"));

    let job = store.insert_job(due_shortly("healthy")).await.unwrap();
    make_due(&store, job.id).await;
    picker.pick_one().await.unwrap().unwrap();

    assert_eq!(picker.recover_stale(None).await.unwrap(), 0);
    let reread = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(reread.status, JobStatus::Queued);
    assert_eq!(reread.retry_count, 0);
}
