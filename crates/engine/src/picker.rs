//! The atomic claim protocol.
//!
//! `pick_one` is the only mechanism that prevents duplicate pickup: the
//! claim filter plus a single find-and-update means at most one worker can
//! match and transition a given record. No in-memory coordination between
//! workers exists or is assumed.

use std::sync::Arc;

use chrono::Utc;
use chronos_core::{Job, JobStatus, WorkerId};
use chronos_store::{JobFilter, JobSort, JobStore, JobUpdate, LockFilter, StoreResult};
use tracing::debug;

pub struct JobPicker {
    store: Arc<dyn JobStore>,
    worker_id: WorkerId,
}

impl JobPicker {
    pub fn new(store: Arc<dyn JobStore>, worker_id: WorkerId) -> Self {
        Self { store, worker_id }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Claim the single most urgent due job: ascending priority, then
    /// oldest `next_run_at`. Returns `None` when nothing is claimable.
    pub async fn pick_one(&self) -> StoreResult<Option<Job>> {
        let now = Utc::now();
        let claimed = self
            .store
            .find_one_and_update(
                JobFilter::due(now),
                JobUpdate::new()
                    .set_status(JobStatus::Queued)
                    .set_lock(self.worker_id.clone(), now),
                Some(JobSort::PriorityThenDue),
            )
            .await?;
        if let Some(job) = &claimed {
            debug!(job_id = %job.id, seq = job.seq, task_type = %job.task_type, "claimed job");
        }
        Ok(claimed)
    }

    /// Claim up to `n` jobs, stopping at the first empty pick.
    pub async fn pick_many(&self, n: usize) -> StoreResult<Vec<Job>> {
        let mut jobs = Vec::new();
        for _ in 0..n {
            match self.pick_one().await? {
                Some(job) => jobs.push(job),
                None => break,
            }
        }
        Ok(jobs)
    }

    /// Return a job this worker holds to SCHEDULED (voluntary drain).
    pub async fn release(&self, job: &Job) -> StoreResult<bool> {
        let released = self
            .store
            .find_one_and_update(
                JobFilter::by_id(job.id)
                    .with_status_in(vec![JobStatus::Queued, JobStatus::Running])
                    .with_locked_by(self.worker_id.clone()),
                JobUpdate::new().set_status(JobStatus::Scheduled).clear_lock(),
                None,
            )
            .await?;
        Ok(released.is_some())
    }

    /// Bulk release of everything this worker holds.
    pub async fn release_all(&self) -> StoreResult<u64> {
        self.store
            .update_many(
                JobFilter::default()
                    .with_status_in(vec![JobStatus::Queued, JobStatus::Running])
                    .with_locked_by(self.worker_id.clone()),
                JobUpdate::new().set_status(JobStatus::Scheduled).clear_lock(),
            )
            .await
    }

    /// Reclaim jobs abandoned by crashed workers: QUEUED/RUNNING records
    /// whose lock is older than the threshold go back to SCHEDULED with the
    /// crash counted as an attempt. Idempotent and safe to run on every
    /// worker concurrently.
    ///
    /// `threshold_ms = None` uses each job's own `lock_timeout_ms`.
    pub async fn recover_stale(&self, threshold_ms: Option<i64>) -> StoreResult<u64> {
        self.store
            .update_many(
                JobFilter::default()
                    .with_status_in(vec![JobStatus::Queued, JobStatus::Running])
                    .with_lock(LockFilter::Stale {
                        as_of: Utc::now(),
                        threshold_ms,
                    }),
                JobUpdate::new()
                    .set_status(JobStatus::Scheduled)
                    .clear_lock()
                    .increment_retry_count(),
            )
            .await
    }

    /// Diagnostic count of currently claimable jobs.
    pub async fn count_due(&self) -> StoreResult<u64> {
        self.store.count_jobs(JobFilter::due(Utc::now())).await
    }
}
