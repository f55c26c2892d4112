//! In-memory store.
//!
//! The reference implementation of the store contract, used by the engine
//! test suite and for single-process deployments. A single mutex around the
//! whole state makes every conditional update trivially atomic; it is not
//! optimized for throughput.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use chronos_core::{ExecutionLog, ExecutionStatus, Job, JobId, LogId, NewJob, WorkerId};

use crate::filter::{JobFilter, JobQuery, JobSort, JobUpdate};
use crate::job_store::{
    JobPage, JobStore, Lock, LockStore, LogUpdate, StoreError, StoreResult, JOB_SEQUENCE,
};
use crate::stats::{HourlyBucket, JobStats};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    logs: Vec<ExecutionLog>,
    counters: HashMap<String, i64>,
    locks: HashMap<String, Lock>,
}

/// In-memory job and lock store behind one mutex.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_inner(&self) -> StoreResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Storage("store mutex poisoned".to_string()))
    }
}

fn sort_candidates(candidates: &mut [&Job], sort: Option<JobSort>) {
    match sort {
        Some(JobSort::PriorityThenDue) => {
            candidates.sort_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.next_run_at.cmp(&b.next_run_at))
            });
        }
        Some(JobSort::CreatedDesc) => {
            candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }
        // Deterministic fallback so tests are stable.
        None => candidates.sort_by_key(|j| j.seq),
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, new_job: NewJob) -> StoreResult<Job> {
        let now = Utc::now();
        let mut inner = self.lock_inner()?;
        let seq = {
            let counter = inner.counters.entry(JOB_SEQUENCE.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        let job = new_job.into_job(JobId::new(), seq, now)?;
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>> {
        let inner = self.lock_inner()?;
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn find_one_and_update(
        &self,
        filter: JobFilter,
        update: JobUpdate,
        sort: Option<JobSort>,
    ) -> StoreResult<Option<Job>> {
        let now = Utc::now();
        let mut inner = self.lock_inner()?;

        let mut candidates: Vec<&Job> = inner.jobs.values().filter(|j| filter.matches(j)).collect();
        if candidates.is_empty() {
            return Ok(None);
        }
        sort_candidates(&mut candidates, sort);
        let id = candidates[0].id;

        Ok(inner.jobs.get_mut(&id).map(|job| {
            update.apply(job, now);
            job.clone()
        }))
    }

    async fn update_many(&self, filter: JobFilter, update: JobUpdate) -> StoreResult<u64> {
        let now = Utc::now();
        let mut inner = self.lock_inner()?;
        let mut count = 0;
        for job in inner.jobs.values_mut() {
            if filter.matches(job) {
                update.apply(job, now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn query_jobs(&self, query: JobQuery) -> StoreResult<JobPage> {
        let inner = self.lock_inner()?;
        let mut matched: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| query.matches(j))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.seq.cmp(&a.seq)));

        let total = matched.len() as u64;
        let jobs: Vec<Job> = matched
            .into_iter()
            .skip(query.offset)
            .take(if query.limit == 0 { usize::MAX } else { query.limit })
            .collect();
        Ok(JobPage { jobs, total })
    }

    async fn count_jobs(&self, filter: JobFilter) -> StoreResult<u64> {
        let inner = self.lock_inner()?;
        Ok(inner.jobs.values().filter(|j| filter.matches(j)).count() as u64)
    }

    async fn append_log(&self, log: ExecutionLog) -> StoreResult<()> {
        let mut inner = self.lock_inner()?;
        inner.logs.push(log);
        Ok(())
    }

    async fn update_log(&self, id: LogId, update: LogUpdate) -> StoreResult<()> {
        let mut inner = self.lock_inner()?;
        match inner.logs.iter_mut().find(|l| l.id == id) {
            Some(log) => {
                update.apply(log);
                Ok(())
            }
            None => Err(StoreError::Storage(format!("log {id} not found"))),
        }
    }

    async fn logs_for_job(&self, job_id: JobId, limit: usize) -> StoreResult<Vec<ExecutionLog>> {
        let inner = self.lock_inner()?;
        let mut logs: Vec<ExecutionLog> = inner
            .logs
            .iter()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if limit > 0 {
            logs.truncate(limit);
        }
        Ok(logs)
    }

    async fn job_stats(&self) -> StoreResult<JobStats> {
        let now = Utc::now();
        let inner = self.lock_inner()?;

        let mut stats = JobStats::default();
        for job in inner.jobs.values() {
            stats.total += 1;
            *stats.by_status.entry(job.status.to_string()).or_insert(0) += 1;
            *stats.by_task_type.entry(job.task_type.clone()).or_insert(0) += 1;
        }

        let window_start = (now - Duration::hours(24))
            .duration_trunc(Duration::hours(1))
            .map_err(|e| StoreError::Storage(format!("histogram bucketing failed: {e}")))?;
        let mut buckets: Vec<HourlyBucket> = (0..=24)
            .map(|h| HourlyBucket {
                hour: window_start + Duration::hours(h),
                executions: 0,
                failures: 0,
            })
            .collect();
        for log in &inner.logs {
            if log.started_at < window_start {
                continue;
            }
            let idx = (log.started_at - window_start).num_hours() as usize;
            if let Some(bucket) = buckets.get_mut(idx) {
                bucket.executions += 1;
                if matches!(log.status, ExecutionStatus::Failed | ExecutionStatus::Timeout) {
                    bucket.failures += 1;
                }
            }
        }
        stats.hourly = buckets;
        Ok(stats)
    }

    async fn next_sequence(&self, name: &str) -> StoreResult<i64> {
        let mut inner = self.lock_inner()?;
        let counter = inner.counters.entry(name.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.lock_inner()?;
        let jobs_before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, j| j.expire_at.map_or(true, |at| at > now));
        let logs_before = inner.logs.len();
        inner.logs.retain(|l| l.expire_at > now);
        Ok((jobs_before - inner.jobs.len() + logs_before - inner.logs.len()) as u64)
    }
}

#[async_trait]
impl LockStore for MemoryJobStore {
    async fn upsert_lock(
        &self,
        lock_id: &str,
        holder: &WorkerId,
        ttl_ms: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Lock> {
        let mut inner = self.lock_inner()?;
        let expires_at = now + Duration::milliseconds(ttl_ms);

        let lock = match inner.locks.get(lock_id) {
            Some(existing) if &existing.holder == holder && !existing.is_expired(now) => Lock {
                expires_at,
                renew_count: existing.renew_count + 1,
                ..existing.clone()
            },
            Some(existing) if !existing.is_expired(now) => return Ok(existing.clone()),
            _ => Lock {
                lock_id: lock_id.to_string(),
                holder: holder.clone(),
                acquired_at: now,
                expires_at,
                renew_count: 0,
            },
        };
        inner.locks.insert(lock_id.to_string(), lock.clone());
        Ok(lock)
    }

    async fn delete_lock(&self, lock_id: &str, holder: &WorkerId) -> StoreResult<bool> {
        let mut inner = self.lock_inner()?;
        match inner.locks.get(lock_id) {
            Some(lock) if &lock.holder == holder => {
                inner.locks.remove(lock_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn renew_lock(
        &self,
        lock_id: &str,
        holder: &WorkerId,
        ttl_ms: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.lock_inner()?;
        match inner.locks.get_mut(lock_id) {
            Some(lock) if &lock.holder == holder => {
                lock.expires_at = now + Duration::milliseconds(ttl_ms);
                lock.renew_count += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_lock(&self, lock_id: &str) -> StoreResult<Option<Lock>> {
        let inner = self.lock_inner()?;
        Ok(inner.locks.get(lock_id).cloned())
    }

    async fn purge_expired_locks(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.lock_inner()?;
        let before = inner.locks.len();
        inner.locks.retain(|_, l| !l.is_expired(now));
        Ok((before - inner.locks.len()) as u64)
    }
}
