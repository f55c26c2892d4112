//! The store contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chronos_core::{
    DomainError, ErrorCode, ExecutionLog, ExecutionStatus, Job, JobId, LogId, NewJob, WorkerId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::filter::{JobFilter, JobQuery, JobSort, JobUpdate};
use crate::stats::JobStats;

/// Counter name used to mint human-readable job sequence numbers.
pub const JOB_SEQUENCE: &str = "jobId";

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Creation-time domain failures (validation, invariants).
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// A uniqueness constraint was violated.
    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The backing storage failed or is unreachable.
    #[error("storage error: {0}")]
    Storage(String),
}

/// A page of jobs with the total match count.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: u64,
}

/// Closing update for an execution log entry.
#[derive(Debug, Clone, Default)]
pub struct LogUpdate {
    pub status: Option<ExecutionStatus>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub error_stack: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub result: Option<JsonValue>,
    pub metadata: Option<JsonValue>,
}

impl LogUpdate {
    pub fn close(
        status: ExecutionStatus,
        finished_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        Self {
            status: Some(status),
            finished_at: Some(finished_at),
            duration_ms: Some(duration_ms),
            ..Default::default()
        }
    }

    pub fn with_error(
        mut self,
        message: impl Into<String>,
        stack: Option<String>,
        code: ErrorCode,
    ) -> Self {
        self.error = Some(message.into());
        self.error_stack = stack;
        self.error_code = Some(code);
        self
    }

    pub fn with_result(mut self, result: JsonValue) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn apply(&self, log: &mut ExecutionLog) {
        if let Some(status) = self.status {
            log.status = status;
        }
        if let Some(at) = self.finished_at {
            log.finished_at = Some(at);
        }
        if let Some(ms) = self.duration_ms {
            log.duration_ms = Some(ms);
        }
        if let Some(error) = &self.error {
            log.error = Some(error.clone());
        }
        if let Some(stack) = &self.error_stack {
            log.error_stack = Some(stack.clone());
        }
        if let Some(code) = self.error_code {
            log.error_code = Some(code);
        }
        if let Some(result) = &self.result {
            log.result = Some(result.clone());
        }
        if let Some(metadata) = &self.metadata {
            log.metadata = metadata.clone();
        }
    }
}

/// Durable collection of jobs and execution logs.
///
/// Implementations must make [`find_one_and_update`] atomic: no two callers
/// may both match and update the same record. That single guarantee carries
/// the engine's exactly-once-pickup semantics; nothing else in the system
/// coordinates workers.
///
/// [`find_one_and_update`]: JobStore::find_one_and_update
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job, minting its sequence number from the [`JOB_SEQUENCE`]
    /// counter and computing its initial status and `next_run_at`.
    async fn insert_job(&self, new_job: NewJob) -> StoreResult<Job>;

    async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>>;

    /// Atomically find one record matching `filter` (first by `sort`) and
    /// apply `update` to it. Returns the updated record, or `None` when
    /// nothing matched. A no-match is not an error and is never retried
    /// internally.
    async fn find_one_and_update(
        &self,
        filter: JobFilter,
        update: JobUpdate,
        sort: Option<JobSort>,
    ) -> StoreResult<Option<Job>>;

    /// Apply `update` to every record matching `filter`; returns the count.
    async fn update_many(&self, filter: JobFilter, update: JobUpdate) -> StoreResult<u64>;

    async fn query_jobs(&self, query: JobQuery) -> StoreResult<JobPage>;

    async fn count_jobs(&self, filter: JobFilter) -> StoreResult<u64>;

    async fn append_log(&self, log: ExecutionLog) -> StoreResult<()>;

    async fn update_log(&self, id: LogId, update: LogUpdate) -> StoreResult<()>;

    /// Most recent first.
    async fn logs_for_job(&self, job_id: JobId, limit: usize) -> StoreResult<Vec<ExecutionLog>>;

    /// Aggregated counts by status and task type, plus an hourly execution
    /// histogram over the last 24 hours.
    async fn job_stats(&self) -> StoreResult<JobStats>;

    /// Atomic get-and-increment of a named counter, starting at 1.
    async fn next_sequence(&self, name: &str) -> StoreResult<i64>;

    /// Evict jobs and logs whose `expire_at` has passed. Returns how many
    /// records were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}

/// A named advisory lock record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub lock_id: String,
    pub holder: WorkerId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renew_count: u32,
}

impl Lock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Shared named-lock collection.
///
/// The atomicity contract mirrors [`JobStore::find_one_and_update`]: of two
/// workers racing [`upsert_lock`], exactly one observes itself as holder.
///
/// [`upsert_lock`]: LockStore::upsert_lock
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomic upsert that succeeds only when the lock is absent, expired,
    /// or already held by `holder` (renewal). Returns the resulting record,
    /// whose `holder` field tells the caller whether it won.
    async fn upsert_lock(
        &self,
        lock_id: &str,
        holder: &WorkerId,
        ttl_ms: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Lock>;

    /// Delete only when held by `holder`. Returns whether a record was
    /// removed.
    async fn delete_lock(&self, lock_id: &str, holder: &WorkerId) -> StoreResult<bool>;

    /// Extend `expires_at`, gated on `holder`. Bumps the renew counter.
    async fn renew_lock(
        &self,
        lock_id: &str,
        holder: &WorkerId,
        ttl_ms: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn get_lock(&self, lock_id: &str) -> StoreResult<Option<Lock>>;

    /// Evict expired lock records. TTL is the cure for crashed holders.
    async fn purge_expired_locks(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}
