//! Execution log records, one per attempt.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::classify::ErrorCode;
use crate::id::{JobId, LogId, WorkerId};
use crate::job::{Job, JobKind};

/// Execution logs are purged after this many days.
pub const EXECUTION_LOG_TTL_DAYS: i64 = 30;

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Timeout,
    Skipped,
    /// Attempt still in flight; the closing update rewrites this.
    Running,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Timeout => "TIMEOUT",
            ExecutionStatus::Skipped => "SKIPPED",
            ExecutionStatus::Running => "RUNNING",
        };
        f.write_str(s)
    }
}

/// Append-only audit record of one handler invocation.
///
/// Job identity fields are denormalized so the log stays meaningful after
/// the job record itself is purged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: LogId,
    pub job_id: JobId,

    pub job_name: String,
    pub job_kind: JobKind,
    pub task_type: String,

    /// The `next_run_at` this attempt was picked for.
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,

    pub status: ExecutionStatus,
    /// 0 for the first attempt, then 1, 2, ... per retry.
    pub attempt: u32,
    pub is_retry: bool,

    pub error: Option<String>,
    pub error_stack: Option<String>,
    pub error_code: Option<ErrorCode>,

    pub worker_id: WorkerId,
    pub worker_host: String,

    pub payload_snapshot: JsonValue,
    pub result: Option<JsonValue>,

    /// Free-form extras: willRetry, nextRetryAt, remainingRetries,
    /// retryDelayMs, blockedBy.
    pub metadata: JsonValue,

    pub expire_at: DateTime<Utc>,
}

impl ExecutionLog {
    /// Open a log entry for an attempt that is about to run.
    pub fn begin(
        job: &Job,
        worker_id: WorkerId,
        worker_host: impl Into<String>,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: LogId::new(),
            job_id: job.id,
            job_name: job.name.clone(),
            job_kind: job.kind,
            task_type: job.task_type.clone(),
            scheduled_for: job.next_run_at,
            started_at: now,
            finished_at: None,
            duration_ms: None,
            status: ExecutionStatus::Running,
            attempt,
            is_retry: attempt > 0,
            error: None,
            error_stack: None,
            error_code: None,
            worker_id,
            worker_host: worker_host.into(),
            payload_snapshot: job.payload.clone(),
            result: None,
            metadata: JsonValue::Null,
            expire_at: now + Duration::days(EXECUTION_LOG_TTL_DAYS),
        }
    }
}
