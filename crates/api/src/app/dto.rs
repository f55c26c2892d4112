//! Request/response DTOs and their mapping onto the domain model.

use chrono::{DateTime, Utc};
use chronos_core::{
    BackoffStrategy, DomainError, ExecutionLog, Job, NewJob, RetryPolicy, Schedule,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Job creation payload.
///
/// Exactly one of `scheduleTime`, `cronExpression`, `interval` selects the
/// schedule; unknown `taskType`s are accepted and fail at execution time.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateJobRequest {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub timezone: Option<String>,
    pub task_type: String,
    #[serde(default)]
    pub payload: JsonValue,

    pub schedule_time: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    /// Milliseconds.
    pub interval: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    pub priority: Option<u8>,
    pub max_retries: Option<u32>,
    /// Base retry delay in milliseconds.
    pub retry_delay: Option<i64>,
    pub max_retry_delay: Option<i64>,
    pub retry_strategy: Option<String>,
    pub jitter: Option<bool>,
    /// Handler deadline / stale-lock threshold in milliseconds.
    pub lock_timeout: Option<i64>,
    pub depends_on_job_id: Option<String>,
}

impl CreateJobRequest {
    pub fn into_new_job(self, created_by: Option<String>) -> Result<NewJob, DomainError> {
        let schedule = match (self.schedule_time, &self.cron_expression, self.interval) {
            (Some(at), None, None) => Schedule::Once { at },
            (None, Some(expr), None) => Schedule::Cron { expr: expr.clone() },
            (None, None, Some(interval_ms)) => Schedule::Every { interval_ms },
            _ => {
                return Err(DomainError::validation(
                    "exactly one of scheduleTime, cronExpression, interval is required",
                ))
            }
        };

        let mut retry = RetryPolicy::default();
        if let Some(n) = self.max_retries {
            retry.max_retries = n;
        }
        if let Some(ms) = self.retry_delay {
            retry.base_delay_ms = ms;
        }
        if let Some(ms) = self.max_retry_delay {
            retry.max_delay_ms = ms;
        }
        if let Some(s) = &self.retry_strategy {
            retry.strategy = parse_strategy(s)?;
        }
        if let Some(jitter) = self.jitter {
            retry.jitter = jitter;
        }

        let mut job = NewJob::new(self.name, self.task_type, schedule);
        job.description = self.description;
        job.tags = self.tags;
        if let Some(tz) = self.timezone {
            job.timezone = tz;
        }
        job.created_by = created_by;
        job.start_time = self.start_time;
        job.end_time = self.end_time;
        if let Some(p) = self.priority {
            job.priority = p;
        }
        job.retry = retry;
        if let Some(ms) = self.lock_timeout {
            job.lock_timeout_ms = ms;
        }
        if let Some(parent) = self.depends_on_job_id {
            job.depends_on = Some(parent.parse()?);
        }
        Ok(job)
    }
}

fn parse_strategy(s: &str) -> Result<BackoffStrategy, DomainError> {
    match s {
        "fixed" => Ok(BackoffStrategy::Fixed),
        "exponential" => Ok(BackoffStrategy::Exponential),
        "linear" => Ok(BackoffStrategy::Linear),
        "fibonacci" => Ok(BackoffStrategy::Fibonacci),
        other => Err(DomainError::validation(format!(
            "retryStrategy must be one of fixed, exponential, linear, fibonacci; got '{other}'"
        ))),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub id: String,
    /// Human-readable sequential id.
    pub job_id: String,
    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub timezone: String,
    pub created_by: Option<String>,
    pub kind: chronos_core::JobKind,
    pub schedule: Schedule,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub task_type: String,
    pub payload: JsonValue,
    pub priority: u8,
    pub status: chronos_core::JobStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub execution_duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_result: Option<JsonValue>,
    pub locked_by: Option<String>,
    pub depends_on_job_id: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id.to_string(),
            job_id: job.seq.to_string(),
            name: job.name,
            description: job.description,
            tags: job.tags,
            timezone: job.timezone,
            created_by: job.created_by,
            kind: job.kind,
            schedule: job.schedule,
            start_time: job.start_time,
            end_time: job.end_time,
            task_type: job.task_type,
            payload: job.payload,
            priority: job.priority,
            status: job.status,
            next_run_at: job.next_run_at,
            last_run_at: job.last_run_at,
            retry_count: job.retry_count,
            execution_duration_ms: job.execution_duration_ms,
            last_error: job.last_error,
            last_result: job.last_result,
            locked_by: job.locked_by.map(|w| w.to_string()),
            depends_on_job_id: job.depends_on.map(|id| id.to_string()),
            is_active: job.is_active,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub total: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogResponse {
    pub id: String,
    pub job_id: String,
    pub job_name: String,
    pub task_type: String,
    pub status: chronos_core::ExecutionStatus,
    pub attempt: u32,
    pub is_retry: bool,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub error_code: Option<chronos_core::ErrorCode>,
    pub worker_id: String,
    pub result: Option<JsonValue>,
    pub metadata: JsonValue,
}

impl From<ExecutionLog> for LogResponse {
    fn from(log: ExecutionLog) -> Self {
        Self {
            id: log.id.to_string(),
            job_id: log.job_id.to_string(),
            job_name: log.job_name,
            task_type: log.task_type,
            status: log.status,
            attempt: log.attempt,
            is_retry: log.is_retry,
            scheduled_for: log.scheduled_for,
            started_at: log.started_at,
            finished_at: log.finished_at,
            duration_ms: log.duration_ms,
            error: log.error,
            error_code: log.error_code,
            worker_id: log.worker_id.to_string(),
            result: log.result,
            metadata: log.metadata,
        }
    }
}

/// Listing query parameters for `GET /jobs`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsParams {
    pub status: Option<String>,
    pub task_type: Option<String>,
    pub tag: Option<String>,
    /// Free-text search over name and description.
    pub q: Option<String>,
    #[serde(default)]
    pub include_inactive: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}
