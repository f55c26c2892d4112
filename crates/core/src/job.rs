//! The job record, its lifecycle states, and creation-time validation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, WorkerId};
use crate::retry::RetryPolicy;
use crate::schedule::{parse_timezone, Schedule};

/// Completed jobs are purged from the store after this many days.
pub const COMPLETED_JOB_TTL_DAYS: i64 = 5;

/// Default stale-lock threshold and handler deadline.
pub const DEFAULT_LOCK_TIMEOUT_MS: i64 = 300_000;

const NAME_MIN: usize = 3;
const NAME_MAX: usize = 200;
const DESCRIPTION_MAX: usize = 1_000;

/// One-shot or recurring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    OneTime,
    Recurring,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::OneTime => f.write_str("ONE_TIME"),
            JobKind::Recurring => f.write_str("RECURRING"),
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONE_TIME" => Ok(JobKind::OneTime),
            "RECURRING" => Ok(JobKind::Recurring),
            other => Err(DomainError::validation(format!("unknown job kind '{other}'"))),
        }
    }
}

/// Lifecycle state of a job.
///
/// Every transition between these states is a single conditional write in
/// the store, gated on the expected predecessor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Created but not yet scheduled.
    Pending,
    /// Eligible for pickup once `next_run_at` passes.
    Scheduled,
    /// Claimed by a worker, waiting to enter the handler.
    Queued,
    /// Handler in flight.
    Running,
    /// Finished successfully (terminal for one-time jobs).
    Completed,
    /// Failed permanently.
    Failed,
    /// Scheduling suspended by the operator.
    Paused,
    /// Cancelled before execution.
    Cancelled,
    /// Waiting for a parent job to complete.
    Waiting,
    /// Parent job failed; this job will never run.
    Blocked,
}

impl JobStatus {
    /// Terminal relative to scheduling: no further executions occur.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Scheduled | JobStatus::Queued)
    }

    pub fn is_pausable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Scheduled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Scheduled => "SCHEDULED",
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Paused => "PAUSED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Waiting => "WAITING",
            JobStatus::Blocked => "BLOCKED",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "SCHEDULED" => Ok(JobStatus::Scheduled),
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "PAUSED" => Ok(JobStatus::Paused),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            "WAITING" => Ok(JobStatus::Waiting),
            "BLOCKED" => Ok(JobStatus::Blocked),
            other => Err(DomainError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Surrogate key.
    pub id: JobId,
    /// Human-readable sequence number, minted from the `jobId` counter and
    /// rendered as a string on the wire.
    pub seq: i64,

    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    /// IANA timezone name used for cron evaluation.
    pub timezone: String,
    /// Opaque reference to the creating principal; populated upstream.
    pub created_by: Option<String>,

    pub kind: JobKind,
    pub schedule: Schedule,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    /// Key into the worker's handler registry. Unknown types are accepted
    /// at creation and fail at execution time.
    pub task_type: String,
    pub payload: JsonValue,

    /// 1 (highest) to 10 (lowest).
    pub priority: u8,

    pub status: JobStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub execution_duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_error_stack: Option<String>,
    pub last_result: Option<JsonValue>,

    pub retry: RetryPolicy,

    pub locked_by: Option<WorkerId>,
    pub locked_at: Option<DateTime<Utc>>,
    /// Stale-lock threshold and handler deadline for this job.
    pub lock_timeout_ms: i64,

    pub depends_on: Option<JobId>,

    /// Soft-delete flag; inactive jobs are never picked.
    pub is_active: bool,
    pub paused_at: Option<DateTime<Utc>>,
    /// TTL marker; the store purges records past this point.
    pub expire_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether the picker filter would currently match this job.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.status == JobStatus::Scheduled
            && self.next_run_at.is_some_and(|t| t <= now)
            && (self.lock_is_free() || self.lock_is_stale(now))
    }

    pub fn lock_is_free(&self) -> bool {
        self.locked_by.is_none() || self.locked_at.is_none()
    }

    /// A lock is stale once its holder has been silent past the timeout.
    pub fn lock_is_stale(&self, now: DateTime<Utc>) -> bool {
        match (&self.locked_by, self.locked_at) {
            (Some(_), Some(at)) => at < now - Duration::milliseconds(self.lock_timeout_ms),
            _ => false,
        }
    }

    /// The handler deadline for one execution attempt.
    pub fn execution_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lock_timeout_ms.max(0) as u64)
    }
}

/// Creation payload for a job, before the store assigns identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub timezone: String,
    pub created_by: Option<String>,
    pub schedule: Schedule,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub task_type: String,
    pub payload: JsonValue,
    pub priority: u8,
    pub retry: RetryPolicy,
    pub lock_timeout_ms: i64,
    pub depends_on: Option<JobId>,
}

impl NewJob {
    pub fn new(name: impl Into<String>, task_type: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            name: name.into(),
            description: None,
            tags: Vec::new(),
            timezone: "UTC".to_string(),
            created_by: None,
            schedule,
            start_time: None,
            end_time: None,
            task_type: task_type.into(),
            payload: JsonValue::Null,
            priority: 5,
            retry: RetryPolicy::default(),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            depends_on: None,
        }
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = tz.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_end_time(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    pub fn with_lock_timeout_ms(mut self, ms: i64) -> Self {
        self.lock_timeout_ms = ms;
        self
    }

    pub fn depends_on(mut self, parent: JobId) -> Self {
        self.depends_on = Some(parent);
        self
    }

    pub fn validate(&self, now: DateTime<Utc>) -> DomainResult<()> {
        let name_len = self.name.chars().count();
        if !(NAME_MIN..=NAME_MAX).contains(&name_len) {
            return Err(DomainError::validation(format!(
                "name must be {NAME_MIN}-{NAME_MAX} characters, got {name_len}"
            )));
        }
        if let Some(desc) = &self.description {
            if desc.chars().count() > DESCRIPTION_MAX {
                return Err(DomainError::validation(format!(
                    "description must be at most {DESCRIPTION_MAX} characters"
                )));
            }
        }
        if !(1..=10).contains(&self.priority) {
            return Err(DomainError::validation(format!(
                "priority must be 1-10, got {}",
                self.priority
            )));
        }
        if self.task_type.trim().is_empty() {
            return Err(DomainError::validation("task_type must not be empty".to_string()));
        }
        if self.lock_timeout_ms <= 0 {
            return Err(DomainError::validation("lock_timeout_ms must be positive".to_string()));
        }
        self.retry.validate()?;
        self.schedule.validate(&self.timezone)?;
        if let Schedule::Once { at } = &self.schedule {
            if *at <= now {
                return Err(DomainError::validation(
                    "one-time schedule must be in the future".to_string(),
                ));
            }
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if end <= start {
                return Err(DomainError::validation(
                    "end_time must be after start_time".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Materialize the job record the store will persist.
    ///
    /// Dependent jobs start in `Waiting` and receive their `next_run_at`
    /// when the parent completes; everything else starts `Scheduled` with
    /// the first occurrence computed here.
    pub fn into_job(self, id: JobId, seq: i64, now: DateTime<Utc>) -> DomainResult<Job> {
        self.validate(now)?;
        let kind = if self.schedule.is_recurring() {
            JobKind::Recurring
        } else {
            JobKind::OneTime
        };

        let (status, next_run_at) = if self.depends_on.is_some() {
            (JobStatus::Waiting, None)
        } else {
            let tz = parse_timezone(&self.timezone)?;
            let anchor = match self.start_time {
                Some(start) if start > now => start,
                _ => now,
            };
            let first = match &self.schedule {
                // The anchor itself is the first run when a start bound is set.
                Schedule::Every { .. } if self.start_time.is_some_and(|s| s > now) => Some(anchor),
                _ => self.schedule.next_occurrence(anchor, tz),
            };
            let first = first.filter(|t| self.end_time.map_or(true, |end| *t <= end));
            match first {
                Some(t) => (JobStatus::Scheduled, Some(t)),
                None => {
                    return Err(DomainError::validation(
                        "schedule has no occurrence within its time bounds".to_string(),
                    ))
                }
            }
        };

        Ok(Job {
            id,
            seq,
            name: self.name,
            description: self.description,
            tags: self.tags,
            timezone: self.timezone,
            created_by: self.created_by,
            kind,
            schedule: self.schedule,
            start_time: self.start_time,
            end_time: self.end_time,
            task_type: self.task_type,
            payload: self.payload,
            priority: self.priority,
            status,
            next_run_at,
            last_run_at: None,
            retry_count: 0,
            execution_duration_ms: None,
            last_error: None,
            last_error_stack: None,
            last_result: None,
            retry: self.retry,
            locked_by: None,
            locked_at: None,
            lock_timeout_ms: self.lock_timeout_ms,
            depends_on: self.depends_on,
            is_active: true,
            paused_at: None,
            expire_at: None,
            created_at: now,
            updated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn one_time() -> NewJob {
        NewJob::new(
            "send-welcome-email",
            "email",
            Schedule::Once {
                at: now() + Duration::minutes(5),
            },
        )
    }

    #[test]
    fn one_time_job_starts_scheduled_at_its_time() {
        let job = one_time().into_job(JobId::new(), 1, now()).unwrap();
        assert_eq!(job.kind, JobKind::OneTime);
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.next_run_at, Some(now() + Duration::minutes(5)));
        assert!(job.is_active);
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn recurring_interval_job_gets_first_occurrence() {
        let job = NewJob::new("sync", "sync", Schedule::Every { interval_ms: 60_000 })
            .into_job(JobId::new(), 2, now())
            .unwrap();
        assert_eq!(job.kind, JobKind::Recurring);
        assert_eq!(job.next_run_at, Some(now() + Duration::seconds(60)));
    }

    #[test]
    fn dependent_job_starts_waiting() {
        let parent = JobId::new();
        let job = one_time()
            .depends_on(parent)
            .into_job(JobId::new(), 3, now())
            .unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.next_run_at, None);
        assert_eq!(job.depends_on, Some(parent));
    }

    #[test]
    fn name_and_priority_bounds() {
        let mut j = one_time();
        j.name = "ab".into();
        assert!(j.validate(now()).is_err());

        let mut j = one_time();
        j.name = "x".repeat(201);
        assert!(j.validate(now()).is_err());

        let mut j = one_time();
        j.priority = 0;
        assert!(j.validate(now()).is_err());
        j.priority = 11;
        assert!(j.validate(now()).is_err());
    }

    #[test]
    fn past_one_time_schedule_is_rejected() {
        let j = NewJob::new(
            "late",
            "echo",
            Schedule::Once {
                at: now() - Duration::minutes(1),
            },
        );
        assert!(j.validate(now()).is_err());
    }

    #[test]
    fn start_time_in_future_anchors_first_interval_run() {
        let start = now() + Duration::hours(1);
        let mut j = NewJob::new("later", "echo", Schedule::Every { interval_ms: 5_000 });
        j.start_time = Some(start);
        let job = j.into_job(JobId::new(), 4, now()).unwrap();
        assert_eq!(job.next_run_at, Some(start));
    }

    #[test]
    fn schedule_past_end_time_is_rejected() {
        let j = one_time().with_end_time(now() + Duration::minutes(1));
        assert!(j.into_job(JobId::new(), 5, now()).is_err());
    }

    #[test]
    fn due_and_stale_predicates() {
        let mut job = one_time().into_job(JobId::new(), 6, now()).unwrap();
        assert!(!job.is_due(now()));
        assert!(job.is_due(now() + Duration::minutes(6)));

        job.locked_by = Some(WorkerId::new("w1"));
        job.locked_at = Some(now());
        assert!(!job.is_due(now() + Duration::minutes(4)));
        // Past the 300s lock timeout the claim becomes available again.
        assert!(job.lock_is_stale(now() + Duration::minutes(6)));
        assert!(job.is_due(now() + Duration::minutes(11)));
    }

    #[test]
    fn status_predicates() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Blocked.is_terminal());
        assert!(JobStatus::Queued.is_cancellable());
        assert!(!JobStatus::Running.is_cancellable());
        assert!(JobStatus::Scheduled.is_pausable());
        assert!(!JobStatus::Queued.is_pausable());
    }
}
