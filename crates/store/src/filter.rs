//! Typed filter and update model for conditional writes.
//!
//! Filters are conjunctive: every populated field must match. Updates are
//! sparse: only populated fields are applied, and `updated_at` is always
//! bumped. Keeping both typed (instead of an opaque expression language)
//! lets every store implementation apply them atomically and lets tests
//! state transitions precisely.

use chrono::{DateTime, Duration, Utc};
use chronos_core::{Job, JobId, JobStatus, WorkerId};
use serde_json::Value as JsonValue;

/// Conjunctive filter over job records.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub id: Option<JobId>,
    pub status_in: Option<Vec<JobStatus>>,
    /// `next_run_at <= due_before`.
    pub due_before: Option<DateTime<Utc>>,
    pub is_active: Option<bool>,
    pub lock: LockFilter,
    pub locked_by: Option<WorkerId>,
    pub depends_on: Option<JobId>,
}

impl JobFilter {
    pub fn by_id(id: JobId) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    /// CAS-style filter: this id in this exact status.
    pub fn by_id_in_status(id: JobId, status: JobStatus) -> Self {
        Self {
            id: Some(id),
            status_in: Some(vec![status]),
            ..Default::default()
        }
    }

    /// The claim filter: due, active, scheduled, and not (validly) locked.
    pub fn due(now: DateTime<Utc>) -> Self {
        Self {
            status_in: Some(vec![JobStatus::Scheduled]),
            due_before: Some(now),
            is_active: Some(true),
            lock: LockFilter::FreeOrStale { as_of: now },
            ..Default::default()
        }
    }

    pub fn with_status_in(mut self, statuses: Vec<JobStatus>) -> Self {
        self.status_in = Some(statuses);
        self
    }

    pub fn with_locked_by(mut self, worker: WorkerId) -> Self {
        self.locked_by = Some(worker);
        self
    }

    pub fn with_depends_on(mut self, parent: JobId) -> Self {
        self.depends_on = Some(parent);
        self
    }

    pub fn with_lock(mut self, lock: LockFilter) -> Self {
        self.lock = lock;
        self
    }

    /// Whether a job record matches this filter at face value.
    ///
    /// This is the reference semantics; the SQL store compiles the same
    /// predicate into its WHERE clause.
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(id) = self.id {
            if job.id != id {
                return false;
            }
        }
        if let Some(statuses) = &self.status_in {
            if !statuses.contains(&job.status) {
                return false;
            }
        }
        if let Some(due) = self.due_before {
            match job.next_run_at {
                Some(at) if at <= due => {}
                _ => return false,
            }
        }
        if let Some(active) = self.is_active {
            if job.is_active != active {
                return false;
            }
        }
        if let Some(worker) = &self.locked_by {
            if job.locked_by.as_ref() != Some(worker) {
                return false;
            }
        }
        if let Some(parent) = self.depends_on {
            if job.depends_on != Some(parent) {
                return false;
            }
        }
        self.lock.matches(job)
    }
}

/// Lock-state predicate within a [`JobFilter`].
#[derive(Debug, Clone, Default)]
pub enum LockFilter {
    /// No constraint.
    #[default]
    Any,
    /// Unlocked, or the holder's lock is older than the job's own
    /// `lock_timeout_ms`. This is the claimability condition.
    FreeOrStale { as_of: DateTime<Utc> },
    /// Locked and stale. `threshold_ms = None` falls back to the job's own
    /// `lock_timeout_ms`. This is the stale-recovery condition.
    Stale {
        as_of: DateTime<Utc>,
        threshold_ms: Option<i64>,
    },
    /// Locked by anyone.
    Locked,
}

impl LockFilter {
    fn matches(&self, job: &Job) -> bool {
        match self {
            LockFilter::Any => true,
            LockFilter::FreeOrStale { as_of } => job.lock_is_free() || job.lock_is_stale(*as_of),
            LockFilter::Stale { as_of, threshold_ms } => match (&job.locked_by, job.locked_at) {
                (Some(_), Some(at)) => {
                    let threshold = threshold_ms.unwrap_or(job.lock_timeout_ms);
                    at < *as_of - Duration::milliseconds(threshold)
                }
                _ => false,
            },
            LockFilter::Locked => job.locked_by.is_some(),
        }
    }
}

/// Tri-state lock mutation.
#[derive(Debug, Clone)]
pub enum LockUpdate {
    Set { worker: WorkerId, at: DateTime<Utc> },
    Clear,
}

/// Sparse update applied by a conditional write.
///
/// Double-`Option` fields distinguish "leave as is" (`None`) from "set to
/// null" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub lock: Option<LockUpdate>,
    pub next_run_at: Option<Option<DateTime<Utc>>>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Count this transition as an attempt (retry reschedule, stale
    /// reclaim).
    pub increment_retry_count: bool,
    pub execution_duration_ms: Option<u64>,
    pub last_error: Option<Option<String>>,
    pub last_error_stack: Option<Option<String>>,
    pub last_result: Option<Option<JsonValue>>,
    pub expire_at: Option<Option<DateTime<Utc>>>,
    pub paused_at: Option<Option<DateTime<Utc>>>,
    pub is_active: Option<bool>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn set_lock(mut self, worker: WorkerId, at: DateTime<Utc>) -> Self {
        self.lock = Some(LockUpdate::Set { worker, at });
        self
    }

    pub fn clear_lock(mut self) -> Self {
        self.lock = Some(LockUpdate::Clear);
        self
    }

    pub fn set_next_run_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    pub fn set_last_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_run_at = Some(at);
        self
    }

    pub fn increment_retry_count(mut self) -> Self {
        self.increment_retry_count = true;
        self
    }

    pub fn set_execution_duration_ms(mut self, ms: u64) -> Self {
        self.execution_duration_ms = Some(ms);
        self
    }

    pub fn set_error(mut self, message: Option<String>, stack: Option<String>) -> Self {
        self.last_error = Some(message);
        self.last_error_stack = Some(stack);
        self
    }

    pub fn set_result(mut self, result: Option<JsonValue>) -> Self {
        self.last_result = Some(result);
        self
    }

    pub fn set_expire_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.expire_at = Some(at);
        self
    }

    pub fn set_paused_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.paused_at = Some(at);
        self
    }

    pub fn set_is_active(mut self, active: bool) -> Self {
        self.is_active = Some(active);
        self
    }

    /// Apply to a record in place. Reference semantics for all stores.
    pub fn apply(&self, job: &mut Job, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            job.status = status;
        }
        match &self.lock {
            Some(LockUpdate::Set { worker, at }) => {
                job.locked_by = Some(worker.clone());
                job.locked_at = Some(*at);
            }
            Some(LockUpdate::Clear) => {
                job.locked_by = None;
                job.locked_at = None;
            }
            None => {}
        }
        if let Some(next) = self.next_run_at {
            job.next_run_at = next;
        }
        if let Some(last) = self.last_run_at {
            job.last_run_at = Some(last);
        }
        if self.increment_retry_count {
            job.retry_count += 1;
        }
        if let Some(ms) = self.execution_duration_ms {
            job.execution_duration_ms = Some(ms);
        }
        if let Some(err) = &self.last_error {
            job.last_error = err.clone();
        }
        if let Some(stack) = &self.last_error_stack {
            job.last_error_stack = stack.clone();
        }
        if let Some(result) = &self.last_result {
            job.last_result = result.clone();
        }
        if let Some(expire) = self.expire_at {
            job.expire_at = expire;
        }
        if let Some(paused) = self.paused_at {
            job.paused_at = paused;
        }
        if let Some(active) = self.is_active {
            job.is_active = active;
        }
        job.updated_at = now;
    }
}

/// Ordering for `find_one_and_update` candidate selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSort {
    /// Ascending priority (1 first), then oldest `next_run_at`. The claim
    /// order.
    PriorityThenDue,
    /// Newest first, for listings.
    CreatedDesc,
}

/// Listing query for the API surface.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub status: Option<JobStatus>,
    pub task_type: Option<String>,
    pub tag: Option<String>,
    /// Case-insensitive substring over name and description.
    pub text: Option<String>,
    pub include_inactive: bool,
    pub limit: usize,
    pub offset: usize,
}

impl JobQuery {
    pub fn matches(&self, job: &Job) -> bool {
        if !self.include_inactive && !job.is_active {
            return false;
        }
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(task_type) = &self.task_type {
            if &job.task_type != task_type {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !job.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            let in_name = job.name.to_lowercase().contains(&needle);
            let in_desc = job
                .description
                .as_ref()
                .is_some_and(|d| d.to_lowercase().contains(&needle));
            if !in_name && !in_desc {
                return false;
            }
        }
        true
    }
}
