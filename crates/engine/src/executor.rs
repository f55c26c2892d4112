//! Single-attempt job execution.
//!
//! Given a claimed job, the executor opens a log entry, re-asserts the
//! lock, races the handler against the job's deadline, and records the
//! outcome. Every job mutation is a conditional write gated on
//! `locked_by = self`, so a stolen lock turns into a visible no-op rather
//! than a double-write. Handler code never touches the store.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chronos_core::{
    classify_error, is_non_retryable, parse_timezone, ErrorCode, ExecutionLog, ExecutionStatus,
    Job, JobId, JobKind, JobStatus, LogId, WorkerId, COMPLETED_JOB_TTL_DAYS,
};
use chronos_store::{JobFilter, JobStore, JobUpdate, LogUpdate, StoreResult};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::registry::{HandlerContext, HandlerRegistry};

/// What happened to one execution attempt.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Succeeded {
        job_id: JobId,
        result: JsonValue,
        duration_ms: u64,
    },
    /// Failed, rescheduled with backoff.
    Retrying {
        job_id: JobId,
        error: String,
        attempt: u32,
        next_retry_at: DateTime<Utc>,
        remaining_retries: u32,
    },
    /// Failed permanently.
    Failed {
        job_id: JobId,
        error: String,
        attempt: u32,
        reason: FailureReason,
    },
    /// The attempt could not run or record its outcome (lock stolen, store
    /// write refused). Stale recovery or another worker takes over.
    Lost { job_id: JobId, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    RetriesExhausted,
    NonRetryable,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::RetriesExhausted => "retries_exhausted",
            FailureReason::NonRetryable => "non_retryable",
        }
    }
}

pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    worker_id: WorkerId,
    worker_host: String,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        worker_id: WorkerId,
        worker_host: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            worker_id,
            worker_host: worker_host.into(),
        }
    }

    /// Run one attempt for a job this worker has claimed.
    pub async fn execute(&self, job: Job) -> ExecutionOutcome {
        let attempt = job.retry_count;
        let started_at = Utc::now();

        let log = ExecutionLog::begin(&job, self.worker_id.clone(), &self.worker_host, attempt, started_at);
        let log_id = log.id;
        if let Err(e) = self.store.append_log(log).await {
            warn!(job_id = %job.id, error = %e, "failed to open execution log");
            return ExecutionOutcome::Lost {
                job_id: job.id,
                error: e.to_string(),
            };
        }

        // Enter RUNNING, re-asserting ownership in the same write.
        let marked = self
            .store
            .find_one_and_update(
                JobFilter::by_id_in_status(job.id, JobStatus::Queued)
                    .with_locked_by(self.worker_id.clone()),
                JobUpdate::new()
                    .set_status(JobStatus::Running)
                    .set_lock(self.worker_id.clone(), started_at),
                None,
            )
            .await;
        let job = match marked {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job_id = %job.id, "claim no longer ours, skipping attempt");
                self.close_log(
                    log_id,
                    LogUpdate::close(ExecutionStatus::Skipped, Utc::now(), 0),
                )
                .await;
                return ExecutionOutcome::Lost {
                    job_id: job.id,
                    error: "claim no longer held by this worker".to_string(),
                };
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to mark job running");
                return ExecutionOutcome::Lost {
                    job_id: job.id,
                    error: e.to_string(),
                };
            }
        };

        let run = match self.registry.get(&job.task_type) {
            Some(handler) => {
                let ctx = HandlerContext {
                    job_id: job.id,
                    job_seq: job.seq,
                    job_name: job.name.clone(),
                    task_type: job.task_type.clone(),
                    attempt,
                    scheduled_for: job.next_run_at,
                    payload: job.payload.clone(),
                };
                match tokio::time::timeout(job.execution_deadline(), handler.run(ctx)).await {
                    Ok(Ok(result)) => Ok(result),
                    Ok(Err(e)) => Err((e.message, e.stack)),
                    Err(_) => Err((
                        format!("execution timeout after {} ms", job.lock_timeout_ms),
                        None,
                    )),
                }
            }
            None => Err((
                format!("no handler registered for task type '{}'", job.task_type),
                None,
            )),
        };

        match run {
            Ok(result) => self.on_success(&job, log_id, result, started_at).await,
            Err((message, stack)) => {
                self.on_failure(&job, log_id, message, stack, started_at).await
            }
        }
    }

    async fn on_success(
        &self,
        job: &Job,
        log_id: LogId,
        result: JsonValue,
        started_at: DateTime<Utc>,
    ) -> ExecutionOutcome {
        let finished_at = Utc::now();
        let duration_ms = duration_ms(started_at, finished_at);

        self.close_log(
            log_id,
            LogUpdate::close(ExecutionStatus::Success, finished_at, duration_ms)
                .with_result(result.clone()),
        )
        .await;

        let update = JobUpdate::new()
            .set_last_run_at(finished_at)
            .set_execution_duration_ms(duration_ms)
            .set_error(None, None)
            .set_result(Some(result.clone()))
            .clear_lock();

        let update = match self.next_run_after_success(job, finished_at) {
            Some(next) => update
                .set_status(JobStatus::Scheduled)
                .set_next_run_at(Some(next)),
            None => update
                .set_status(JobStatus::Completed)
                .set_next_run_at(None)
                .set_expire_at(Some(finished_at + Duration::days(COMPLETED_JOB_TTL_DAYS))),
        };

        match self.write_outcome(job.id, update).await {
            Some(updated) => {
                info!(
                    job_id = %job.id,
                    seq = job.seq,
                    task_type = %job.task_type,
                    duration_ms,
                    status = %updated.status,
                    "job succeeded"
                );
            }
            None => {
                warn!(job_id = %job.id, "success outcome write refused (lock no longer ours)");
            }
        }

        self.fan_out_dependents(job.id, finished_at).await;

        ExecutionOutcome::Succeeded {
            job_id: job.id,
            result,
            duration_ms,
        }
    }

    async fn on_failure(
        &self,
        job: &Job,
        log_id: LogId,
        message: String,
        stack: Option<String>,
        started_at: DateTime<Utc>,
    ) -> ExecutionOutcome {
        let finished_at = Utc::now();
        let duration_ms = duration_ms(started_at, finished_at);
        let attempt = job.retry_count;

        let code = classify_error(&message);
        let log_status = if code == ErrorCode::Timeout {
            ExecutionStatus::Timeout
        } else {
            ExecutionStatus::Failed
        };

        let non_retryable = is_non_retryable(&message);
        let will_retry = !non_retryable && job.retry.allows_retry(attempt);

        if will_retry {
            let delay_ms = job.retry.delay_for_attempt(attempt);
            let next_retry_at = finished_at + Duration::milliseconds(delay_ms);
            let remaining = job.retry.max_retries - attempt - 1;

            self.close_log(
                log_id,
                LogUpdate::close(log_status, finished_at, duration_ms)
                    .with_error(&message, stack.clone(), code)
                    .with_metadata(json!({
                        "willRetry": true,
                        "nextRetryAt": next_retry_at,
                        "remainingRetries": remaining,
                        "retryDelayMs": delay_ms,
                    })),
            )
            .await;

            let update = JobUpdate::new()
                .set_status(JobStatus::Scheduled)
                .set_next_run_at(Some(next_retry_at))
                .increment_retry_count()
                .set_last_run_at(finished_at)
                .set_execution_duration_ms(duration_ms)
                .set_error(Some(message.clone()), stack)
                .clear_lock();
            if self.write_outcome(job.id, update).await.is_none() {
                warn!(job_id = %job.id, "retry outcome write refused (lock no longer ours)");
            }

            info!(
                job_id = %job.id,
                seq = job.seq,
                attempt,
                error = %message,
                next_retry_at = %next_retry_at,
                remaining,
                "job failed, retry scheduled"
            );
            ExecutionOutcome::Retrying {
                job_id: job.id,
                error: message,
                attempt,
                next_retry_at,
                remaining_retries: remaining,
            }
        } else {
            let reason = if non_retryable {
                FailureReason::NonRetryable
            } else {
                FailureReason::RetriesExhausted
            };

            self.close_log(
                log_id,
                LogUpdate::close(log_status, finished_at, duration_ms)
                    .with_error(&message, stack.clone(), code)
                    .with_metadata(json!({
                        "willRetry": false,
                        "reason": reason.as_str(),
                    })),
            )
            .await;

            let update = JobUpdate::new()
                .set_status(JobStatus::Failed)
                .set_next_run_at(None)
                .set_last_run_at(finished_at)
                .set_execution_duration_ms(duration_ms)
                .set_error(Some(message.clone()), stack)
                .clear_lock();
            if self.write_outcome(job.id, update).await.is_none() {
                warn!(job_id = %job.id, "failure outcome write refused (lock no longer ours)");
            }

            self.block_dependents(job.id).await;

            warn!(
                job_id = %job.id,
                seq = job.seq,
                attempt,
                error = %message,
                reason = reason.as_str(),
                "job failed permanently"
            );
            ExecutionOutcome::Failed {
                job_id: job.id,
                error: message,
                attempt,
                reason,
            }
        }
    }

    /// For recurring jobs, the next occurrence within the end bound.
    /// `None` means the job completes.
    fn next_run_after_success(&self, job: &Job, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if job.kind != JobKind::Recurring {
            return None;
        }
        let tz = match parse_timezone(&job.timezone) {
            Ok(tz) => tz,
            Err(_) => {
                warn!(job_id = %job.id, timezone = %job.timezone, "unparseable timezone, using UTC");
                chrono_tz::Tz::UTC
            }
        };
        job.schedule
            .next_occurrence(now, tz)
            .filter(|next| job.end_time.map_or(true, |end| *next <= end))
    }

    /// Wake WAITING children of a parent that just succeeded.
    async fn fan_out_dependents(&self, parent: JobId, now: DateTime<Utc>) {
        let result = self
            .store
            .update_many(
                JobFilter::default()
                    .with_depends_on(parent)
                    .with_status_in(vec![JobStatus::Waiting]),
                JobUpdate::new()
                    .set_status(JobStatus::Scheduled)
                    .set_next_run_at(Some(now)),
            )
            .await;
        match result {
            Ok(0) => {}
            Ok(n) => info!(parent_job_id = %parent, released = n, "dependent jobs scheduled"),
            Err(e) => warn!(parent_job_id = %parent, error = %e, "dependent fan-out failed"),
        }
    }

    /// Block WAITING children of a parent that failed permanently.
    async fn block_dependents(&self, parent: JobId) {
        let result = self
            .store
            .update_many(
                JobFilter::default()
                    .with_depends_on(parent)
                    .with_status_in(vec![JobStatus::Waiting]),
                JobUpdate::new().set_status(JobStatus::Blocked).set_error(
                    Some(format!("blocked: parent job {parent} failed")),
                    None,
                ),
            )
            .await;
        match result {
            Ok(0) => {}
            Ok(n) => info!(parent_job_id = %parent, blocked = n, "dependent jobs blocked"),
            Err(e) => warn!(parent_job_id = %parent, error = %e, "dependent block failed"),
        }
    }

    /// Outcome writes are gated on RUNNING + our lock; `None` means the
    /// lock was stolen and the write was refused.
    async fn write_outcome(&self, job_id: JobId, update: JobUpdate) -> Option<Job> {
        let result: StoreResult<Option<Job>> = self
            .store
            .find_one_and_update(
                JobFilter::by_id_in_status(job_id, JobStatus::Running)
                    .with_locked_by(self.worker_id.clone()),
                update,
                None,
            )
            .await;
        match result {
            Ok(updated) => updated,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "outcome write failed");
                None
            }
        }
    }

    async fn close_log(&self, log_id: LogId, update: LogUpdate) {
        if let Err(e) = self.store.update_log(log_id, update).await {
            warn!(log_id = %log_id, error = %e, "failed to close execution log");
        }
    }
}

fn duration_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}
