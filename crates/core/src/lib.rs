//! Core domain model for the CHRONOS scheduling engine.
//!
//! Everything in this crate is pure data and pure computation: job records,
//! execution logs, schedules, retry policies, and error classification.
//! Persistence and execution live in `chronos-store` and `chronos-engine`.

pub mod classify;
pub mod error;
pub mod id;
pub mod job;
pub mod log;
pub mod retry;
pub mod schedule;

pub use classify::{classify_error, is_non_retryable, ErrorCode};
pub use error::{DomainError, DomainResult};
pub use id::{process_host, JobId, LogId, WorkerId};
pub use job::{Job, JobKind, JobStatus, NewJob, COMPLETED_JOB_TTL_DAYS};
pub use log::{ExecutionLog, ExecutionStatus, EXECUTION_LOG_TTL_DAYS};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use schedule::{parse_timezone, Schedule, MAX_INTERVAL_MS, MIN_INTERVAL_MS};
