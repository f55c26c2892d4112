//! Worker lifecycle and per-job events.
//!
//! Events are broadcast for external observers (the API's SSE stream, test
//! harnesses); the engine itself never depends on anyone listening.

use chrono::{DateTime, Utc};
use chronos_core::JobId;
use serde::Serialize;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WorkerEvent {
    Started {
        worker_id: String,
    },
    Stopped {
        worker_id: String,
    },
    Paused,
    Resumed,
    Error {
        message: String,
    },
    JobStart {
        job_id: JobId,
        task_type: String,
        attempt: u32,
    },
    JobComplete {
        job_id: JobId,
        result: JsonValue,
        duration_ms: u64,
    },
    JobRetry {
        job_id: JobId,
        error: String,
        attempt: u32,
        next_retry_at: DateTime<Utc>,
        remaining_retries: u32,
    },
    JobFailed {
        job_id: JobId,
        error: String,
        attempt: u32,
        reason: String,
    },
    JobError {
        job_id: JobId,
        error: String,
    },
}
