use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use chronos_core::{JobId, JobStatus};
use chronos_store::{JobFilter, JobQuery, JobUpdate};

use crate::app::dto::{CreateJobRequest, JobListResponse, JobResponse, ListJobsParams, LogResponse};
use crate::app::errors::{domain_error_to_response, json_error, store_error_to_response};
use crate::app::services::AppServices;

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/:id", get(get_job).delete(delete_job))
        .route("/:id/cancel", post(cancel_job))
        .route("/:id/pause", post(pause_job))
        .route("/:id/resume", post(resume_job))
        .route("/:id/logs", get(job_logs))
}

fn parse_job_id(id: &str) -> Result<JobId, axum::response::Response> {
    id.parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    Json(body): Json<CreateJobRequest>,
) -> axum::response::Response {
    // Auth happens upstream; the principal arrives as an opaque header.
    let created_by = headers
        .get("x-principal")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let new_job = match body.into_new_job(created_by) {
        Ok(j) => j,
        Err(e) => return domain_error_to_response(e),
    };

    match services.store.insert_job(new_job).await {
        Ok(job) => (StatusCode::CREATED, Json(JobResponse::from(job))).into_response(),
        Err(e) => store_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<ListJobsParams>,
) -> axum::response::Response {
    let status = match params.status.as_deref().map(JobStatus::from_str).transpose() {
        Ok(s) => s,
        Err(e) => return domain_error_to_response(e),
    };

    let query = JobQuery {
        status,
        task_type: params.task_type,
        tag: params.tag,
        text: params.q,
        include_inactive: params.include_inactive,
        limit: params.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE),
        offset: params.offset.unwrap_or(0),
    };

    match services.store.query_jobs(query).await {
        Ok(page) => Json(JobListResponse {
            jobs: page.jobs.into_iter().map(JobResponse::from).collect(),
            total: page.total,
        })
        .into_response(),
        Err(e) => store_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.store.get_job(id).await {
        Ok(Some(job)) => Json(JobResponse::from(job)).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Err(e) => store_error_to_response(e),
    }
}

/// Soft delete: the job stays queryable with `includeInactive=true` but is
/// never picked again.
pub async fn delete_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let result = services
        .store
        .find_one_and_update(JobFilter::by_id(id), JobUpdate::new().set_is_active(false), None)
        .await;
    match result {
        Ok(Some(job)) => Json(JobResponse::from(job)).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Err(e) => store_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    // A RUNNING job cannot be cancelled mid-flight; its current execution
    // finishes and is recorded, but no further runs occur.
    let result = services
        .store
        .find_one_and_update(
            JobFilter::by_id(id).with_status_in(vec![
                JobStatus::Pending,
                JobStatus::Scheduled,
                JobStatus::Queued,
            ]),
            JobUpdate::new()
                .set_status(JobStatus::Cancelled)
                .set_next_run_at(None)
                .clear_lock(),
            None,
        )
        .await;
    transition_response(services, id, result, "job is not cancellable in its current status").await
}

pub async fn pause_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let result = services
        .store
        .find_one_and_update(
            JobFilter::by_id(id).with_status_in(vec![JobStatus::Pending, JobStatus::Scheduled]),
            JobUpdate::new()
                .set_status(JobStatus::Paused)
                .set_paused_at(Some(Utc::now())),
            None,
        )
        .await;
    transition_response(services, id, result, "job is not pausable in its current status").await
}

pub async fn resume_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let result = services
        .store
        .find_one_and_update(
            JobFilter::by_id_in_status(id, JobStatus::Paused),
            JobUpdate::new()
                .set_status(JobStatus::Scheduled)
                .set_paused_at(None),
            None,
        )
        .await;
    transition_response(services, id, result, "job is not paused").await
}

async fn transition_response(
    services: Arc<AppServices>,
    id: JobId,
    result: chronos_store::StoreResult<Option<chronos_core::Job>>,
    conflict_message: &str,
) -> axum::response::Response {
    match result {
        Ok(Some(job)) => Json(JobResponse::from(job)).into_response(),
        Ok(None) => match services.store.get_job(id).await {
            Ok(Some(_)) => json_error(StatusCode::CONFLICT, "conflict", conflict_message),
            Ok(None) => json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
            Err(e) => store_error_to_response(e),
        },
        Err(e) => store_error_to_response(e),
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct LogsParams {
    pub limit: Option<usize>,
}

pub async fn job_logs(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Query(params): Query<LogsParams>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
    match services.store.logs_for_job(id, limit).await {
        Ok(logs) => Json(
            logs.into_iter().map(LogResponse::from).collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => store_error_to_response(e),
    }
}
