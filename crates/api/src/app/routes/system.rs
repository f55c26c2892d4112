use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{sse::Event as SseEvent, IntoResponse, Sse},
    Json,
};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::app::errors::{json_error, store_error_to_response};
use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Store aggregation plus this process's worker statistics (when a worker
/// runs in-process).
pub async fn stats(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let jobs = match services.store.job_stats().await {
        Ok(stats) => stats,
        Err(e) => return store_error_to_response(e),
    };
    let worker = services.worker.as_ref().map(|w| w.stats());
    Json(serde_json::json!({
        "jobs": jobs,
        "worker": worker,
    }))
    .into_response()
}

/// SSE stream of worker events. Slow consumers may observe gaps; events are
/// observability, not a durable feed.
pub async fn events(
    Extension(services): Extension<Arc<AppServices>>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, axum::response::Response> {
    let worker = services.worker.as_ref().ok_or_else(|| {
        json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "no_worker",
            "no worker runs in this process",
        )
    })?;

    let stream = BroadcastStream::new(worker.subscribe()).filter_map(|event| match event {
        Ok(event) => match SseEvent::default().json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(_) => None,
        },
        // Lagged receivers skip ahead.
        Err(_) => None,
    });

    Ok(Sse::new(stream))
}
