use axum::{routing::get, Router};

pub mod jobs;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .route("/stats", get(system::stats))
        .route("/events", get(system::events))
}
