//! Read-only view of the store: health, jobs, PRs and artifacts.

pub mod handlers;
pub mod types;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::AppState;

pub fn dashboard_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/dashboard", get(handlers::dashboard))
        .route("/api/jobs", get(handlers::list_jobs))
        .route("/api/jobs/{id}", get(handlers::get_job))
        .route("/api/prs", get(handlers::list_prs))
        .route("/api/prs/{owner}/{repo}/{number}", get(handlers::get_pr))
        .route("/api/artifacts/{id}", get(handlers::get_artifact))
}
