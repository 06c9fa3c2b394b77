//! HTTP handlers for health and the dashboard API.

use std::sync::Arc;

use agentloop_core::{PrId, RepoId};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json, Response},
};
use serde_json::json;
use tracing::error;

use super::types::{
    DashboardSummary, HealthResponse, JobDetailResponse, JobsApiResponse, JobsQuery,
    PrDetailResponse, PrsApiResponse,
};
use crate::artifacts::ArtifactKind;
use crate::error::StoreError;
use crate::queue::JobStatus;
use crate::AppState;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;
const MAX_EVENTS_PER_PR: usize = 100;
const MAX_SNAPSHOTS_PER_PR: usize = 20;
const RECENT_FAILURES: usize = 20;

const DASHBOARD_HTML_TEMPLATE: &str = include_str!("dashboard.html");

/// Errors surfaced by the dashboard API.
#[derive(Debug)]
pub enum DashboardError {
    NotFound(String),
    BadRequest(String),
    Internal,
}

impl From<StoreError> for DashboardError {
    fn from(e: StoreError) -> Self {
        error!("Dashboard query failed: {}", e);
        Self::Internal
    }
}

impl IntoResponse for DashboardError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(what) => (StatusCode::NOT_FOUND, format!("{} not found", what)),
            Self::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason),
            Self::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn wants_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.to_lowercase().contains("text/html"))
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// Handler: GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let (code, store) = match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            error!("Health check could not reach the store: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "unreachable")
        }
    };
    let body = HealthResponse {
        status: if code == StatusCode::OK {
            "healthy"
        } else {
            "unhealthy"
        },
        service: "agentloop",
        version: crate::get_version(),
        store,
    };
    (code, Json(body)).into_response()
}

/// Handler: GET /dashboard
///
/// HTML for browsers, the same summary as JSON otherwise.
pub async fn dashboard(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Result<Response, DashboardError> {
    let counts = state.store.count_jobs_by_status().await?;
    let summary = DashboardSummary {
        version: crate::get_version(),
        jobs_by_status: counts
            .into_iter()
            .map(|(status, n)| (status.as_str().to_string(), n))
            .collect(),
        recent_failures: state
            .store
            .list_jobs(Some(JobStatus::Failed), RECENT_FAILURES)
            .await?,
        prs: state.store.list_pr_states(DEFAULT_LIMIT).await?,
    };

    if wants_html(&headers) {
        return Ok(Html(render_dashboard(&summary)).into_response());
    }
    Ok(Json(summary).into_response())
}

fn render_dashboard(summary: &DashboardSummary) -> String {
    let counts_json =
        serde_json::to_string(&summary.jobs_by_status).unwrap_or_else(|_| "{}".to_string());
    let failures_json =
        serde_json::to_string(&summary.recent_failures).unwrap_or_else(|_| "[]".to_string());
    let prs_json = serde_json::to_string(&summary.prs).unwrap_or_else(|_| "[]".to_string());
    let timestamp = chrono::Utc::now()
        .format("%Y-%m-%d %H:%M:%S UTC")
        .to_string();

    DASHBOARD_HTML_TEMPLATE
        .replace("{version}", &summary.version)
        .replace("{timestamp}", &timestamp)
        .replace("{counts_json}", &counts_json)
        .replace("{failures_json}", &failures_json)
        .replace("{prs_json}", &prs_json)
}

/// Handler: GET /api/jobs?status=&limit=
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<JobsApiResponse>, DashboardError> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(DashboardError::BadRequest)?;
    let jobs = state
        .store
        .list_jobs(status, clamp_limit(query.limit))
        .await?;
    Ok(Json(JobsApiResponse {
        version: crate::get_version(),
        jobs,
    }))
}

/// Handler: GET /api/jobs/{id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<i64>,
) -> Result<Json<JobDetailResponse>, DashboardError> {
    let job = state
        .store
        .get_job(job_id)
        .await?
        .ok_or_else(|| DashboardError::NotFound(format!("job {}", job_id)))?;
    let artifacts = state.store.artifacts_for_job(job_id).await?;
    Ok(Json(JobDetailResponse { job, artifacts }))
}

/// Handler: GET /api/prs
pub async fn list_prs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<PrsApiResponse>, DashboardError> {
    let prs = state
        .store
        .list_pr_states(clamp_limit(query.limit))
        .await?;
    Ok(Json(PrsApiResponse {
        version: crate::get_version(),
        prs,
    }))
}

/// Handler: GET /api/prs/{owner}/{repo}/{number}
pub async fn get_pr(
    State(state): State<Arc<AppState>>,
    Path((owner, repo, number)): Path<(String, String, u64)>,
) -> Result<Json<PrDetailResponse>, DashboardError> {
    let pr_id = PrId::new(RepoId::new(owner, repo), number);
    let pr = state
        .store
        .get_pr_state(&pr_id)
        .await?
        .ok_or_else(|| DashboardError::NotFound(format!("PR {}", pr_id)))?;
    let ci_snapshots = state
        .store
        .ci_snapshots(&pr_id, MAX_SNAPSHOTS_PER_PR)
        .await?;
    let events = state.store.pr_events(&pr_id, MAX_EVENTS_PER_PR).await?;
    Ok(Json(PrDetailResponse {
        pr,
        ci_snapshots,
        events,
    }))
}

/// Handler: GET /api/artifacts/{id}
///
/// Serves the stored payload itself.
pub async fn get_artifact(
    State(state): State<Arc<AppState>>,
    Path(artifact_id): Path<i64>,
) -> Result<Response, DashboardError> {
    let loaded = state.artifacts.load(artifact_id).await.map_err(|e| {
        error!("Failed to load artifact {}: {:#}", artifact_id, e);
        DashboardError::Internal
    })?;
    let Some((record, bytes)) = loaded else {
        return Err(DashboardError::NotFound(format!(
            "artifact {}",
            artifact_id
        )));
    };
    let content_type = match record.kind {
        ArtifactKind::Diff => "text/plain; charset=utf-8",
        ArtifactKind::Log | ArtifactKind::ModelOutput => "application/json",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dashboard::dashboard_router;
    use crate::queue::{unix_now, JobSpec, RepoTarget};
    use crate::store::NewPr;
    use crate::test_support::{test_app_state, TEST_SECRET};
    use agentloop_core::CommitSha;
    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(state: Arc<AppState>) -> Router {
        dashboard_router().with_state(state)
    }

    async fn get(state: &Arc<AppState>, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app(state.clone())
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    async fn get_json(state: &Arc<AppState>, uri: &str) -> (StatusCode, Value) {
        let (status, bytes) = get(state, uri).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn code_gen(issue_number: u64) -> JobSpec {
        JobSpec::CodeGen {
            target: RepoTarget {
                repo: RepoId::new("acme", "widgets"),
                installation_id: 7,
            },
            issue_number,
        }
    }

    #[tokio::test]
    async fn test_health_reports_store() {
        let state = test_app_state(TEST_SECRET);
        let (status, body) = get_json(&state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "agentloop");
        assert_eq!(body["store"], "ok");
    }

    #[tokio::test]
    async fn test_jobs_filtered_by_status() {
        let state = test_app_state(TEST_SECRET);
        let first = state.store.enqueue(code_gen(1), unix_now()).await.unwrap();
        state.store.enqueue(code_gen(2), unix_now()).await.unwrap();
        state
            .store
            .lease("w", std::time::Duration::from_secs(60), unix_now())
            .await
            .unwrap();

        let (status, body) = get_json(&state, "/api/jobs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["jobs"].as_array().unwrap().len(), 2);

        let (_, body) = get_json(&state, "/api/jobs?status=leased").await;
        let jobs = body["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["job_id"], first);

        let (status, _) = get_json(&state, "/api/jobs?status=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_job_detail_includes_artifacts() {
        let state = test_app_state(TEST_SECRET);
        let job_id = state.store.enqueue(code_gen(1), unix_now()).await.unwrap();
        let record = state
            .artifacts
            .record(job_id, ArtifactKind::Diff, b"diff --git a/x b/x\n")
            .await
            .unwrap();

        let (status, body) = get_json(&state, &format!("/api/jobs/{}", job_id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["artifacts"][0]["artifact_id"], record.artifact_id);

        let (status, bytes) = get(&state, &format!("/api/artifacts/{}", record.artifact_id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bytes, b"diff --git a/x b/x\n");

        let (status, _) = get_json(&state, "/api/jobs/999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get_json(&state, "/api/artifacts/999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pr_detail_has_timeline() {
        let state = test_app_state(TEST_SECRET);
        let pr = PrId::new(RepoId::new("acme", "widgets"), 100);
        state
            .store
            .create_pr_state(
                NewPr {
                    pr: pr.clone(),
                    issue_number: 1,
                    installation_id: 7,
                    max_iterations: 3,
                    head_sha: CommitSha::from("abc"),
                },
                unix_now(),
            )
            .await
            .unwrap();

        let (status, body) = get_json(&state, "/api/prs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["prs"].as_array().unwrap().len(), 1);

        let (status, body) = get_json(&state, "/api/prs/acme/widgets/100").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pr"]["phase"], "awaiting_ci");
        assert!(!body["events"].as_array().unwrap().is_empty());

        let (status, _) = get_json(&state, "/api/prs/acme/widgets/101").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dashboard_negotiates_html() {
        let state = test_app_state(TEST_SECRET);
        let (status, body) = get_json(&state, "/dashboard").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["jobs_by_status"]["pending"], 0);

        let response = app(state)
            .oneshot(
                Request::get("/dashboard")
                    .header(header::ACCEPT, "text/html")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(html.contains("<html"));
        assert!(!html.contains("{prs_json}"));
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(10_000)), MAX_LIMIT);
    }
}
