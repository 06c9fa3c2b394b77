use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info_span, warn, Instrument};

use crate::error::IngestError;
use crate::ingest::{InboundEvent, IngestOutcome, MAX_BODY_BYTES};
use crate::AppState;

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = match &self {
            IngestError::AuthFailure => StatusCode::UNAUTHORIZED,
            IngestError::MalformedEvent(_) => StatusCode::BAD_REQUEST,
            IngestError::Store(e) => {
                error!("Failed to record webhook: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match &self {
            IngestError::Store(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "status": "rejected", "error": message }))).into_response()
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

/// Runs the rest of the request inside a span keyed by the delivery id.
async fn delivery_span(request: Request, next: Next) -> Response {
    let delivery_id = header(request.headers(), "x-github-delivery")
        .unwrap_or("-")
        .to_string();
    let event_type = header(request.headers(), "x-github-event")
        .unwrap_or("-")
        .to_string();
    let span = info_span!("webhook", delivery_id = %delivery_id, event_type = %event_type);
    next.run(request).instrument(span).await
}

pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Json<IngestOutcome>, IngestError> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES).await.map_err(|e| {
        warn!("Failed to read webhook body: {}", e);
        IngestError::MalformedEvent("body unreadable or too large".to_string())
    })?;

    let outcome = state
        .ingestor
        .ingest(InboundEvent {
            body: &bytes,
            signature: header(&parts.headers, "x-hub-signature-256"),
            event_type: header(&parts.headers, "x-github-event"),
            delivery_id: header(&parts.headers, "x-github-delivery"),
        })
        .await?;

    Ok(Json(outcome))
}

pub fn webhook_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook", post(github_webhook_handler))
        .route_layer(middleware::from_fn(delivery_span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::sign;
    use crate::test_support::test_app_state;
    use axum::body::Body;
    use tower::ServiceExt;

    const SECRET: &str = "test-secret";

    fn issue_body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "action": "opened",
            "repository": {"full_name": "acme/widgets"},
            "installation": {"id": 42},
            "issue": {"number": 12}
        }))
        .unwrap()
    }

    fn request(body: Vec<u8>, signature: Option<String>, delivery: Option<&str>) -> Request {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json")
            .header("x-github-event", "issues");
        if let Some(signature) = signature {
            builder = builder.header("x-hub-signature-256", signature);
        }
        if let Some(delivery) = delivery {
            builder = builder.header("x-github-delivery", delivery);
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn app(state: Arc<AppState>) -> Router {
        webhook_router().with_state(state)
    }

    #[tokio::test]
    async fn test_valid_webhook_is_accepted_then_duplicate() {
        let state = test_app_state(SECRET);
        let body = issue_body();
        let signature = sign(SECRET, &body);

        let response = app(state.clone())
            .oneshot(request(body.clone(), Some(signature.clone()), Some("d-1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let first = json_body(response).await;
        assert_eq!(first["status"], "accepted");
        assert!(first["job_id"].is_i64());

        let response = app(state.clone())
            .oneshot(request(body, Some(signature), Some("d-1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "duplicate");

        assert_eq!(state.store.list_jobs(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_signature_is_401_without_digest() {
        let state = test_app_state(SECRET);
        let body = issue_body();
        let expected = sign(SECRET, &body);

        let response = app(state.clone())
            .oneshot(request(body.clone(), Some(sign("wrong", &body)), Some("d-2")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let text = json_body(response).await.to_string();
        assert!(!text.contains(expected.trim_start_matches("sha256=")));

        let response = app(state.clone())
            .oneshot(request(body, None, Some("d-2")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(state.store.list_jobs(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_delivery_header_is_400() {
        let state = test_app_state(SECRET);
        let body = issue_body();
        let signature = sign(SECRET, &body);

        let response = app(state)
            .oneshot(request(body, Some(signature), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unsigned_request_without_delivery_is_401() {
        let state = test_app_state(SECRET);

        let response = app(state.clone())
            .oneshot(request(issue_body(), None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(state.store.list_jobs(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_body_is_400() {
        let state = test_app_state(SECRET);
        let body = vec![b' '; MAX_BODY_BYTES + 1];
        let signature = sign(SECRET, &body);

        let response = app(state)
            .oneshot(request(body, Some(signature), Some("d-big")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
