//! Outbound HTTP plumbing shared by the GitHub and LLM clients.

use std::fmt;
use std::time::{Duration, Instant};

use axum::http;
use reqwest::{Client, Request, Response, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next, Result as MiddlewareResult};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::JobError;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Ties outbound calls to the job that made them. Stored in request
/// extensions or sent as [`CORRELATION_ID_HEADER`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn for_job(job_id: i64) -> Self {
        Self(format!("job-{}", job_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    GitHub,
    Llm,
}

impl ServiceType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::Llm => "llm",
        }
    }
}

/// Stamps a correlation id on every request and logs its outcome.
pub struct CorrelationMiddleware {
    service_type: ServiceType,
}

impl CorrelationMiddleware {
    pub fn new(service_type: ServiceType) -> Self {
        Self { service_type }
    }
}

#[async_trait::async_trait]
impl Middleware for CorrelationMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        let correlation_id = match req.headers().get(CORRELATION_ID_HEADER) {
            Some(existing) => existing
                .to_str()
                .map(str::to_string)
                .unwrap_or_else(|_| Uuid::new_v4().to_string()),
            None => extensions
                .get::<CorrelationId>()
                .map(|id| id.0.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        };

        if !req.headers().contains_key(CORRELATION_ID_HEADER) {
            if let Ok(value) = correlation_id.parse() {
                req.headers_mut().insert(CORRELATION_ID_HEADER, value);
            }
        }

        let method = req.method().to_string();
        let path = extract_path(req.url().as_str());
        let started = Instant::now();

        let response = next.run(req, extensions).await;
        let elapsed_ms = started.elapsed().as_millis();

        match &response {
            Ok(resp) if resp.status().is_success() => debug!(
                service = self.service_type.as_str(),
                correlation_id = %correlation_id,
                "{} {} -> {} ({} ms)",
                method,
                path,
                resp.status().as_u16(),
                elapsed_ms
            ),
            Ok(resp) => warn!(
                service = self.service_type.as_str(),
                correlation_id = %correlation_id,
                "{} {} -> {} ({} ms)",
                method,
                path,
                resp.status().as_u16(),
                elapsed_ms
            ),
            Err(err) => warn!(
                service = self.service_type.as_str(),
                correlation_id = %correlation_id,
                "{} {} failed after {} ms: {}",
                method,
                path,
                elapsed_ms,
                err
            ),
        }

        response
    }
}

/// A non-success response from a remote API.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub service: ServiceType,
    pub operation: String,
    pub status: StatusCode,
    pub body: String,
}

impl ApiError {
    /// Rate limits and server-side failures are worth retrying; any other
    /// client error means the request itself is wrong.
    pub fn is_transient(&self) -> bool {
        self.status == StatusCode::TOO_MANY_REQUESTS
            || self.status == StatusCode::REQUEST_TIMEOUT
            || self.status.is_server_error()
            || (self.status == StatusCode::FORBIDDEN
                && self.body.to_ascii_lowercase().contains("rate limit"))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} API error during {}: {} - {}",
            self.service.as_str(),
            self.operation,
            self.status,
            self.body
        )
    }
}

impl std::error::Error for ApiError {}

/// Classify a client error for the retry policy.
///
/// API errors follow [`ApiError::is_transient`]; transport failures are
/// transient; anything else (bad credentials, undecodable responses) is
/// permanent.
pub fn classify_error(err: &anyhow::Error) -> JobError {
    let message = format!("{:#}", err);
    for cause in err.chain() {
        if let Some(api) = cause.downcast_ref::<ApiError>() {
            return if api.is_transient() {
                JobError::Transient(message)
            } else {
                JobError::Permanent(message)
            };
        }
        if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
            if e.is_decode() {
                return JobError::Permanent(message);
            }
            return JobError::Transient(message);
        }
        if cause.downcast_ref::<reqwest_middleware::Error>().is_some() {
            return JobError::Transient(message);
        }
    }
    JobError::Permanent(message)
}

/// Logged paths never include query strings, which can carry tokens.
fn extract_path(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

pub fn create_client(service_type: ServiceType, timeout: Option<Duration>) -> ClientWithMiddleware {
    let mut builder = Client::builder().user_agent(concat!("agentloop/", env!("CARGO_PKG_VERSION")));
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    let client = builder.build().expect("Failed to create HTTP client");

    ClientBuilder::new(client)
        .with(CorrelationMiddleware::new(service_type))
        .build()
}
