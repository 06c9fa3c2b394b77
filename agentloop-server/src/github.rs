use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Method, StatusCode};
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{info, warn};

use agentloop_core::{CheckConclusion, CheckRun, CommitSha};

use crate::http_client::{create_client, ApiError, ServiceType, CORRELATION_ID_HEADER};
use crate::queue::RepoTarget;

/// An issue, as much of it as the agents need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueInfo {
    pub number: u64,
    pub title: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub sha: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestUser {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestInfo {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub body: String,
    #[serde(default)]
    pub state: String,
    pub user: Option<PullRequestUser>,
    pub head: PullRequestRef,
    pub base: PullRequestRef,
    #[serde(default)]
    pub html_url: String,
    pub changed_files: Option<u64>,
    pub additions: Option<u64>,
    pub deletions: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestFile {
    pub filename: String,
    pub status: String,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
    pub patch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewPullRequest {
    pub title: String,
    pub head: String,
    pub base: String,
    pub body: String,
}

/// Event of a submitted pull request review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewEvent {
    Approve,
    RequestChanges,
    Comment,
}

fn null_as_empty<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// The source-control platform, as seen by job handlers.
///
/// Every call is scoped to one installation; `correlation_id` is forwarded
/// as a header so the call can be traced back to its job.
#[async_trait]
pub trait RepoHost: Send + Sync {
    async fn get_issue(
        &self,
        correlation_id: Option<&str>,
        target: &RepoTarget,
        issue_number: u64,
    ) -> Result<IssueInfo>;

    async fn get_default_branch(&self, correlation_id: Option<&str>, target: &RepoTarget) -> Result<String>;

    async fn create_pull_request(
        &self,
        correlation_id: Option<&str>,
        target: &RepoTarget,
        request: &NewPullRequest,
    ) -> Result<PullRequestInfo>;

    async fn get_pull_request(
        &self,
        correlation_id: Option<&str>,
        target: &RepoTarget,
        pr_number: u64,
    ) -> Result<PullRequestInfo>;

    /// The open PR whose head is `branch` in the target repository, if any.
    async fn find_open_pull_request(
        &self,
        correlation_id: Option<&str>,
        target: &RepoTarget,
        branch: &str,
    ) -> Result<Option<PullRequestInfo>>;

    async fn get_pr_diff(
        &self,
        correlation_id: Option<&str>,
        target: &RepoTarget,
        pr_number: u64,
    ) -> Result<String>;

    async fn get_pr_files(
        &self,
        correlation_id: Option<&str>,
        target: &RepoTarget,
        pr_number: u64,
    ) -> Result<Vec<PullRequestFile>>;

    /// Every check run and commit status reported for `sha`.
    async fn get_check_runs(
        &self,
        correlation_id: Option<&str>,
        target: &RepoTarget,
        sha: &CommitSha,
    ) -> Result<Vec<CheckRun>>;

    async fn post_comment(
        &self,
        correlation_id: Option<&str>,
        target: &RepoTarget,
        number: u64,
        body: &str,
    ) -> Result<u64>;

    async fn submit_review(
        &self,
        correlation_id: Option<&str>,
        target: &RepoTarget,
        pr_number: u64,
        body: &str,
        event: ReviewEvent,
    ) -> Result<()>;

    /// HTTPS clone URL carrying a short-lived installation token.
    async fn authenticated_clone_url(&self, target: &RepoTarget) -> Result<String>;
}

#[derive(Clone)]
pub struct GitHubClient {
    client: ClientWithMiddleware,
    api_base: String,
    app_id: u64,
    private_key: String,
    token_cache: Arc<RwLock<HashMap<u64, (String, SystemTime)>>>,
}

#[derive(Debug, Serialize)]
struct GitHubAppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Deserialize)]
struct RepositoryResponse {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct CommentResponse {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct CheckRunsResponse {
    total_count: u64,
    check_runs: Vec<CheckRunResponse>,
}

#[derive(Debug, Deserialize)]
struct CheckRunResponse {
    name: String,
    head_sha: String,
    status: String,
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CombinedStatusResponse {
    sha: String,
    #[serde(default)]
    statuses: Vec<CommitStatusResponse>,
}

#[derive(Debug, Deserialize)]
struct CommitStatusResponse {
    context: String,
    state: String,
}

const PER_PAGE: usize = 100;
const MAX_PAGES: usize = 10;

impl CommitStatusResponse {
    fn conclusion(&self) -> CheckConclusion {
        match self.state.as_str() {
            "success" => CheckConclusion::Success,
            "pending" => CheckConclusion::Pending,
            "failure" => CheckConclusion::Failure,
            _ => CheckConclusion::Error,
        }
    }
}

/// Web host for an API base: `api.github.com` serves `github.com`;
/// GitHub Enterprise serves its API under `/api/v3` on the web host.
fn web_base(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_suffix("/api/v3") {
        return rest.to_string();
    }
    trimmed.replacen("://api.", "://", 1)
}

/// Clone URL for `repo` authenticated with `token` as `x-access-token`.
pub fn clone_url_with_token(api_base: &str, repo: &str, token: &str) -> Result<String> {
    let mut url = url::Url::parse(&format!("{}/{}.git", web_base(api_base), repo))
        .context("Failed to build clone URL")?;
    url.set_username("x-access-token")
        .map_err(|_| anyhow!("Clone URL cannot carry credentials"))?;
    url.set_password(Some(token))
        .map_err(|_| anyhow!("Clone URL cannot carry credentials"))?;
    Ok(url.to_string())
}

impl GitHubClient {
    pub fn new(app_id: u64, private_key: String, api_base: impl Into<String>) -> Self {
        Self {
            client: create_client(ServiceType::GitHub, None),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            app_id,
            private_key,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn generate_jwt(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_secs();

        let claims = GitHubAppClaims {
            iss: self.app_id,
            iat: now - 60,  // Issued 60 seconds ago to account for clock skew
            exp: now + 540, // GitHub rejects anything over 10 minutes
        };

        let header = Header::new(Algorithm::RS256);
        let encoding_key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .context("Failed to parse private key")?;

        encode(&header, &claims, &encoding_key).context("Failed to encode JWT")
    }

    async fn get_installation_token(&self, installation_id: u64) -> Result<String> {
        // Reuse the cached token while it has more than 5 minutes left
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.get(&installation_id) {
                if expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default()
                    .as_secs()
                    > 300
                {
                    return Ok(token.clone());
                }
            }
        }

        let jwt = self.generate_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, installation_id
        );

        info!("Requesting new installation access token for {}", installation_id);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .context("Failed to send installation token request")?;

        if !response.status().is_success() {
            return Err(api_error("installation token", response).await.into());
        }

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse installation token response")?;

        let expires_at = chrono::DateTime::parse_from_rfc3339(&token_response.expires_at)
            .context("Failed to parse token expiration")?
            .with_timezone(&Utc);
        let expires_at_system =
            UNIX_EPOCH + std::time::Duration::from_secs(expires_at.timestamp().max(0) as u64);

        {
            let mut cache = self.token_cache.write().await;
            cache.insert(
                installation_id,
                (token_response.token.clone(), expires_at_system),
            );
        }

        Ok(token_response.token)
    }

    /// Send an authenticated API request, retrying once with a fresh token
    /// on 401.
    #[allow(clippy::too_many_arguments)]
    async fn send(
        &self,
        correlation_id: Option<&str>,
        installation_id: u64,
        method: Method,
        path: &str,
        accept: &str,
        body: Option<&serde_json::Value>,
        operation: &str,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.api_base, path);

        for attempt in 0..2 {
            let token = self.get_installation_token(installation_id).await?;
            let mut request_builder = self
                .client
                .request(method.clone(), &url)
                .header("Authorization", format!("Bearer {}", token))
                .header("Accept", accept)
                .header("X-GitHub-Api-Version", "2022-11-28");

            if let Some(body) = body {
                request_builder = request_builder.json(body);
            }
            if let Some(cid) = correlation_id {
                request_builder = request_builder.header(CORRELATION_ID_HEADER, cid);
            }

            let response = request_builder
                .send()
                .await
                .with_context(|| format!("Failed to send {} request", operation))?;

            if response.status() == StatusCode::UNAUTHORIZED && attempt == 0 {
                warn!("Got 401 during {}, retrying with a fresh token", operation);
                self.token_cache.write().await.remove(&installation_id);
                continue;
            }
            if !response.status().is_success() {
                return Err(api_error(operation, response).await.into());
            }
            return Ok(response);
        }

        Err(anyhow!("GitHub kept rejecting credentials during {}", operation))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        correlation_id: Option<&str>,
        installation_id: u64,
        path: &str,
        operation: &str,
    ) -> Result<T> {
        self.send(
            correlation_id,
            installation_id,
            Method::GET,
            path,
            "application/vnd.github+json",
            None,
            operation,
        )
        .await?
        .json()
        .await
        .with_context(|| format!("Failed to parse {} response", operation))
    }

    async fn check_runs_page(
        &self,
        correlation_id: Option<&str>,
        target: &RepoTarget,
        sha: &CommitSha,
        page: usize,
    ) -> Result<CheckRunsResponse> {
        let path = format!(
            "/repos/{}/commits/{}/check-runs?per_page={}&page={}",
            target.repo, sha, PER_PAGE, page
        );
        self.get_json(correlation_id, target.installation_id, &path, "list check runs")
            .await
    }
}

async fn api_error(operation: &str, response: reqwest::Response) -> ApiError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    ApiError {
        service: ServiceType::GitHub,
        operation: operation.to_string(),
        status,
        body,
    }
}

#[async_trait]
impl RepoHost for GitHubClient {
    async fn get_issue(
        &self,
        correlation_id: Option<&str>,
        target: &RepoTarget,
        issue_number: u64,
    ) -> Result<IssueInfo> {
        info!("Fetching issue #{} from {}", issue_number, target.repo);
        let path = format!("/repos/{}/issues/{}", target.repo, issue_number);
        self.get_json(correlation_id, target.installation_id, &path, "get issue")
            .await
    }

    async fn get_default_branch(&self, correlation_id: Option<&str>, target: &RepoTarget) -> Result<String> {
        let path = format!("/repos/{}", target.repo);
        let repo: RepositoryResponse = self
            .get_json(correlation_id, target.installation_id, &path, "get repository")
            .await?;
        Ok(repo.default_branch)
    }

    async fn create_pull_request(
        &self,
        correlation_id: Option<&str>,
        target: &RepoTarget,
        request: &NewPullRequest,
    ) -> Result<PullRequestInfo> {
        info!(
            "Opening PR {} -> {} in {}",
            request.head, request.base, target.repo
        );
        let path = format!("/repos/{}/pulls", target.repo);
        let body = serde_json::to_value(request)?;
        let pr: PullRequestInfo = self
            .send(
                correlation_id,
                target.installation_id,
                Method::POST,
                &path,
                "application/vnd.github+json",
                Some(&body),
                "create pull request",
            )
            .await?
            .json()
            .await
            .context("Failed to parse create pull request response")?;
        info!("Opened PR #{} ({})", pr.number, pr.html_url);
        Ok(pr)
    }

    async fn get_pull_request(
        &self,
        correlation_id: Option<&str>,
        target: &RepoTarget,
        pr_number: u64,
    ) -> Result<PullRequestInfo> {
        let path = format!("/repos/{}/pulls/{}", target.repo, pr_number);
        let pr: PullRequestInfo = self
            .get_json(correlation_id, target.installation_id, &path, "get pull request")
            .await?;
        info!(
            "Fetched PR #{} (head: {}, base: {})",
            pr.number, pr.head.sha, pr.base.ref_name
        );
        Ok(pr)
    }

    async fn find_open_pull_request(
        &self,
        correlation_id: Option<&str>,
        target: &RepoTarget,
        branch: &str,
    ) -> Result<Option<PullRequestInfo>> {
        let head: String =
            url::form_urlencoded::byte_serialize(format!("{}:{}", target.repo.owner, branch).as_bytes())
                .collect();
        let path = format!("/repos/{}/pulls?state=open&head={}&per_page=1", target.repo, head);
        let pulls: Vec<PullRequestInfo> = self
            .get_json(correlation_id, target.installation_id, &path, "list pull requests")
            .await?;
        Ok(pulls.into_iter().find(|pr| pr.head.ref_name == branch))
    }

    async fn get_pr_diff(
        &self,
        correlation_id: Option<&str>,
        target: &RepoTarget,
        pr_number: u64,
    ) -> Result<String> {
        let path = format!("/repos/{}/pulls/{}", target.repo, pr_number);
        let diff = self
            .send(
                correlation_id,
                target.installation_id,
                Method::GET,
                &path,
                "application/vnd.github.v3.diff",
                None,
                "get pull request diff",
            )
            .await?
            .text()
            .await
            .context("Failed to read diff response body")?;
        info!("Fetched diff for PR #{} ({} bytes)", pr_number, diff.len());
        Ok(diff)
    }

    async fn get_pr_files(
        &self,
        correlation_id: Option<&str>,
        target: &RepoTarget,
        pr_number: u64,
    ) -> Result<Vec<PullRequestFile>> {
        let mut all_files = Vec::new();
        for page in 1..=MAX_PAGES {
            let path = format!(
                "/repos/{}/pulls/{}/files?per_page={}&page={}",
                target.repo, pr_number, PER_PAGE, page
            );
            let files: Vec<PullRequestFile> = self
                .get_json(correlation_id, target.installation_id, &path, "list pull request files")
                .await?;
            let count = files.len();
            all_files.extend(files);
            if count < PER_PAGE {
                break;
            }
        }
        Ok(all_files)
    }

    async fn get_check_runs(
        &self,
        correlation_id: Option<&str>,
        target: &RepoTarget,
        sha: &CommitSha,
    ) -> Result<Vec<CheckRun>> {
        let mut runs = Vec::new();
        for page in 1..=MAX_PAGES {
            let response = self.check_runs_page(correlation_id, target, sha, page).await?;
            let count = response.check_runs.len();
            runs.extend(response.check_runs.into_iter().map(|run| {
                CheckRun::new(
                    run.name,
                    run.head_sha,
                    CheckConclusion::from_github(&run.status, run.conclusion.as_deref()),
                )
            }));
            if count < PER_PAGE || runs.len() as u64 >= response.total_count {
                break;
            }
        }

        // Legacy commit statuses (external CI services) count as checks too.
        let path = format!("/repos/{}/commits/{}/status", target.repo, sha);
        let combined: CombinedStatusResponse = self
            .get_json(correlation_id, target.installation_id, &path, "get combined status")
            .await?;
        runs.extend(combined.statuses.iter().map(|status| {
            CheckRun::new(status.context.clone(), combined.sha.clone(), status.conclusion())
        }));

        info!("Found {} checks for {} on {}", runs.len(), sha.short(), target.repo);
        Ok(runs)
    }

    async fn post_comment(
        &self,
        correlation_id: Option<&str>,
        target: &RepoTarget,
        number: u64,
        body: &str,
    ) -> Result<u64> {
        info!("Posting comment to #{} in {}", number, target.repo);
        let path = format!("/repos/{}/issues/{}/comments", target.repo, number);
        let request_body = serde_json::json!({ "body": body });
        let comment: CommentResponse = self
            .send(
                correlation_id,
                target.installation_id,
                Method::POST,
                &path,
                "application/vnd.github+json",
                Some(&request_body),
                "post comment",
            )
            .await?
            .json()
            .await
            .context("Failed to parse comment response")?;
        info!("Posted comment with ID: {}", comment.id);
        Ok(comment.id)
    }

    async fn submit_review(
        &self,
        correlation_id: Option<&str>,
        target: &RepoTarget,
        pr_number: u64,
        body: &str,
        event: ReviewEvent,
    ) -> Result<()> {
        let path = format!("/repos/{}/pulls/{}/reviews", target.repo, pr_number);
        let request_body = serde_json::json!({ "body": body, "event": event });
        self.send(
            correlation_id,
            target.installation_id,
            Method::POST,
            &path,
            "application/vnd.github+json",
            Some(&request_body),
            "submit review",
        )
        .await?;
        Ok(())
    }

    async fn authenticated_clone_url(&self, target: &RepoTarget) -> Result<String> {
        let token = self.get_installation_token(target.installation_id).await?;
        clone_url_with_token(&self.api_base, &target.repo.full_name(), &token)
    }
}
