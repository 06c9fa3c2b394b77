//! In-process fakes and fixtures shared by the tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentloop_core::{
    CheckRun, CiPolicy, CodeProposal, CommitSha, FileEdit, ReviewDecision, ReviewVerdict,
};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tempfile::TempDir;

use crate::agent::{Agent, AgentRun, ChatMessage, CodeTask, ReviewOutcome, ReviewTask};
use crate::artifacts::{Artifacts, FsArtifactSink};
use crate::error::JobError;
use crate::git::{GitIdentity, GitOps};
use crate::github::{
    IssueInfo, NewPullRequest, PullRequestFile, PullRequestInfo, PullRequestRef, RepoHost,
    ReviewEvent,
};
use crate::handlers::{handler_table, HandlerSettings, Services};
use crate::http_client::{ApiError, ServiceType};
use crate::ingest::{sign, InboundEvent, IngestOutcome, Ingestor};
use crate::queue::{RepoTarget, RetryPolicy};
use crate::store::Store;
use crate::worker::{Worker, WorkerSettings};
use crate::AppState;

pub const TEST_SECRET: &str = "test-secret";

/// App state over an in-memory store, for router tests.
pub fn test_app_state(secret: &str) -> Arc<AppState> {
    let store = Store::new_in_memory().unwrap();
    let artifacts_dir = std::env::temp_dir().join(format!("agentloop-test-{}", uuid::Uuid::new_v4()));
    let artifacts = Artifacts::new(Arc::new(FsArtifactSink::new(artifacts_dir)), store.clone());
    Arc::new(AppState {
        store: store.clone(),
        ingestor: Ingestor::new(store, vec![secret.to_string()], None),
        artifacts,
    })
}

#[derive(Default)]
struct HostState {
    issues: HashMap<u64, IssueInfo>,
    pulls: HashMap<u64, PullRequestInfo>,
    check_runs: Vec<CheckRun>,
    comments: Vec<(u64, String)>,
    reviews: Vec<(u64, ReviewEvent)>,
    clone_url: String,
    fail_status: Option<u16>,
    lose_next_create: bool,
    calls: usize,
}

/// A repository host that keeps everything in memory.
#[derive(Default)]
pub struct FakeRepoHost {
    state: Mutex<HostState>,
}

impl FakeRepoHost {
    pub fn add_issue(&self, number: u64, title: &str, body: &str) {
        self.state.lock().unwrap().issues.insert(
            number,
            IssueInfo {
                number,
                title: title.to_string(),
                body: body.to_string(),
            },
        );
    }

    pub fn set_clone_url(&self, url: &str) {
        self.state.lock().unwrap().clone_url = url.to_string();
    }

    pub fn set_check_runs(&self, runs: Vec<CheckRun>) {
        self.state.lock().unwrap().check_runs = runs;
    }

    pub fn add_check_run(&self, run: CheckRun) {
        self.state.lock().unwrap().check_runs.push(run);
    }

    /// Every later call fails with this HTTP status.
    pub fn fail_with_status(&self, status: u16) {
        self.state.lock().unwrap().fail_status = Some(status);
    }

    /// The next PR is opened but the caller sees a 502, as if the response
    /// was lost on the way back.
    pub fn lose_next_create(&self) {
        self.state.lock().unwrap().lose_next_create = true;
    }

    pub fn pulls(&self) -> Vec<PullRequestInfo> {
        let mut pulls: Vec<_> = self.state.lock().unwrap().pulls.values().cloned().collect();
        pulls.sort_by_key(|p| p.number);
        pulls
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    pub fn comments(&self) -> Vec<(u64, String)> {
        self.state.lock().unwrap().comments.clone()
    }

    pub fn reviews(&self) -> Vec<(u64, ReviewEvent)> {
        self.state.lock().unwrap().reviews.clone()
    }

    pub fn pull(&self, number: u64) -> Option<PullRequestInfo> {
        self.state.lock().unwrap().pulls.get(&number).cloned()
    }

    fn begin(&self, operation: &str) -> Result<std::sync::MutexGuard<'_, HostState>> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if let Some(status) = state.fail_status {
            return Err(anyhow::Error::new(ApiError {
                service: ServiceType::GitHub,
                operation: operation.to_string(),
                status: StatusCode::from_u16(status).unwrap(),
                body: "injected failure".to_string(),
            }));
        }
        Ok(state)
    }
}

fn not_found(operation: &str) -> anyhow::Error {
    anyhow::Error::new(ApiError {
        service: ServiceType::GitHub,
        operation: operation.to_string(),
        status: StatusCode::NOT_FOUND,
        body: "Not Found".to_string(),
    })
}

#[async_trait]
impl RepoHost for FakeRepoHost {
    async fn get_issue(&self, _: Option<&str>, _: &RepoTarget, issue_number: u64) -> Result<IssueInfo> {
        let state = self.begin("get issue")?;
        state
            .issues
            .get(&issue_number)
            .cloned()
            .ok_or_else(|| not_found("get issue"))
    }

    async fn get_default_branch(&self, _: Option<&str>, _: &RepoTarget) -> Result<String> {
        self.begin("get repository")?;
        Ok("main".to_string())
    }

    async fn create_pull_request(
        &self,
        _: Option<&str>,
        target: &RepoTarget,
        request: &NewPullRequest,
    ) -> Result<PullRequestInfo> {
        let mut state = self.begin("create pull request")?;
        let number = 100 + state.pulls.len() as u64;
        let info = PullRequestInfo {
            number,
            title: request.title.clone(),
            body: request.body.clone(),
            state: "open".to_string(),
            user: None,
            head: PullRequestRef {
                sha: String::new(),
                ref_name: request.head.clone(),
            },
            base: PullRequestRef {
                sha: String::new(),
                ref_name: request.base.clone(),
            },
            html_url: format!("https://github.com/{}/pull/{}", target.repo, number),
            changed_files: None,
            additions: None,
            deletions: None,
        };
        state.pulls.insert(number, info.clone());
        if std::mem::take(&mut state.lose_next_create) {
            return Err(anyhow::Error::new(ApiError {
                service: ServiceType::GitHub,
                operation: "create pull request".to_string(),
                status: StatusCode::BAD_GATEWAY,
                body: "response lost".to_string(),
            }));
        }
        Ok(info)
    }

    async fn find_open_pull_request(
        &self,
        _: Option<&str>,
        _: &RepoTarget,
        branch: &str,
    ) -> Result<Option<PullRequestInfo>> {
        let state = self.begin("list pull requests")?;
        Ok(state
            .pulls
            .values()
            .find(|p| p.state == "open" && p.head.ref_name == branch)
            .cloned())
    }

    async fn get_pull_request(
        &self,
        _: Option<&str>,
        _: &RepoTarget,
        pr_number: u64,
    ) -> Result<PullRequestInfo> {
        let state = self.begin("get pull request")?;
        state
            .pulls
            .get(&pr_number)
            .cloned()
            .ok_or_else(|| not_found("get pull request"))
    }

    async fn get_pr_diff(&self, _: Option<&str>, _: &RepoTarget, _: u64) -> Result<String> {
        self.begin("get diff")?;
        Ok("diff --git a/README.md b/README.md\n".to_string())
    }

    async fn get_pr_files(&self, _: Option<&str>, _: &RepoTarget, _: u64) -> Result<Vec<PullRequestFile>> {
        self.begin("list files")?;
        Ok(Vec::new())
    }

    async fn get_check_runs(
        &self,
        _: Option<&str>,
        _: &RepoTarget,
        sha: &CommitSha,
    ) -> Result<Vec<CheckRun>> {
        let state = self.begin("list check runs")?;
        Ok(state
            .check_runs
            .iter()
            .filter(|r| &r.sha == sha)
            .cloned()
            .collect())
    }

    async fn post_comment(&self, _: Option<&str>, _: &RepoTarget, number: u64, body: &str) -> Result<u64> {
        let mut state = self.begin("post comment")?;
        state.comments.push((number, body.to_string()));
        Ok(state.comments.len() as u64)
    }

    async fn submit_review(
        &self,
        _: Option<&str>,
        _: &RepoTarget,
        pr_number: u64,
        _: &str,
        event: ReviewEvent,
    ) -> Result<()> {
        let mut state = self.begin("submit review")?;
        state.reviews.push((pr_number, event));
        Ok(())
    }

    async fn authenticated_clone_url(&self, _: &RepoTarget) -> Result<String> {
        let state = self.begin("clone url")?;
        Ok(state.clone_url.clone())
    }
}

/// An agent that replays scripted answers.
#[derive(Default)]
pub struct FakeAgent {
    proposals: Mutex<VecDeque<CodeProposal>>,
    reviews: Mutex<VecDeque<ReviewOutcome>>,
}

impl FakeAgent {
    pub fn push_proposal(&self, proposal: CodeProposal) {
        self.proposals.lock().unwrap().push_back(proposal);
    }

    pub fn push_review(&self, outcome: ReviewOutcome) {
        self.reviews.lock().unwrap().push_back(outcome);
    }
}

fn transcript(role: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::assistant(format!("scripted {}", role))]
}

#[async_trait]
impl Agent for FakeAgent {
    async fn propose_change(&self, _: CodeTask<'_>) -> Result<AgentRun<CodeProposal>, JobError> {
        let output = self
            .proposals
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| JobError::permanent("no scripted proposal"))?;
        Ok(AgentRun {
            output,
            transcript: transcript("proposal"),
        })
    }

    async fn review(&self, _: ReviewTask<'_>) -> Result<AgentRun<ReviewOutcome>, JobError> {
        let output = self
            .reviews
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| JobError::permanent("no scripted review"))?;
        Ok(AgentRun {
            output,
            transcript: transcript("review"),
        })
    }
}

pub fn proposal(path: &str, content: &str) -> CodeProposal {
    CodeProposal {
        summary: format!("write {}", path),
        tests: String::new(),
        edits: vec![FileEdit {
            path: path.to_string(),
            content: content.to_string(),
            delete: false,
        }],
    }
}

pub fn review(decision: ReviewDecision) -> ReviewOutcome {
    ReviewOutcome::from_verdict(ReviewVerdict {
        decision,
        summary: format!("scripted {}", decision),
        findings: Vec::new(),
        ci: "success".to_string(),
    })
}

fn git(args: &[&str], cwd: &Path) {
    let status = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("GIT_AUTHOR_NAME", "seed")
        .env("GIT_AUTHOR_EMAIL", "seed@example.com")
        .env("GIT_COMMITTER_NAME", "seed")
        .env("GIT_COMMITTER_EMAIL", "seed@example.com")
        .status()
        .unwrap();
    assert!(status.success(), "git {:?} failed", args);
}

/// A bare repository with one commit on `main`, standing in for GitHub.
pub fn init_remote(dir: &Path) -> PathBuf {
    let remote = dir.join("remote.git");
    let seed = dir.join("seed");
    std::fs::create_dir_all(&remote).unwrap();
    std::fs::create_dir_all(&seed).unwrap();

    git(&["init", "--bare"], &remote);
    git(&["symbolic-ref", "HEAD", "refs/heads/main"], &remote);
    git(&["init"], &seed);
    git(&["symbolic-ref", "HEAD", "refs/heads/main"], &seed);
    std::fs::write(seed.join("README.md"), "# widgets\n").unwrap();
    git(&["add", "-A"], &seed);
    git(&["commit", "-m", "initial"], &seed);
    git(&["push", remote.to_str().unwrap(), "main"], &seed);
    remote
}

/// Head of `branch` in a bare repository.
pub fn remote_head(remote: &Path, branch: &str) -> CommitSha {
    let output = Command::new("git")
        .args(["rev-parse", &format!("refs/heads/{}", branch)])
        .current_dir(remote)
        .output()
        .unwrap();
    assert!(output.status.success());
    CommitSha::from(String::from_utf8(output.stdout).unwrap().trim())
}

/// A worker wired to fakes and a local git remote.
pub struct Harness {
    pub store: Store,
    pub host: Arc<FakeRepoHost>,
    pub agent: Arc<FakeAgent>,
    pub artifacts: Artifacts,
    pub worker: Worker,
    pub ingestor: Ingestor,
    pub remote: PathBuf,
    deliveries: Mutex<u64>,
    _dir: TempDir,
}

impl Harness {
    pub fn new(max_iterations: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let remote = init_remote(dir.path());

        let store = Store::new_in_memory().unwrap();
        let artifacts = Artifacts::new(
            Arc::new(FsArtifactSink::new(dir.path().join("artifacts"))),
            store.clone(),
        );
        let host = Arc::new(FakeRepoHost::default());
        host.set_clone_url(remote.to_str().unwrap());
        let agent = Arc::new(FakeAgent::default());

        let services = Arc::new(Services {
            store: store.clone(),
            artifacts: artifacts.clone(),
            repo_host: host.clone(),
            agent: agent.clone(),
            git: GitOps::new(
                GitIdentity {
                    name: "agentloop".to_string(),
                    email: "agentloop@example.com".to_string(),
                },
                Duration::from_secs(30),
            ),
            settings: HandlerSettings {
                workdir_root: dir.path().join("workdir"),
                max_iterations,
                ci_policy: CiPolicy::default(),
                max_tool_output_chars: 10_000,
            },
        });
        let worker = Worker::new(
            store.clone(),
            handler_table(services),
            artifacts.clone(),
            host.clone(),
            WorkerSettings {
                worker_id: "test-worker".to_string(),
                lease_duration: Duration::from_secs(120),
                job_timeout: Duration::from_secs(60),
                reap_interval: Duration::from_secs(60),
                poll_interval: Duration::from_millis(10),
                retry_policy: RetryPolicy {
                    max_attempts: 2,
                    backoff_base: Duration::ZERO,
                    backoff_cap: Duration::ZERO,
                },
                delivery_retention: Duration::from_secs(3600),
            },
        );
        let ingestor = Ingestor::new(store.clone(), vec![TEST_SECRET.to_string()], None);

        Self {
            store,
            host,
            agent,
            artifacts,
            worker,
            ingestor,
            remote,
            deliveries: Mutex::new(0),
            _dir: dir,
        }
    }

    /// Sign and ingest a webhook under a fresh delivery id.
    pub async fn deliver(&self, event_type: &str, payload: Value) -> IngestOutcome {
        let delivery_id = {
            let mut n = self.deliveries.lock().unwrap();
            *n += 1;
            format!("delivery-{}", n)
        };
        let body = serde_json::to_vec(&payload).unwrap();
        let signature = sign(TEST_SECRET, &body);
        self.ingestor
            .ingest(InboundEvent {
                body: &body,
                signature: Some(&signature),
                event_type: Some(event_type),
                delivery_id: Some(&delivery_id),
            })
            .await
            .unwrap()
    }

    /// Process jobs until the queue is idle.
    pub async fn drain(&self) -> usize {
        let mut processed = 0;
        while self.worker.run_once().await.unwrap() {
            processed += 1;
            assert!(processed < 50, "queue never drained");
        }
        processed
    }
}
