//! Webhook ingestion: authenticate, normalise into a job, persist.
//!
//! Ingestion never runs work. It records the delivery and at most one job in
//! a single transaction and returns; the worker does the rest.

use agentloop_core::{CommitSha, PrId, RepoId};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use crate::error::IngestError;
use crate::queue::{unix_now, JobSpec, PrActivity, RepoTarget};
use crate::store::{Delivery, DeliveryOutcome, Store};

/// Largest webhook body accepted.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

type HmacSha256 = Hmac<Sha256>;

fn verify_github_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };

    mac.update(payload);

    // Constant-time comparison
    mac.verify_slice(&signature_bytes).is_ok()
}

/// True when `signature` is valid under any configured secret.
pub fn verify_signature(secrets: &[String], payload: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };
    secrets
        .iter()
        .filter(|s| !s.is_empty())
        .any(|secret| verify_github_signature(secret, payload, signature))
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Deserialize, Clone)]
pub struct Repository {
    pub full_name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Installation {
    pub id: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Issue {
    pub number: u64,
    #[serde(default)]
    pub labels: Vec<Label>,
    /// Present when the "issue" is really a pull request.
    pub pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitRef {
    pub sha: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequest {
    pub number: u64,
    pub head: Option<GitRef>,
    #[serde(default)]
    pub merged: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequestLink {
    pub number: u64,
}

/// The CI object of `check_suite`, `check_run` and `workflow_run` events.
#[derive(Debug, Deserialize, Clone)]
pub struct CiRun {
    pub head_sha: Option<String>,
    #[serde(default)]
    pub pull_requests: Vec<PullRequestLink>,
}

/// `repository` is an object in GitHub payloads but a plain name in
/// hand-written simulation payloads.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum RepositoryField {
    Object(Repository),
    Name(String),
}

impl RepositoryField {
    fn full_name(&self) -> &str {
        match self {
            Self::Object(repo) => &repo.full_name,
            Self::Name(name) => name,
        }
    }
}

/// Union of the fields the supported events carry.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub action: Option<String>,
    pub repository: Option<RepositoryField>,
    pub installation: Option<Installation>,
    pub issue: Option<Issue>,
    pub label: Option<Label>,
    pub pull_request: Option<PullRequest>,
    pub before: Option<String>,
    pub after: Option<String>,
    pub check_suite: Option<CiRun>,
    pub check_run: Option<CiRun>,
    pub workflow_run: Option<CiRun>,
    /// Top-level PR list, seen on some `check_suite` deliveries.
    #[serde(default)]
    pub pull_requests: Vec<PullRequestLink>,
    // Fields of the synthetic `ci_completed` event.
    pub repo: Option<String>,
    pub pr_number: Option<u64>,
    pub head_sha: Option<String>,
    pub sha: Option<String>,
}

impl WebhookPayload {
    fn repo(&self) -> Result<RepoId, IngestError> {
        let full_name = self
            .repository
            .as_ref()
            .map(RepositoryField::full_name)
            .or(self.repo.as_deref())
            .ok_or_else(|| malformed("missing repository"))?;
        RepoId::parse_full_name(full_name)
            .ok_or_else(|| malformed(format!("invalid repository name '{}'", full_name)))
    }

    fn installation_id(&self) -> Result<u64, IngestError> {
        self.installation
            .as_ref()
            .map(|i| i.id)
            .ok_or_else(|| malformed("missing installation"))
    }

    fn pull_request(&self) -> Result<&PullRequest, IngestError> {
        self.pull_request
            .as_ref()
            .ok_or_else(|| malformed("missing pull_request"))
    }
}

fn malformed(reason: impl Into<String>) -> IngestError {
    IngestError::MalformedEvent(reason.into())
}

/// Abbreviated or full hex object name.
fn is_hex_sha(s: &str) -> bool {
    (7..=40).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn sha(value: Option<&str>, what: &str) -> Result<CommitSha, IngestError> {
    match value.map(str::trim) {
        Some(s) if s.is_empty() => Err(malformed(format!("missing {}", what))),
        Some(s) if is_hex_sha(s) => Ok(CommitSha::from(s)),
        Some(s) => Err(malformed(format!("invalid {} '{}'", what, s.escape_debug()))),
        None => Err(malformed(format!("missing {}", what))),
    }
}

// =============================================================================
// Normalisation
// =============================================================================

/// Map an event to the job it should produce. `Ok(None)` means the event is
/// valid but not one we act on.
pub fn normalize(
    event_type: &str,
    payload: &WebhookPayload,
    trigger_label: Option<&str>,
) -> Result<Option<JobSpec>, IngestError> {
    let action = payload.action.as_deref().unwrap_or_default();

    match (event_type, action) {
        ("issues", "opened" | "labeled") => {
            let issue = payload.issue.as_ref().ok_or_else(|| malformed("missing issue"))?;
            if issue.pull_request.is_some() {
                return Ok(None);
            }
            // Without a trigger label every new issue is work, and a label
            // being added to an existing one is not.
            let triggered = match (trigger_label, action) {
                (Some(label), "labeled") => payload.label.as_ref().is_some_and(|l| l.name == label),
                (Some(label), _) => issue.labels.iter().any(|l| l.name == label),
                (None, "labeled") => false,
                (None, _) => true,
            };
            if !triggered {
                return Ok(None);
            }
            Ok(Some(JobSpec::CodeGen {
                target: RepoTarget {
                    repo: payload.repo()?,
                    installation_id: payload.installation_id()?,
                },
                issue_number: issue.number,
            }))
        }

        ("pull_request", "opened" | "reopened") => {
            let pr = payload.pull_request()?;
            let head_sha = sha(pr.head.as_ref().map(|h| h.sha.as_str()), "head sha")?;
            Ok(Some(pr_event(payload, pr.number, PrActivity::Opened { head_sha })?))
        }

        ("pull_request", "synchronize") => {
            let pr = payload.pull_request()?;
            let before = sha(payload.before.as_deref(), "before sha")?;
            let after = sha(
                payload
                    .after
                    .as_deref()
                    .or(pr.head.as_ref().map(|h| h.sha.as_str())),
                "after sha",
            )?;
            Ok(Some(pr_event(payload, pr.number, PrActivity::Pushed { before, after })?))
        }

        ("pull_request", "closed") => {
            let pr = payload.pull_request()?;
            Ok(Some(pr_event(
                payload,
                pr.number,
                PrActivity::Closed { merged: pr.merged },
            )?))
        }

        ("check_suite" | "check_run" | "workflow_run", "completed") => {
            let run = match event_type {
                "check_suite" => payload.check_suite.as_ref(),
                "check_run" => payload.check_run.as_ref(),
                _ => payload.workflow_run.as_ref(),
            }
            .ok_or_else(|| malformed(format!("missing {}", event_type)))?;

            // CI on a branch without a PR concerns nobody.
            let Some(pr) = run
                .pull_requests
                .first()
                .or(payload.pull_requests.first())
            else {
                return Ok(None);
            };
            let head_sha = sha(run.head_sha.as_deref(), "head sha")?;
            Ok(Some(pr_event(payload, pr.number, PrActivity::CiActivity { head_sha })?))
        }

        ("ci_completed", _) => {
            let number = payload
                .pull_request
                .as_ref()
                .map(|pr| pr.number)
                .or(payload.pr_number)
                .ok_or_else(|| malformed("missing PR number"))?;
            let head_sha = sha(
                payload
                    .head_sha
                    .as_deref()
                    .or(payload.sha.as_deref())
                    .or(payload
                        .pull_request
                        .as_ref()
                        .and_then(|pr| pr.head.as_ref())
                        .map(|h| h.sha.as_str())),
                "head sha",
            )?;
            Ok(Some(pr_event(payload, number, PrActivity::CiActivity { head_sha })?))
        }

        _ => Ok(None),
    }
}

fn pr_event(payload: &WebhookPayload, number: u64, activity: PrActivity) -> Result<JobSpec, IngestError> {
    Ok(JobSpec::PrEvent {
        pr: PrId::new(payload.repo()?, number),
        activity,
    })
}

// =============================================================================
// Ingestion
// =============================================================================

/// Result of a successful ingestion, serialised as the HTTP response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Accepted { job_id: i64 },
    Duplicate {
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<i64>,
    },
    Ignored,
}

/// One inbound request, as raw as it arrived.
#[derive(Debug, Clone, Copy)]
pub struct InboundEvent<'a> {
    pub body: &'a [u8],
    pub signature: Option<&'a str>,
    pub event_type: Option<&'a str>,
    pub delivery_id: Option<&'a str>,
}

pub struct Ingestor {
    store: Store,
    secrets: Vec<String>,
    trigger_label: Option<String>,
}

impl Ingestor {
    pub fn new(store: Store, secrets: Vec<String>, trigger_label: Option<String>) -> Self {
        Self {
            store,
            secrets,
            trigger_label,
        }
    }

    pub async fn ingest(&self, event: InboundEvent<'_>) -> Result<IngestOutcome, IngestError> {
        if !verify_signature(&self.secrets, event.body, event.signature) {
            warn!(
                delivery_id = event.delivery_id.unwrap_or("-"),
                "Rejected webhook with invalid signature"
            );
            return Err(IngestError::AuthFailure);
        }

        let delivery_id = event
            .delivery_id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| malformed("missing X-GitHub-Delivery header"))?;

        let event_type = event
            .event_type
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| malformed("missing X-GitHub-Event header"))?;

        if event.body.len() > MAX_BODY_BYTES {
            return Err(malformed("body too large"));
        }

        let payload: WebhookPayload = serde_json::from_slice(event.body)
            .map_err(|e| malformed(format!("invalid JSON body: {}", e)))?;

        let spec = normalize(event_type, &payload, self.trigger_label.as_deref())?;

        let delivery = Delivery {
            delivery_id: delivery_id.to_string(),
            event_type: event_type.to_string(),
            received_at: unix_now(),
        };
        let outcome = match self.store.record_delivery(delivery, spec).await? {
            DeliveryOutcome::Enqueued { job_id } => {
                info!(delivery_id, event_type, job_id, "Accepted webhook");
                IngestOutcome::Accepted { job_id }
            }
            DeliveryOutcome::AlreadyQueued { job_id } => {
                info!(delivery_id, job_id, "Issue already has a code-gen job queued");
                IngestOutcome::Duplicate {
                    job_id: Some(job_id),
                }
            }
            DeliveryOutcome::Duplicate => {
                info!(delivery_id, "Duplicate delivery");
                IngestOutcome::Duplicate { job_id: None }
            }
            DeliveryOutcome::Recorded => {
                info!(delivery_id, event_type, "Ignored webhook");
                IngestOutcome::Ignored
            }
        };
        Ok(outcome)
    }
}

/// `X-Hub-Signature-256` value for a body, as GitHub computes it.
pub fn signature_header(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[cfg(test)]
pub(crate) fn sign(secret: &str, body: &[u8]) -> String {
    signature_header(secret, body).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "s3cret";

    fn payload(value: serde_json::Value) -> WebhookPayload {
        serde_json::from_value(value).unwrap()
    }

    fn ingestor(store: &Store) -> Ingestor {
        Ingestor::new(
            store.clone(),
            vec![SECRET.to_string(), "reviewer".to_string()],
            None,
        )
    }

    fn issue_opened() -> serde_json::Value {
        json!({
            "action": "opened",
            "repository": {"full_name": "acme/widgets"},
            "installation": {"id": 42},
            "issue": {"number": 12, "labels": []}
        })
    }

    #[test]
    fn test_signature_verification() {
        let body = br#"{"a":1}"#;
        let secrets = vec![SECRET.to_string()];
        assert!(verify_signature(&secrets, body, Some(&sign(SECRET, body))));
        assert!(!verify_signature(&secrets, body, Some(&sign("wrong", body))));
        assert!(!verify_signature(&secrets, b"tampered", Some(&sign(SECRET, body))));
        assert!(!verify_signature(&secrets, body, None));
        assert!(!verify_signature(&secrets, body, Some("sha1=abcd")));
        assert!(!verify_signature(&secrets, body, Some("sha256=not-hex")));
    }

    #[test]
    fn test_any_configured_secret_is_accepted() {
        let body = b"{}";
        let secrets = vec!["code".to_string(), "reviewer".to_string()];
        assert!(verify_signature(&secrets, body, Some(&sign("reviewer", body))));
        assert!(!verify_signature(&[String::new()], body, Some(&sign("", body))));
    }

    #[test]
    fn test_issue_opened_maps_to_code_gen() {
        let spec = normalize("issues", &payload(issue_opened()), None).unwrap();
        assert_eq!(
            spec,
            Some(JobSpec::CodeGen {
                target: RepoTarget {
                    repo: RepoId::new("acme", "widgets"),
                    installation_id: 42,
                },
                issue_number: 12,
            })
        );
    }

    #[test]
    fn test_trigger_label_filters_issues() {
        let unlabeled = payload(issue_opened());
        assert_eq!(normalize("issues", &unlabeled, Some("agent")).unwrap(), None);

        let labeled = payload(json!({
            "action": "labeled",
            "repository": {"full_name": "acme/widgets"},
            "installation": {"id": 42},
            "issue": {"number": 12, "labels": [{"name": "agent"}]},
            "label": {"name": "agent"}
        }));
        assert!(normalize("issues", &labeled, Some("agent")).unwrap().is_some());

        assert_eq!(normalize("issues", &labeled, None).unwrap(), None);

        let other_label = payload(json!({
            "action": "labeled",
            "repository": {"full_name": "acme/widgets"},
            "installation": {"id": 42},
            "issue": {"number": 12, "labels": [{"name": "agent"}, {"name": "bug"}]},
            "label": {"name": "bug"}
        }));
        assert_eq!(normalize("issues", &other_label, Some("agent")).unwrap(), None);
    }

    #[test]
    fn test_pull_request_events() {
        let synchronize = payload(json!({
            "action": "synchronize",
            "repository": {"full_name": "acme/widgets"},
            "pull_request": {"number": 7, "head": {"sha": "b2b2b2b"}},
            "before": "a1a1a1a",
            "after": "b2b2b2b"
        }));
        assert_eq!(
            normalize("pull_request", &synchronize, None).unwrap(),
            Some(JobSpec::PrEvent {
                pr: PrId::new(RepoId::new("acme", "widgets"), 7),
                activity: PrActivity::Pushed {
                    before: CommitSha::from("a1a1a1a"),
                    after: CommitSha::from("b2b2b2b"),
                },
            })
        );

        let closed = payload(json!({
            "action": "closed",
            "repository": {"full_name": "acme/widgets"},
            "pull_request": {"number": 7, "merged": true}
        }));
        assert!(matches!(
            normalize("pull_request", &closed, None).unwrap(),
            Some(JobSpec::PrEvent {
                activity: PrActivity::Closed { merged: true },
                ..
            })
        ));

        let edited = payload(json!({
            "action": "edited",
            "repository": {"full_name": "acme/widgets"},
            "pull_request": {"number": 7}
        }));
        assert_eq!(normalize("pull_request", &edited, None).unwrap(), None);
    }

    #[test]
    fn test_ci_events_use_first_pr() {
        let suite = payload(json!({
            "action": "completed",
            "repository": {"full_name": "acme/widgets"},
            "check_suite": {"head_sha": "a1a1a1a", "pull_requests": [{"number": 7}, {"number": 8}]}
        }));
        assert_eq!(
            normalize("check_suite", &suite, None).unwrap(),
            Some(JobSpec::PrEvent {
                pr: PrId::new(RepoId::new("acme", "widgets"), 7),
                activity: PrActivity::CiActivity {
                    head_sha: CommitSha::from("a1a1a1a")
                },
            })
        );

        let no_pr = payload(json!({
            "action": "completed",
            "repository": {"full_name": "acme/widgets"},
            "workflow_run": {"head_sha": "a1a1a1a", "pull_requests": []}
        }));
        assert_eq!(normalize("workflow_run", &no_pr, None).unwrap(), None);
    }

    #[test]
    fn test_synthetic_ci_completed() {
        let simulated = payload(json!({
            "repository": "acme/widgets",
            "pr_number": 7,
            "head_sha": "a1a1a1a"
        }));
        assert!(matches!(
            normalize("ci_completed", &simulated, None).unwrap(),
            Some(JobSpec::PrEvent {
                activity: PrActivity::CiActivity { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_recognised_event_missing_fields_is_malformed() {
        let no_sha = payload(json!({
            "action": "completed",
            "repository": {"full_name": "acme/widgets"},
            "check_run": {"pull_requests": [{"number": 7}]}
        }));
        assert!(matches!(
            normalize("check_run", &no_sha, None),
            Err(IngestError::MalformedEvent(_))
        ));

        for bad in ["a1", "zzzzzzz", "0123456789abcdef0123456789abcdef012345678", "ä1b2c3d4"] {
            let run = payload(json!({
                "action": "completed",
                "repository": {"full_name": "acme/widgets"},
                "check_run": {"head_sha": bad, "pull_requests": [{"number": 7}]}
            }));
            assert!(
                matches!(normalize("check_run", &run, None), Err(IngestError::MalformedEvent(_))),
                "accepted sha {:?}",
                bad
            );
        }

        let no_installation = payload(json!({
            "action": "opened",
            "repository": {"full_name": "acme/widgets"},
            "issue": {"number": 12}
        }));
        assert!(matches!(
            normalize("issues", &no_installation, None),
            Err(IngestError::MalformedEvent(_))
        ));

        let bad_repo = payload(json!({
            "action": "closed",
            "repository": {"full_name": "no-slash"},
            "pull_request": {"number": 7}
        }));
        assert!(normalize("pull_request", &bad_repo, None).is_err());
    }

    #[tokio::test]
    async fn test_ingest_is_idempotent_per_delivery() {
        let store = Store::new_in_memory().unwrap();
        let ingestor = ingestor(&store);
        let body = serde_json::to_vec(&issue_opened()).unwrap();
        let signature = sign(SECRET, &body);
        let event = InboundEvent {
            body: &body,
            signature: Some(&signature),
            event_type: Some("issues"),
            delivery_id: Some("d-1"),
        };

        let first = ingestor.ingest(event).await.unwrap();
        assert!(matches!(first, IngestOutcome::Accepted { .. }));
        let second = ingestor.ingest(event).await.unwrap();
        assert_eq!(second, IngestOutcome::Duplicate { job_id: None });
        assert_eq!(store.list_jobs(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_signature_changes_nothing() {
        let store = Store::new_in_memory().unwrap();
        let ingestor = ingestor(&store);
        let body = serde_json::to_vec(&issue_opened()).unwrap();
        let signature = sign("attacker", &body);

        let result = ingestor
            .ingest(InboundEvent {
                body: &body,
                signature: Some(&signature),
                event_type: Some("issues"),
                delivery_id: Some("d-1"),
            })
            .await;
        assert_eq!(result, Err(IngestError::AuthFailure));

        // The delivery id was not burned: a correctly signed redelivery works.
        let signature = sign(SECRET, &body);
        let retry = ingestor
            .ingest(InboundEvent {
                body: &body,
                signature: Some(&signature),
                event_type: Some("issues"),
                delivery_id: Some("d-1"),
            })
            .await
            .unwrap();
        assert!(matches!(retry, IngestOutcome::Accepted { .. }));
    }

    #[tokio::test]
    async fn test_unsigned_request_is_rejected_before_header_checks() {
        let store = Store::new_in_memory().unwrap();
        let ingestor = ingestor(&store);
        let body = serde_json::to_vec(&issue_opened()).unwrap();

        let result = ingestor
            .ingest(InboundEvent {
                body: &body,
                signature: None,
                event_type: None,
                delivery_id: None,
            })
            .await;
        assert_eq!(result, Err(IngestError::AuthFailure));
        assert!(store.list_jobs(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_event_is_recorded_and_ignored() {
        let store = Store::new_in_memory().unwrap();
        let ingestor = ingestor(&store);
        let body = br#"{"zen":"Keep it logically awesome."}"#;
        let signature = sign(SECRET, body);

        let outcome = ingestor
            .ingest(InboundEvent {
                body,
                signature: Some(&signature),
                event_type: Some("ping"),
                delivery_id: Some("d-ping"),
            })
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Ignored);
        assert!(store.list_jobs(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_headers_and_bad_json_are_malformed() {
        let store = Store::new_in_memory().unwrap();
        let ingestor = ingestor(&store);
        let body = b"not json";
        let signature = sign(SECRET, body);

        let no_delivery = ingestor
            .ingest(InboundEvent {
                body,
                signature: Some(&signature),
                event_type: Some("issues"),
                delivery_id: None,
            })
            .await;
        assert!(matches!(no_delivery, Err(IngestError::MalformedEvent(_))));

        let bad_json = ingestor
            .ingest(InboundEvent {
                body,
                signature: Some(&signature),
                event_type: Some("issues"),
                delivery_id: Some("d-9"),
            })
            .await;
        assert!(matches!(bad_json, Err(IngestError::MalformedEvent(_))));
    }

    #[test]
    fn test_outcome_response_shape() {
        assert_eq!(
            serde_json::to_value(IngestOutcome::Accepted { job_id: 3 }).unwrap(),
            json!({"status": "accepted", "job_id": 3})
        );
        assert_eq!(
            serde_json::to_value(IngestOutcome::Duplicate { job_id: None }).unwrap(),
            json!({"status": "duplicate"})
        );
        assert_eq!(
            serde_json::to_value(IngestOutcome::Ignored).unwrap(),
            json!({"status": "ignored"})
        );
    }
}
