//! PR iteration state persistence.
//!
//! `apply_pr_event` is the only way a PR's phase changes: it reads the row,
//! runs the pure transition, writes the new row, inserts any job effects and
//! appends the timeline entry in one IMMEDIATE transaction.

use agentloop_core::{CommitSha, PrId, RepoId, ReviewDecision};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::Serialize;

use super::jobs::insert_job_sync;
use super::{i64_to_u32, i64_to_u64, sql, u64_to_i64, usize_to_i64_limit, Store};
use crate::error::StoreError;
use crate::queue::JobSpec;
use crate::state_machine::{transition, Effect, Event, IterationState, Phase};

/// A stored PR iteration state with its bookkeeping columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrRecord {
    pub pr: PrId,
    #[serde(flatten)]
    pub state: IterationState,
    pub issue_number: Option<u64>,
    pub installation_id: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Result of applying one event to a stored PR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedTransition {
    pub from: Phase,
    pub record: PrRecord,
    /// Effects the caller still has to execute (comments, logs).
    pub effects: Vec<Effect>,
    /// Jobs inserted in the same transaction.
    pub enqueued: Vec<i64>,
}

impl AppliedTransition {
    pub fn changed(&self) -> bool {
        self.from != self.record.state.phase || !self.enqueued.is_empty()
    }
}

/// One entry of a PR's timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrEventRecord {
    pub event_id: i64,
    pub event: String,
    pub from_phase: String,
    pub to_phase: String,
    pub head_sha: Option<String>,
    pub recorded_at: i64,
}

const PR_COLUMNS: &str = "repo_owner, repo_name, pr_number, phase, iteration_count, max_iterations, \
     last_decision, head_sha, issue_number, installation_id, created_at, updated_at";

struct RawPr {
    owner: String,
    name: String,
    number: i64,
    phase: String,
    iteration_count: i64,
    max_iterations: i64,
    last_decision: Option<String>,
    head_sha: Option<String>,
    issue_number: Option<i64>,
    installation_id: i64,
    created_at: i64,
    updated_at: i64,
}

impl RawPr {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            owner: row.get(0)?,
            name: row.get(1)?,
            number: row.get(2)?,
            phase: row.get(3)?,
            iteration_count: row.get(4)?,
            max_iterations: row.get(5)?,
            last_decision: row.get(6)?,
            head_sha: row.get(7)?,
            issue_number: row.get(8)?,
            installation_id: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn decode(self) -> Result<PrRecord, StoreError> {
        let pr = PrId::new(
            RepoId::new(self.owner, self.name),
            i64_to_u64(self.number, "PR number")?,
        );
        let phase: Phase = self
            .phase
            .parse()
            .map_err(|_| StoreError::corruption(format!("phase '{}' of {}", self.phase, pr)))?;
        let last_decision = self
            .last_decision
            .map(|d| d.parse::<ReviewDecision>())
            .transpose()
            .map_err(|_| StoreError::corruption(format!("last_decision of {}", pr)))?;
        Ok(PrRecord {
            state: IterationState {
                phase,
                head_sha: self.head_sha.map(CommitSha::from),
                iteration_count: i64_to_u32(self.iteration_count, "iteration_count")?,
                max_iterations: i64_to_u32(self.max_iterations, "max_iterations")?,
                last_decision,
            },
            issue_number: self
                .issue_number
                .map(|n| i64_to_u64(n, "issue number"))
                .transpose()?,
            installation_id: i64_to_u64(self.installation_id, "installation id")?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            pr,
        })
    }
}

fn get_sync(conn: &Connection, pr: &PrId) -> Result<Option<PrRecord>, StoreError> {
    let number = u64_to_i64(pr.number, "get_pr_state")?;
    let raw = conn
        .query_row(
            &format!(
                "SELECT {} FROM pr_states
                 WHERE repo_owner = ?1 AND repo_name = ?2 AND pr_number = ?3",
                PR_COLUMNS
            ),
            params![pr.repo.owner, pr.repo.name, number],
            RawPr::from_row,
        )
        .optional()
        .map_err(sql("get_pr_state"))?;
    raw.map(RawPr::decode).transpose()
}

fn write_sync(conn: &Connection, record: &PrRecord) -> Result<(), StoreError> {
    let state = &record.state;
    conn.execute(
        "UPDATE pr_states SET phase = ?1, iteration_count = ?2, last_decision = ?3,
                              head_sha = ?4, updated_at = ?5
         WHERE repo_owner = ?6 AND repo_name = ?7 AND pr_number = ?8",
        params![
            state.phase.as_str(),
            state.iteration_count,
            state.last_decision.map(|d| d.as_str()),
            state.head_sha.as_ref().map(|s| s.as_str()),
            record.updated_at,
            record.pr.repo.owner,
            record.pr.repo.name,
            u64_to_i64(record.pr.number, "write_pr_state")?,
        ],
    )
    .map_err(sql("write_pr_state"))?;
    Ok(())
}

/// Run the transition on `record` and persist everything it decided.
fn apply_sync(
    tx: &Transaction<'_>,
    record: PrRecord,
    event: Event,
    now: i64,
) -> Result<AppliedTransition, StoreError> {
    let from = record.state.phase;
    let event_name = event.name();
    let result = transition(record.state.clone(), event);

    let state_changed = result.state != record.state;
    let pr = record.pr.clone();
    let record = PrRecord {
        state: result.state,
        updated_at: if state_changed { now } else { record.updated_at },
        ..record
    };

    let mut effects = Vec::new();
    let mut enqueued = Vec::new();
    for effect in result.effects {
        let spec = match effect {
            Effect::EnqueueReview { head_sha } => JobSpec::Review {
                pr: pr.clone(),
                head_sha,
            },
            Effect::EnqueueFix {
                head_sha,
                iteration,
                feedback,
            } => JobSpec::FixIteration {
                pr: pr.clone(),
                head_sha,
                iteration,
                feedback,
            },
            other => {
                effects.push(other);
                continue;
            }
        };
        enqueued.push(insert_job_sync(tx, &spec, None, now)?);
    }

    if state_changed || !enqueued.is_empty() {
        write_sync(tx, &record)?;
        tx.execute(
            "INSERT INTO pr_events (repo_owner, repo_name, pr_number, event, from_phase, to_phase,
                                    head_sha, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                pr.repo.owner,
                pr.repo.name,
                u64_to_i64(pr.number, "log_pr_event")?,
                event_name,
                from.as_str(),
                record.state.phase.as_str(),
                record.state.head_sha.as_ref().map(|s| s.as_str()),
                now,
            ],
        )
        .map_err(sql("log_pr_event"))?;
    }

    Ok(AppliedTransition {
        from,
        record,
        effects,
        enqueued,
    })
}

/// Parameters for registering a PR the Code Agent just opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPr {
    pub pr: PrId,
    pub issue_number: u64,
    pub installation_id: u64,
    pub max_iterations: u32,
    pub head_sha: CommitSha,
}

impl Store {
    pub async fn get_pr_state(&self, pr: &PrId) -> Result<Option<PrRecord>, StoreError> {
        let pr = pr.clone();
        self.blocking("get_pr_state", move |conn| get_sync(conn, &pr))
            .await
    }

    /// The PR the agent opened for an issue, if it opened one.
    pub async fn pr_for_issue(
        &self,
        repo: &RepoId,
        issue_number: u64,
    ) -> Result<Option<PrRecord>, StoreError> {
        let owner = repo.owner.clone();
        let name = repo.name.clone();
        let issue = u64_to_i64(issue_number, "pr_for_issue")?;
        self.blocking("pr_for_issue", move |conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM pr_states
                         WHERE repo_owner = ?1 AND repo_name = ?2 AND issue_number = ?3
                         ORDER BY pr_number LIMIT 1",
                        PR_COLUMNS
                    ),
                    params![owner, name, issue],
                    RawPr::from_row,
                )
                .optional()
                .map_err(sql("pr_for_issue"))?;
            raw.map(RawPr::decode).transpose()
        })
        .await
    }

    /// All PR states, most recently updated first.
    pub async fn list_pr_states(&self, limit: usize) -> Result<Vec<PrRecord>, StoreError> {
        let limit = usize_to_i64_limit(limit, "list_pr_states")?;
        self.blocking("list_pr_states", move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM pr_states ORDER BY updated_at DESC, pr_number DESC LIMIT ?1",
                    PR_COLUMNS
                ))
                .map_err(sql("list_pr_states"))?;
            let rows = stmt
                .query_map(params![limit], RawPr::from_row)
                .map_err(sql("list_pr_states"))?;
            let mut records = Vec::new();
            for row in rows {
                let raw = row.map_err(sql("list_pr_states"))?;
                match raw.decode() {
                    Ok(record) => records.push(record),
                    Err(e) => tracing::warn!("Skipping corrupt PR state: {}", e),
                }
            }
            Ok(records)
        })
        .await
    }

    /// Create the iteration state for a freshly opened PR and apply
    /// `PrOpened` in the same transaction. Re-registering an existing PR
    /// only re-applies the (then stale) event.
    pub async fn create_pr_state(&self, new: NewPr, now: i64) -> Result<AppliedTransition, StoreError> {
        self.blocking("create_pr_state", move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql("create_pr_state"))?;

            let initial = IterationState::new(new.max_iterations);
            tx.execute(
                "INSERT OR IGNORE INTO pr_states (repo_owner, repo_name, pr_number, phase,
                     iteration_count, max_iterations, last_decision, head_sha, issue_number,
                     installation_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, NULL, NULL, ?6, ?7, ?8, ?8)",
                params![
                    new.pr.repo.owner,
                    new.pr.repo.name,
                    u64_to_i64(new.pr.number, "create_pr_state")?,
                    initial.phase.as_str(),
                    new.max_iterations,
                    u64_to_i64(new.issue_number, "create_pr_state")?,
                    u64_to_i64(new.installation_id, "create_pr_state")?,
                    now,
                ],
            )
            .map_err(sql("create_pr_state"))?;

            let record = get_sync(&tx, &new.pr)?
                .ok_or_else(|| StoreError::not_found(format!("PR state {}", new.pr)))?;
            let applied = apply_sync(
                &tx,
                record,
                Event::PrOpened {
                    head_sha: new.head_sha,
                },
                now,
            )?;

            tx.commit().map_err(sql("create_pr_state"))?;
            Ok(applied)
        })
        .await
    }

    /// Apply an event to a stored PR. `None` when the PR is not agent-managed.
    pub async fn apply_pr_event(
        &self,
        pr: &PrId,
        event: Event,
        now: i64,
    ) -> Result<Option<AppliedTransition>, StoreError> {
        let pr = pr.clone();
        self.blocking("apply_pr_event", move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql("apply_pr_event"))?;

            let Some(record) = get_sync(&tx, &pr)? else {
                return Ok(None);
            };
            let applied = apply_sync(&tx, record, event, now)?;

            tx.commit().map_err(sql("apply_pr_event"))?;
            Ok(Some(applied))
        })
        .await
    }

    /// Timeline for one PR, newest first.
    pub async fn pr_events(&self, pr: &PrId, limit: usize) -> Result<Vec<PrEventRecord>, StoreError> {
        let owner = pr.repo.owner.clone();
        let name = pr.repo.name.clone();
        let number = u64_to_i64(pr.number, "pr_events")?;
        let limit = usize_to_i64_limit(limit, "pr_events")?;
        self.blocking("pr_events", move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT event_id, event, from_phase, to_phase, head_sha, recorded_at
                     FROM pr_events
                     WHERE repo_owner = ?1 AND repo_name = ?2 AND pr_number = ?3
                     ORDER BY recorded_at DESC, event_id DESC
                     LIMIT ?4",
                )
                .map_err(sql("pr_events"))?;
            let rows = stmt
                .query_map(params![owner, name, number, limit], |row| {
                    Ok(PrEventRecord {
                        event_id: row.get(0)?,
                        event: row.get(1)?,
                        from_phase: row.get(2)?,
                        to_phase: row.get(3)?,
                        head_sha: row.get(4)?,
                        recorded_at: row.get(5)?,
                    })
                })
                .map_err(sql("pr_events"))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(sql("pr_events"))
        })
        .await
    }
}
