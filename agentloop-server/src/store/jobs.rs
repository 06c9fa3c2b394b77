//! Job queue operations.
//!
//! Leasing is a single compare-and-set `UPDATE ... WHERE status = 'pending'`;
//! completion and failure are fenced by `(job_id, lease_owner, status =
//! 'leased')` so a worker whose lease was reaped cannot overwrite the outcome
//! of whoever holds the job now.

use std::collections::BTreeMap;
use std::time::Duration;

use agentloop_core::PrId;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::warn;

use super::{i64_to_u32, sql, u64_to_i64, usize_to_i64_limit, Store};
use crate::error::StoreError;
use crate::queue::{FailOutcome, Job, JobSpec, JobStatus, ReapedJob, RetryPolicy};

pub(super) const JOB_COLUMNS: &str = "job_id, kind, payload, status, lease_owner, lease_expires_at, \
     created_at, updated_at, available_at, attempt_count, last_error, delivery_id";

/// A job row before its payload is decoded.
pub(super) struct RawJob {
    job_id: i64,
    kind: String,
    payload: String,
    status: String,
    lease_owner: Option<String>,
    lease_expires_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
    available_at: i64,
    attempt_count: i64,
    last_error: Option<String>,
    delivery_id: Option<String>,
}

impl RawJob {
    pub(super) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            kind: row.get(1)?,
            payload: row.get(2)?,
            status: row.get(3)?,
            lease_owner: row.get(4)?,
            lease_expires_at: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            available_at: row.get(8)?,
            attempt_count: row.get(9)?,
            last_error: row.get(10)?,
            delivery_id: row.get(11)?,
        })
    }

    pub(super) fn decode(self) -> Result<Job, StoreError> {
        let what = |field: &str| format!("job {} {}", self.job_id, field);
        let spec: JobSpec =
            serde_json::from_str(&self.payload).map_err(|_| StoreError::corruption(what("payload")))?;
        if spec.kind().as_str() != self.kind {
            return Err(StoreError::corruption(format!(
                "job {} kind column '{}' does not match payload kind '{}'",
                self.job_id,
                self.kind,
                spec.kind()
            )));
        }
        let status: JobStatus = self
            .status
            .parse()
            .map_err(|_| StoreError::corruption(what("status")))?;
        Ok(Job {
            job_id: self.job_id,
            spec,
            status,
            lease_owner: self.lease_owner,
            lease_expires_at: self.lease_expires_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            available_at: self.available_at,
            attempt_count: i64_to_u32(self.attempt_count, "attempt_count")?,
            last_error: self.last_error,
            delivery_id: self.delivery_id,
        })
    }
}

/// Insert a pending job. Used directly by ingestion and state-machine
/// transactions so the job commits together with whatever caused it.
pub(super) fn insert_job_sync(
    conn: &Connection,
    spec: &JobSpec,
    delivery_id: Option<&str>,
    now: i64,
) -> Result<i64, StoreError> {
    let payload =
        serde_json::to_string(spec).map_err(|e| StoreError::storage("serialize job", e))?;
    let issue_number = spec
        .issue_number()
        .map(|n| u64_to_i64(n, "enqueue"))
        .transpose()?;
    let pr_number = spec
        .pr()
        .map(|pr| u64_to_i64(pr.number, "enqueue"))
        .transpose()?;

    conn.execute(
        "INSERT INTO jobs (kind, payload, status, created_at, updated_at, available_at,
                           attempt_count, delivery_id, repo, issue_number, pr_number, head_sha)
         VALUES (?1, ?2, 'pending', ?3, ?3, ?3, 0, ?4, ?5, ?6, ?7, ?8)",
        params![
            spec.kind().as_str(),
            payload,
            now,
            delivery_id,
            spec.repo().full_name(),
            issue_number,
            pr_number,
            spec.head_sha().map(|s| s.as_str()),
        ],
    )
    .map_err(sql("enqueue"))?;

    Ok(conn.last_insert_rowid())
}

fn lease_sync(
    conn: &Connection,
    worker_id: &str,
    lease_expires_at: i64,
    now: i64,
) -> Result<Option<Job>, StoreError> {
    let statement = format!(
        "UPDATE jobs SET status = 'leased', lease_owner = ?1, lease_expires_at = ?2, updated_at = ?3
         WHERE job_id = (
             SELECT job_id FROM jobs
             WHERE status = 'pending' AND available_at <= ?3
             ORDER BY created_at, job_id
             LIMIT 1
         ) AND status = 'pending'
         RETURNING {}",
        JOB_COLUMNS
    );

    loop {
        let raw = conn
            .query_row(&statement, params![worker_id, lease_expires_at, now], RawJob::from_row)
            .optional()
            .map_err(sql("lease"))?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let job_id = raw.job_id;

        match raw.decode() {
            Ok(job) => return Ok(Some(job)),
            Err(e) => {
                // An undecodable job can never run; fail it and look for the next one.
                warn!("Failing undecodable job {}: {}", job_id, e);
                conn.execute(
                    "UPDATE jobs SET status = 'failed', last_error = ?1, lease_expires_at = NULL,
                                     updated_at = ?2
                     WHERE job_id = ?3 AND status = 'leased' AND lease_owner = ?4",
                    params![e.to_string(), now, job_id, worker_id],
                )
                .map_err(sql("lease"))?;
            }
        }
    }
}

fn complete_sync(conn: &Connection, job_id: i64, worker_id: &str, now: i64) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE jobs SET status = 'done', lease_expires_at = NULL, updated_at = ?1
         WHERE job_id = ?2 AND status = 'leased' AND lease_owner = ?3",
        params![now, job_id, worker_id],
    )
    .map_err(sql("complete"))?;

    if conn.changes() == 0 {
        return Err(StoreError::LeaseLost {
            job_id,
            worker_id: worker_id.to_string(),
        });
    }
    Ok(())
}

fn fail_sync(
    conn: &mut Connection,
    job_id: i64,
    worker_id: &str,
    error: &str,
    retryable: bool,
    policy: &RetryPolicy,
    now: i64,
) -> Result<FailOutcome, StoreError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(sql("fail"))?;

    let attempt_count: Option<i64> = tx
        .query_row(
            "SELECT attempt_count FROM jobs
             WHERE job_id = ?1 AND status = 'leased' AND lease_owner = ?2",
            params![job_id, worker_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql("fail"))?;

    let Some(attempt_count) = attempt_count else {
        return Err(StoreError::LeaseLost {
            job_id,
            worker_id: worker_id.to_string(),
        });
    };
    let attempt_count = i64_to_u32(attempt_count, "attempt_count")?.saturating_add(1);

    let outcome = if retryable {
        policy.after_failure(attempt_count, now)
    } else {
        FailOutcome::Failed
    };

    match outcome {
        FailOutcome::Retrying { available_at } => {
            tx.execute(
                "UPDATE jobs SET status = 'pending', lease_owner = NULL, lease_expires_at = NULL,
                                 attempt_count = ?1, available_at = ?2, last_error = ?3, updated_at = ?4
                 WHERE job_id = ?5",
                params![attempt_count, available_at, error, now, job_id],
            )
            .map_err(sql("fail"))?;
        }
        FailOutcome::Failed => {
            tx.execute(
                "UPDATE jobs SET status = 'failed', lease_expires_at = NULL,
                                 attempt_count = ?1, last_error = ?2, updated_at = ?3
                 WHERE job_id = ?4",
                params![attempt_count, error, now, job_id],
            )
            .map_err(sql("fail"))?;
        }
    }

    tx.commit().map_err(sql("fail"))?;
    Ok(outcome)
}

fn reap_sync(conn: &mut Connection, policy: &RetryPolicy, now: i64) -> Result<Vec<ReapedJob>, StoreError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(sql("reap"))?;

    let expired: Vec<(i64, i64)> = {
        let mut stmt = tx
            .prepare(
                "SELECT job_id, attempt_count FROM jobs
                 WHERE status = 'leased' AND lease_expires_at < ?1
                 ORDER BY job_id",
            )
            .map_err(sql("reap"))?;
        let rows = stmt
            .query_map(params![now], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(sql("reap"))?;
        rows.collect::<Result<_, _>>().map_err(sql("reap"))?
    };

    let mut reaped = Vec::with_capacity(expired.len());
    for (job_id, attempt_count) in expired {
        let attempt_count = i64_to_u32(attempt_count, "attempt_count")?.saturating_add(1);
        let outcome = match policy.after_failure(attempt_count, now) {
            // An expired lease is crash recovery: the job is runnable again at once.
            FailOutcome::Retrying { .. } => FailOutcome::Retrying { available_at: now },
            FailOutcome::Failed => FailOutcome::Failed,
        };
        let status = match outcome {
            FailOutcome::Retrying { .. } => "pending",
            FailOutcome::Failed => "failed",
        };

        tx.execute(
            "UPDATE jobs SET status = ?1, lease_owner = CASE WHEN ?1 = 'pending' THEN NULL ELSE lease_owner END,
                             lease_expires_at = NULL, attempt_count = ?2, available_at = ?3,
                             last_error = 'lease expired', updated_at = ?3
             WHERE job_id = ?4 AND status = 'leased' AND lease_expires_at < ?3",
            params![status, attempt_count, now, job_id],
        )
        .map_err(sql("reap"))?;

        if tx.changes() == 1 {
            reaped.push(ReapedJob { job_id, outcome });
        }
    }

    tx.commit().map_err(sql("reap"))?;
    Ok(reaped)
}

fn decode_rows(
    stmt: &mut rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
    operation: &'static str,
) -> Result<Vec<Job>, StoreError> {
    let rows = stmt
        .query_map(params, RawJob::from_row)
        .map_err(sql(operation))?;

    let mut jobs = Vec::new();
    for row in rows {
        let raw = row.map_err(sql(operation))?;
        let job_id = raw.job_id;
        // Listing is best effort: one corrupt row must not hide the rest.
        match raw.decode() {
            Ok(job) => jobs.push(job),
            Err(e) => warn!("Skipping job {} in {}: {}", job_id, operation, e),
        }
    }
    Ok(jobs)
}

impl Store {
    /// Add a pending job not tied to any delivery.
    pub async fn enqueue(&self, spec: JobSpec, now: i64) -> Result<i64, StoreError> {
        self.blocking("enqueue", move |conn| insert_job_sync(conn, &spec, None, now))
            .await
    }

    /// Lease the oldest runnable pending job, if any.
    pub async fn lease(
        &self,
        worker_id: &str,
        lease_duration: Duration,
        now: i64,
    ) -> Result<Option<Job>, StoreError> {
        let worker_id = worker_id.to_string();
        let lease_secs = i64::try_from(lease_duration.as_secs())
            .map_err(|_| StoreError::storage("lease", "lease duration too large"))?;
        let lease_expires_at = now.saturating_add(lease_secs);
        self.blocking("lease", move |conn| {
            lease_sync(conn, &worker_id, lease_expires_at, now)
        })
        .await
    }

    /// Mark a leased job done. `LeaseLost` if `worker_id` no longer holds it.
    pub async fn complete(&self, job_id: i64, worker_id: &str, now: i64) -> Result<(), StoreError> {
        let worker_id = worker_id.to_string();
        self.blocking("complete", move |conn| {
            complete_sync(conn, job_id, &worker_id, now)
        })
        .await
    }

    /// Record a failed attempt. Retryable failures go back to pending with
    /// backoff until the attempt budget runs out; the rest fail at once.
    pub async fn fail(
        &self,
        job_id: i64,
        worker_id: &str,
        error: &str,
        retryable: bool,
        policy: RetryPolicy,
        now: i64,
    ) -> Result<FailOutcome, StoreError> {
        let worker_id = worker_id.to_string();
        let error = error.to_string();
        self.blocking("fail", move |conn| {
            fail_sync(conn, job_id, &worker_id, &error, retryable, &policy, now)
        })
        .await
    }

    /// Return every job whose lease expired before `now` to the queue,
    /// counting the lost attempt.
    pub async fn reap_expired_leases(
        &self,
        policy: RetryPolicy,
        now: i64,
    ) -> Result<Vec<ReapedJob>, StoreError> {
        self.blocking("reap", move |conn| reap_sync(conn, &policy, now))
            .await
    }

    pub async fn get_job(&self, job_id: i64) -> Result<Option<Job>, StoreError> {
        self.blocking("get_job", move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {} FROM jobs WHERE job_id = ?1", JOB_COLUMNS),
                    params![job_id],
                    RawJob::from_row,
                )
                .optional()
                .map_err(sql("get_job"))?;
            raw.map(RawJob::decode).transpose()
        })
        .await
    }

    /// Most recent jobs first, optionally filtered by status.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let limit = usize_to_i64_limit(limit, "list_jobs")?;
        self.blocking("list_jobs", move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM jobs
                     WHERE ?1 IS NULL OR status = ?1
                     ORDER BY job_id DESC
                     LIMIT ?2",
                    JOB_COLUMNS
                ))
                .map_err(sql("list_jobs"))?;
            decode_rows(&mut stmt, params![status.map(|s| s.as_str()), limit], "list_jobs")
        })
        .await
    }

    /// Jobs touching one PR, most recent first.
    pub async fn jobs_for_pr(&self, pr: &PrId, limit: usize) -> Result<Vec<Job>, StoreError> {
        let repo = pr.repo.full_name();
        let pr_number = u64_to_i64(pr.number, "jobs_for_pr")?;
        let limit = usize_to_i64_limit(limit, "jobs_for_pr")?;
        self.blocking("jobs_for_pr", move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM jobs
                     WHERE repo = ?1 AND pr_number = ?2
                     ORDER BY job_id DESC
                     LIMIT ?3",
                    JOB_COLUMNS
                ))
                .map_err(sql("jobs_for_pr"))?;
            decode_rows(&mut stmt, params![repo, pr_number, limit], "jobs_for_pr")
        })
        .await
    }

    /// Job counts for every status, zero-filled.
    pub async fn count_jobs_by_status(&self) -> Result<BTreeMap<JobStatus, u64>, StoreError> {
        self.blocking("count_jobs_by_status", |conn| {
            let mut counts: BTreeMap<JobStatus, u64> = [
                JobStatus::Pending,
                JobStatus::Leased,
                JobStatus::Done,
                JobStatus::Failed,
            ]
            .into_iter()
            .map(|s| (s, 0))
            .collect();

            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .map_err(sql("count_jobs_by_status"))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(sql("count_jobs_by_status"))?;

            for row in rows {
                let (status, count) = row.map_err(sql("count_jobs_by_status"))?;
                let status: JobStatus = status
                    .parse()
                    .map_err(|_| StoreError::corruption(format!("job status '{}'", status)))?;
                counts.insert(status, super::i64_to_u64(count, "job count")?);
            }
            Ok(counts)
        })
        .await
    }
}
