//! CI snapshots, one per (PR, head sha).

use agentloop_core::{CheckRun, CommitSha, MergedStatus, PrId};
use rusqlite::{params, Row};
use serde::Serialize;

use super::{sql, u64_to_i64, usize_to_i64_limit, Store};
use crate::error::StoreError;

/// Aggregated CI result for one commit of a PR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CiSnapshot {
    pub head_sha: CommitSha,
    pub merged_status: MergedStatus,
    pub checks: Vec<CheckRun>,
    pub updated_at: i64,
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode(
    (head_sha, merged_status, checks_json, updated_at): (String, String, String, i64),
) -> Result<CiSnapshot, StoreError> {
    let merged_status: MergedStatus = merged_status
        .parse()
        .map_err(|_| StoreError::corruption(format!("CI status of {}", head_sha)))?;
    let checks: Vec<CheckRun> = serde_json::from_str(&checks_json)
        .map_err(|_| StoreError::corruption(format!("CI checks of {}", head_sha)))?;
    Ok(CiSnapshot {
        head_sha: CommitSha::from(head_sha),
        merged_status,
        checks,
        updated_at,
    })
}

impl Store {
    /// Insert or replace the snapshot for `(pr, snapshot.head_sha)`.
    pub async fn upsert_ci_snapshot(&self, pr: &PrId, snapshot: CiSnapshot) -> Result<(), StoreError> {
        let owner = pr.repo.owner.clone();
        let name = pr.repo.name.clone();
        let number = u64_to_i64(pr.number, "upsert_ci_snapshot")?;
        let checks_json = serde_json::to_string(&snapshot.checks)
            .map_err(|e| StoreError::storage("serialize CI checks", e))?;

        self.blocking("upsert_ci_snapshot", move |conn| {
            conn.execute(
                "INSERT INTO ci_snapshots (repo_owner, repo_name, pr_number, head_sha,
                                           merged_status, checks_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(repo_owner, repo_name, pr_number, head_sha) DO UPDATE SET
                     merged_status = excluded.merged_status,
                     checks_json = excluded.checks_json,
                     updated_at = excluded.updated_at",
                params![
                    owner,
                    name,
                    number,
                    snapshot.head_sha.as_str(),
                    snapshot.merged_status.as_str(),
                    checks_json,
                    snapshot.updated_at
                ],
            )
            .map_err(sql("upsert_ci_snapshot"))?;
            Ok(())
        })
        .await
    }

    pub async fn get_ci_snapshot(
        &self,
        pr: &PrId,
        head_sha: &CommitSha,
    ) -> Result<Option<CiSnapshot>, StoreError> {
        let owner = pr.repo.owner.clone();
        let name = pr.repo.name.clone();
        let number = u64_to_i64(pr.number, "get_ci_snapshot")?;
        let head_sha = head_sha.as_str().to_string();

        self.blocking("get_ci_snapshot", move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT head_sha, merged_status, checks_json, updated_at FROM ci_snapshots
                     WHERE repo_owner = ?1 AND repo_name = ?2 AND pr_number = ?3 AND head_sha = ?4",
                )
                .map_err(sql("get_ci_snapshot"))?;
            let mut rows = stmt
                .query_map(params![owner, name, number, head_sha], snapshot_from_row)
                .map_err(sql("get_ci_snapshot"))?;
            match rows.next() {
                Some(row) => Ok(Some(decode(row.map_err(sql("get_ci_snapshot"))?)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Snapshots of a PR, newest first.
    pub async fn ci_snapshots(&self, pr: &PrId, limit: usize) -> Result<Vec<CiSnapshot>, StoreError> {
        let owner = pr.repo.owner.clone();
        let name = pr.repo.name.clone();
        let number = u64_to_i64(pr.number, "ci_snapshots")?;
        let limit = usize_to_i64_limit(limit, "ci_snapshots")?;

        self.blocking("ci_snapshots", move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT head_sha, merged_status, checks_json, updated_at FROM ci_snapshots
                     WHERE repo_owner = ?1 AND repo_name = ?2 AND pr_number = ?3
                     ORDER BY updated_at DESC
                     LIMIT ?4",
                )
                .map_err(sql("ci_snapshots"))?;
            let rows = stmt
                .query_map(params![owner, name, number, limit], snapshot_from_row)
                .map_err(sql("ci_snapshots"))?;
            rows.map(|row| decode(row.map_err(sql("ci_snapshots"))?))
                .collect()
        })
        .await
    }
}
