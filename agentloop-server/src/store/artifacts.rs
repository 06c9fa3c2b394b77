//! Artifact metadata. Payloads live in the artifact sink, never in SQLite.

use rusqlite::{params, Row};

use super::{i64_to_u64, sql, u64_to_i64, Store};
use crate::artifacts::{ArtifactKind, ArtifactRecord};
use crate::error::StoreError;

const ARTIFACT_COLUMNS: &str = "artifact_id, job_id, kind, storage_pointer, size, created_at";

fn raw_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, i64, String, String, i64, i64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode(
    (artifact_id, job_id, kind, storage_pointer, size, created_at): (i64, i64, String, String, i64, i64),
) -> Result<ArtifactRecord, StoreError> {
    let kind: ArtifactKind = kind
        .parse()
        .map_err(|_| StoreError::corruption(format!("kind of artifact {}", artifact_id)))?;
    Ok(ArtifactRecord {
        artifact_id,
        job_id,
        kind,
        storage_pointer,
        size: i64_to_u64(size, "artifact size")?,
        created_at,
    })
}

impl Store {
    pub async fn insert_artifact(
        &self,
        job_id: i64,
        kind: ArtifactKind,
        storage_pointer: &str,
        size: u64,
        now: i64,
    ) -> Result<ArtifactRecord, StoreError> {
        let storage_pointer = storage_pointer.to_string();
        let size_i64 = u64_to_i64(size, "insert_artifact")?;

        self.blocking("insert_artifact", move |conn| {
            conn.execute(
                "INSERT INTO artifacts (job_id, kind, storage_pointer, size, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![job_id, kind.as_str(), storage_pointer, size_i64, now],
            )
            .map_err(sql("insert_artifact"))?;
            Ok(ArtifactRecord {
                artifact_id: conn.last_insert_rowid(),
                job_id,
                kind,
                storage_pointer,
                size,
                created_at: now,
            })
        })
        .await
    }

    pub async fn get_artifact(&self, artifact_id: i64) -> Result<Option<ArtifactRecord>, StoreError> {
        self.blocking("get_artifact", move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM artifacts WHERE artifact_id = ?1",
                    ARTIFACT_COLUMNS
                ))
                .map_err(sql("get_artifact"))?;
            let mut rows = stmt
                .query_map(params![artifact_id], raw_from_row)
                .map_err(sql("get_artifact"))?;
            match rows.next() {
                Some(row) => Ok(Some(decode(row.map_err(sql("get_artifact"))?)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Artifacts recorded for a job, oldest first.
    pub async fn artifacts_for_job(&self, job_id: i64) -> Result<Vec<ArtifactRecord>, StoreError> {
        self.blocking("artifacts_for_job", move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM artifacts WHERE job_id = ?1 ORDER BY artifact_id",
                    ARTIFACT_COLUMNS
                ))
                .map_err(sql("artifacts_for_job"))?;
            let rows = stmt
                .query_map(params![job_id], raw_from_row)
                .map_err(sql("artifacts_for_job"))?;
            rows.map(|row| decode(row.map_err(sql("artifacts_for_job"))?))
                .collect()
        })
        .await
    }
}
