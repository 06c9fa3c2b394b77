//! Artifact storage: logs, diffs and model transcripts produced by jobs.
//!
//! Payloads go to an append-only [`ArtifactSink`]; only the metadata row
//! (pointer, size, kind) is recorded in the store.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::queue::unix_now;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Log,
    Diff,
    ModelOutput,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Diff => "diff",
            Self::ModelOutput => "model-output",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Diff => "diff",
            Self::ModelOutput => "json",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log" => Ok(Self::Log),
            "diff" => Ok(Self::Diff),
            "model-output" => Ok(Self::ModelOutput),
            other => Err(format!("unknown artifact kind '{}'", other)),
        }
    }
}

/// Metadata of a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRecord {
    pub artifact_id: i64,
    pub job_id: i64,
    pub kind: ArtifactKind,
    pub storage_pointer: String,
    pub size: u64,
    pub created_at: i64,
}

/// Where a payload landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub pointer: String,
    pub size: u64,
}

/// Append-only blob storage. A written blob is never overwritten.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn put(&self, job_id: i64, kind: ArtifactKind, bytes: &[u8]) -> Result<StoredBlob>;
    async fn get(&self, pointer: &str) -> Result<Vec<u8>>;
}

/// Stores blobs as files under `root/job-<id>/<uuid>.<ext>`.
pub struct FsArtifactSink {
    root: PathBuf,
}

impl FsArtifactSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a stored pointer, refusing anything that could leave the root.
    fn resolve(&self, pointer: &str) -> Result<PathBuf> {
        let relative = Path::new(pointer);
        if pointer.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid artifact pointer '{}'", pointer);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactSink for FsArtifactSink {
    async fn put(&self, job_id: i64, kind: ArtifactKind, bytes: &[u8]) -> Result<StoredBlob> {
        let dir_name = format!("job-{}", job_id);
        let dir = self.root.join(&dir_name);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create artifact directory {}", dir.display()))?;

        let file_name = format!("{}.{}", uuid::Uuid::new_v4(), kind.extension());
        let path = dir.join(&file_name);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to create artifact {}", path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("Failed to write artifact {}", path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("Failed to sync artifact {}", path.display()))?;

        debug!("Stored {} artifact for job {} at {}", kind, job_id, path.display());

        Ok(StoredBlob {
            pointer: format!("{}/{}", dir_name, file_name),
            size: bytes.len() as u64,
        })
    }

    async fn get(&self, pointer: &str) -> Result<Vec<u8>> {
        let path = self.resolve(pointer)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read artifact {}", path.display()))
    }
}

/// Writes payloads through the sink and records their metadata.
#[derive(Clone)]
pub struct Artifacts {
    sink: Arc<dyn ArtifactSink>,
    store: Store,
}

impl Artifacts {
    pub fn new(sink: Arc<dyn ArtifactSink>, store: Store) -> Self {
        Self { sink, store }
    }

    pub async fn record(&self, job_id: i64, kind: ArtifactKind, bytes: &[u8]) -> Result<ArtifactRecord> {
        let blob = self.sink.put(job_id, kind, bytes).await?;
        let record = self
            .store
            .insert_artifact(job_id, kind, &blob.pointer, blob.size, unix_now())
            .await
            .context("Failed to record artifact metadata")?;
        Ok(record)
    }

    /// Metadata and payload of an artifact, if it exists.
    pub async fn load(&self, artifact_id: i64) -> Result<Option<(ArtifactRecord, Vec<u8>)>> {
        let Some(record) = self
            .store
            .get_artifact(artifact_id)
            .await
            .context("Failed to look up artifact")?
        else {
            return Ok(None);
        };
        let bytes = self.sink.get(&record.storage_pointer).await?;
        Ok(Some((record, bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobSpec, RepoTarget};
    use agentloop_core::RepoId;

    #[tokio::test]
    async fn test_put_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsArtifactSink::new(dir.path());

        let first = sink.put(1, ArtifactKind::Log, b"first").await.unwrap();
        let second = sink.put(1, ArtifactKind::Log, b"second").await.unwrap();

        assert_ne!(first.pointer, second.pointer);
        assert!(first.pointer.starts_with("job-1/"));
        assert_eq!(sink.get(&first.pointer).await.unwrap(), b"first");
        assert_eq!(sink.get(&second.pointer).await.unwrap(), b"second");
        assert_eq!(second.size, 6);
    }

    #[tokio::test]
    async fn test_get_rejects_escaping_pointers() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsArtifactSink::new(dir.path().join("artifacts"));

        for pointer in ["../secret", "/etc/passwd", "job-1/../../x", ""] {
            assert!(sink.get(pointer).await.is_err(), "{} accepted", pointer);
        }
    }

    #[tokio::test]
    async fn test_record_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new_in_memory().unwrap();
        let job_id = store
            .enqueue(
                JobSpec::CodeGen {
                    target: RepoTarget {
                        repo: RepoId::new("acme", "widgets"),
                        installation_id: 1,
                    },
                    issue_number: 3,
                },
                100,
            )
            .await
            .unwrap();

        let artifacts = Artifacts::new(Arc::new(FsArtifactSink::new(dir.path())), store.clone());
        let record = artifacts
            .record(job_id, ArtifactKind::Diff, b"--- a\n+++ b\n")
            .await
            .unwrap();
        assert_eq!(record.kind, ArtifactKind::Diff);
        assert_eq!(record.size, 12);

        let (loaded, bytes) = artifacts.load(record.artifact_id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(bytes, b"--- a\n+++ b\n");

        assert_eq!(store.artifacts_for_job(job_id).await.unwrap(), vec![record]);
        assert!(artifacts.load(9999).await.unwrap().is_none());
    }
}
