//! Durable store backed by SQLite.
//!
//! Every queue and state-machine mutation is a single SQLite transaction or a
//! compare-and-set `UPDATE ... WHERE status = ?`, so two `Store` handles opened
//! on the same file (server and worker processes) preserve every invariant
//! without relying on in-process locks.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version.

mod artifacts;
mod deliveries;
mod jobs;
mod pr_states;
mod snapshots;


pub use deliveries::{Delivery, DeliveryOutcome};
pub use pr_states::{AppliedTransition, NewPr, PrEventRecord, PrRecord};
pub use snapshots::CiSnapshot;

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::error::StoreError;

/// Current schema version. Increment this when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
pub(crate) const CURRENT_SCHEMA_VERSION: i64 = 2;

/// SQLite-backed store for deliveries, jobs, PR states, CI snapshots and
/// artifact metadata.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and run pending migrations.
    ///
    /// # Durability
    ///
    /// The database is configured with:
    /// - `journal_mode = WAL` for concurrent readers and crash safety
    /// - `synchronous = FULL` so a committed transaction survives power loss
    /// - `busy_timeout = 5000ms` so a second process waits instead of failing
    /// - `foreign_keys = ON`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;

                    // Covers the WAL and SHM files SQLite creates with the default umask.
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        let dir_permissions = std::fs::Permissions::from_mode(0o700);
                        if let Err(e) = std::fs::set_permissions(parent, dir_permissions) {
                            warn!(
                                "Failed to set restrictive permissions on state directory: {}",
                                e
                            );
                        }
                    }
                }
            }
        }

        let conn = Connection::open(path_ref).map_err(|e| StoreError::storage("open database", e))?;

        #[cfg(unix)]
        if !is_in_memory && !path_str.is_empty() {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
                warn!(
                    "Failed to set restrictive permissions on database file: {}",
                    e
                );
            }
        }

        // SQLite silently keeps DELETE mode on filesystems without shared
        // memory support, so the returned mode must be checked.
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::storage("set journal_mode", e))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));

        if !journal_mode_ok {
            return Err(StoreError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'. \
                     This can happen on filesystems that don't support shared memory \
                     (e.g., some network filesystems).",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .map_err(|e| StoreError::storage("configure pragmas", e))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::storage("create schema_version table", e))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("get schema version", e))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run migrations from `from_version` to `CURRENT_SCHEMA_VERSION`.
    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), StoreError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::SchemaTooNew {
                found: from_version,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        // Version 1: queue, PR states, CI snapshots, artifact metadata
        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS deliveries (
                    delivery_id TEXT PRIMARY KEY,
                    event_type TEXT NOT NULL,
                    received_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_deliveries_received_at
                    ON deliveries(received_at);

                CREATE TABLE IF NOT EXISTS jobs (
                    job_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    kind TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL
                        CHECK (status IN ('pending', 'leased', 'done', 'failed')),
                    lease_owner TEXT,
                    lease_expires_at INTEGER,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    available_at INTEGER NOT NULL,
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    delivery_id TEXT
                        REFERENCES deliveries(delivery_id) ON DELETE SET NULL,
                    repo TEXT NOT NULL,
                    issue_number INTEGER,
                    pr_number INTEGER,
                    head_sha TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_jobs_pending
                    ON jobs(available_at, created_at, job_id) WHERE status = 'pending';
                CREATE INDEX IF NOT EXISTS idx_jobs_leased
                    ON jobs(lease_expires_at) WHERE status = 'leased';
                CREATE INDEX IF NOT EXISTS idx_jobs_status
                    ON jobs(status, job_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_pr
                    ON jobs(repo, pr_number) WHERE pr_number IS NOT NULL;

                CREATE TABLE IF NOT EXISTS pr_states (
                    repo_owner TEXT NOT NULL,
                    repo_name TEXT NOT NULL,
                    pr_number INTEGER NOT NULL,
                    phase TEXT NOT NULL,
                    iteration_count INTEGER NOT NULL,
                    max_iterations INTEGER NOT NULL,
                    last_decision TEXT,
                    head_sha TEXT,
                    issue_number INTEGER,
                    installation_id INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (repo_owner, repo_name, pr_number),
                    CHECK (iteration_count <= max_iterations)
                );

                CREATE TABLE IF NOT EXISTS ci_snapshots (
                    repo_owner TEXT NOT NULL,
                    repo_name TEXT NOT NULL,
                    pr_number INTEGER NOT NULL,
                    head_sha TEXT NOT NULL,
                    merged_status TEXT NOT NULL,
                    checks_json TEXT NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (repo_owner, repo_name, pr_number, head_sha)
                );

                CREATE TABLE IF NOT EXISTS artifacts (
                    artifact_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL REFERENCES jobs(job_id),
                    kind TEXT NOT NULL CHECK (kind IN ('log', 'diff', 'model-output')),
                    storage_pointer TEXT NOT NULL UNIQUE,
                    size INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_artifacts_job
                    ON artifacts(job_id);
                "#,
            )
            .map_err(|e| StoreError::storage("migration v1", e))?;
        }

        // Version 2: per-PR event timeline for the dashboard
        if from_version < 2 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS pr_events (
                    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo_owner TEXT NOT NULL,
                    repo_name TEXT NOT NULL,
                    pr_number INTEGER NOT NULL,
                    event TEXT NOT NULL,
                    from_phase TEXT NOT NULL,
                    to_phase TEXT NOT NULL,
                    head_sha TEXT,
                    recorded_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_pr_events_pr
                    ON pr_events(repo_owner, repo_name, pr_number, recorded_at DESC);
                CREATE INDEX IF NOT EXISTS idx_pr_events_recorded_at
                    ON pr_events(recorded_at);
                "#,
            )
            .map_err(|e| StoreError::storage("migration v2", e))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::storage("update schema version", e))?;

        Ok(())
    }

    /// Create a new in-memory store (for tests and dry runs).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::storage(operation, "connection mutex poisoned"))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::storage(operation, e))?
    }

    /// Cheap round trip for health checks.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.blocking("ping", |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(|e| StoreError::storage("ping", e))?;
            Ok(())
        })
        .await
    }
}

// =============================================================================
// Integer conversion helpers
// =============================================================================

/// Convert a u64 identifier (PR, issue, installation) to i64 for SQLite storage.
///
/// Returns an error instead of wrapping silently with `as i64`.
pub(crate) fn u64_to_i64(value: u64, operation: &'static str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| {
        StoreError::storage(
            operation,
            format!(
                "value {} exceeds maximum storable value ({})",
                value,
                i64::MAX
            ),
        )
    })
}

/// Convert an i64 read from SQLite back to u64.
///
/// A negative value means the row was written by something else.
pub(crate) fn i64_to_u64(value: i64, what: &str) -> Result<u64, StoreError> {
    u64::try_from(value)
        .map_err(|_| StoreError::corruption(format!("negative {} {} in database", what, value)))
}

pub(crate) fn i64_to_u32(value: i64, what: &str) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::corruption(format!("{} {} out of range in database", what, value)))
}

/// Convert a usize limit to i64 for a SQLite LIMIT clause.
pub(crate) fn usize_to_i64_limit(limit: usize, operation: &'static str) -> Result<i64, StoreError> {
    i64::try_from(limit).map_err(|_| {
        StoreError::storage(
            operation,
            format!("limit {} exceeds maximum storable value ({})", limit, i64::MAX),
        )
    })
}

/// Map a rusqlite error to a storage error for `operation`.
pub(crate) fn sql(operation: &'static str) -> impl Fn(rusqlite::Error) -> StoreError {
    move |e| StoreError::storage(operation, e)
}
