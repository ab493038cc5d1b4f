//! Storage layer for the grading engine
//!
//! Durable, independently queryable records: snapshots, ground-truth
//! findings/occurrences, critic runs, reported issues/occurrences, and
//! grading edges. No derived table is authoritative; drift and metrics are
//! always recomputed from these.
//!
//! Uses rusqlite behind a deadpool connection pool; every public method
//! takes an [`Identity`](crate::access::Identity) and enforces visibility
//! inside the same database interaction that serves the query.

pub mod critique;
pub mod edges;
pub mod ground_truth;

use crate::error::{GradebookError, Result};
use chrono::{DateTime, Utc};
use deadpool_sqlite::{Config, Pool, Runtime};
use std::path::Path;
use tracing::info;

/// Schema, applied idempotently at startup
///
/// Foreign keys are declared for documentation; deletes cascade explicitly
/// inside transactions because SQLite leaves FK enforcement off per
/// connection.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    slug        TEXT PRIMARY KEY,
    split       TEXT NOT NULL,
    description TEXT,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS findings (
    snapshot_slug             TEXT NOT NULL REFERENCES snapshots(slug),
    finding_id                TEXT NOT NULL,
    kind                      TEXT NOT NULL,
    rationale                 TEXT NOT NULL,
    catchability              TEXT NOT NULL,
    match_only_if_reported_on TEXT,
    created_at                TEXT NOT NULL,
    PRIMARY KEY (snapshot_slug, finding_id)
);

CREATE TABLE IF NOT EXISTS finding_occurrences (
    snapshot_slug TEXT NOT NULL,
    finding_id    TEXT NOT NULL,
    occurrence_id TEXT NOT NULL,
    files         TEXT NOT NULL,
    note          TEXT,
    PRIMARY KEY (snapshot_slug, finding_id, occurrence_id),
    FOREIGN KEY (snapshot_slug, finding_id)
        REFERENCES findings(snapshot_slug, finding_id)
);

CREATE TABLE IF NOT EXISTS critic_runs (
    run_id        TEXT PRIMARY KEY,
    snapshot_slug TEXT NOT NULL REFERENCES snapshots(slug),
    definition    TEXT NOT NULL,
    status        TEXT NOT NULL,
    scope         TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reported_issues (
    run_id     TEXT NOT NULL REFERENCES critic_runs(run_id),
    issue_id   TEXT NOT NULL,
    rationale  TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (run_id, issue_id)
);

CREATE TABLE IF NOT EXISTS issue_occurrences (
    run_id        TEXT NOT NULL,
    issue_id      TEXT NOT NULL,
    occurrence_id TEXT NOT NULL,
    files         TEXT NOT NULL,
    note          TEXT,
    PRIMARY KEY (run_id, issue_id, occurrence_id),
    FOREIGN KEY (run_id, issue_id)
        REFERENCES reported_issues(run_id, issue_id)
);

CREATE TABLE IF NOT EXISTS grading_edges (
    run_id        TEXT NOT NULL,
    issue_id      TEXT NOT NULL,
    snapshot_slug TEXT NOT NULL,
    target_kind   TEXT NOT NULL,
    finding_id    TEXT NOT NULL,
    occurrence_id TEXT NOT NULL,
    credit        REAL NOT NULL,
    rationale     TEXT,
    created_at    TEXT NOT NULL,
    PRIMARY KEY (run_id, issue_id, target_kind, finding_id, occurrence_id),
    FOREIGN KEY (run_id, issue_id)
        REFERENCES reported_issues(run_id, issue_id)
);

CREATE INDEX IF NOT EXISTS idx_findings_snapshot
    ON findings(snapshot_slug);
CREATE INDEX IF NOT EXISTS idx_critic_runs_snapshot
    ON critic_runs(snapshot_slug);
CREATE INDEX IF NOT EXISTS idx_edges_snapshot
    ON grading_edges(snapshot_slug);
"#;

/// SQLite-backed store with pooled connections
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        info!("Opening gradebook database: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let config = Config::new(path);
        let pool = config.create_pool(Runtime::Tokio1).map_err(|e| {
            GradebookError::Database(format!("failed to create connection pool: {e}"))
        })?;

        let store = Self { pool };
        store
            .with_conn(|conn| {
                // WAL lets readers proceed while a write transaction is open
                conn.pragma_update(None, "journal_mode", "wal")?;
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;

        info!("Gradebook database ready");
        Ok(store)
    }

    /// Run a closure against a pooled connection
    pub(crate) async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| GradebookError::Database(format!("connection pool: {e}")))?;

        conn.interact(|conn| {
            // Writers queue behind each other instead of failing busy
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            // The bundled SQLite is compiled with SQLITE_DEFAULT_FOREIGN_KEYS=1;
            // restore the stock default this code is written against (see the
            // SCHEMA comment: deletes cascade explicitly inside transactions)
            conn.pragma_update(None, "foreign_keys", "off")?;
            f(conn)
        })
        .await
        .map_err(|e| GradebookError::Database(format!("pool interaction: {e}")))?
    }
}

/// Begin a write transaction that takes the write lock up front
///
/// IMMEDIATE keeps two read-then-write transactions (e.g. concurrent
/// fill-remaining calls) strictly serialized: the second blocks until the
/// first commits and then sees its writes.
pub(crate) fn write_tx(conn: &mut rusqlite::Connection) -> Result<rusqlite::Transaction<'_>> {
    Ok(conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?)
}

/// Serialize a timestamp for storage
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parse a stored timestamp
pub(crate) fn decode_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GradebookError::Database(format!("invalid stored timestamp '{s}': {e}")))
}
