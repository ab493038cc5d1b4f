//! Critic-run and reported-issue persistence
//!
//! A run is created in progress, then finalized exactly once with a terminal
//! status and its full issue list. Critiques are immutable after that: a
//! critic that wants to revise its review gets a new run.

use crate::access::Identity;
use crate::error::{GradebookError, Result};
use crate::types::{
    CriticRun, CriticRunId, CriticRunStatus, FileAnchor, IssueId, Occurrence, ReportedIssue,
    ReviewScope, SnapshotSlug,
};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::ground_truth::snapshot_split;
use super::{decode_ts, encode_ts, SqliteStore};

impl SqliteStore {
    /// Register a critic run before the critic starts reviewing
    ///
    /// Operator only: runs are provisioned by the orchestration layer, the
    /// critic itself only submits against an id it was handed.
    pub async fn create_critic_run(&self, identity: &Identity, run: CriticRun) -> Result<()> {
        identity.check_ingest()?;
        if run.status.is_terminal() {
            return Err(GradebookError::InvalidOperation(
                "critic runs are created in progress and finalized separately".to_string(),
            ));
        }
        self.with_conn(move |conn| {
            snapshot_split(conn, &run.snapshot)?;
            let scope = serde_json::to_string(&run.scope)?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO critic_runs
                 (run_id, snapshot_slug, definition, status, scope, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run.id.to_string(),
                    run.snapshot.as_str(),
                    run.definition,
                    run.status.as_str(),
                    scope,
                    encode_ts(run.created_at),
                ],
            )?;
            if inserted == 0 {
                return Err(GradebookError::InvalidOperation(format!(
                    "critic run {} already exists",
                    run.id
                )));
            }
            info!(
                "Created critic run {} ('{}') against '{}'",
                run.id, run.definition, run.snapshot
            );
            Ok(())
        })
        .await
    }

    /// Finalize a run with a terminal status and its reported issues
    ///
    /// A failed or context-exceeded run finalizes with an empty issue list;
    /// it still counts against the critic (zero recall) rather than being
    /// dropped from metrics.
    pub async fn complete_critic_run(
        &self,
        identity: &Identity,
        run_id: CriticRunId,
        status: CriticRunStatus,
        issues: Vec<ReportedIssue>,
    ) -> Result<()> {
        identity.check_submit_critique(run_id)?;
        if !status.is_terminal() {
            return Err(GradebookError::InvalidOperation(
                "finalizing a run requires a terminal status".to_string(),
            ));
        }
        for issue in &issues {
            if issue.run_id != run_id {
                return Err(GradebookError::InvalidOperation(format!(
                    "issue '{}' carries run id {}, expected {run_id}",
                    issue.issue_id, issue.run_id
                )));
            }
            issue.validate().map_err(GradebookError::InvalidOperation)?;
        }

        self.with_conn(move |conn| {
            let tx = super::write_tx(conn)?;
            let run = load_run(&tx, run_id)?;
            if run.status.is_terminal() {
                return Err(GradebookError::InvalidOperation(format!(
                    "critic run {run_id} is already finalized; critiques are immutable"
                )));
            }
            let now = encode_ts(chrono::Utc::now());
            for issue in &issues {
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO reported_issues
                     (run_id, issue_id, rationale, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![run_id.to_string(), issue.issue_id.0, issue.rationale, now],
                )?;
                if inserted == 0 {
                    return Err(GradebookError::InvalidOperation(format!(
                        "duplicate issue id '{}' in submission",
                        issue.issue_id
                    )));
                }
                for occ in &issue.occurrences {
                    let files = serde_json::to_string(&occ.files)?;
                    tx.execute(
                        "INSERT INTO issue_occurrences
                         (run_id, issue_id, occurrence_id, files, note)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            run_id.to_string(),
                            issue.issue_id.0,
                            occ.occurrence_id.0,
                            files,
                            occ.note,
                        ],
                    )?;
                }
            }
            tx.execute(
                "UPDATE critic_runs SET status = ?1 WHERE run_id = ?2",
                params![status.as_str(), run_id.to_string()],
            )?;
            tx.commit()?;
            info!(
                "Finalized critic run {run_id} as {} with {} issues",
                status.as_str(),
                issues.len()
            );
            Ok(())
        })
        .await
    }

    /// Look up a critic run
    pub async fn get_critic_run(
        &self,
        identity: &Identity,
        run_id: CriticRunId,
    ) -> Result<CriticRun> {
        let identity = identity.clone();
        self.with_conn(move |conn| {
            let run = load_run(conn, run_id)?;
            let split = snapshot_split(conn, &run.snapshot)?;
            identity.check_critique_read(&run.snapshot, split, Some(run_id))?;
            Ok(run)
        })
        .await
    }

    /// All critic runs against a snapshot, oldest first
    pub async fn list_critic_runs(
        &self,
        identity: &Identity,
        slug: &SnapshotSlug,
    ) -> Result<Vec<CriticRun>> {
        let identity = identity.clone();
        let slug = slug.clone();
        self.with_conn(move |conn| {
            let split = snapshot_split(conn, &slug)?;
            identity.check_critique_read(&slug, split, None)?;
            load_runs_for_snapshot(conn, &slug)
        })
        .await
    }

    /// The issues a run reported
    pub async fn list_issues(
        &self,
        identity: &Identity,
        run_id: CriticRunId,
    ) -> Result<Vec<ReportedIssue>> {
        let identity = identity.clone();
        self.with_conn(move |conn| {
            let run = load_run(conn, run_id)?;
            let split = snapshot_split(conn, &run.snapshot)?;
            identity.check_critique_read(&run.snapshot, split, Some(run_id))?;
            load_issues(conn, run_id)
        })
        .await
    }
}

fn run_from_row(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<(String, String, String, String, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn run_from_parts(
    (run_id, snapshot, definition, status, scope, created_at): (
        String,
        String,
        String,
        String,
        String,
        String,
    ),
) -> Result<CriticRun> {
    let id = CriticRunId::from_string(&run_id)
        .map_err(|e| GradebookError::Database(format!("invalid stored run id '{run_id}': {e}")))?;
    let status = CriticRunStatus::parse(&status)
        .ok_or_else(|| GradebookError::Database(format!("unknown run status '{status}'")))?;
    let scope: ReviewScope = serde_json::from_str(&scope)?;
    Ok(CriticRun {
        id,
        snapshot: SnapshotSlug::new(snapshot),
        definition,
        status,
        scope,
        created_at: decode_ts(&created_at)?,
    })
}

const RUN_COLUMNS: &str = "run_id, snapshot_slug, definition, status, scope, created_at";

/// Load one run or fail with `RunNotFound`
pub(crate) fn load_run(conn: &Connection, run_id: CriticRunId) -> Result<CriticRun> {
    let row = conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM critic_runs WHERE run_id = ?1"),
            params![run_id.to_string()],
            run_from_row,
        )
        .optional()?
        .ok_or(GradebookError::RunNotFound(run_id))?;
    run_from_parts(row)
}

/// All runs against a snapshot, in creation order
pub(crate) fn load_runs_for_snapshot(
    conn: &Connection,
    slug: &SnapshotSlug,
) -> Result<Vec<CriticRun>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RUN_COLUMNS} FROM critic_runs
         WHERE snapshot_slug = ?1 ORDER BY created_at, run_id"
    ))?;
    let rows: Vec<_> = stmt
        .query_map(params![slug.as_str()], run_from_row)?
        .collect::<rusqlite::Result<_>>()?;
    rows.into_iter().map(run_from_parts).collect()
}

/// All issues a run reported, in submission order
pub(crate) fn load_issues(conn: &Connection, run_id: CriticRunId) -> Result<Vec<ReportedIssue>> {
    let mut stmt = conn.prepare(
        "SELECT issue_id, rationale FROM reported_issues
         WHERE run_id = ?1 ORDER BY rowid",
    )?;
    let rows: Vec<(String, String)> = stmt
        .query_map(params![run_id.to_string()], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<rusqlite::Result<_>>()?;

    let mut issues = Vec::with_capacity(rows.len());
    for (issue_id, rationale) in rows {
        let occurrences = load_issue_occurrences(conn, run_id, &issue_id)?;
        issues.push(ReportedIssue {
            run_id,
            issue_id: IssueId::new(issue_id),
            rationale,
            occurrences,
        });
    }
    debug!("Loaded {} issues for run {run_id}", issues.len());
    Ok(issues)
}

fn load_issue_occurrences(
    conn: &Connection,
    run_id: CriticRunId,
    issue_id: &str,
) -> Result<Vec<Occurrence>> {
    let mut stmt = conn.prepare(
        "SELECT occurrence_id, files, note FROM issue_occurrences
         WHERE run_id = ?1 AND issue_id = ?2 ORDER BY rowid",
    )?;
    let rows: Vec<(String, String, Option<String>)> = stmt
        .query_map(params![run_id.to_string(), issue_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<rusqlite::Result<_>>()?;

    rows.into_iter()
        .map(|(occurrence_id, files, note)| {
            let files: Vec<FileAnchor> = serde_json::from_str(&files)?;
            Ok(Occurrence {
                occurrence_id: crate::types::OccurrenceId::new(occurrence_id),
                files,
                note,
            })
        })
        .collect()
}
