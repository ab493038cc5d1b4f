//! Grading-edge persistence
//!
//! Edges are append-only within an (issue, occurrence) pair: writing over an
//! existing edge is rejected with `DuplicateEdge`, and a redo goes through
//! `delete_edges` or `replace_edges` so that the audit trail of a re-grade
//! is an explicit delete, not a silent overwrite.

use crate::access::Identity;
use crate::drift::{compute_pending, EdgeKey};
use crate::error::{GradebookError, Result};
use crate::matchability::rule_is_matchable;
use crate::types::{
    CatchabilityRule, CriticRunId, EdgeDraft, EdgeTarget, FindingKind, GradingEdge, IssueId,
    SnapshotSlug,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::ground_truth::{load_findings, snapshot_split};
use super::{critique, decode_ts, encode_ts, SqliteStore};

impl SqliteStore {
    /// Persist a batch of grading edges in one transaction
    ///
    /// All drafts commit or none do; the first validation failure aborts the
    /// batch. Returns the number of edges written.
    pub async fn put_edges(
        &self,
        identity: &Identity,
        slug: &SnapshotSlug,
        drafts: Vec<EdgeDraft>,
    ) -> Result<usize> {
        let identity = identity.clone();
        let slug = slug.clone();
        self.with_conn(move |conn| {
            snapshot_split(conn, &slug)?;
            identity.check_edge_write(&slug)?;
            let tx = super::write_tx(conn)?;
            for draft in &drafts {
                insert_edge_tx(&tx, &slug, draft)?;
            }
            tx.commit()?;
            debug!("Persisted {} edges for snapshot '{slug}'", drafts.len());
            Ok(drafts.len())
        })
        .await
    }

    /// Delete all edges for one reported issue, returning how many were removed
    ///
    /// This is the redo path: after the delete, every previously graded pair
    /// for the issue is pending again.
    pub async fn delete_edges(
        &self,
        identity: &Identity,
        slug: &SnapshotSlug,
        run_id: CriticRunId,
        issue_id: &IssueId,
    ) -> Result<usize> {
        let identity = identity.clone();
        let slug = slug.clone();
        let issue_id = issue_id.clone();
        self.with_conn(move |conn| {
            snapshot_split(conn, &slug)?;
            identity.check_edge_write(&slug)?;
            let removed = conn.execute(
                "DELETE FROM grading_edges
                 WHERE snapshot_slug = ?1 AND run_id = ?2 AND issue_id = ?3",
                params![slug.as_str(), run_id.to_string(), issue_id.0],
            )?;
            info!("Deleted {removed} edges for issue '{issue_id}' of run {run_id}");
            Ok(removed)
        })
        .await
    }

    /// Atomically replace an issue's edges with a new set
    ///
    /// Delete plus insert in one transaction, so no observer sees the issue
    /// half-graded.
    pub async fn replace_edges(
        &self,
        identity: &Identity,
        slug: &SnapshotSlug,
        run_id: CriticRunId,
        issue_id: &IssueId,
        drafts: Vec<EdgeDraft>,
    ) -> Result<usize> {
        let identity = identity.clone();
        let slug = slug.clone();
        let issue_id = issue_id.clone();
        self.with_conn(move |conn| {
            snapshot_split(conn, &slug)?;
            identity.check_edge_write(&slug)?;
            let tx = super::write_tx(conn)?;
            tx.execute(
                "DELETE FROM grading_edges
                 WHERE snapshot_slug = ?1 AND run_id = ?2 AND issue_id = ?3",
                params![slug.as_str(), run_id.to_string(), issue_id.0],
            )?;
            for draft in &drafts {
                if draft.run_id != run_id || draft.issue_id != issue_id {
                    return Err(GradebookError::InvalidOperation(format!(
                        "replacement edge targets issue '{}' of run {}, expected '{issue_id}' of {run_id}",
                        draft.issue_id, draft.run_id
                    )));
                }
                insert_edge_tx(&tx, &slug, draft)?;
            }
            tx.commit()?;
            info!(
                "Replaced edges for issue '{issue_id}' of run {run_id} ({} new)",
                drafts.len()
            );
            Ok(drafts.len())
        })
        .await
    }

    /// Write credit-0 edges for every still-pending pair of one issue
    ///
    /// `expected_count` is the number of pending pairs the caller observed
    /// before deciding none of them match. The count is re-checked inside
    /// the write transaction; if ground truth or edges changed in between,
    /// the fill aborts instead of silently zeroing pairs the caller never
    /// reviewed.
    pub async fn fill_remaining(
        &self,
        identity: &Identity,
        slug: &SnapshotSlug,
        run_id: CriticRunId,
        issue_id: &IssueId,
        expected_count: usize,
        rationale: Option<String>,
    ) -> Result<usize> {
        let identity = identity.clone();
        let slug = slug.clone();
        let issue_id = issue_id.clone();
        self.with_conn(move |conn| {
            snapshot_split(conn, &slug)?;
            identity.check_edge_write(&slug)?;

            let tx = super::write_tx(conn)?;
            let run = critique::load_run(&tx, run_id)?;
            if run.snapshot != slug {
                return Err(GradebookError::InvalidOperation(format!(
                    "run {run_id} belongs to snapshot '{}', not '{slug}'",
                    run.snapshot
                )));
            }
            let issues = critique::load_issues(&tx, run_id)?;
            if !issues.iter().any(|i| i.issue_id == issue_id) {
                return Err(GradebookError::IssueNotFound {
                    run_id,
                    issue_id: issue_id.clone(),
                });
            }
            let findings = load_findings(&tx, &slug)?;
            let existing = load_edge_keys(&tx, &slug)?;
            let pending = compute_pending(
                &findings,
                &[(run, issues)],
                &existing,
                Some(&issue_id),
            );
            if pending.len() != expected_count {
                warn!(
                    "Fill for issue '{issue_id}' of run {run_id} aborted: expected {expected_count} pending pairs, found {}",
                    pending.len()
                );
                return Err(GradebookError::InvalidOperation(format!(
                    "expected {expected_count} pending pairs for issue '{issue_id}' but found {}; \
                     the grading surface changed underneath the fill",
                    pending.len()
                )));
            }
            for pair in &pending {
                let draft = EdgeDraft::zero(pair, rationale.clone());
                insert_edge_tx(&tx, &slug, &draft)?;
            }
            tx.commit()?;
            debug!(
                "Filled {} remaining pairs for issue '{issue_id}' of run {run_id}",
                pending.len()
            );
            Ok(pending.len())
        })
        .await
    }

    /// Edges for a snapshot, optionally restricted to one run
    pub async fn list_edges(
        &self,
        identity: &Identity,
        slug: &SnapshotSlug,
        run_id: Option<CriticRunId>,
    ) -> Result<Vec<GradingEdge>> {
        let identity = identity.clone();
        let slug = slug.clone();
        self.with_conn(move |conn| {
            let split = snapshot_split(conn, &slug)?;
            identity.check_edge_read(&slug, split)?;
            load_edges(conn, &slug, run_id)
        })
        .await
    }
}

/// Validate and insert one edge inside an open transaction
///
/// Checks, in order: credit range, run existence and snapshot agreement,
/// issue existence, occurrence existence (distinguishing cross-snapshot
/// references from plain typos), matchability of the target for the run's
/// scope, duplicate detection, and the per-occurrence credit cap. Unmatchable
/// targets are refused here rather than filtered in metrics: earned credit
/// could otherwise outgrow the matchable denominator.
fn insert_edge_tx(conn: &Connection, slug: &SnapshotSlug, draft: &EdgeDraft) -> Result<()> {
    if !(0.0..=1.0).contains(&draft.credit) || draft.credit.is_nan() {
        return Err(GradebookError::InvalidCredit(draft.credit));
    }

    let run = critique::load_run(conn, draft.run_id)?;
    if run.snapshot != *slug {
        return Err(GradebookError::CrossSnapshotEdge {
            issue_snapshot: run.snapshot,
            occurrence_snapshot: slug.clone(),
        });
    }

    let issue_exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM reported_issues WHERE run_id = ?1 AND issue_id = ?2",
            params![draft.run_id.to_string(), draft.issue_id.0],
            |row| row.get(0),
        )
        .optional()?;
    if issue_exists.is_none() {
        return Err(GradebookError::IssueNotFound {
            run_id: draft.run_id,
            issue_id: draft.issue_id.clone(),
        });
    }

    let finding_id = draft.target.finding_id();
    let occurrence_id = draft.target.occurrence_id();
    let target_row: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT f.kind, f.catchability, f.match_only_if_reported_on
             FROM finding_occurrences o
             JOIN findings f
               ON f.snapshot_slug = o.snapshot_slug AND f.finding_id = o.finding_id
             WHERE o.snapshot_slug = ?1 AND o.finding_id = ?2 AND o.occurrence_id = ?3",
            params![slug.as_str(), finding_id.0, occurrence_id.0],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    match target_row {
        Some((kind, catchability, reported_on))
            if FindingKind::parse(&kind) == Some(draft.target.kind()) =>
        {
            let catchability: CatchabilityRule = serde_json::from_str(&catchability)?;
            let reported_on: Option<BTreeSet<PathBuf>> = reported_on
                .map(|s| serde_json::from_str(&s))
                .transpose()?;
            if !rule_is_matchable(&catchability, reported_on.as_ref(), &run.scope) {
                return Err(GradebookError::UnmatchableEdge {
                    run_id: draft.run_id,
                    finding_id: finding_id.clone(),
                    occurrence_id: occurrence_id.clone(),
                });
            }
        }
        Some(_) => {
            // Typed target disagrees with the stored finding kind
            return Err(GradebookError::OccurrenceNotFound {
                finding_id: finding_id.clone(),
                occurrence_id: occurrence_id.clone(),
            });
        }
        None => {
            let elsewhere: Option<String> = conn
                .query_row(
                    "SELECT snapshot_slug FROM finding_occurrences
                     WHERE finding_id = ?1 AND occurrence_id = ?2 LIMIT 1",
                    params![finding_id.0, occurrence_id.0],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match elsewhere {
                Some(other) => GradebookError::CrossSnapshotEdge {
                    issue_snapshot: slug.clone(),
                    occurrence_snapshot: SnapshotSlug::new(other),
                },
                None => GradebookError::OccurrenceNotFound {
                    finding_id: finding_id.clone(),
                    occurrence_id: occurrence_id.clone(),
                },
            });
        }
    }

    let duplicate: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM grading_edges
             WHERE run_id = ?1 AND issue_id = ?2 AND target_kind = ?3
               AND finding_id = ?4 AND occurrence_id = ?5",
            params![
                draft.run_id.to_string(),
                draft.issue_id.0,
                draft.target.kind().as_str(),
                finding_id.0,
                occurrence_id.0,
            ],
            |row| row.get(0),
        )
        .optional()?;
    if duplicate.is_some() {
        return Err(GradebookError::DuplicateEdge {
            issue_id: draft.issue_id.clone(),
            finding_id: finding_id.clone(),
            occurrence_id: occurrence_id.clone(),
        });
    }

    // Credit for one occurrence may be split across a run's issues, but the
    // total can never exceed 1.0
    let existing_credit: f64 = conn.query_row(
        "SELECT COALESCE(SUM(credit), 0.0) FROM grading_edges
         WHERE run_id = ?1 AND target_kind = ?2
           AND finding_id = ?3 AND occurrence_id = ?4",
        params![
            draft.run_id.to_string(),
            draft.target.kind().as_str(),
            finding_id.0,
            occurrence_id.0,
        ],
        |row| row.get(0),
    )?;
    if existing_credit + draft.credit > 1.0 {
        return Err(GradebookError::CreditOverflow {
            run_id: draft.run_id,
            finding_id: finding_id.clone(),
            occurrence_id: occurrence_id.clone(),
            total: existing_credit + draft.credit,
        });
    }

    conn.execute(
        "INSERT INTO grading_edges
         (run_id, issue_id, snapshot_slug, target_kind, finding_id,
          occurrence_id, credit, rationale, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            draft.run_id.to_string(),
            draft.issue_id.0,
            slug.as_str(),
            draft.target.kind().as_str(),
            finding_id.0,
            occurrence_id.0,
            draft.credit,
            draft.rationale,
            encode_ts(chrono::Utc::now()),
        ],
    )?;
    Ok(())
}

/// Load edges for a snapshot, optionally for a single run
pub(crate) fn load_edges(
    conn: &Connection,
    slug: &SnapshotSlug,
    run_id: Option<CriticRunId>,
) -> Result<Vec<GradingEdge>> {
    let sql = "SELECT run_id, issue_id, target_kind, finding_id, occurrence_id,
                      credit, rationale, created_at
               FROM grading_edges
               WHERE snapshot_slug = ?1 AND (?2 IS NULL OR run_id = ?2)
               ORDER BY rowid";
    let mut stmt = conn.prepare(sql)?;
    let rows: Vec<(
        String,
        String,
        String,
        String,
        String,
        f64,
        Option<String>,
        String,
    )> = stmt
        .query_map(
            params![slug.as_str(), run_id.map(|r| r.to_string())],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            },
        )?
        .collect::<rusqlite::Result<_>>()?;

    rows.into_iter()
        .map(
            |(run_id, issue_id, kind, finding_id, occurrence_id, credit, rationale, created_at)| {
                let run_id = CriticRunId::from_string(&run_id).map_err(|e| {
                    GradebookError::Database(format!("invalid stored run id '{run_id}': {e}"))
                })?;
                let kind = FindingKind::parse(&kind).ok_or_else(|| {
                    GradebookError::Database(format!("unknown edge target kind '{kind}'"))
                })?;
                Ok(GradingEdge {
                    run_id,
                    issue_id: IssueId::new(issue_id),
                    snapshot: slug.clone(),
                    target: EdgeTarget::new(
                        kind,
                        crate::types::FindingId::new(finding_id),
                        crate::types::OccurrenceId::new(occurrence_id),
                    ),
                    credit,
                    rationale,
                    created_at: decode_ts(&created_at)?,
                })
            },
        )
        .collect()
}

/// Keys of every edge in a snapshot, for drift computation
pub(crate) fn load_edge_keys(conn: &Connection, slug: &SnapshotSlug) -> Result<HashSet<EdgeKey>> {
    Ok(load_edges(conn, slug, None)?
        .into_iter()
        .map(|e| (e.run_id, e.issue_id, e.target))
        .collect())
}
