//! Drift detection
//!
//! Drift is the set of matchable (reported issue, ground-truth occurrence)
//! pairs that have no grading edge. It is recomputed from base records on
//! every query rather than maintained incrementally, so any write that
//! changes the answer (new run, new finding, deleted finding, deleted
//! edges) is picked up automatically. Zero drift means grading is complete.

use crate::access::Identity;
use crate::error::Result;
use crate::matchability::matchable_occurrences;
use crate::store::{critique, edges, ground_truth, SqliteStore};
use crate::types::{
    CriticRun, CriticRunId, CriticRunStatus, EdgeTarget, GroundTruthFinding, IssueId, PendingPair,
    ReportedIssue, SnapshotSlug,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Key identifying one grading edge
pub(crate) type EdgeKey = (CriticRunId, IssueId, EdgeTarget);

/// What portion of the grading surface to inspect
#[derive(Debug, Clone)]
pub enum DriftScope {
    /// Every completed run against the snapshot
    Snapshot(SnapshotSlug),
    /// One critic run
    CriticRun(CriticRunId),
    /// One reported issue within a run
    Issue {
        run_id: CriticRunId,
        issue_id: IssueId,
    },
}

/// Pure drift computation over already-loaded records
///
/// Only completed runs produce pending pairs: in-progress runs are not yet
/// gradeable and failed runs have nothing to grade. Output order is
/// deterministic (sorted) so batches are stable across calls.
pub(crate) fn compute_pending(
    findings: &[GroundTruthFinding],
    runs: &[(CriticRun, Vec<ReportedIssue>)],
    existing: &HashSet<EdgeKey>,
    issue_filter: Option<&IssueId>,
) -> Vec<PendingPair> {
    let mut pending = Vec::new();
    for (run, issues) in runs {
        if run.status != CriticRunStatus::Completed {
            continue;
        }
        let matchable = matchable_occurrences(findings, &run.scope);
        for issue in issues {
            if let Some(filter) = issue_filter {
                if issue.issue_id != *filter {
                    continue;
                }
            }
            for (kind, finding_id, occurrence_id) in &matchable {
                let target = EdgeTarget::new(*kind, (*finding_id).clone(), (*occurrence_id).clone());
                let key = (run.id, issue.issue_id.clone(), target);
                if !existing.contains(&key) {
                    let (run_id, issue_id, target) = key;
                    pending.push(PendingPair {
                        run_id,
                        issue_id,
                        target,
                    });
                }
            }
        }
    }
    pending.sort();
    pending
}

/// Computes pending grading pairs from the store on demand
pub struct DriftDetector {
    store: Arc<SqliteStore>,
}

impl DriftDetector {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    /// All matchable pairs lacking an edge, for the given scope
    ///
    /// Pending pairs name ground-truth occurrence ids, so the caller needs
    /// ground-truth visibility for the snapshot.
    pub async fn pending_for(
        &self,
        identity: &Identity,
        scope: DriftScope,
    ) -> Result<Vec<PendingPair>> {
        let identity = identity.clone();
        self.store
            .with_conn(move |conn| {
                let (slug, run_filter, issue_filter) = match scope {
                    DriftScope::Snapshot(slug) => (slug, None, None),
                    DriftScope::CriticRun(run_id) => {
                        let run = critique::load_run(conn, run_id)?;
                        (run.snapshot.clone(), Some(run_id), None)
                    }
                    DriftScope::Issue { run_id, issue_id } => {
                        let run = critique::load_run(conn, run_id)?;
                        (run.snapshot.clone(), Some(run_id), Some(issue_id))
                    }
                };
                let split = ground_truth::snapshot_split(conn, &slug)?;
                identity.check_ground_truth_read(&slug, split)?;
                identity.check_edge_read(&slug, split)?;

                let findings = ground_truth::load_findings(conn, &slug)?;
                let runs = match run_filter {
                    Some(run_id) => vec![critique::load_run(conn, run_id)?],
                    None => critique::load_runs_for_snapshot(conn, &slug)?,
                };
                let mut runs_with_issues = Vec::with_capacity(runs.len());
                for run in runs {
                    let issues = critique::load_issues(conn, run.id)?;
                    runs_with_issues.push((run, issues));
                }
                let existing = edges::load_edge_keys(conn, &slug)?;

                let pending = compute_pending(
                    &findings,
                    &runs_with_issues,
                    &existing,
                    issue_filter.as_ref(),
                );
                debug!("Drift for '{slug}': {} pending pairs", pending.len());
                Ok(pending)
            })
            .await
    }
}
