//! Recall and precision aggregation
//!
//! Metrics are derived on demand from ground truth, critiques, and edges.
//! Every report carries a `grading_complete` flag so a consumer can tell a
//! genuinely low score from a partially graded one; nothing here waits for
//! grading to finish.

use crate::access::Identity;
use crate::drift::compute_pending;
use crate::error::Result;
use crate::matchability::matchable_occurrences;
use crate::store::{critique, edges, ground_truth, SqliteStore};
use crate::types::{
    CriticRunId, CriticRunStatus, FindingKind, GradingEdge, GroundTruthFinding, SnapshotSlug,
    Split,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Credit earned against the credit available to a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallReport {
    /// Sum of credit on edges into true-positive occurrences
    pub credit_earned: f64,
    /// Number of matchable true-positive occurrences for the run's scope
    pub credit_available: f64,
    /// True when the run has zero pending pairs
    pub grading_complete: bool,
}

impl RecallReport {
    /// Recall in [0, 1], or `None` when nothing was matchable
    ///
    /// A run whose scope makes no true positive matchable has no recall,
    /// rather than a misleading 0.0 or 1.0.
    pub fn recall(&self) -> Option<f64> {
        if self.credit_available > 0.0 {
            Some(self.credit_earned / self.credit_available)
        } else {
            None
        }
    }
}

/// How often a run endorsed known false positives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecisionReport {
    /// Sum of positive credit on edges into false-positive occurrences
    pub fp_credit: f64,
    /// Number of false-positive edges with positive credit
    pub fp_hits: usize,
    pub grading_complete: bool,
}

/// Combined per-run report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub run_id: CriticRunId,
    pub snapshot: SnapshotSlug,
    pub status: CriticRunStatus,
    pub recall: RecallReport,
    pub precision: PrecisionReport,
}

/// Rollup over every run of one snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetrics {
    pub snapshot: SnapshotSlug,
    pub split: Split,
    /// Runs in a terminal status (in-progress runs are excluded entirely)
    pub runs: usize,
    /// Terminal runs with a defined recall (the population of `mean_recall`)
    pub scored_runs: usize,
    /// Mean recall over runs with a defined recall; `None` if there are none
    pub mean_recall: Option<f64>,
    pub fp_credit: f64,
    pub fp_hits: usize,
    /// True only when every terminal run is fully graded
    pub grading_complete: bool,
}

/// Rollup over every snapshot of one split
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitMetrics {
    pub split: Split,
    pub snapshots: usize,
    pub runs: usize,
    pub mean_recall: Option<f64>,
    pub fp_credit: f64,
    pub fp_hits: usize,
    pub grading_complete: bool,
}

/// Computes recall/precision rollups from the store
pub struct MetricsAggregator {
    store: Arc<SqliteStore>,
}

impl MetricsAggregator {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    /// Metrics for one critic run
    pub async fn run_metrics(&self, identity: &Identity, run_id: CriticRunId) -> Result<RunMetrics> {
        let identity = identity.clone();
        self.store
            .with_conn(move |conn| {
                let run = critique::load_run(conn, run_id)?;
                let split = ground_truth::snapshot_split(conn, &run.snapshot)?;
                identity.check_metrics_read(split)?;
                let findings = ground_truth::load_findings(conn, &run.snapshot)?;
                run_metrics_for(conn, &findings, run_id)
            })
            .await
    }

    /// Recall for one critic run
    pub async fn recall(&self, identity: &Identity, run_id: CriticRunId) -> Result<RecallReport> {
        Ok(self.run_metrics(identity, run_id).await?.recall)
    }

    /// False-positive endorsement signal for one critic run
    pub async fn precision_signal(
        &self,
        identity: &Identity,
        run_id: CriticRunId,
    ) -> Result<PrecisionReport> {
        Ok(self.run_metrics(identity, run_id).await?.precision)
    }

    /// Rollup over all terminal runs of a snapshot
    pub async fn snapshot_metrics(
        &self,
        identity: &Identity,
        slug: &SnapshotSlug,
    ) -> Result<SnapshotMetrics> {
        let identity = identity.clone();
        let slug = slug.clone();
        self.store
            .with_conn(move |conn| {
                let split = ground_truth::snapshot_split(conn, &slug)?;
                identity.check_metrics_read(split)?;
                snapshot_metrics_for(conn, &slug, split)
            })
            .await
    }

    /// Rollup over every snapshot in a split
    pub async fn split_metrics(&self, identity: &Identity, split: Split) -> Result<SplitMetrics> {
        identity.check_metrics_read(split)?;
        self.store
            .with_conn(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT slug FROM snapshots WHERE split = ?1 ORDER BY slug")?;
                let slugs: Vec<String> = stmt
                    .query_map([split.as_str()], |row| row.get(0))?
                    .collect::<rusqlite::Result<_>>()?;

                let mut runs = 0;
                let mut recalls = Vec::new();
                let mut fp_credit = 0.0;
                let mut fp_hits = 0;
                let mut grading_complete = true;
                for slug in &slugs {
                    let slug = SnapshotSlug::new(slug.clone());
                    let snap = snapshot_metrics_for(conn, &slug, split)?;
                    runs += snap.runs;
                    if let Some(recall) = snap.mean_recall {
                        // Weight the split mean by the runs that produced a
                        // recall, not by snapshot
                        recalls.extend(std::iter::repeat(recall).take(snap.scored_runs));
                    }
                    fp_credit += snap.fp_credit;
                    fp_hits += snap.fp_hits;
                    grading_complete &= snap.grading_complete;
                }
                debug!(
                    "Split {split}: {} snapshots, {runs} runs",
                    slugs.len()
                );
                Ok(SplitMetrics {
                    split,
                    snapshots: slugs.len(),
                    runs,
                    mean_recall: mean(&recalls),
                    fp_credit,
                    fp_hits,
                    grading_complete,
                })
            })
            .await
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn run_metrics_for(
    conn: &Connection,
    findings: &[GroundTruthFinding],
    run_id: CriticRunId,
) -> Result<RunMetrics> {
    let run = critique::load_run(conn, run_id)?;
    let issues = critique::load_issues(conn, run_id)?;
    let run_edges: Vec<GradingEdge> = edges::load_edges(conn, &run.snapshot, Some(run_id))?;

    let matchable = matchable_occurrences(findings, &run.scope);
    let credit_available = matchable
        .iter()
        .filter(|(kind, _, _)| *kind == FindingKind::TruePositive)
        .count() as f64;

    // Credit for one TP occurrence may be split across the run's issues;
    // the store caps each sum at 1.0 at write time, and the cap is applied
    // again here so stale data can never push recall past 1.0.
    let mut tp_credit: std::collections::BTreeMap<(String, String), f64> = Default::default();
    let mut fp_credit = 0.0;
    let mut fp_hits = 0;
    for edge in &run_edges {
        match edge.target.kind() {
            FindingKind::TruePositive => {
                let key = (
                    edge.target.finding_id().0.clone(),
                    edge.target.occurrence_id().0.clone(),
                );
                *tp_credit.entry(key).or_insert(0.0) += edge.credit;
            }
            FindingKind::FalsePositive => {
                if edge.credit > 0.0 {
                    fp_credit += edge.credit;
                    fp_hits += 1;
                }
            }
        }
    }
    let credit_earned: f64 = tp_credit.values().map(|c| c.min(1.0)).sum();

    let existing: HashSet<_> = run_edges
        .iter()
        .map(|e| (e.run_id, e.issue_id.clone(), e.target.clone()))
        .collect();
    let grading_complete =
        compute_pending(findings, &[(run.clone(), issues)], &existing, None).is_empty();

    Ok(RunMetrics {
        run_id,
        snapshot: run.snapshot,
        status: run.status,
        recall: RecallReport {
            credit_earned,
            credit_available,
            grading_complete,
        },
        precision: PrecisionReport {
            fp_credit,
            fp_hits,
            grading_complete,
        },
    })
}

fn snapshot_metrics_for(
    conn: &Connection,
    slug: &SnapshotSlug,
    split: Split,
) -> Result<SnapshotMetrics> {
    let findings = ground_truth::load_findings(conn, slug)?;
    let runs = critique::load_runs_for_snapshot(conn, slug)?;

    let mut terminal_runs = 0;
    let mut recalls = Vec::new();
    let mut fp_credit = 0.0;
    let mut fp_hits = 0;
    let mut grading_complete = true;
    for run in &runs {
        if !run.status.is_terminal() {
            continue;
        }
        terminal_runs += 1;
        let m = run_metrics_for(conn, &findings, run.id)?;
        if let Some(recall) = m.recall.recall() {
            recalls.push(recall);
        }
        fp_credit += m.precision.fp_credit;
        fp_hits += m.precision.fp_hits;
        grading_complete &= m.recall.grading_complete;
    }

    Ok(SnapshotMetrics {
        snapshot: slug.clone(),
        split,
        runs: terminal_runs,
        scored_runs: recalls.len(),
        mean_recall: mean(&recalls),
        fp_credit,
        fp_hits,
        grading_complete,
    })
}
