//! Shared fixtures for integration tests
//!
//! A seeded snapshot contains two findings:
//! - `tp-1`: a true positive with two occurrences, catchable from a.py
//! - `fp-1`: a known false positive with one occurrence, catchable from b.py
//!
//! A whole-snapshot run with one issue therefore has 3 matchable pairs.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use gradebook::reconciler::process::{GradingOutcome, GradingProcess, GradingProcessFactory};
use gradebook::store::SqliteStore;
use gradebook::types::*;
use gradebook::{DriftDetector, DriftScope, Identity};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Honor RUST_LOG when debugging test failures
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Open a store backed by a fresh temp-directory database
///
/// The TempDir must stay alive as long as the store: dropping it deletes
/// the database file out from under the pool.
pub async fn open_store() -> (TempDir, Arc<SqliteStore>) {
    init_tracing();
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("gradebook_test.db");
    let store = SqliteStore::open(&db_path)
        .await
        .expect("Failed to open store");
    (temp_dir, Arc::new(store))
}

pub fn snapshot(slug: &str, split: Split) -> Snapshot {
    Snapshot {
        slug: SnapshotSlug::new(slug),
        split,
        description: Some("test snapshot".to_string()),
        created_at: Utc::now(),
    }
}

pub fn tp_finding() -> GroundTruthFinding {
    GroundTruthFinding {
        id: FindingId::new("tp-1"),
        kind: FindingKind::TruePositive,
        rationale: "off-by-one in pagination".to_string(),
        occurrences: vec![
            Occurrence::new("occ-0", vec![FileAnchor::new("a.py")]),
            Occurrence::new("occ-1", vec![FileAnchor::new("a.py")]),
        ],
        catchability: CatchabilityRule::single(["a.py"]),
        match_only_if_reported_on: None,
    }
}

pub fn fp_finding() -> GroundTruthFinding {
    GroundTruthFinding {
        id: FindingId::new("fp-1"),
        kind: FindingKind::FalsePositive,
        rationale: "looks like a leak but the handle is pooled".to_string(),
        occurrences: vec![Occurrence::new("occ-0", vec![FileAnchor::new("b.py")])],
        catchability: CatchabilityRule::single(["b.py"]),
        match_only_if_reported_on: None,
    }
}

/// Snapshot with tp-1 and fp-1 ingested
pub async fn seed_snapshot(store: &SqliteStore, slug: &str, split: Split) -> SnapshotSlug {
    let slug = SnapshotSlug::new(slug);
    store
        .insert_snapshot(&Identity::Operator, snapshot(slug.as_str(), split))
        .await
        .expect("Failed to insert snapshot");
    store
        .insert_finding(&Identity::Operator, &slug, tp_finding())
        .await
        .expect("Failed to insert tp finding");
    store
        .insert_finding(&Identity::Operator, &slug, fp_finding())
        .await
        .expect("Failed to insert fp finding");
    slug
}

pub fn issue(run_id: CriticRunId, id: &str, file: &str) -> ReportedIssue {
    ReportedIssue {
        run_id,
        issue_id: IssueId::new(id),
        rationale: "suspicious loop bound".to_string(),
        occurrences: vec![Occurrence::new("r0", vec![FileAnchor::new(file)])],
    }
}

/// Create and finalize a completed run with the given issues
pub async fn completed_run(
    store: &SqliteStore,
    slug: &SnapshotSlug,
    scope: ReviewScope,
    issue_ids: &[&str],
) -> CriticRunId {
    let run_id = CriticRunId::new();
    store
        .create_critic_run(
            &Identity::Operator,
            CriticRun {
                id: run_id,
                snapshot: slug.clone(),
                definition: "critic-v1".to_string(),
                status: CriticRunStatus::InProgress,
                scope,
                created_at: Utc::now(),
            },
        )
        .await
        .expect("Failed to create run");
    let issues: Vec<ReportedIssue> = issue_ids
        .iter()
        .map(|id| issue(run_id, id, "a.py"))
        .collect();
    store
        .complete_critic_run(
            &Identity::Operator,
            run_id,
            CriticRunStatus::Completed,
            issues,
        )
        .await
        .expect("Failed to complete run");
    run_id
}

pub async fn pending_count(store: &Arc<SqliteStore>, slug: &SnapshotSlug) -> usize {
    DriftDetector::new(store.clone())
        .pending_for(&Identity::Operator, DriftScope::Snapshot(slug.clone()))
        .await
        .expect("Failed to compute drift")
        .len()
}

/// Poll until drift hits zero or the timeout elapses
pub async fn wait_for_zero_drift(store: &Arc<SqliteStore>, slug: &SnapshotSlug) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if pending_count(store, slug).await == 0 {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("Drift for '{slug}' never reached zero");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Grades every pair it is handed: full credit for the first issue matching
/// a true-positive occurrence, zero for repeat matches and false positives
///
/// Credit for one occurrence may not total more than 1.0 per run, so later
/// issues hitting an already-credited occurrence get zero-credit edges.
pub struct ScriptedGrader {
    credited: Arc<Mutex<HashSet<(CriticRunId, String, String)>>>,
}

#[async_trait]
impl GradingProcess for ScriptedGrader {
    async fn decide(
        &mut self,
        batch: &[PendingPair],
    ) -> gradebook::Result<GradingOutcome> {
        let mut credited = self.credited.lock().unwrap();
        let drafts = batch
            .iter()
            .map(|pair| {
                let credit = match pair.target.kind() {
                    FindingKind::TruePositive => {
                        let key = (
                            pair.run_id,
                            pair.target.finding_id().0.clone(),
                            pair.target.occurrence_id().0.clone(),
                        );
                        if credited.insert(key) {
                            1.0
                        } else {
                            0.0
                        }
                    }
                    FindingKind::FalsePositive => 0.0,
                };
                EdgeDraft {
                    run_id: pair.run_id,
                    issue_id: pair.issue_id.clone(),
                    target: pair.target.clone(),
                    credit,
                    rationale: Some("scripted".to_string()),
                }
            })
            .collect();
        Ok(GradingOutcome::Edges(drafts))
    }
}

/// Factory handing out [`ScriptedGrader`]s, counting spawns
///
/// The credited-occurrence set is shared across spawns so restarts do not
/// double-credit an occurrence.
pub struct ScriptedFactory {
    pub spawns: Arc<AtomicUsize>,
    credited: Arc<Mutex<HashSet<(CriticRunId, String, String)>>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self {
            spawns: Arc::new(AtomicUsize::new(0)),
            credited: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

#[async_trait]
impl GradingProcessFactory for ScriptedFactory {
    async fn spawn(
        &self,
        _snapshot: &SnapshotSlug,
    ) -> gradebook::Result<Box<dyn GradingProcess>> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedGrader {
            credited: self.credited.clone(),
        }))
    }
}

/// Grades one pair per batch, then exhausts. Forces a restart after every
/// single edge.
pub struct OnePairThenExhausted {
    judged: bool,
}

#[async_trait]
impl GradingProcess for OnePairThenExhausted {
    async fn decide(
        &mut self,
        batch: &[PendingPair],
    ) -> gradebook::Result<GradingOutcome> {
        if self.judged {
            return Ok(GradingOutcome::ResourceExhausted);
        }
        self.judged = true;
        let pair = &batch[0];
        Ok(GradingOutcome::Edges(vec![EdgeDraft {
            run_id: pair.run_id,
            issue_id: pair.issue_id.clone(),
            target: pair.target.clone(),
            credit: 0.5,
            rationale: None,
        }]))
    }
}

pub struct ExhaustingFactory {
    pub spawns: Arc<AtomicUsize>,
}

impl ExhaustingFactory {
    pub fn new() -> Self {
        Self {
            spawns: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl GradingProcessFactory for ExhaustingFactory {
    async fn spawn(
        &self,
        _snapshot: &SnapshotSlug,
    ) -> gradebook::Result<Box<dyn GradingProcess>> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(OnePairThenExhausted { judged: false }))
    }
}

/// Never produces an edge; every batch exhausts immediately
pub struct AlwaysExhausted;

#[async_trait]
impl GradingProcess for AlwaysExhausted {
    async fn decide(
        &mut self,
        _batch: &[PendingPair],
    ) -> gradebook::Result<GradingOutcome> {
        Ok(GradingOutcome::ResourceExhausted)
    }
}

pub struct AlwaysExhaustedFactory {
    pub spawns: Arc<AtomicUsize>,
}

impl AlwaysExhaustedFactory {
    pub fn new() -> Self {
        Self {
            spawns: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl GradingProcessFactory for AlwaysExhaustedFactory {
    async fn spawn(
        &self,
        _snapshot: &SnapshotSlug,
    ) -> gradebook::Result<Box<dyn GradingProcess>> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(AlwaysExhausted))
    }
}

/// Produces an edge with credit outside [0, 1]; the store rejects every
/// batch it makes
pub struct OutOfRangeGrader;

#[async_trait]
impl GradingProcess for OutOfRangeGrader {
    async fn decide(
        &mut self,
        batch: &[PendingPair],
    ) -> gradebook::Result<GradingOutcome> {
        let pair = &batch[0];
        Ok(GradingOutcome::Edges(vec![EdgeDraft {
            run_id: pair.run_id,
            issue_id: pair.issue_id.clone(),
            target: pair.target.clone(),
            credit: 1.5,
            rationale: None,
        }]))
    }
}

pub struct OutOfRangeFactory {
    pub spawns: Arc<AtomicUsize>,
}

impl OutOfRangeFactory {
    pub fn new() -> Self {
        Self {
            spawns: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl GradingProcessFactory for OutOfRangeFactory {
    async fn spawn(
        &self,
        _snapshot: &SnapshotSlug,
    ) -> gradebook::Result<Box<dyn GradingProcess>> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(OutOfRangeGrader))
    }
}
