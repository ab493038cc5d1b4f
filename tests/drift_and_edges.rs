//! Integration tests for drift detection and edge writes
//!
//! Covers the pending-pair lifecycle: cross-product drift after a run
//! completes, shrinkage as edges land, duplicate rejection, the delete/redo
//! path, fill-remaining semantics, and referential validation.

mod common;

use common::*;
use gradebook::store::SqliteStore;
use gradebook::types::*;
use gradebook::{DriftDetector, DriftScope, GradebookError, Identity, MetricsAggregator};
use std::sync::Arc;

fn draft(pair: &PendingPair, credit: f64) -> EdgeDraft {
    EdgeDraft {
        run_id: pair.run_id,
        issue_id: pair.issue_id.clone(),
        target: pair.target.clone(),
        credit,
        rationale: None,
    }
}

async fn pending(
    store: &Arc<SqliteStore>,
    scope: DriftScope,
) -> Vec<PendingPair> {
    DriftDetector::new(store.clone())
        .pending_for(&Identity::Operator, scope)
        .await
        .expect("Failed to compute drift")
}

#[tokio::test]
async fn test_completed_run_drifts_by_cross_product() {
    let (_tmp, store) = open_store().await;
    let slug = seed_snapshot(&store, "train/s1", Split::Train).await;

    // Nothing to grade before any run completes
    assert_eq!(pending_count(&store, &slug).await, 0);

    // Whole-snapshot scope: 2 issues x (2 TP occurrences + 1 FP occurrence)
    completed_run(&store, &slug, ReviewScope::WholeSnapshot, &["i1", "i2"]).await;
    assert_eq!(pending_count(&store, &slug).await, 6);
}

#[tokio::test]
async fn test_scope_limits_matchable_pairs() {
    let (_tmp, store) = open_store().await;
    let slug = seed_snapshot(&store, "train/s1", Split::Train).await;

    // a.py-only scope reaches tp-1 (2 occurrences) but not fp-1 (b.py)
    completed_run(&store, &slug, ReviewScope::files(["a.py"]), &["i1"]).await;
    assert_eq!(pending_count(&store, &slug).await, 2);
}

#[tokio::test]
async fn test_edges_shrink_drift_and_duplicates_are_rejected() {
    let (_tmp, store) = open_store().await;
    let slug = seed_snapshot(&store, "train/s1", Split::Train).await;
    completed_run(&store, &slug, ReviewScope::WholeSnapshot, &["i1"]).await;

    let pairs = pending(&store, DriftScope::Snapshot(slug.clone())).await;
    assert_eq!(pairs.len(), 3);

    store
        .put_edges(&Identity::Operator, &slug, vec![draft(&pairs[0], 1.0)])
        .await
        .expect("First edge should persist");
    assert_eq!(pending_count(&store, &slug).await, 2);

    // Same pair again: rejected, drift unchanged
    let err = store
        .put_edges(&Identity::Operator, &slug, vec![draft(&pairs[0], 0.5)])
        .await
        .unwrap_err();
    assert!(matches!(err, GradebookError::DuplicateEdge { .. }));
    assert_eq!(pending_count(&store, &slug).await, 2);
}

#[tokio::test]
async fn test_delete_edges_reopens_pairs_for_redo() {
    let (_tmp, store) = open_store().await;
    let slug = seed_snapshot(&store, "train/s1", Split::Train).await;
    let run_id = completed_run(&store, &slug, ReviewScope::WholeSnapshot, &["i1"]).await;

    let pairs = pending(&store, DriftScope::Snapshot(slug.clone())).await;
    let drafts: Vec<EdgeDraft> = pairs.iter().map(|p| draft(p, 0.0)).collect();
    store
        .put_edges(&Identity::Operator, &slug, drafts)
        .await
        .expect("Edges should persist");
    assert_eq!(pending_count(&store, &slug).await, 0);

    let removed = store
        .delete_edges(&Identity::Operator, &slug, run_id, &IssueId::new("i1"))
        .await
        .expect("Delete should succeed");
    assert_eq!(removed, 3);

    // The exact same pairs are pending again
    let reopened = pending(&store, DriftScope::Snapshot(slug.clone())).await;
    assert_eq!(reopened, pairs);
}

#[tokio::test]
async fn test_replace_edges_is_atomic_per_issue() {
    let (_tmp, store) = open_store().await;
    let slug = seed_snapshot(&store, "train/s1", Split::Train).await;
    let run_id = completed_run(&store, &slug, ReviewScope::WholeSnapshot, &["i1"]).await;

    let pairs = pending(&store, DriftScope::Snapshot(slug.clone())).await;
    store
        .put_edges(
            &Identity::Operator,
            &slug,
            pairs.iter().map(|p| draft(p, 0.0)).collect(),
        )
        .await
        .expect("Edges should persist");

    // Regrade i1 with different credit in one call
    store
        .replace_edges(
            &Identity::Operator,
            &slug,
            run_id,
            &IssueId::new("i1"),
            pairs.iter().map(|p| draft(p, 1.0)).collect(),
        )
        .await
        .expect("Replace should succeed");

    assert_eq!(pending_count(&store, &slug).await, 0);
    let edges = store
        .list_edges(&Identity::Operator, &slug, Some(run_id))
        .await
        .expect("List should succeed");
    assert_eq!(edges.len(), 3);
    assert!(edges.iter().all(|e| e.credit == 1.0));
}

#[tokio::test]
async fn test_fill_remaining_zeroes_pending_pairs() {
    let (_tmp, store) = open_store().await;
    let slug = seed_snapshot(&store, "train/s1", Split::Train).await;
    let run_id = completed_run(&store, &slug, ReviewScope::WholeSnapshot, &["i1"]).await;

    let pairs = pending(&store, DriftScope::Snapshot(slug.clone())).await;
    store
        .put_edges(&Identity::Operator, &slug, vec![draft(&pairs[0], 1.0)])
        .await
        .expect("Edge should persist");

    let filled = store
        .fill_remaining(
            &Identity::Operator,
            &slug,
            run_id,
            &IssueId::new("i1"),
            2,
            Some("no further matches".to_string()),
        )
        .await
        .expect("Fill should succeed");
    assert_eq!(filled, 2);
    assert_eq!(pending_count(&store, &slug).await, 0);

    // Filled edges carry zero credit; the graded one keeps its credit
    let edges = store
        .list_edges(&Identity::Operator, &slug, Some(run_id))
        .await
        .expect("List should succeed");
    let zeroes = edges.iter().filter(|e| e.credit == 0.0).count();
    assert_eq!(zeroes, 2);
}

#[tokio::test]
async fn test_fill_remaining_aborts_when_surface_changed() {
    let (_tmp, store) = open_store().await;
    let slug = seed_snapshot(&store, "train/s1", Split::Train).await;
    let run_id = completed_run(&store, &slug, ReviewScope::WholeSnapshot, &["i1"]).await;

    // Caller observed 3 pending pairs, but a concurrent grade lands first
    let pairs = pending(&store, DriftScope::Snapshot(slug.clone())).await;
    store
        .put_edges(&Identity::Operator, &slug, vec![draft(&pairs[0], 1.0)])
        .await
        .expect("Edge should persist");

    let err = store
        .fill_remaining(&Identity::Operator, &slug, run_id, &IssueId::new("i1"), 3, None)
        .await
        .unwrap_err();
    assert!(matches!(err, GradebookError::InvalidOperation(_)));
    // Nothing was zeroed
    assert_eq!(pending_count(&store, &slug).await, 2);
}

#[tokio::test]
async fn test_concurrent_fills_never_duplicate_edges() {
    let (_tmp, store) = open_store().await;
    let slug = seed_snapshot(&store, "train/s1", Split::Train).await;
    let run_id = completed_run(&store, &slug, ReviewScope::WholeSnapshot, &["i1"]).await;

    // Both callers observed 3 pending pairs; the fills race. The loser must
    // abort on its in-transaction recount, never double-insert.
    let a = {
        let store = store.clone();
        let slug = slug.clone();
        tokio::spawn(async move {
            store
                .fill_remaining(&Identity::Operator, &slug, run_id, &IssueId::new("i1"), 3, None)
                .await
        })
    };
    let b = {
        let store = store.clone();
        let slug = slug.clone();
        tokio::spawn(async move {
            store
                .fill_remaining(&Identity::Operator, &slug, run_id, &IssueId::new("i1"), 3, None)
                .await
        })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one fill should win: {results:?}");

    let edges = store
        .list_edges(&Identity::Operator, &slug, Some(run_id))
        .await
        .expect("List should succeed");
    assert_eq!(edges.len(), 3);
    assert_eq!(pending_count(&store, &slug).await, 0);
}

#[tokio::test]
async fn test_cross_snapshot_edges_are_rejected() {
    let (_tmp, store) = open_store().await;
    let slug_a = seed_snapshot(&store, "train/a", Split::Train).await;
    let slug_b = seed_snapshot(&store, "train/b", Split::Train).await;
    completed_run(&store, &slug_a, ReviewScope::WholeSnapshot, &["i1"]).await;
    let run_b = completed_run(&store, &slug_b, ReviewScope::WholeSnapshot, &["i1"]).await;

    // Issue from run_b (snapshot b) against an occurrence written via
    // snapshot a's grading surface
    let bad = EdgeDraft {
        run_id: run_b,
        issue_id: IssueId::new("i1"),
        target: EdgeTarget::TruePositive {
            finding_id: FindingId::new("tp-1"),
            occurrence_id: OccurrenceId::new("occ-0"),
        },
        credit: 1.0,
        rationale: None,
    };
    let err = store
        .put_edges(&Identity::Operator, &slug_a, vec![bad])
        .await
        .unwrap_err();
    assert!(matches!(err, GradebookError::CrossSnapshotEdge { .. }));
}

#[tokio::test]
async fn test_credit_out_of_range_is_rejected() {
    let (_tmp, store) = open_store().await;
    let slug = seed_snapshot(&store, "train/s1", Split::Train).await;
    completed_run(&store, &slug, ReviewScope::WholeSnapshot, &["i1"]).await;
    let pairs = pending(&store, DriftScope::Snapshot(slug.clone())).await;

    for credit in [-0.1, 1.1, f64::NAN] {
        let err = store
            .put_edges(&Identity::Operator, &slug, vec![draft(&pairs[0], credit)])
            .await
            .unwrap_err();
        assert!(matches!(err, GradebookError::InvalidCredit(_)));
    }
}

#[tokio::test]
async fn test_edges_require_matchable_targets() {
    let (_tmp, store) = open_store().await;
    let slug = seed_snapshot(&store, "train/s1", Split::Train).await;
    let run_id = completed_run(&store, &slug, ReviewScope::files(["a.py"]), &["i1"]).await;

    // fp-1 is only catchable from b.py; an edge into it from an a.py-scoped
    // run would earn credit the run's denominator never counts
    let bad = EdgeDraft {
        run_id,
        issue_id: IssueId::new("i1"),
        target: EdgeTarget::FalsePositive {
            finding_id: FindingId::new("fp-1"),
            occurrence_id: OccurrenceId::new("occ-0"),
        },
        credit: 0.0,
        rationale: None,
    };
    let err = store
        .put_edges(&Identity::Operator, &slug, vec![bad])
        .await
        .unwrap_err();
    assert!(matches!(err, GradebookError::UnmatchableEdge { .. }));

    // Grading every matchable pair yields a fully graded run whose recall
    // stays within [0, 1]
    let pairs = pending(&store, DriftScope::Snapshot(slug.clone())).await;
    assert_eq!(pairs.len(), 2);
    store
        .put_edges(
            &Identity::Operator,
            &slug,
            pairs.iter().map(|p| draft(p, 1.0)).collect(),
        )
        .await
        .expect("Edges should persist");
    let metrics = MetricsAggregator::new(store.clone())
        .run_metrics(&Identity::Operator, run_id)
        .await
        .expect("Metrics should compute");
    assert!(metrics.recall.grading_complete);
    assert_eq!(metrics.recall.recall(), Some(1.0));
}

#[tokio::test]
async fn test_per_occurrence_credit_cannot_exceed_one() {
    let (_tmp, store) = open_store().await;
    let slug = seed_snapshot(&store, "train/s1", Split::Train).await;
    let run_id = completed_run(&store, &slug, ReviewScope::WholeSnapshot, &["i1", "i2"]).await;

    let target = EdgeTarget::TruePositive {
        finding_id: FindingId::new("tp-1"),
        occurrence_id: OccurrenceId::new("occ-0"),
    };
    let edge = |issue: &str, credit: f64| EdgeDraft {
        run_id,
        issue_id: IssueId::new(issue),
        target: target.clone(),
        credit,
        rationale: None,
    };

    store
        .put_edges(&Identity::Operator, &slug, vec![edge("i1", 0.6)])
        .await
        .expect("First split should persist");

    // A second issue pushing the occurrence total past 1.0 is rejected
    let err = store
        .put_edges(&Identity::Operator, &slug, vec![edge("i2", 0.5)])
        .await
        .unwrap_err();
    assert!(matches!(err, GradebookError::CreditOverflow { .. }));

    // A total of exactly 1.0 is allowed
    store
        .put_edges(&Identity::Operator, &slug, vec![edge("i2", 0.4)])
        .await
        .expect("Boundary split should persist");
}

#[tokio::test]
async fn test_delete_then_fill_reproduces_complete_zero_credit_state() {
    let (_tmp, store) = open_store().await;
    let slug = seed_snapshot(&store, "train/s1", Split::Train).await;
    let run_id = completed_run(&store, &slug, ReviewScope::WholeSnapshot, &["i1"]).await;

    let pairs = pending(&store, DriftScope::Snapshot(slug.clone())).await;
    store
        .put_edges(
            &Identity::Operator,
            &slug,
            pairs.iter().map(|p| draft(p, 1.0)).collect(),
        )
        .await
        .expect("Edges should persist");
    assert_eq!(pending_count(&store, &slug).await, 0);

    // Redo: drop the issue's grades, then declare no matches remain
    let removed = store
        .delete_edges(&Identity::Operator, &slug, run_id, &IssueId::new("i1"))
        .await
        .expect("Delete should succeed");
    assert_eq!(removed, 3);
    let filled = store
        .fill_remaining(&Identity::Operator, &slug, run_id, &IssueId::new("i1"), 3, None)
        .await
        .expect("Fill should succeed");
    assert_eq!(filled, 3);

    // Same fully graded surface as before, now with zero credit everywhere
    assert_eq!(pending_count(&store, &slug).await, 0);
    let edges = store
        .list_edges(&Identity::Operator, &slug, Some(run_id))
        .await
        .expect("List should succeed");
    assert_eq!(edges.len(), 3);
    assert!(edges.iter().all(|e| e.credit == 0.0));
    let metrics = MetricsAggregator::new(store.clone())
        .run_metrics(&Identity::Operator, run_id)
        .await
        .expect("Metrics should compute");
    assert!(metrics.recall.grading_complete);
    assert_eq!(metrics.recall.credit_earned, 0.0);
    assert_eq!(metrics.recall.recall(), Some(0.0));
}

#[tokio::test]
async fn test_unknown_occurrence_is_rejected() {
    let (_tmp, store) = open_store().await;
    let slug = seed_snapshot(&store, "train/s1", Split::Train).await;
    let run_id = completed_run(&store, &slug, ReviewScope::WholeSnapshot, &["i1"]).await;

    let bad = EdgeDraft {
        run_id,
        issue_id: IssueId::new("i1"),
        target: EdgeTarget::TruePositive {
            finding_id: FindingId::new("tp-1"),
            occurrence_id: OccurrenceId::new("occ-99"),
        },
        credit: 1.0,
        rationale: None,
    };
    let err = store
        .put_edges(&Identity::Operator, &slug, vec![bad])
        .await
        .unwrap_err();
    assert!(matches!(err, GradebookError::OccurrenceNotFound { .. }));
}

#[tokio::test]
async fn test_deleting_a_finding_removes_its_pairs_and_edges() {
    let (_tmp, store) = open_store().await;
    let slug = seed_snapshot(&store, "train/s1", Split::Train).await;
    let run_id = completed_run(&store, &slug, ReviewScope::WholeSnapshot, &["i1"]).await;

    let pairs = pending(&store, DriftScope::Snapshot(slug.clone())).await;
    store
        .put_edges(
            &Identity::Operator,
            &slug,
            pairs.iter().map(|p| draft(p, 1.0)).collect(),
        )
        .await
        .expect("Edges should persist");
    assert_eq!(pending_count(&store, &slug).await, 0);

    // Remove tp-1: its edges go with it, fp-1's edge stays, drift stays zero
    store
        .delete_finding(&Identity::Operator, &slug, &FindingId::new("tp-1"))
        .await
        .expect("Delete should succeed");
    assert_eq!(pending_count(&store, &slug).await, 0);
    let edges = store
        .list_edges(&Identity::Operator, &slug, Some(run_id))
        .await
        .expect("List should succeed");
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].target.finding_id().0, "fp-1");
}

#[tokio::test]
async fn test_issue_scoped_drift() {
    let (_tmp, store) = open_store().await;
    let slug = seed_snapshot(&store, "train/s1", Split::Train).await;
    let run_id = completed_run(&store, &slug, ReviewScope::WholeSnapshot, &["i1", "i2"]).await;

    let only_i2 = pending(
        &store,
        DriftScope::Issue {
            run_id,
            issue_id: IssueId::new("i2"),
        },
    )
    .await;
    assert_eq!(only_i2.len(), 3);
    assert!(only_i2.iter().all(|p| p.issue_id.0 == "i2"));
}

#[tokio::test]
async fn test_non_completed_runs_are_not_gradeable() {
    let (_tmp, store) = open_store().await;
    let slug = seed_snapshot(&store, "train/s1", Split::Train).await;

    let run_id = CriticRunId::new();
    store
        .create_critic_run(
            &Identity::Operator,
            CriticRun {
                id: run_id,
                snapshot: slug.clone(),
                definition: "critic-v1".to_string(),
                status: CriticRunStatus::InProgress,
                scope: ReviewScope::WholeSnapshot,
                created_at: chrono::Utc::now(),
            },
        )
        .await
        .expect("Create should succeed");
    assert_eq!(pending_count(&store, &slug).await, 0);

    // A failed run finalizes with no issues and produces no drift
    store
        .complete_critic_run(&Identity::Operator, run_id, CriticRunStatus::Failed, vec![])
        .await
        .expect("Finalize should succeed");
    assert_eq!(pending_count(&store, &slug).await, 0);
}

#[tokio::test]
async fn test_critiques_are_immutable_once_finalized() {
    let (_tmp, store) = open_store().await;
    let slug = seed_snapshot(&store, "train/s1", Split::Train).await;
    let run_id = completed_run(&store, &slug, ReviewScope::WholeSnapshot, &["i1"]).await;

    let err = store
        .complete_critic_run(
            &Identity::Operator,
            run_id,
            CriticRunStatus::Completed,
            vec![issue(run_id, "i2", "a.py")],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GradebookError::InvalidOperation(_)));
}
