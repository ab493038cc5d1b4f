//! Error types for the gradebook grading engine
//!
//! This module provides structured error definitions using thiserror. Note
//! that grading-process resource exhaustion is deliberately NOT an error:
//! it is a normal outcome (`GradingOutcome::ResourceExhausted`) that moves
//! the reconciler into its restarting state.

use crate::types::{CriticRunId, FindingId, IssueId, OccurrenceId, SnapshotSlug};
use thiserror::Error;

/// Main error type for gradebook operations
#[derive(Error, Debug)]
pub enum GradebookError {
    /// An edge references occurrences or runs from different snapshots
    #[error("cross-snapshot edge: issue from snapshot '{issue_snapshot}' cannot link to occurrence in snapshot '{occurrence_snapshot}'")]
    CrossSnapshotEdge {
        issue_snapshot: SnapshotSlug,
        occurrence_snapshot: SnapshotSlug,
    },

    /// An edge already exists for this (issue, occurrence) pair
    #[error("duplicate edge for issue '{issue_id}' and occurrence '{finding_id}/{occurrence_id}'; delete existing edges to redo")]
    DuplicateEdge {
        issue_id: IssueId,
        finding_id: FindingId,
        occurrence_id: OccurrenceId,
    },

    /// Identity is not permitted to perform this read or write
    #[error("access denied for {identity}: {operation}")]
    AccessDenied { identity: String, operation: String },

    /// A finding was authored with an empty catchability rule
    #[error("finding '{finding_id}' has an empty catchability rule and can never be matched")]
    MatchabilityMisconfigured { finding_id: FindingId },

    /// Snapshot not found
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(SnapshotSlug),

    /// Critic run not found
    #[error("critic run not found: {0}")]
    RunNotFound(CriticRunId),

    /// Reported issue not found
    #[error("reported issue not found: {run_id}/{issue_id}")]
    IssueNotFound {
        run_id: CriticRunId,
        issue_id: IssueId,
    },

    /// Ground-truth occurrence not found
    #[error("ground-truth occurrence not found: {finding_id}/{occurrence_id}")]
    OccurrenceNotFound {
        finding_id: FindingId,
        occurrence_id: OccurrenceId,
    },

    /// An edge targets an occurrence the run's scope can never match
    #[error("occurrence '{finding_id}/{occurrence_id}' is not matchable for the scope of run {run_id}")]
    UnmatchableEdge {
        run_id: CriticRunId,
        finding_id: FindingId,
        occurrence_id: OccurrenceId,
    },

    /// Credit outside the valid [0, 1] range
    #[error("invalid credit {0}: must be within [0.0, 1.0]")]
    InvalidCredit(f64),

    /// Total credit for one (run, occurrence) pair would exceed 1.0
    #[error("credit for occurrence '{finding_id}/{occurrence_id}' of run {run_id} would total {total}; at most 1.0 may be spread across a run's issues")]
    CreditOverflow {
        run_id: CriticRunId,
        finding_id: FindingId,
        occurrence_id: OccurrenceId,
        total: f64,
    },

    /// Invalid operation (e.g., completing an already-completed run)
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A reconciliation episode exceeded its restart ceiling
    #[error("reconciler for snapshot '{snapshot}' exhausted {restarts} grading-process restarts; operator intervention required")]
    RestartsExhausted {
        snapshot: SnapshotSlug,
        restarts: u32,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for gradebook operations
pub type Result<T> = std::result::Result<T, GradebookError>;

impl From<rusqlite::Error> for GradebookError {
    fn from(err: rusqlite::Error) -> Self {
        GradebookError::Database(err.to_string())
    }
}
