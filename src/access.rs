//! Identity-based access control
//!
//! Every store and metrics method takes an [`Identity`] and enforces
//! visibility at the data-access boundary itself, not by caller convention:
//! grading and optimization agents run semi-autonomously and cannot be
//! trusted to self-restrict.
//!
//! Rules:
//! - **Critic**: never reads ground truth or grading edges, for any
//!   snapshot. May read and submit only its own run.
//! - **Grader**: reads ground truth, critiques, and edges only for the one
//!   snapshot it is grading; writes edges only there.
//! - **Optimizer**: full detail (ground truth, edges, critic runs) only for
//!   Train-split snapshots. Valid/Test expose aggregated metrics only,
//!   never rationale or occurrence text, so an optimization loop cannot
//!   overfit to held-out labels.
//! - **Operator**: unrestricted; this is the ingestion and dashboard path.
//!
//! Snapshot metadata (slug, split) is not sensitive and is readable by all
//! identities.

use crate::error::{GradebookError, Result};
use crate::types::{CriticRunId, SnapshotSlug, Split};
use serde::{Deserialize, Serialize};

/// Who is asking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "role")]
pub enum Identity {
    /// Trusted operator / ingestion pipeline
    Operator,
    /// A critic agent run; sees only its own submissions
    Critic { run_id: CriticRunId },
    /// A grader agent bound to a single snapshot
    Grader { snapshot: SnapshotSlug },
    /// A prompt-optimization agent; train-split detail only
    Optimizer,
}

impl Identity {
    fn denied(&self, operation: impl Into<String>) -> GradebookError {
        GradebookError::AccessDenied {
            identity: self.to_string(),
            operation: operation.into(),
        }
    }

    /// Ground-truth detail reads (findings, occurrences, rationale)
    pub(crate) fn check_ground_truth_read(
        &self,
        snapshot: &SnapshotSlug,
        split: Split,
    ) -> Result<()> {
        match self {
            Identity::Operator => Ok(()),
            Identity::Critic { .. } => {
                Err(self.denied(format!("read ground truth for snapshot '{snapshot}'")))
            }
            Identity::Grader { snapshot: own } if own == snapshot => Ok(()),
            Identity::Grader { .. } => {
                Err(self.denied(format!("read ground truth outside assigned snapshot ('{snapshot}')")))
            }
            Identity::Optimizer if split == Split::Train => Ok(()),
            Identity::Optimizer => Err(self.denied(format!(
                "read ground truth for {split}-split snapshot '{snapshot}'"
            ))),
        }
    }

    /// Grading-edge reads (same visibility as ground truth: edges name
    /// ground-truth occurrence ids)
    pub(crate) fn check_edge_read(&self, snapshot: &SnapshotSlug, split: Split) -> Result<()> {
        match self {
            Identity::Critic { .. } => {
                Err(self.denied(format!("read grading edges for snapshot '{snapshot}'")))
            }
            _ => self.check_ground_truth_read(snapshot, split),
        }
    }

    /// Grading-edge mutations
    pub(crate) fn check_edge_write(&self, snapshot: &SnapshotSlug) -> Result<()> {
        match self {
            Identity::Operator => Ok(()),
            Identity::Grader { snapshot: own } if own == snapshot => Ok(()),
            _ => Err(self.denied(format!("write grading edges for snapshot '{snapshot}'"))),
        }
    }

    /// Critique detail reads (issues, occurrences, rationale)
    pub(crate) fn check_critique_read(
        &self,
        snapshot: &SnapshotSlug,
        split: Split,
        run_id: Option<CriticRunId>,
    ) -> Result<()> {
        match self {
            Identity::Operator => Ok(()),
            Identity::Critic { run_id: own } => match run_id {
                Some(id) if id == *own => Ok(()),
                _ => Err(self.denied("read critiques beyond own run".to_string())),
            },
            Identity::Grader { snapshot: own } if own == snapshot => Ok(()),
            Identity::Grader { .. } => {
                Err(self.denied(format!("read critiques outside assigned snapshot ('{snapshot}')")))
            }
            Identity::Optimizer if split == Split::Train => Ok(()),
            Identity::Optimizer => Err(self.denied(format!(
                "read critique detail for {split}-split snapshot '{snapshot}'"
            ))),
        }
    }

    /// Ground-truth and snapshot ingestion (create/delete)
    pub(crate) fn check_ingest(&self) -> Result<()> {
        match self {
            Identity::Operator => Ok(()),
            _ => Err(self.denied("ingest snapshots or ground truth".to_string())),
        }
    }

    /// Completing a critic run with its reported issues
    pub(crate) fn check_submit_critique(&self, run_id: CriticRunId) -> Result<()> {
        match self {
            Identity::Operator => Ok(()),
            Identity::Critic { run_id: own } if *own == run_id => Ok(()),
            _ => Err(self.denied(format!("submit critique for run {run_id}"))),
        }
    }

    /// Aggregated metrics views (recall/precision rollups)
    ///
    /// Allowed for any split: the whole point of the asymmetry is that
    /// held-out splits are visible only through this surface.
    pub(crate) fn check_metrics_read(&self, _split: Split) -> Result<()> {
        match self {
            Identity::Operator | Identity::Optimizer => Ok(()),
            Identity::Grader { .. } | Identity::Critic { .. } => {
                Err(self.denied("read evaluation metrics".to_string()))
            }
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identity::Operator => write!(f, "operator"),
            Identity::Critic { run_id } => write!(f, "critic:{run_id}"),
            Identity::Grader { snapshot } => write!(f, "grader:{snapshot}"),
            Identity::Optimizer => write!(f, "optimizer"),
        }
    }
}
