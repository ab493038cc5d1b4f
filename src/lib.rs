//! Gradebook: a grading reconciliation engine for code-review critics
//!
//! Gradebook evaluates automated code-review agents ("critics") against
//! hand-authored ground truth. Each critic run reports issues against an
//! immutable source snapshot; human-or-agent graders connect those issues
//! to ground-truth occurrences with credit-weighted edges; recall and
//! precision fall out of the edges.
//!
//! The engine is built around three ideas:
//!
//! - **Drift, not queues.** The set of ungraded work is recomputed on
//!   demand from base records (findings, critiques, edges). Any write that
//!   changes the answer is picked up on the next computation; nothing can
//!   go stale.
//! - **Absence means ungraded.** A matchable pair without an edge is
//!   pending; a zero-credit edge records "reviewed, no match". Metrics
//!   carry a completeness flag instead of blocking on grading.
//! - **Access control at the data boundary.** Critics never see ground
//!   truth, graders see one snapshot, optimizers see full detail only for
//!   the training split. Enforced per query, not by caller discipline.
//!
//! # Example
//!
//! ```no_run
//! use gradebook::access::Identity;
//! use gradebook::drift::{DriftDetector, DriftScope};
//! use gradebook::store::SqliteStore;
//! use gradebook::types::SnapshotSlug;
//! use std::sync::Arc;
//!
//! # async fn example() -> gradebook::error::Result<()> {
//! let store = Arc::new(SqliteStore::open("gradebook.db").await?);
//! let detector = DriftDetector::new(store.clone());
//! let pending = detector
//!     .pending_for(
//!         &Identity::Operator,
//!         DriftScope::Snapshot(SnapshotSlug::new("train/payments-v3")),
//!     )
//!     .await?;
//! println!("{} pairs await grading", pending.len());
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod config;
pub mod drift;
pub mod error;
pub mod matchability;
pub mod metrics;
pub mod reconciler;
pub mod store;
pub mod types;

pub use access::Identity;
pub use config::{EngineConfig, ReconcilerConfig};
pub use drift::{DriftDetector, DriftScope};
pub use error::{GradebookError, Result};
pub use matchability::{is_matchable, matchable_occurrences, rule_is_matchable};
pub use metrics::{MetricsAggregator, PrecisionReport, RecallReport, RunMetrics};
pub use reconciler::process::{GradingOutcome, GradingProcess, GradingProcessFactory};
pub use reconciler::{ChangeKind, ReconcilerRegistry, ReconcilerState};
pub use store::SqliteStore;
pub use types::{
    CatchabilityRule, CriticRun, CriticRunId, CriticRunStatus, EdgeDraft, EdgeTarget, FileAnchor,
    FindingId, FindingKind, GradingEdge, GroundTruthFinding, IssueId, LineRange, Occurrence,
    OccurrenceId, PendingPair, ReportedIssue, ReviewScope, Snapshot, SnapshotSlug, Split,
};
