//! Core data types for the grading reconciliation engine
//!
//! This module defines the fundamental data structures used throughout
//! gradebook: snapshots, ground-truth findings with their occurrences and
//! catchability rules, critic runs with reported issues, and the grading
//! edges that connect the two sides of the bipartite matching problem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Identifier for an immutable source snapshot (e.g. "train/payments-v3")
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotSlug(pub String);

impl SnapshotSlug {
    pub fn new(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SnapshotSlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a critic run
///
/// Wraps a UUID to prevent mixing critic-run ids with other identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CriticRunId(pub Uuid);

impl CriticRunId {
    /// Create a new random run ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a run ID from a string
    pub fn from_string(s: &str) -> std::result::Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for CriticRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CriticRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a ground-truth finding, unique within its snapshot
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FindingId(pub String);

impl FindingId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for FindingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for an occurrence, unique within its finding or issue
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OccurrenceId(pub String);

impl OccurrenceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for OccurrenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a reported issue, unique within its critic run
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueId(pub String);

impl IssueId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for IssueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Evaluation split a snapshot belongs to
///
/// Optimization agents may only read full detail for Train; Valid and Test
/// expose aggregated metrics only (enforced by [`crate::access::Identity`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "train" => Some(Split::Train),
            "valid" => Some(Split::Valid),
            "test" => Some(Split::Test),
            _ => None,
        }
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable pinned source state under evaluation
///
/// Snapshots are created at ingestion and never mutated; an edit to the
/// underlying source requires a new snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub slug: SnapshotSlug,
    pub split: Split,
    /// Human-readable note about what this snapshot pins
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A 1-based inclusive line range within a file, with an optional per-range note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start_line: u32,
    /// Inclusive end line; `None` for a single-line anchor
    pub end_line: Option<u32>,
    /// Why this specific range matters (e.g. definition site vs call site)
    #[serde(default)]
    pub note: Option<String>,
}

impl LineRange {
    pub fn new(start_line: u32, end_line: Option<u32>) -> Self {
        Self {
            start_line,
            end_line,
            note: None,
        }
    }

    /// Validate line-number invariants
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.start_line < 1 {
            return Err("start_line must be >= 1".to_string());
        }
        if let Some(end) = self.end_line {
            if end < self.start_line {
                return Err(format!(
                    "end_line {} must be >= start_line {}",
                    end, self.start_line
                ));
            }
        }
        Ok(())
    }

    /// Format as "123" or "123-145"
    pub fn format(&self) -> String {
        match self.end_line {
            Some(end) => format!("{}-{}", self.start_line, end),
            None => self.start_line.to_string(),
        }
    }
}

/// One file referenced by an occurrence, with optional line ranges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAnchor {
    pub path: PathBuf,
    /// Line ranges, or `None` for an unspecified anchor within the file
    pub ranges: Option<Vec<LineRange>>,
}

impl FileAnchor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ranges: None,
        }
    }

    pub fn with_ranges(path: impl Into<PathBuf>, ranges: Vec<LineRange>) -> Self {
        Self {
            path: path.into(),
            ranges: Some(ranges),
        }
    }
}

/// One code-location instance of a finding or reported issue
///
/// An occurrence may span multiple files (e.g. a caller/callee pair) but
/// represents a single logical location instance. Findings and issues share
/// this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub occurrence_id: OccurrenceId,
    pub files: Vec<FileAnchor>,
    /// Occurrence-specific note; issue-level rationale lives on the parent
    #[serde(default)]
    pub note: Option<String>,
}

impl Occurrence {
    pub fn new(occurrence_id: impl Into<String>, files: Vec<FileAnchor>) -> Self {
        Self {
            occurrence_id: OccurrenceId::new(occurrence_id),
            files,
            note: None,
        }
    }

    /// The set of file paths this occurrence touches
    pub fn file_set(&self) -> BTreeSet<PathBuf> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.files.is_empty() {
            return Err(format!(
                "occurrence '{}' must reference at least one file",
                self.occurrence_id
            ));
        }
        for anchor in &self.files {
            for range in anchor.ranges.iter().flatten() {
                range.validate()?;
            }
        }
        Ok(())
    }
}

/// Disjunction of file-set conjunctions: "caught if all files in set A are
/// reviewed, OR all files in set B are reviewed"
///
/// The outer vector is the OR, each inner set the AND. An empty outer
/// vector is an authoring error rejected at ingestion
/// ([`crate::error::GradebookError::MatchabilityMisconfigured`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatchabilityRule(pub Vec<BTreeSet<PathBuf>>);

impl CatchabilityRule {
    /// A rule with a single conjunction
    pub fn single(files: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self(vec![files.into_iter().map(Into::into).collect()])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn disjuncts(&self) -> &[BTreeSet<PathBuf>] {
        &self.0
    }
}

/// Whether a finding is a hand-labeled true positive or a known false positive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    TruePositive,
    FalsePositive,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingKind::TruePositive => "true_positive",
            FindingKind::FalsePositive => "false_positive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "true_positive" => Some(FindingKind::TruePositive),
            "false_positive" => Some(FindingKind::FalsePositive),
            _ => None,
        }
    }
}

/// Hand-authored ground-truth finding against a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthFinding {
    pub id: FindingId,
    pub kind: FindingKind,
    /// Global explanation and acceptance criteria for the finding
    pub rationale: String,
    pub occurrences: Vec<Occurrence>,
    /// File sets from which a competent review could plausibly detect this
    pub catchability: CatchabilityRule,
    /// If set, a critic run only matches this finding when its file scope
    /// intersects this set. `None` means cross-cutting: matchable from any
    /// scope that satisfies catchability. `Some(∅)` is invalid.
    pub match_only_if_reported_on: Option<BTreeSet<PathBuf>>,
}

impl GroundTruthFinding {
    /// Validate authoring invariants checked at ingestion
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.occurrences.is_empty() {
            return Err(format!(
                "finding '{}' must have at least one occurrence",
                self.id
            ));
        }
        for occ in &self.occurrences {
            occ.validate()?;
        }
        if let Some(set) = &self.match_only_if_reported_on {
            if set.is_empty() {
                return Err(format!(
                    "finding '{}': match_only_if_reported_on must be None or non-empty",
                    self.id
                ));
            }
        }
        for disjunct in self.catchability.disjuncts() {
            if disjunct.is_empty() {
                return Err(format!(
                    "finding '{}': catchability disjuncts must be non-empty file sets",
                    self.id
                ));
            }
        }
        Ok(())
    }
}

/// File scope a critic run was asked to review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ReviewScope {
    /// The critic saw the entire snapshot
    WholeSnapshot,
    /// The critic saw an explicit file subset
    Files { files: BTreeSet<PathBuf> },
}

impl ReviewScope {
    pub fn files(files: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        ReviewScope::Files {
            files: files.into_iter().map(Into::into).collect(),
        }
    }

    /// True if every file in `required` was reviewed
    pub fn covers(&self, required: &BTreeSet<PathBuf>) -> bool {
        match self {
            ReviewScope::WholeSnapshot => true,
            ReviewScope::Files { files } => required.iter().all(|f| files.contains(f)),
        }
    }

    /// True if at least one file in `candidates` was reviewed
    pub fn touches(&self, candidates: &BTreeSet<PathBuf>) -> bool {
        match self {
            ReviewScope::WholeSnapshot => true,
            ReviewScope::Files { files } => candidates.iter().any(|f| files.contains(f)),
        }
    }

    /// True if the given single path was reviewed
    pub fn contains(&self, path: &Path) -> bool {
        match self {
            ReviewScope::WholeSnapshot => true,
            ReviewScope::Files { files } => files.contains(path),
        }
    }
}

/// Terminal and non-terminal states of a critic run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticRunStatus {
    InProgress,
    Completed,
    Failed,
    ContextExceeded,
}

impl CriticRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CriticRunStatus::InProgress => "in_progress",
            CriticRunStatus::Completed => "completed",
            CriticRunStatus::Failed => "failed",
            CriticRunStatus::ContextExceeded => "context_exceeded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(CriticRunStatus::InProgress),
            "completed" => Some(CriticRunStatus::Completed),
            "failed" => Some(CriticRunStatus::Failed),
            "context_exceeded" => Some(CriticRunStatus::ContextExceeded),
            _ => None,
        }
    }

    /// Whether the run can still transition to another status
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CriticRunStatus::InProgress)
    }
}

/// One execution of a critic agent against a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticRun {
    pub id: CriticRunId,
    pub snapshot: SnapshotSlug,
    /// Critic definition identifier (agent name/version)
    pub definition: String,
    pub status: CriticRunStatus,
    pub scope: ReviewScope,
    pub created_at: DateTime<Utc>,
}

/// An issue a critic reported, immutable once the run completes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportedIssue {
    pub run_id: CriticRunId,
    pub issue_id: IssueId,
    pub rationale: String,
    pub occurrences: Vec<Occurrence>,
}

impl ReportedIssue {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.occurrences.is_empty() {
            return Err(format!(
                "issue '{}' must have at least one occurrence",
                self.issue_id
            ));
        }
        for occ in &self.occurrences {
            occ.validate()?;
        }
        Ok(())
    }
}

/// The ground-truth side of a grading edge: exactly one TP or FP occurrence
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EdgeTarget {
    TruePositive {
        finding_id: FindingId,
        occurrence_id: OccurrenceId,
    },
    FalsePositive {
        finding_id: FindingId,
        occurrence_id: OccurrenceId,
    },
}

impl EdgeTarget {
    pub fn new(kind: FindingKind, finding_id: FindingId, occurrence_id: OccurrenceId) -> Self {
        match kind {
            FindingKind::TruePositive => EdgeTarget::TruePositive {
                finding_id,
                occurrence_id,
            },
            FindingKind::FalsePositive => EdgeTarget::FalsePositive {
                finding_id,
                occurrence_id,
            },
        }
    }

    pub fn kind(&self) -> FindingKind {
        match self {
            EdgeTarget::TruePositive { .. } => FindingKind::TruePositive,
            EdgeTarget::FalsePositive { .. } => FindingKind::FalsePositive,
        }
    }

    pub fn finding_id(&self) -> &FindingId {
        match self {
            EdgeTarget::TruePositive { finding_id, .. } => finding_id,
            EdgeTarget::FalsePositive { finding_id, .. } => finding_id,
        }
    }

    pub fn occurrence_id(&self) -> &OccurrenceId {
        match self {
            EdgeTarget::TruePositive { occurrence_id, .. } => occurrence_id,
            EdgeTarget::FalsePositive { occurrence_id, .. } => occurrence_id,
        }
    }
}

/// Credit-weighted link between a reported issue and a ground-truth occurrence
///
/// The unit of grading work. For a completely graded critic run, every
/// matchable (issue, occurrence) pair has exactly one edge; absence of an
/// edge always means "not yet graded", never "graded as zero".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingEdge {
    pub run_id: CriticRunId,
    pub issue_id: IssueId,
    pub snapshot: SnapshotSlug,
    pub target: EdgeTarget,
    /// Match credit in [0, 1]; 0.0 means "reviewed, no match"
    pub credit: f64,
    pub rationale: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Edge a grading process wants to persist (not yet committed)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDraft {
    pub run_id: CriticRunId,
    pub issue_id: IssueId,
    pub target: EdgeTarget,
    pub credit: f64,
    pub rationale: Option<String>,
}

impl EdgeDraft {
    /// Credit-0 draft for a pending pair (used by fill-remaining)
    pub fn zero(pair: &PendingPair, rationale: Option<String>) -> Self {
        Self {
            run_id: pair.run_id,
            issue_id: pair.issue_id.clone(),
            target: pair.target.clone(),
            credit: 0.0,
            rationale,
        }
    }
}

/// A matchable (issue, occurrence) pair with no grading edge yet
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PendingPair {
    pub run_id: CriticRunId,
    pub issue_id: IssueId,
    pub target: EdgeTarget,
}
