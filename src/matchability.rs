//! Matchability resolution
//!
//! Pure evaluation of whether a ground-truth finding is eligible to receive
//! grading edges for a given critic run scope. Matchability is a function of
//! the finding's catchability rule and the run's reviewed file set only. It
//! never consults edge state and is re-evaluated on every drift computation
//! rather than cached.

use crate::types::{
    CatchabilityRule, FindingId, FindingKind, GroundTruthFinding, OccurrenceId, ReviewScope,
};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Whether `finding` can be matched by a critic run with the given scope
///
/// Two conditions, both required:
/// 1. at least one catchability disjunct is fully contained in the reviewed
///    file set, and
/// 2. if the finding is restricted to being matched only when reported on,
///    the scope intersects that file set.
///
/// A finding with an empty catchability rule is never matchable; ingestion
/// rejects such findings, so hitting one here indicates corrupt state and is
/// answered with `false` rather than a panic.
pub fn is_matchable(finding: &GroundTruthFinding, scope: &ReviewScope) -> bool {
    rule_is_matchable(
        &finding.catchability,
        finding.match_only_if_reported_on.as_ref(),
        scope,
    )
}

/// Matchability for a catchability rule and report-on set taken on their own
///
/// Used where the full finding is not in hand (e.g. validating an edge
/// target straight from its stored columns).
pub fn rule_is_matchable(
    catchability: &CatchabilityRule,
    match_only_if_reported_on: Option<&BTreeSet<PathBuf>>,
    scope: &ReviewScope,
) -> bool {
    let catchable = catchability
        .disjuncts()
        .iter()
        .any(|conjunct| scope.covers(conjunct));
    if !catchable {
        return false;
    }
    match match_only_if_reported_on {
        None => true,
        Some(files) => scope.touches(files),
    }
}

/// All matchable ground-truth occurrences for a scope
///
/// Every occurrence of a matchable finding is matchable; the rule lives at
/// the finding level.
pub fn matchable_occurrences<'a>(
    findings: &'a [GroundTruthFinding],
    scope: &ReviewScope,
) -> Vec<(FindingKind, &'a FindingId, &'a OccurrenceId)> {
    findings
        .iter()
        .filter(|f| is_matchable(f, scope))
        .flat_map(|f| {
            f.occurrences
                .iter()
                .map(move |occ| (f.kind, &f.id, &occ.occurrence_id))
        })
        .collect()
}
