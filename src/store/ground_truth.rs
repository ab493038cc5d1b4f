//! Snapshot and ground-truth persistence
//!
//! Snapshots are immutable once ingested. Findings may be added or deleted
//! by the operator at any time; drift detection picks the change up on the
//! next computation, so a deletion never requires re-grading unrelated
//! pairs.

use crate::access::Identity;
use crate::error::{GradebookError, Result};
use crate::types::{
    CatchabilityRule, FileAnchor, FindingId, FindingKind, GroundTruthFinding, Occurrence,
    Snapshot, SnapshotSlug, Split,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{debug, info};

use super::{decode_ts, encode_ts, SqliteStore};

impl SqliteStore {
    /// Register a new snapshot. Operator only; slugs are never reused.
    pub async fn insert_snapshot(&self, identity: &Identity, snapshot: Snapshot) -> Result<()> {
        identity.check_ingest()?;
        self.with_conn(move |conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT slug FROM snapshots WHERE slug = ?1",
                    params![snapshot.slug.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Err(GradebookError::InvalidOperation(format!(
                    "snapshot '{}' already exists; snapshots are immutable",
                    snapshot.slug
                )));
            }
            conn.execute(
                "INSERT INTO snapshots (slug, split, description, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    snapshot.slug.as_str(),
                    snapshot.split.as_str(),
                    snapshot.description,
                    encode_ts(snapshot.created_at),
                ],
            )?;
            info!("Registered snapshot '{}' ({})", snapshot.slug, snapshot.split);
            Ok(())
        })
        .await
    }

    /// Snapshot metadata by slug. Readable by every identity.
    pub async fn get_snapshot(
        &self,
        _identity: &Identity,
        slug: &SnapshotSlug,
    ) -> Result<Snapshot> {
        let slug = slug.clone();
        self.with_conn(move |conn| load_snapshot(conn, &slug)).await
    }

    /// All snapshot metadata, newest first. Readable by every identity.
    pub async fn list_snapshots(&self, _identity: &Identity) -> Result<Vec<Snapshot>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT slug, split, description, created_at
                 FROM snapshots ORDER BY created_at DESC, slug",
            )?;
            let rows: Vec<_> = stmt
                .query_map([], snapshot_from_row)?
                .collect::<rusqlite::Result<_>>()?;
            rows.into_iter().map(snapshot_from_parts).collect()
        })
        .await
    }

    /// Ingest a hand-authored finding with its occurrences
    pub async fn insert_finding(
        &self,
        identity: &Identity,
        slug: &SnapshotSlug,
        finding: GroundTruthFinding,
    ) -> Result<()> {
        identity.check_ingest()?;
        finding
            .validate()
            .map_err(GradebookError::InvalidOperation)?;
        if finding.catchability.is_empty() {
            return Err(GradebookError::MatchabilityMisconfigured {
                finding_id: finding.id.clone(),
            });
        }

        let slug = slug.clone();
        self.with_conn(move |conn| {
            // Verify the snapshot exists before writing
            snapshot_split(conn, &slug)?;

            let tx = super::write_tx(conn)?;
            let catchability = serde_json::to_string(&finding.catchability)?;
            let reported_on = finding
                .match_only_if_reported_on
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO findings
                 (snapshot_slug, finding_id, kind, rationale, catchability,
                  match_only_if_reported_on, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    slug.as_str(),
                    finding.id.0,
                    finding.kind.as_str(),
                    finding.rationale,
                    catchability,
                    reported_on,
                    encode_ts(chrono::Utc::now()),
                ],
            )?;
            if inserted == 0 {
                return Err(GradebookError::InvalidOperation(format!(
                    "finding '{}' already exists in snapshot '{slug}'",
                    finding.id
                )));
            }
            for occ in &finding.occurrences {
                let files = serde_json::to_string(&occ.files)?;
                tx.execute(
                    "INSERT INTO finding_occurrences
                     (snapshot_slug, finding_id, occurrence_id, files, note)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        slug.as_str(),
                        finding.id.0,
                        occ.occurrence_id.0,
                        files,
                        occ.note,
                    ],
                )?;
            }
            tx.commit()?;
            debug!(
                "Ingested finding '{}' ({} occurrences) into '{}'",
                finding.id,
                finding.occurrences.len(),
                slug
            );
            Ok(())
        })
        .await
    }

    /// Remove a finding, its occurrences, and any edges that target it
    ///
    /// Edges are removed in the same transaction so that metrics never see
    /// credit against ground truth that no longer exists.
    pub async fn delete_finding(
        &self,
        identity: &Identity,
        slug: &SnapshotSlug,
        finding_id: &FindingId,
    ) -> Result<()> {
        identity.check_ingest()?;
        let slug = slug.clone();
        let finding_id = finding_id.clone();
        self.with_conn(move |conn| {
            snapshot_split(conn, &slug)?;
            let tx = super::write_tx(conn)?;
            let removed = tx.execute(
                "DELETE FROM findings WHERE snapshot_slug = ?1 AND finding_id = ?2",
                params![slug.as_str(), finding_id.0],
            )?;
            if removed == 0 {
                return Err(GradebookError::InvalidOperation(format!(
                    "finding '{finding_id}' not found in snapshot '{slug}'"
                )));
            }
            tx.execute(
                "DELETE FROM finding_occurrences
                 WHERE snapshot_slug = ?1 AND finding_id = ?2",
                params![slug.as_str(), finding_id.0],
            )?;
            let edges = tx.execute(
                "DELETE FROM grading_edges
                 WHERE snapshot_slug = ?1 AND finding_id = ?2",
                params![slug.as_str(), finding_id.0],
            )?;
            tx.commit()?;
            info!(
                "Deleted finding '{finding_id}' from '{slug}' ({edges} edges removed)"
            );
            Ok(())
        })
        .await
    }

    /// All findings for a snapshot, in ingestion order
    pub async fn list_findings(
        &self,
        identity: &Identity,
        slug: &SnapshotSlug,
    ) -> Result<Vec<GroundTruthFinding>> {
        let identity = identity.clone();
        let slug = slug.clone();
        self.with_conn(move |conn| {
            let split = snapshot_split(conn, &slug)?;
            identity.check_ground_truth_read(&slug, split)?;
            load_findings(conn, &slug)
        })
        .await
    }
}

fn snapshot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, Option<String>, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn snapshot_from_parts(
    (slug, split, description, created_at): (String, String, Option<String>, String),
) -> Result<Snapshot> {
    Ok(Snapshot {
        slug: SnapshotSlug::new(slug),
        split: Split::parse(&split)
            .ok_or_else(|| GradebookError::Database(format!("unknown split '{split}'")))?,
        description,
        created_at: decode_ts(&created_at)?,
    })
}

/// Load one snapshot or fail with `SnapshotNotFound`
pub(crate) fn load_snapshot(conn: &Connection, slug: &SnapshotSlug) -> Result<Snapshot> {
    let row = conn
        .query_row(
            "SELECT slug, split, description, created_at FROM snapshots WHERE slug = ?1",
            params![slug.as_str()],
            snapshot_from_row,
        )
        .optional()?
        .ok_or_else(|| GradebookError::SnapshotNotFound(slug.clone()))?;
    snapshot_from_parts(row)
}

/// The split a snapshot belongs to, failing if the snapshot is unknown
pub(crate) fn snapshot_split(conn: &Connection, slug: &SnapshotSlug) -> Result<Split> {
    Ok(load_snapshot(conn, slug)?.split)
}

/// Load every finding (with occurrences) for a snapshot
pub(crate) fn load_findings(
    conn: &Connection,
    slug: &SnapshotSlug,
) -> Result<Vec<GroundTruthFinding>> {
    let mut stmt = conn.prepare(
        "SELECT finding_id, kind, rationale, catchability, match_only_if_reported_on
         FROM findings WHERE snapshot_slug = ?1 ORDER BY rowid",
    )?;
    let rows: Vec<(String, String, String, String, Option<String>)> = stmt
        .query_map(params![slug.as_str()], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        })?
        .collect::<rusqlite::Result<_>>()?;

    let mut findings = Vec::with_capacity(rows.len());
    for (id, kind, rationale, catchability, reported_on) in rows {
        let kind = FindingKind::parse(&kind)
            .ok_or_else(|| GradebookError::Database(format!("unknown finding kind '{kind}'")))?;
        let catchability: CatchabilityRule = serde_json::from_str(&catchability)?;
        let match_only_if_reported_on: Option<BTreeSet<PathBuf>> = reported_on
            .map(|s| serde_json::from_str(&s))
            .transpose()?;
        let occurrences = load_finding_occurrences(conn, slug, &id)?;
        findings.push(GroundTruthFinding {
            id: FindingId::new(id),
            kind,
            rationale,
            occurrences,
            catchability,
            match_only_if_reported_on,
        });
    }
    Ok(findings)
}

fn load_finding_occurrences(
    conn: &Connection,
    slug: &SnapshotSlug,
    finding_id: &str,
) -> Result<Vec<Occurrence>> {
    let mut stmt = conn.prepare(
        "SELECT occurrence_id, files, note FROM finding_occurrences
         WHERE snapshot_slug = ?1 AND finding_id = ?2 ORDER BY rowid",
    )?;
    let rows: Vec<(String, String, Option<String>)> = stmt
        .query_map(params![slug.as_str(), finding_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<rusqlite::Result<_>>()?;

    rows.into_iter()
        .map(|(occurrence_id, files, note)| {
            let files: Vec<FileAnchor> = serde_json::from_str(&files)?;
            Ok(Occurrence {
                occurrence_id: crate::types::OccurrenceId::new(occurrence_id),
                files,
                note,
            })
        })
        .collect()
}
