//! File row queries
//!
//! Creation, live lookups, soft deletion and the listing shapes handlers
//! serve. Every read that feeds a pipeline stage or a deletion goes through
//! `find_live_file`, which filters tombstoned rows and enforces ownership
//! in the query itself.

use chrono::{DateTime, Utc};
use log::info;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

use super::{
    file_category_err, format_ts, is_unique_violation, now_micros, parse_opt_ts, parse_ts,
    ArtifactRepository, DeleteReason, FileCategory, FileRecord, MAX_SEQUENCE_FILES,
};
use crate::error::{Error, Result};

/// Live files grouped the way the file browser shows them
#[derive(Debug, Default, Serialize)]
pub struct FileListing {
    pub genomic: Vec<FileSummary>,
    pub primer: Vec<FileSummary>,
    pub pcr: Vec<FileSummary>,
}

#[derive(Debug, Serialize)]
pub struct FileSummary {
    pub id: i64,
    pub filename: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Which input slot a file filled in a PCR run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PcrRole {
    Primer,
    Reference,
}

/// A PCR run shown under the file that fed it
#[derive(Debug, Clone, Serialize)]
pub struct PcrRunView {
    pub id: i64,
    pub name: String,
    pub cycle_count: i64,
    pub role: PcrRole,
    pub output_file_id: i64,
    pub output_filename: String,
    pub created_at: DateTime<Utc>,
}

/// A live FASTA file with its analysis summary and the PCR runs that used it
#[derive(Debug, Serialize)]
pub struct FastaFileView {
    pub id: i64,
    pub filename: String,
    pub category: FileCategory,
    pub uploaded_at: DateTime<Utc>,
    pub analysis_result: Option<String>,
    pub pcr_runs: Vec<PcrRunView>,
}

const FILE_COLUMNS: &str =
    "id, user_id, filename, category, locator, uploaded_at, deleted_at, delete_reason";

pub(crate) fn file_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    let category_raw: String = row.get(3)?;
    let category = FileCategory::parse(&category_raw).ok_or_else(|| file_category_err(3, &category_raw))?;
    let reason_raw: Option<String> = row.get(7)?;
    let delete_reason = match reason_raw {
        Some(raw) => Some(DeleteReason::parse(&raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                7,
                rusqlite::types::Type::Text,
                format!("unknown delete reason: {}", raw).into(),
            )
        })?),
        None => None,
    };
    let uploaded_raw: String = row.get(5)?;
    Ok(FileRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        filename: row.get(2)?,
        category,
        locator: row.get(4)?,
        uploaded_at: parse_ts(5, &uploaded_raw)?,
        deleted_at: parse_opt_ts(6, row.get(6)?)?,
        delete_reason,
    })
}

/// Tombstone a file row in the caller's transaction scope.
///
/// The filename is rewritten to `{original}.deleted.{unix_seconds}`, which
/// releases the live-name unique index slot. Returns false when the row was
/// already tombstoned; the first deletion's timestamp and reason stand.
pub(crate) fn soft_delete_file_conn(
    conn: &Connection,
    file_id: i64,
    reason: DeleteReason,
    now: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE files
         SET filename = filename || '.deleted.' || ?2, deleted_at = ?3, delete_reason = ?4
         WHERE id = ?1 AND deleted_at IS NULL",
        params![file_id, now.timestamp(), format_ts(now), reason.as_str()],
    )?;
    Ok(changed > 0)
}

/// Name a tombstoned filename carried before deletion
pub(crate) fn tombstone_source_name(filename: &str) -> &str {
    filename
        .rfind(".deleted.")
        .map_or(filename, |idx| &filename[..idx])
}

impl ArtifactRepository {
    /// Insert a live file row.
    ///
    /// Enforces the sequence file quota for uploadable categories and maps a
    /// live-filename unique violation to `Duplicate`; the partial unique
    /// index is the authoritative guard, so concurrent creators cannot both
    /// win the same name.
    pub fn create_file(
        &self,
        user_id: i64,
        filename: &str,
        category: FileCategory,
        locator: &str,
    ) -> Result<FileRecord> {
        let conn = self.lock_conn();
        if category.counts_against_quota() {
            let live = count_quota_files_conn(&conn, user_id)?;
            if live >= MAX_SEQUENCE_FILES {
                return Err(Error::QuotaExceeded {
                    limit: MAX_SEQUENCE_FILES,
                });
            }
        }
        let now = now_micros();
        let inserted = conn.execute(
            "INSERT INTO files (user_id, filename, category, locator, uploaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, filename, category.as_str(), locator, format_ts(now)],
        );
        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                return Err(Error::Duplicate {
                    entity: "File",
                    name: filename.to_string(),
                });
            }
            return Err(err.into());
        }
        info!(
            "Created {} file {} for user {}",
            category.as_str(),
            filename,
            user_id
        );
        Ok(FileRecord {
            id: conn.last_insert_rowid(),
            user_id,
            filename: filename.to_string(),
            category,
            locator: locator.to_string(),
            uploaded_at: now,
            deleted_at: None,
            delete_reason: None,
        })
    }

    /// Fetch a live file owned by the user. Tombstoned and foreign-owned
    /// rows are indistinguishable from absent ones.
    pub fn find_live_file(&self, user_id: i64, file_id: i64) -> Result<Option<FileRecord>> {
        let conn = self.lock_conn();
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM files WHERE id = ?1 AND user_id = ?2 AND deleted_at IS NULL",
                    FILE_COLUMNS
                ),
                params![file_id, user_id],
                file_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Fetch a file row by id regardless of owner or tombstone state
    pub fn get_file(&self, file_id: i64) -> Result<Option<FileRecord>> {
        let conn = self.lock_conn();
        let record = conn
            .query_row(
                &format!("SELECT {} FROM files WHERE id = ?1", FILE_COLUMNS),
                params![file_id],
                file_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Whether the user already holds a live file with this filename
    pub fn live_filename_exists(&self, user_id: i64, filename: &str) -> Result<bool> {
        let conn = self.lock_conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM files
             WHERE user_id = ?1 AND filename = ?2 AND deleted_at IS NULL",
            params![user_id, filename],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Live genomic + primer files held by the user
    pub fn count_live_sequence_files(&self, user_id: i64) -> Result<usize> {
        let conn = self.lock_conn();
        count_quota_files_conn(&conn, user_id)
    }

    /// Tombstone a file. Idempotent: returns false and leaves the original
    /// deletion untouched when the row is already tombstoned.
    pub fn soft_delete_file(&self, file_id: i64, reason: DeleteReason) -> Result<bool> {
        let conn = self.lock_conn();
        let changed = soft_delete_file_conn(&conn, file_id, reason, now_micros())?;
        if changed {
            info!("Tombstoned file {} (reason: {})", file_id, reason.as_str());
        }
        Ok(changed)
    }

    /// Live files grouped by category for the file browser
    pub fn list_files_grouped(&self, user_id: i64) -> Result<FileListing> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, filename, category, uploaded_at FROM files
             WHERE user_id = ?1 AND deleted_at IS NULL AND category IN ('genomic', 'primer', 'pcr')
             ORDER BY uploaded_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            let category_raw: String = row.get(2)?;
            let uploaded_raw: String = row.get(3)?;
            Ok((
                FileSummary {
                    id: row.get(0)?,
                    filename: row.get(1)?,
                    uploaded_at: parse_ts(3, &uploaded_raw)?,
                },
                category_raw,
            ))
        })?;

        let mut listing = FileListing::default();
        for row in rows {
            let (summary, category_raw) = row?;
            match FileCategory::parse(&category_raw) {
                Some(FileCategory::Genomic) => listing.genomic.push(summary),
                Some(FileCategory::Primer) => listing.primer.push(summary),
                Some(FileCategory::Pcr) => listing.pcr.push(summary),
                _ => {}
            }
        }
        Ok(listing)
    }

    /// Live FASTA files with their analysis summary and the PCR runs each
    /// fed, as primer or reference.
    ///
    /// Loads exactly three statements: the user's live genomic/primer files,
    /// their FASTA analysis rows, and their PCR analysis rows.
    pub fn fasta_files_with_provenance(&self, user_id: i64) -> Result<Vec<FastaFileView>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM files
             WHERE user_id = ?1 AND deleted_at IS NULL AND category IN ('genomic', 'primer')
             ORDER BY uploaded_at DESC, id DESC",
            FILE_COLUMNS
        ))?;
        let files = stmt
            .query_map(params![user_id], file_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut summaries: HashMap<i64, String> = HashMap::new();
        let mut stmt =
            conn.prepare("SELECT fasta_file_id, result FROM fasta_analyses WHERE user_id = ?1")?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (file_id, result) = row?;
            summaries.insert(file_id, result);
        }

        let mut runs_by_file: HashMap<i64, Vec<PcrRunView>> = HashMap::new();
        let mut stmt = conn.prepare(
            "SELECT id, primer_file_id, reference_file_id, name, cycle_count,
                    output_file_id, output_filename, created_at
             FROM pcr_analyses WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            let created_raw: String = row.get(7)?;
            Ok((
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                PcrRunView {
                    id: row.get(0)?,
                    name: row.get(3)?,
                    cycle_count: row.get(4)?,
                    role: PcrRole::Primer,
                    output_file_id: row.get(5)?,
                    output_filename: row.get(6)?,
                    created_at: parse_ts(7, &created_raw)?,
                },
            ))
        })?;
        for row in rows {
            let (primer_file_id, reference_file_id, run) = row?;
            runs_by_file
                .entry(primer_file_id)
                .or_default()
                .push(run.clone());
            let mut as_reference = run;
            as_reference.role = PcrRole::Reference;
            runs_by_file
                .entry(reference_file_id)
                .or_default()
                .push(as_reference);
        }

        Ok(files
            .into_iter()
            .map(|file| FastaFileView {
                analysis_result: summaries.get(&file.id).cloned(),
                pcr_runs: runs_by_file.remove(&file.id).unwrap_or_default(),
                id: file.id,
                filename: file.filename,
                category: file.category,
                uploaded_at: file.uploaded_at,
            })
            .collect())
    }

    /// Sweep candidates: live files uploaded on or before the cutoff
    pub fn live_files_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FileRecord>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM files WHERE deleted_at IS NULL AND uploaded_at <= ?1
             ORDER BY uploaded_at ASC LIMIT ?2",
            FILE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![format_ts(cutoff), limit as i64], file_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Sweep candidates scoped to one user, for the opportunistic sweep
    pub fn live_files_older_than_for_user(
        &self,
        user_id: i64,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FileRecord>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM files
             WHERE user_id = ?1 AND deleted_at IS NULL AND uploaded_at <= ?2
             ORDER BY uploaded_at ASC LIMIT ?3",
            FILE_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![user_id, format_ts(cutoff), limit as i64],
            file_from_row,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }
}

fn count_quota_files_conn(conn: &Connection, user_id: i64) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM files
         WHERE user_id = ?1 AND deleted_at IS NULL AND category IN ('genomic', 'primer')",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> ArtifactRepository {
        ArtifactRepository::open_in_memory().unwrap()
    }

    #[test]
    fn test_create_and_find_live_file() {
        let repo = repo();
        let record = repo
            .create_file(1, "sample.fasta", FileCategory::Genomic, "vault://b/1/genomic/sample.fasta")
            .unwrap();
        assert!(record.id > 0);
        assert!(record.is_live());

        let found = repo.find_live_file(1, record.id).unwrap().unwrap();
        assert_eq!(found.filename, "sample.fasta");
        assert_eq!(found.category, FileCategory::Genomic);
        assert_eq!(found.uploaded_at, record.uploaded_at);
    }

    #[test]
    fn test_find_live_file_enforces_ownership() {
        let repo = repo();
        let record = repo
            .create_file(1, "sample.fasta", FileCategory::Genomic, "vault://b/k")
            .unwrap();
        assert!(repo.find_live_file(2, record.id).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_live_filename_rejected_per_user() {
        let repo = repo();
        repo.create_file(1, "reads.fasta", FileCategory::Genomic, "vault://b/a")
            .unwrap();
        let err = repo
            .create_file(1, "reads.fasta", FileCategory::Primer, "vault://b/b")
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate { .. }));

        // a different user may hold the same name
        repo.create_file(2, "reads.fasta", FileCategory::Genomic, "vault://b/c")
            .unwrap();
    }

    #[test]
    fn test_quota_rejects_seventh_sequence_file() {
        let repo = repo();
        for i in 0..MAX_SEQUENCE_FILES {
            repo.create_file(1, &format!("f{}.fasta", i), FileCategory::Genomic, "vault://b/k")
                .unwrap();
        }
        let err = repo
            .create_file(1, "one-more.fasta", FileCategory::Genomic, "vault://b/k7")
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { limit: MAX_SEQUENCE_FILES }));

        // derived artifacts do not count against the quota
        repo.create_file(1, "amplicon.fasta", FileCategory::Pcr, "vault://b/p")
            .unwrap();
        assert_eq!(repo.count_live_sequence_files(1).unwrap(), MAX_SEQUENCE_FILES);
    }

    #[test]
    fn test_soft_delete_tombstones_and_frees_name() {
        let repo = repo();
        let record = repo
            .create_file(1, "reads.fasta", FileCategory::Genomic, "vault://b/k")
            .unwrap();

        assert!(repo.soft_delete_file(record.id, DeleteReason::User).unwrap());
        assert!(repo.find_live_file(1, record.id).unwrap().is_none());

        let tombstoned = repo.get_file(record.id).unwrap().unwrap();
        assert!(tombstoned.filename.starts_with("reads.fasta.deleted."));
        assert_eq!(tombstoned.delete_reason, Some(DeleteReason::User));
        assert!(tombstoned.deleted_at.is_some());

        // the original name is free again
        repo.create_file(1, "reads.fasta", FileCategory::Genomic, "vault://b/k2")
            .unwrap();
    }

    #[test]
    fn test_soft_delete_is_idempotent() {
        let repo = repo();
        let record = repo
            .create_file(1, "reads.fasta", FileCategory::Genomic, "vault://b/k")
            .unwrap();

        assert!(repo.soft_delete_file(record.id, DeleteReason::Missing).unwrap());
        let first = repo.get_file(record.id).unwrap().unwrap();

        // second delete is a no-op and must not disturb the first record
        assert!(!repo.soft_delete_file(record.id, DeleteReason::User).unwrap());
        let second = repo.get_file(record.id).unwrap().unwrap();
        assert_eq!(second.deleted_at, first.deleted_at);
        assert_eq!(second.delete_reason, Some(DeleteReason::Missing));
        assert_eq!(second.filename, first.filename);
    }

    #[test]
    fn test_tombstone_source_name_strips_suffix() {
        assert_eq!(
            tombstone_source_name("reads.fasta.deleted.1700000000"),
            "reads.fasta"
        );
        assert_eq!(tombstone_source_name("reads.fasta"), "reads.fasta");
    }

    #[test]
    fn test_list_files_grouped_excludes_tombstones() {
        let repo = repo();
        let genomic = repo
            .create_file(1, "g.fasta", FileCategory::Genomic, "vault://b/g")
            .unwrap();
        repo.create_file(1, "p.fasta", FileCategory::Primer, "vault://b/p")
            .unwrap();
        repo.create_file(1, "amp.fasta", FileCategory::Pcr, "vault://b/a")
            .unwrap();
        repo.create_file(1, "r1.fastq.gz", FileCategory::Fastq, "vault://b/r1")
            .unwrap();
        repo.create_file(2, "other.fasta", FileCategory::Genomic, "vault://b/o")
            .unwrap();

        repo.soft_delete_file(genomic.id, DeleteReason::User).unwrap();

        let listing = repo.list_files_grouped(1).unwrap();
        assert!(listing.genomic.is_empty());
        assert_eq!(listing.primer.len(), 1);
        assert_eq!(listing.pcr.len(), 1);
        assert_eq!(listing.primer[0].filename, "p.fasta");
    }

    #[test]
    fn test_live_files_older_than_applies_cutoff_and_scope() {
        let repo = repo();
        let old = repo
            .create_file(1, "old.fasta", FileCategory::Genomic, "vault://b/old")
            .unwrap();
        repo.create_file(2, "other.fasta", FileCategory::Genomic, "vault://b/other")
            .unwrap();

        let future = Utc::now() + chrono::Duration::seconds(5);
        let all = repo.live_files_older_than(future, 10).unwrap();
        assert_eq!(all.len(), 2);

        let past = Utc::now() - chrono::Duration::days(1);
        assert!(repo.live_files_older_than(past, 10).unwrap().is_empty());

        let scoped = repo.live_files_older_than_for_user(1, future, 10).unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].id, old.id);

        let limited = repo.live_files_older_than(future, 1).unwrap();
        assert_eq!(limited.len(), 1);
    }
}
