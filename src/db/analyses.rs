//! Stage result queries
//!
//! FASTA summaries upsert in place; PCR and FASTQ runs are immutable rows
//! guarded by UNIQUE idempotency keys. Multi-row writes (output files plus
//! the analysis row, cascading soft deletes) run inside explicit
//! transactions, so a writer that loses an idempotency race rolls back its
//! half-written rows and re-reads the winner's.

use chrono::{DateTime, Utc};
use log::info;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::files::{soft_delete_file_conn, tombstone_source_name};
use super::{
    format_ts, is_unique_violation, now_micros, parse_opt_ts, parse_ts, ArtifactRepository,
    DeleteReason, FastaAnalysis, FastqAnalysis, FileCategory, PcrAnalysis,
};
use crate::error::{Error, Result};

/// Outcome of recording a stage result under an idempotency key
#[derive(Debug)]
pub enum StageInsert<T> {
    /// This call wrote the row
    Created(T),
    /// An identical run was already recorded; the stored row is returned
    AlreadyExists(T),
}

impl<T> StageInsert<T> {
    pub fn is_created(&self) -> bool {
        matches!(self, StageInsert::Created(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            StageInsert::Created(v) | StageInsert::AlreadyExists(v) => v,
        }
    }
}

/// An output file row to create alongside an analysis row
#[derive(Debug, Clone)]
pub struct NewStageFile {
    pub filename: String,
    pub locator: String,
}

#[derive(Debug)]
pub struct NewPcrResult {
    pub primer_file_id: i64,
    pub reference_file_id: i64,
    pub name: String,
    pub cycle_count: i64,
    pub primer_filename: String,
    pub reference_filename: String,
    pub output: NewStageFile,
    pub result: String,
}

#[derive(Debug)]
pub struct NewFastqResult {
    pub pcr_file_id: i64,
    pub analysis_name: String,
    pub sample_name: String,
    pub sequence_count: i64,
    pub pcr_filename: String,
    pub r1: NewStageFile,
    pub r2: NewStageFile,
    pub result: String,
}

/// What a FASTQ cascade delete removed: the analysis row (with `deleted_at`
/// now set) and the blob locators of its tombstoned output files
#[derive(Debug)]
pub struct CascadeOutcome {
    pub analysis: FastqAnalysis,
    pub locators: Vec<String>,
}

/// Row of the FASTA analyses listing
#[derive(Debug, Serialize)]
pub struct FastaAnalysisView {
    pub id: i64,
    pub fasta_file_id: i64,
    pub filename: String,
    pub result: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A file referenced by a FASTQ analysis, marked when tombstoned
#[derive(Debug, Serialize)]
pub struct FastqFileRef {
    pub id: i64,
    pub display_name: String,
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct FastqAnalysisView {
    pub id: i64,
    pub analysis_name: String,
    pub sample_name: String,
    pub sequence_count: i64,
    pub pcr_file: FastqFileRef,
    pub r1_file: FastqFileRef,
    pub r2_file: FastqFileRef,
    pub result: String,
    pub created_at: DateTime<Utc>,
}

const FASTA_COLUMNS: &str = "id, user_id, fasta_file_id, result, created_at, updated_at";

const PCR_COLUMNS: &str = "id, user_id, primer_file_id, reference_file_id, name, cycle_count, \
                           output_file_id, primer_filename, reference_filename, output_filename, \
                           result, created_at";

const FASTQ_COLUMNS: &str = "id, user_id, pcr_file_id, analysis_name, sample_name, \
                             sequence_count, r1_file_id, r2_file_id, pcr_filename, r1_filename, \
                             r2_filename, result, created_at, deleted_at";

fn fasta_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FastaAnalysis> {
    let created_raw: String = row.get(4)?;
    let updated_raw: String = row.get(5)?;
    Ok(FastaAnalysis {
        id: row.get(0)?,
        user_id: row.get(1)?,
        fasta_file_id: row.get(2)?,
        result: row.get(3)?,
        created_at: parse_ts(4, &created_raw)?,
        updated_at: parse_ts(5, &updated_raw)?,
    })
}

fn pcr_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PcrAnalysis> {
    let created_raw: String = row.get(11)?;
    Ok(PcrAnalysis {
        id: row.get(0)?,
        user_id: row.get(1)?,
        primer_file_id: row.get(2)?,
        reference_file_id: row.get(3)?,
        name: row.get(4)?,
        cycle_count: row.get(5)?,
        output_file_id: row.get(6)?,
        primer_filename: row.get(7)?,
        reference_filename: row.get(8)?,
        output_filename: row.get(9)?,
        result: row.get(10)?,
        created_at: parse_ts(11, &created_raw)?,
    })
}

fn fastq_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FastqAnalysis> {
    let created_raw: String = row.get(12)?;
    Ok(FastqAnalysis {
        id: row.get(0)?,
        user_id: row.get(1)?,
        pcr_file_id: row.get(2)?,
        analysis_name: row.get(3)?,
        sample_name: row.get(4)?,
        sequence_count: row.get(5)?,
        r1_file_id: row.get(6)?,
        r2_file_id: row.get(7)?,
        pcr_filename: row.get(8)?,
        r1_filename: row.get(9)?,
        r2_filename: row.get(10)?,
        result: row.get(11)?,
        created_at: parse_ts(12, &created_raw)?,
        deleted_at: parse_opt_ts(13, row.get(13)?)?,
    })
}

/// Insert a stage output file row. Unique violations are left to the caller,
/// which knows whether the taken name means a lost race or a real collision.
fn insert_stage_file_conn(
    conn: &Connection,
    user_id: i64,
    file: &NewStageFile,
    category: FileCategory,
    now: DateTime<Utc>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO files (user_id, filename, category, locator, uploaded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            user_id,
            file.filename,
            category.as_str(),
            file.locator,
            format_ts(now)
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn pcr_by_key_conn(
    conn: &Connection,
    user_id: i64,
    primer_file_id: i64,
    reference_file_id: i64,
    name: &str,
    cycle_count: i64,
) -> Result<Option<PcrAnalysis>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM pcr_analyses
             WHERE user_id = ?1 AND primer_file_id = ?2 AND reference_file_id = ?3
               AND name = ?4 AND cycle_count = ?5",
            PCR_COLUMNS
        ),
        params![user_id, primer_file_id, reference_file_id, name, cycle_count],
        pcr_from_row,
    )
    .optional()
    .map_err(Error::from)
}

fn fastq_by_key_conn(
    conn: &Connection,
    user_id: i64,
    pcr_file_id: i64,
    sample_name: &str,
    analysis_name: &str,
    sequence_count: i64,
) -> Result<Option<FastqAnalysis>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM fastq_analyses
             WHERE user_id = ?1 AND pcr_file_id = ?2 AND sample_name = ?3
               AND analysis_name = ?4 AND sequence_count = ?5 AND deleted_at IS NULL",
            FASTQ_COLUMNS
        ),
        params![user_id, pcr_file_id, sample_name, analysis_name, sequence_count],
        fastq_from_row,
    )
    .optional()
    .map_err(Error::from)
}

/// A unique violation during a PCR record can mean two things: a concurrent
/// identical run already committed (return its row), or the output filename
/// collides with an unrelated live file (a real duplicate).
fn resolve_pcr_conflict(
    conn: &Connection,
    user_id: i64,
    new: &NewPcrResult,
    taken_name: &str,
) -> Result<StageInsert<PcrAnalysis>> {
    match pcr_by_key_conn(
        conn,
        user_id,
        new.primer_file_id,
        new.reference_file_id,
        &new.name,
        new.cycle_count,
    )? {
        Some(existing) => Ok(StageInsert::AlreadyExists(existing)),
        None => Err(Error::Duplicate {
            entity: "File",
            name: taken_name.to_string(),
        }),
    }
}

fn resolve_fastq_conflict(
    conn: &Connection,
    user_id: i64,
    new: &NewFastqResult,
    taken_name: &str,
) -> Result<StageInsert<FastqAnalysis>> {
    match fastq_by_key_conn(
        conn,
        user_id,
        new.pcr_file_id,
        &new.sample_name,
        &new.analysis_name,
        new.sequence_count,
    )? {
        Some(existing) => Ok(StageInsert::AlreadyExists(existing)),
        None => Err(Error::Duplicate {
            entity: "File",
            name: taken_name.to_string(),
        }),
    }
}

fn file_ref(id: i64, denormalized: String, deleted: bool) -> FastqFileRef {
    let display_name = if deleted {
        format!("{} (Deleted)", denormalized)
    } else {
        denormalized
    };
    FastqFileRef {
        id,
        display_name,
        deleted,
    }
}

impl ArtifactRepository {
    /// Record or refresh the sequence-count summary for a FASTA file.
    /// Re-running the stage updates `result` and `updated_at` in place.
    pub fn upsert_fasta_analysis(
        &self,
        user_id: i64,
        fasta_file_id: i64,
        result: &str,
    ) -> Result<FastaAnalysis> {
        let conn = self.lock_conn();
        let now = now_micros();
        conn.execute(
            "INSERT INTO fasta_analyses (user_id, fasta_file_id, result, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(user_id, fasta_file_id)
             DO UPDATE SET result = excluded.result, updated_at = excluded.updated_at",
            params![user_id, fasta_file_id, result, format_ts(now)],
        )?;
        let analysis = conn.query_row(
            &format!(
                "SELECT {} FROM fasta_analyses WHERE user_id = ?1 AND fasta_file_id = ?2",
                FASTA_COLUMNS
            ),
            params![user_id, fasta_file_id],
            fasta_from_row,
        )?;
        info!(
            "Recorded FASTA analysis for file {} (user {})",
            fasta_file_id, user_id
        );
        Ok(analysis)
    }

    pub fn find_fasta_analysis(
        &self,
        user_id: i64,
        fasta_file_id: i64,
    ) -> Result<Option<FastaAnalysis>> {
        let conn = self.lock_conn();
        conn.query_row(
            &format!(
                "SELECT {} FROM fasta_analyses WHERE user_id = ?1 AND fasta_file_id = ?2",
                FASTA_COLUMNS
            ),
            params![user_id, fasta_file_id],
            fasta_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Idempotency lookup for a PCR run
    pub fn find_pcr_analysis_by_key(
        &self,
        user_id: i64,
        primer_file_id: i64,
        reference_file_id: i64,
        name: &str,
        cycle_count: i64,
    ) -> Result<Option<PcrAnalysis>> {
        let conn = self.lock_conn();
        pcr_by_key_conn(
            &conn,
            user_id,
            primer_file_id,
            reference_file_id,
            name,
            cycle_count,
        )
    }

    /// Record a successful PCR run: the output file row plus the analysis
    /// row in one transaction.
    ///
    /// A unique violation on either insert rolls the transaction back. If a
    /// row with this idempotency key exists the violation was a lost race
    /// and the winner's row comes back as `AlreadyExists`; otherwise the
    /// output filename collided with an unrelated live file and the caller
    /// gets `Duplicate`.
    pub fn record_pcr_result(
        &self,
        user_id: i64,
        new: NewPcrResult,
    ) -> Result<StageInsert<PcrAnalysis>> {
        let mut conn = self.lock_conn();
        let now = now_micros();
        let tx = conn.transaction()?;

        let inserted_file = insert_stage_file_conn(&tx, user_id, &new.output, FileCategory::Pcr, now);
        let output_file_id = match inserted_file {
            Ok(id) => id,
            Err(err) if is_unique_violation(&err) => {
                drop(tx);
                return resolve_pcr_conflict(&conn, user_id, &new, &new.output.filename);
            }
            Err(err) => return Err(err.into()),
        };

        let inserted = tx.execute(
            "INSERT INTO pcr_analyses (user_id, primer_file_id, reference_file_id, name,
                 cycle_count, output_file_id, primer_filename, reference_filename,
                 output_filename, result, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                user_id,
                new.primer_file_id,
                new.reference_file_id,
                new.name,
                new.cycle_count,
                output_file_id,
                new.primer_filename,
                new.reference_filename,
                new.output.filename,
                new.result,
                format_ts(now)
            ],
        );
        match inserted {
            Ok(_) => {
                let id = tx.last_insert_rowid();
                tx.commit()?;
                info!("Recorded PCR analysis {} for user {}", new.name, user_id);
                Ok(StageInsert::Created(PcrAnalysis {
                    id,
                    user_id,
                    primer_file_id: new.primer_file_id,
                    reference_file_id: new.reference_file_id,
                    name: new.name,
                    cycle_count: new.cycle_count,
                    output_file_id,
                    primer_filename: new.primer_filename,
                    reference_filename: new.reference_filename,
                    output_filename: new.output.filename,
                    result: new.result,
                    created_at: now,
                }))
            }
            Err(err) if is_unique_violation(&err) => {
                drop(tx);
                let existing = pcr_by_key_conn(
                    &conn,
                    user_id,
                    new.primer_file_id,
                    new.reference_file_id,
                    &new.name,
                    new.cycle_count,
                )?
                .ok_or_else(|| Error::Storage {
                    message: format!(
                        "pcr analysis {} missing after unique conflict (user {})",
                        new.name, user_id
                    ),
                })?;
                Ok(StageInsert::AlreadyExists(existing))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Idempotency lookup for a FASTQ run; deleted analyses do not count
    pub fn find_fastq_analysis_by_key(
        &self,
        user_id: i64,
        pcr_file_id: i64,
        sample_name: &str,
        analysis_name: &str,
        sequence_count: i64,
    ) -> Result<Option<FastqAnalysis>> {
        let conn = self.lock_conn();
        fastq_by_key_conn(
            &conn,
            user_id,
            pcr_file_id,
            sample_name,
            analysis_name,
            sequence_count,
        )
    }

    /// Record a successful FASTQ run: both output file rows plus the
    /// analysis row in one transaction. Conflict handling mirrors
    /// `record_pcr_result`.
    pub fn record_fastq_result(
        &self,
        user_id: i64,
        new: NewFastqResult,
    ) -> Result<StageInsert<FastqAnalysis>> {
        let mut conn = self.lock_conn();
        let now = now_micros();
        let tx = conn.transaction()?;

        let mut output_ids = [0i64; 2];
        for (idx, file) in [&new.r1, &new.r2].into_iter().enumerate() {
            match insert_stage_file_conn(&tx, user_id, file, FileCategory::Fastq, now) {
                Ok(id) => output_ids[idx] = id,
                Err(err) if is_unique_violation(&err) => {
                    let taken = file.filename.clone();
                    drop(tx);
                    return resolve_fastq_conflict(&conn, user_id, &new, &taken);
                }
                Err(err) => return Err(err.into()),
            }
        }
        let [r1_file_id, r2_file_id] = output_ids;

        let inserted = tx.execute(
            "INSERT INTO fastq_analyses (user_id, pcr_file_id, analysis_name, sample_name,
                 sequence_count, r1_file_id, r2_file_id, pcr_filename, r1_filename,
                 r2_filename, result, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                user_id,
                new.pcr_file_id,
                new.analysis_name,
                new.sample_name,
                new.sequence_count,
                r1_file_id,
                r2_file_id,
                new.pcr_filename,
                new.r1.filename,
                new.r2.filename,
                new.result,
                format_ts(now)
            ],
        );
        match inserted {
            Ok(_) => {
                let id = tx.last_insert_rowid();
                tx.commit()?;
                info!(
                    "Recorded FASTQ analysis {} for user {}",
                    new.analysis_name, user_id
                );
                Ok(StageInsert::Created(FastqAnalysis {
                    id,
                    user_id,
                    pcr_file_id: new.pcr_file_id,
                    analysis_name: new.analysis_name,
                    sample_name: new.sample_name,
                    sequence_count: new.sequence_count,
                    r1_file_id,
                    r2_file_id,
                    pcr_filename: new.pcr_filename,
                    r1_filename: new.r1.filename,
                    r2_filename: new.r2.filename,
                    result: new.result,
                    created_at: now,
                    deleted_at: None,
                }))
            }
            Err(err) if is_unique_violation(&err) => {
                drop(tx);
                let existing = fastq_by_key_conn(
                    &conn,
                    user_id,
                    new.pcr_file_id,
                    &new.sample_name,
                    &new.analysis_name,
                    new.sequence_count,
                )?
                .ok_or_else(|| Error::Storage {
                    message: format!(
                        "fastq analysis {} missing after unique conflict (user {})",
                        new.analysis_name, user_id
                    ),
                })?;
                Ok(StageInsert::AlreadyExists(existing))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch a live FASTQ analysis owned by the user
    pub fn find_live_fastq_analysis(
        &self,
        user_id: i64,
        analysis_id: i64,
    ) -> Result<Option<FastqAnalysis>> {
        let conn = self.lock_conn();
        conn.query_row(
            &format!(
                "SELECT {} FROM fastq_analyses
                 WHERE id = ?1 AND user_id = ?2 AND deleted_at IS NULL",
                FASTQ_COLUMNS
            ),
            params![analysis_id, user_id],
            fastq_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Soft-delete a FASTQ analysis together with both of its output files,
    /// in one transaction. Never tombstones only one of the pair.
    ///
    /// Returns `None` when no live analysis matches (absent, foreign-owned
    /// or already deleted); physical cleanup of the returned locators is the
    /// caller's concern.
    pub fn soft_delete_fastq_cascade(
        &self,
        user_id: i64,
        analysis_id: i64,
    ) -> Result<Option<CascadeOutcome>> {
        let mut conn = self.lock_conn();
        let now = now_micros();
        let tx = conn.transaction()?;

        let found = tx
            .query_row(
                &format!(
                    "SELECT {} FROM fastq_analyses
                     WHERE id = ?1 AND user_id = ?2 AND deleted_at IS NULL",
                    FASTQ_COLUMNS
                ),
                params![analysis_id, user_id],
                fastq_from_row,
            )
            .optional()?;
        let mut analysis = match found {
            Some(a) => a,
            None => return Ok(None),
        };

        let mut locators = Vec::with_capacity(2);
        for file_id in [analysis.r1_file_id, analysis.r2_file_id] {
            let locator: String = tx.query_row(
                "SELECT locator FROM files WHERE id = ?1",
                params![file_id],
                |row| row.get(0),
            )?;
            locators.push(locator);
            soft_delete_file_conn(&tx, file_id, DeleteReason::User, now)?;
        }

        tx.execute(
            "UPDATE fastq_analyses SET deleted_at = ?2 WHERE id = ?1",
            params![analysis.id, format_ts(now)],
        )?;
        tx.commit()?;

        analysis.deleted_at = Some(now);
        info!(
            "Soft-deleted FASTQ analysis {} and its output files for user {}",
            analysis.id, user_id
        );
        Ok(Some(CascadeOutcome { analysis, locators }))
    }

    /// FASTA analyses newest first, with the analyzed file's display name.
    /// A tombstoned file shows its original name with a deleted marker.
    pub fn list_fasta_analyses(&self, user_id: i64) -> Result<Vec<FastaAnalysisView>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.fasta_file_id, f.filename, f.deleted_at IS NOT NULL, a.result,
                    a.created_at, a.updated_at
             FROM fasta_analyses a
             JOIN files f ON f.id = a.fasta_file_id
             WHERE a.user_id = ?1
             ORDER BY a.updated_at DESC, a.id DESC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            let filename: String = row.get(2)?;
            let deleted: bool = row.get(3)?;
            let created_raw: String = row.get(5)?;
            let updated_raw: String = row.get(6)?;
            Ok(FastaAnalysisView {
                id: row.get(0)?,
                fasta_file_id: row.get(1)?,
                filename: if deleted {
                    format!("{} (Deleted)", tombstone_source_name(&filename))
                } else {
                    filename
                },
                result: row.get(4)?,
                created_at: parse_ts(5, &created_raw)?,
                updated_at: parse_ts(6, &updated_raw)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    /// Live FASTQ analyses newest first, each with its input file and both
    /// output files. References to tombstoned file rows fall back to the
    /// denormalized filename with a deleted marker.
    pub fn list_fastq_analyses(&self, user_id: i64) -> Result<Vec<FastqAnalysisView>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.analysis_name, a.sample_name, a.sequence_count,
                    a.pcr_file_id, a.pcr_filename, pf.deleted_at IS NOT NULL,
                    a.r1_file_id, a.r1_filename, r1.deleted_at IS NOT NULL,
                    a.r2_file_id, a.r2_filename, r2.deleted_at IS NOT NULL,
                    a.result, a.created_at
             FROM fastq_analyses a
             JOIN files pf ON pf.id = a.pcr_file_id
             JOIN files r1 ON r1.id = a.r1_file_id
             JOIN files r2 ON r2.id = a.r2_file_id
             WHERE a.user_id = ?1 AND a.deleted_at IS NULL
             ORDER BY a.created_at DESC, a.id DESC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            let created_raw: String = row.get(14)?;
            Ok(FastqAnalysisView {
                id: row.get(0)?,
                analysis_name: row.get(1)?,
                sample_name: row.get(2)?,
                sequence_count: row.get(3)?,
                pcr_file: file_ref(row.get(4)?, row.get(5)?, row.get(6)?),
                r1_file: file_ref(row.get(7)?, row.get(8)?, row.get(9)?),
                r2_file: file_ref(row.get(10)?, row.get(11)?, row.get(12)?),
                result: row.get(13)?,
                created_at: parse_ts(14, &created_raw)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{FileRecord, PcrRole};

    fn repo() -> ArtifactRepository {
        ArtifactRepository::open_in_memory().unwrap()
    }

    fn seed_file(
        repo: &ArtifactRepository,
        user_id: i64,
        filename: &str,
        category: FileCategory,
    ) -> FileRecord {
        repo.create_file(
            user_id,
            filename,
            category,
            &format!("vault://b/{}/{}/{}", user_id, category.as_str(), filename),
        )
        .unwrap()
    }

    fn new_pcr(
        primer: &FileRecord,
        reference: &FileRecord,
        name: &str,
        output_filename: &str,
    ) -> NewPcrResult {
        NewPcrResult {
            primer_file_id: primer.id,
            reference_file_id: reference.id,
            name: name.to_string(),
            cycle_count: 30,
            primer_filename: primer.filename.clone(),
            reference_filename: reference.filename.clone(),
            output: NewStageFile {
                filename: output_filename.to_string(),
                locator: format!("vault://b/1/pcr/{}", output_filename),
            },
            result: r#"{"status":"success","pcr_path":"vault://b/1/pcr/out.fasta"}"#.to_string(),
        }
    }

    fn new_fastq(
        pcr: &FileRecord,
        sample: &str,
        analysis: &str,
        count: i64,
        r1: &str,
        r2: &str,
    ) -> NewFastqResult {
        NewFastqResult {
            pcr_file_id: pcr.id,
            analysis_name: analysis.to_string(),
            sample_name: sample.to_string(),
            sequence_count: count,
            pcr_filename: pcr.filename.clone(),
            r1: NewStageFile {
                filename: r1.to_string(),
                locator: format!("vault://b/1/fastq/{}", r1),
            },
            r2: NewStageFile {
                filename: r2.to_string(),
                locator: format!("vault://b/1/fastq/{}", r2),
            },
            result: r#"{"status":"success","r1_path":"a","r2_path":"b"}"#.to_string(),
        }
    }

    #[test]
    fn test_upsert_fasta_analysis_refreshes_in_place() {
        let repo = repo();
        let file = seed_file(&repo, 1, "sample.fasta", FileCategory::Genomic);

        let first = repo
            .upsert_fasta_analysis(1, file.id, "Found 3 sequences.")
            .unwrap();
        assert_eq!(first.result, "Found 3 sequences.");
        assert_eq!(first.created_at, first.updated_at);

        let second = repo
            .upsert_fasta_analysis(1, file.id, "Found 5 sequences.")
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.result, "Found 5 sequences.");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);

        let found = repo.find_fasta_analysis(1, file.id).unwrap().unwrap();
        assert_eq!(found.result, "Found 5 sequences.");
    }

    #[test]
    fn test_record_pcr_creates_output_file_and_analysis() {
        let repo = repo();
        let primer = seed_file(&repo, 1, "primer.fasta", FileCategory::Primer);
        let reference = seed_file(&repo, 1, "genome.fasta", FileCategory::Genomic);

        let outcome = repo
            .record_pcr_result(1, new_pcr(&primer, &reference, "run1", "run1_pcr.fasta"))
            .unwrap();
        assert!(outcome.is_created());
        let analysis = outcome.into_inner();
        assert!(analysis.id > 0);
        assert_eq!(analysis.output_filename, "run1_pcr.fasta");

        let output = repo.get_file(analysis.output_file_id).unwrap().unwrap();
        assert!(output.is_live());
        assert_eq!(output.category, FileCategory::Pcr);
        assert_eq!(output.filename, "run1_pcr.fasta");

        let found = repo
            .find_pcr_analysis_by_key(1, primer.id, reference.id, "run1", 30)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, analysis.id);
    }

    #[test]
    fn test_record_pcr_race_loser_gets_existing_row() {
        let repo = repo();
        let primer = seed_file(&repo, 1, "primer.fasta", FileCategory::Primer);
        let reference = seed_file(&repo, 1, "genome.fasta", FileCategory::Genomic);
        let first = repo
            .record_pcr_result(1, new_pcr(&primer, &reference, "run1", "run1_pcr.fasta"))
            .unwrap()
            .into_inner();

        // same key but a different output name: the loser's file row must
        // not survive the rollback
        let outcome = repo
            .record_pcr_result(1, new_pcr(&primer, &reference, "run1", "run1_pcr.retry.fasta"))
            .unwrap();
        match outcome {
            StageInsert::AlreadyExists(existing) => assert_eq!(existing.id, first.id),
            StageInsert::Created(_) => panic!("expected already-exists"),
        }
        assert!(!repo.live_filename_exists(1, "run1_pcr.retry.fasta").unwrap());

        // same key and the same output name resolves through the file
        // insert conflict instead
        let outcome = repo
            .record_pcr_result(1, new_pcr(&primer, &reference, "run1", "run1_pcr.fasta"))
            .unwrap();
        assert!(!outcome.is_created());
    }

    #[test]
    fn test_record_pcr_unrelated_filename_collision_is_duplicate() {
        let repo = repo();
        let primer = seed_file(&repo, 1, "primer.fasta", FileCategory::Primer);
        let reference = seed_file(&repo, 1, "genome.fasta", FileCategory::Genomic);
        seed_file(&repo, 1, "amp.fasta", FileCategory::Genomic);

        let err = repo
            .record_pcr_result(1, new_pcr(&primer, &reference, "runx", "amp.fasta"))
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate { .. }));
        assert!(repo
            .find_pcr_analysis_by_key(1, primer.id, reference.id, "runx", 30)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_record_fastq_creates_both_output_files() {
        let repo = repo();
        let pcr = seed_file(&repo, 1, "run1_pcr.fasta", FileCategory::Pcr);

        let analysis = repo
            .record_fastq_result(
                1,
                new_fastq(&pcr, "s1", "exp1", 100, "s1_R1.fastq.gz", "s1_R2.fastq.gz"),
            )
            .unwrap()
            .into_inner();

        for (file_id, name) in [
            (analysis.r1_file_id, "s1_R1.fastq.gz"),
            (analysis.r2_file_id, "s1_R2.fastq.gz"),
        ] {
            let file = repo.get_file(file_id).unwrap().unwrap();
            assert!(file.is_live());
            assert_eq!(file.category, FileCategory::Fastq);
            assert_eq!(file.filename, name);
        }

        let found = repo
            .find_fastq_analysis_by_key(1, pcr.id, "s1", "exp1", 100)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, analysis.id);
    }

    #[test]
    fn test_record_fastq_race_loser_rolls_back_files() {
        let repo = repo();
        let pcr = seed_file(&repo, 1, "run1_pcr.fasta", FileCategory::Pcr);
        let first = repo
            .record_fastq_result(
                1,
                new_fastq(&pcr, "s1", "exp1", 100, "s1_R1.fastq.gz", "s1_R2.fastq.gz"),
            )
            .unwrap()
            .into_inner();

        let outcome = repo
            .record_fastq_result(
                1,
                new_fastq(&pcr, "s1", "exp1", 100, "other_R1.fastq.gz", "other_R2.fastq.gz"),
            )
            .unwrap();
        match outcome {
            StageInsert::AlreadyExists(existing) => assert_eq!(existing.id, first.id),
            StageInsert::Created(_) => panic!("expected already-exists"),
        }
        assert!(!repo.live_filename_exists(1, "other_R1.fastq.gz").unwrap());
        assert!(!repo.live_filename_exists(1, "other_R2.fastq.gz").unwrap());
    }

    #[test]
    fn test_fastq_cascade_tombstones_analysis_and_both_outputs() {
        let repo = repo();
        let pcr = seed_file(&repo, 1, "run1_pcr.fasta", FileCategory::Pcr);
        let analysis = repo
            .record_fastq_result(
                1,
                new_fastq(&pcr, "s1", "exp1", 100, "s1_R1.fastq.gz", "s1_R2.fastq.gz"),
            )
            .unwrap()
            .into_inner();

        let outcome = repo
            .soft_delete_fastq_cascade(1, analysis.id)
            .unwrap()
            .unwrap();
        assert_eq!(outcome.locators.len(), 2);
        assert!(outcome.analysis.deleted_at.is_some());

        assert!(repo.find_live_fastq_analysis(1, analysis.id).unwrap().is_none());
        for file_id in [analysis.r1_file_id, analysis.r2_file_id] {
            let file = repo.get_file(file_id).unwrap().unwrap();
            assert!(!file.is_live());
            assert_eq!(file.delete_reason, Some(DeleteReason::User));
        }

        // already deleted means not found
        assert!(repo.soft_delete_fastq_cascade(1, analysis.id).unwrap().is_none());
    }

    #[test]
    fn test_fastq_cascade_enforces_ownership() {
        let repo = repo();
        let pcr = seed_file(&repo, 1, "run1_pcr.fasta", FileCategory::Pcr);
        let analysis = repo
            .record_fastq_result(
                1,
                new_fastq(&pcr, "s1", "exp1", 100, "s1_R1.fastq.gz", "s1_R2.fastq.gz"),
            )
            .unwrap()
            .into_inner();

        assert!(repo.soft_delete_fastq_cascade(2, analysis.id).unwrap().is_none());
        assert!(repo.find_live_fastq_analysis(1, analysis.id).unwrap().is_some());
    }

    #[test]
    fn test_fastq_key_frees_after_cascade() {
        let repo = repo();
        let pcr = seed_file(&repo, 1, "run1_pcr.fasta", FileCategory::Pcr);
        let first = repo
            .record_fastq_result(
                1,
                new_fastq(&pcr, "s1", "exp1", 100, "s1_R1.fastq.gz", "s1_R2.fastq.gz"),
            )
            .unwrap()
            .into_inner();
        repo.soft_delete_fastq_cascade(1, first.id).unwrap().unwrap();

        // identical parameters run again after deletion, including the
        // output filenames the tombstones released
        let second = repo
            .record_fastq_result(
                1,
                new_fastq(&pcr, "s1", "exp1", 100, "s1_R1.fastq.gz", "s1_R2.fastq.gz"),
            )
            .unwrap();
        assert!(second.is_created());
        assert_ne!(second.into_inner().id, first.id);
    }

    #[test]
    fn test_list_fastq_analyses_marks_deleted_file_references() {
        let repo = repo();
        let pcr = seed_file(&repo, 1, "run1_pcr.fasta", FileCategory::Pcr);
        let analysis = repo
            .record_fastq_result(
                1,
                new_fastq(&pcr, "s1", "exp1", 100, "s1_R1.fastq.gz", "s1_R2.fastq.gz"),
            )
            .unwrap()
            .into_inner();

        repo.soft_delete_file(pcr.id, DeleteReason::User).unwrap();

        let rows = repo.list_fastq_analyses(1).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pcr_file.display_name, "run1_pcr.fasta (Deleted)");
        assert!(rows[0].pcr_file.deleted);
        assert_eq!(rows[0].r1_file.display_name, "s1_R1.fastq.gz");
        assert!(!rows[0].r1_file.deleted);

        repo.soft_delete_fastq_cascade(1, analysis.id).unwrap();
        assert!(repo.list_fastq_analyses(1).unwrap().is_empty());
    }

    #[test]
    fn test_list_fasta_analyses_newest_first_with_deleted_marker() {
        let repo = repo();
        let a = seed_file(&repo, 1, "a.fasta", FileCategory::Genomic);
        let b = seed_file(&repo, 1, "b.fasta", FileCategory::Genomic);
        repo.upsert_fasta_analysis(1, a.id, "Found 1 sequences.").unwrap();
        repo.upsert_fasta_analysis(1, b.id, "Found 2 sequences.").unwrap();

        let other = seed_file(&repo, 2, "other.fasta", FileCategory::Genomic);
        repo.upsert_fasta_analysis(2, other.id, "Found 9 sequences.").unwrap();

        repo.soft_delete_file(a.id, DeleteReason::User).unwrap();

        let rows = repo.list_fasta_analyses(1).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].filename, "b.fasta");
        assert_eq!(rows[1].filename, "a.fasta (Deleted)");
        assert_eq!(rows[1].result, "Found 1 sequences.");
    }

    #[test]
    fn test_fasta_files_with_provenance_attaches_runs_and_summary() {
        let repo = repo();
        let primer = seed_file(&repo, 1, "primer.fasta", FileCategory::Primer);
        let reference = seed_file(&repo, 1, "genome.fasta", FileCategory::Genomic);
        repo.upsert_fasta_analysis(1, reference.id, "Found 12 sequences.")
            .unwrap();
        let analysis = repo
            .record_pcr_result(1, new_pcr(&primer, &reference, "exp1", "exp1_pcr.fasta"))
            .unwrap()
            .into_inner();

        let views = repo.fasta_files_with_provenance(1).unwrap();
        assert_eq!(views.len(), 2);

        let genome = views.iter().find(|v| v.filename == "genome.fasta").unwrap();
        assert_eq!(genome.analysis_result.as_deref(), Some("Found 12 sequences."));
        assert_eq!(genome.pcr_runs.len(), 1);
        assert_eq!(genome.pcr_runs[0].role, PcrRole::Reference);
        assert_eq!(genome.pcr_runs[0].output_filename, "exp1_pcr.fasta");
        assert_eq!(genome.pcr_runs[0].id, analysis.id);

        let primer_view = views.iter().find(|v| v.filename == "primer.fasta").unwrap();
        assert!(primer_view.analysis_result.is_none());
        assert_eq!(primer_view.pcr_runs[0].role, PcrRole::Primer);
    }
}
