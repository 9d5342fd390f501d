//! Artifact Repository
//!
//! This module owns the metadata store for files and pipeline analyses,
//! backed by SQLite. Uniqueness rules that matter for correctness (live
//! filename dedup, stage idempotency keys) live in the schema itself as
//! UNIQUE indexes; application-level checks are early exits only, and the
//! database is the final arbiter when concurrent writers race.
//!
//! Files are never hard-deleted. A deletion flips `deleted_at` and
//! `delete_reason` and rewrites the filename to a tombstoned form that
//! embeds the original name and the deletion time, which frees the name
//! for reuse while preserving a forensic trace.

mod files;
mod analyses;

pub use analyses::{
    CascadeOutcome, FastaAnalysisView, FastqAnalysisView, FastqFileRef, NewFastqResult,
    NewPcrResult, NewStageFile, StageInsert,
};
pub use files::{FastaFileView, FileListing, FileSummary, PcrRole, PcrRunView};

use chrono::{DateTime, SecondsFormat, Utc};
use log::info;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// Maximum live genomic + primer files a user may hold
pub const MAX_SEQUENCE_FILES: usize = 6;

/// Category of a stored file, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Genomic,
    Primer,
    Pcr,
    Fastq,
}

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileCategory::Genomic => "genomic",
            FileCategory::Primer => "primer",
            FileCategory::Pcr => "pcr",
            FileCategory::Fastq => "fastq",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "genomic" => Some(FileCategory::Genomic),
            "primer" => Some(FileCategory::Primer),
            "pcr" => Some(FileCategory::Pcr),
            "fastq" => Some(FileCategory::Fastq),
            _ => None,
        }
    }

    /// Categories whose payload is FASTA-formatted text
    pub fn is_fasta(&self) -> bool {
        !matches!(self, FileCategory::Fastq)
    }

    /// Categories a user may upload directly
    pub fn is_uploadable(&self) -> bool {
        matches!(self, FileCategory::Genomic | FileCategory::Primer)
    }

    /// Categories counted against the sequence file quota
    pub fn counts_against_quota(&self) -> bool {
        self.is_uploadable()
    }
}

impl std::str::FromStr for FileCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(&s.to_lowercase()).ok_or_else(|| format!("Unknown file category: {}", s))
    }
}

/// Why a file was tombstoned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteReason {
    /// Explicit user request
    User,
    /// Backing object found missing on the download path
    Missing,
    /// Backing object found missing by the background sweep
    Lifecycle,
}

impl DeleteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteReason::User => "user",
            DeleteReason::Missing => "missing",
            DeleteReason::Lifecycle => "lifecycle",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(DeleteReason::User),
            "missing" => Some(DeleteReason::Missing),
            "lifecycle" => Some(DeleteReason::Lifecycle),
            _ => None,
        }
    }
}

/// A stored file row
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub user_id: i64,
    pub filename: String,
    pub category: FileCategory,
    pub locator: String,
    pub uploaded_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub delete_reason: Option<DeleteReason>,
}

impl FileRecord {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// One sequence-count result per FASTA file, refreshed on re-run
#[derive(Debug, Clone, Serialize)]
pub struct FastaAnalysis {
    pub id: i64,
    pub user_id: i64,
    pub fasta_file_id: i64,
    pub result: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A recorded PCR run; immutable once written
#[derive(Debug, Clone, Serialize)]
pub struct PcrAnalysis {
    pub id: i64,
    pub user_id: i64,
    pub primer_file_id: i64,
    pub reference_file_id: i64,
    pub name: String,
    pub cycle_count: i64,
    pub output_file_id: i64,
    pub primer_filename: String,
    pub reference_filename: String,
    pub output_filename: String,
    pub result: String,
    pub created_at: DateTime<Utc>,
}

/// A recorded FASTQ generation run with its two output files
#[derive(Debug, Clone, Serialize)]
pub struct FastqAnalysis {
    pub id: i64,
    pub user_id: i64,
    pub pcr_file_id: i64,
    pub analysis_name: String,
    pub sample_name: String,
    pub sequence_count: i64,
    pub r1_file_id: i64,
    pub r2_file_id: i64,
    pub pcr_filename: String,
    pub r1_filename: String,
    pub r2_filename: String,
    pub result: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    filename TEXT NOT NULL,
    category TEXT NOT NULL,
    locator TEXT NOT NULL,
    uploaded_at TEXT NOT NULL,
    deleted_at TEXT,
    delete_reason TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_files_live_filename
    ON files(user_id, filename) WHERE deleted_at IS NULL;

CREATE INDEX IF NOT EXISTS idx_files_user_category
    ON files(user_id, category);

CREATE TABLE IF NOT EXISTS fasta_analyses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    fasta_file_id INTEGER NOT NULL REFERENCES files(id),
    result TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(user_id, fasta_file_id)
);

CREATE TABLE IF NOT EXISTS pcr_analyses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    primer_file_id INTEGER NOT NULL REFERENCES files(id),
    reference_file_id INTEGER NOT NULL REFERENCES files(id),
    name TEXT NOT NULL,
    cycle_count INTEGER NOT NULL,
    output_file_id INTEGER NOT NULL REFERENCES files(id),
    primer_filename TEXT NOT NULL,
    reference_filename TEXT NOT NULL,
    output_filename TEXT NOT NULL,
    result TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(user_id, primer_file_id, reference_file_id, name, cycle_count)
);

CREATE TABLE IF NOT EXISTS fastq_analyses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    pcr_file_id INTEGER NOT NULL REFERENCES files(id),
    analysis_name TEXT NOT NULL,
    sample_name TEXT NOT NULL,
    sequence_count INTEGER NOT NULL,
    r1_file_id INTEGER NOT NULL REFERENCES files(id),
    r2_file_id INTEGER NOT NULL REFERENCES files(id),
    pcr_filename TEXT NOT NULL,
    r1_filename TEXT NOT NULL,
    r2_filename TEXT NOT NULL,
    result TEXT NOT NULL,
    created_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_fastq_live_key
    ON fastq_analyses(user_id, sample_name, analysis_name, sequence_count, pcr_file_id)
    WHERE deleted_at IS NULL;
";

/// SQLite-backed metadata store for files and pipeline analyses
pub struct ArtifactRepository {
    conn: Mutex<Connection>,
}

impl ArtifactRepository {
    /// Open a repository from configuration, creating the schema if needed
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| Error::Storage {
                    message: format!("failed to create database directory: {}", e),
                })?;
            }
        }
        let conn = Connection::open(&config.db_path)?;
        if config.wal_mode {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        info!("Opened artifact repository at {}", config.db_path);
        Self::initialize(conn)
    }

    /// Open an in-memory repository, used by tests and the Memory backend
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

/// True when the error is a UNIQUE constraint violation
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Fixed-width RFC 3339 representation, so TEXT comparison orders by time
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time truncated to the precision the store keeps
pub(crate) fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    now - chrono::Duration::nanoseconds(i64::from(now.timestamp_subsec_nanos() % 1000))
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

pub(crate) fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match raw {
        Some(s) => parse_ts(idx, &s).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn file_category_err(idx: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unknown file category: {}", raw).into(),
    )
}
