//! Domain error taxonomy
//!
//! Services and repositories return these errors; the HTTP layer maps them
//! onto status codes through the `ResponseError` impl. Absent, soft-deleted
//! and foreign-owned records all collapse into `NotFound` so responses never
//! reveal whether another tenant's record exists.

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde_json::json;

use crate::blob::BlobError;

/// Errors surfaced by seqvault services
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request was malformed or failed an upload rule
    #[error("{message}")]
    Validation { message: String },

    /// Record is absent, soft-deleted, or owned by someone else
    #[error("not found or not owned by user")]
    NotFound,

    /// A live record with the same identity already exists
    #[error("{entity} {name} already exists")]
    Duplicate { entity: &'static str, name: String },

    /// Upload would exceed the per-user sequence file limit
    #[error("User already has maximum number of FASTA files ({limit}).")]
    QuotaExceeded { limit: usize },

    /// Collaborator process failed, timed out, or produced malformed output
    #[error("{stage} processing failed: {message}")]
    CollaboratorFailed { stage: String, message: String },

    /// Backing object confirmed missing; the metadata row has been tombstoned
    #[error("backing object is gone")]
    Gone,

    /// Blob store could not be reached or answered ambiguously
    #[error("blob store unavailable: {message}")]
    BlobUnavailable { message: String },

    /// Metadata store failure
    #[error("storage failure: {message}")]
    Storage { message: String },

    /// Blob store failure on a path where it is fatal
    #[error(transparent)]
    Blob(#[from] BlobError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage {
            message: err.to_string(),
        }
    }
}

impl actix_web::ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation { .. } | Error::QuotaExceeded { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::Duplicate { .. } => StatusCode::CONFLICT,
            Error::Gone => StatusCode::GONE,
            Error::CollaboratorFailed { .. } => StatusCode::BAD_GATEWAY,
            Error::BlobUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Storage { .. } | Error::Blob(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
