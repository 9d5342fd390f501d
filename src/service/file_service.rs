//! Upload, download and listing operations over stored files
//!
//! Uploads are written to the blob store before the catalog row is
//! inserted, and the object is removed again if the insert loses a
//! name or quota race. Downloads probe the backing object first so a
//! row whose object has drifted away is tombstoned instead of handing
//! out a dead link.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::blob::{probe_locator, BlobError, BlobStore, BlobUri, Locator, ProbeOutcome};
use crate::config::AppConfig;
use crate::db::{
    ArtifactRepository, DeleteReason, FastaAnalysisView, FastaFileView, FastqAnalysisView,
    FileCategory, FileListing, FileRecord, MAX_SEQUENCE_FILES,
};
use crate::error::{Error, Result};

/// File extensions never accepted on upload
const DISALLOWED_EXTENSIONS: [&str; 4] = [".exe", ".sh", ".js", ".bat"];

pub struct FileService {
    repository: Arc<ArtifactRepository>,
    blob_store: Arc<dyn BlobStore>,
    bucket: String,
    presign_expiry_secs: u64,
    probe_timeout: Duration,
    max_upload_bytes: usize,
}

impl FileService {
    pub fn new(
        repository: Arc<ArtifactRepository>,
        blob_store: Arc<dyn BlobStore>,
        config: &AppConfig,
    ) -> Self {
        Self {
            repository,
            blob_store,
            bucket: config.blob.bucket.clone(),
            presign_expiry_secs: config.blob.presign_expiry_secs,
            probe_timeout: Duration::from_secs(config.reconcile.probe_timeout_secs),
            max_upload_bytes: config.server.max_payload_size as usize,
        }
    }

    /// Store an uploaded file under `{user}/{category}/{normalized name}`
    /// and insert its catalog row.
    pub async fn upload(
        &self,
        user_id: i64,
        raw_category: &str,
        raw_filename: &str,
        data: &[u8],
    ) -> Result<FileRecord> {
        let category = raw_category
            .parse::<FileCategory>()
            .ok()
            .filter(|c| c.is_uploadable())
            .ok_or_else(|| Error::Validation {
                message: "Invalid category. Use 'genomic' or 'primer'".to_string(),
            })?;

        let filename = normalize_filename(raw_filename);
        if filename.is_empty() {
            return Err(Error::Validation {
                message: "filename must not be empty".to_string(),
            });
        }
        if DISALLOWED_EXTENSIONS.iter().any(|ext| filename.ends_with(ext)) {
            return Err(Error::Validation {
                message: "Disallowed file type".to_string(),
            });
        }
        if data.is_empty() {
            return Err(Error::Validation {
                message: "No file uploaded".to_string(),
            });
        }
        if data.len() > self.max_upload_bytes {
            return Err(Error::Validation {
                message: "File too large. Max size is 10MB.".to_string(),
            });
        }

        // cheap prechecks before any object is written; the insert below
        // re-checks both under the transaction
        if self.repository.live_filename_exists(user_id, &filename)? {
            return Err(Error::Duplicate {
                entity: "File",
                name: filename,
            });
        }
        if category.counts_against_quota()
            && self.repository.count_live_sequence_files(user_id)? >= MAX_SEQUENCE_FILES
        {
            return Err(Error::QuotaExceeded {
                limit: MAX_SEQUENCE_FILES,
            });
        }

        let key = format!("{}/{}/{}", user_id, category.as_str(), filename);
        let uri = BlobUri::new(&self.bucket, &key);
        match self.blob_store.put_if_absent(&uri, data).await {
            Ok(()) => {}
            Err(BlobError::AlreadyExists) => {
                return Err(Error::Duplicate {
                    entity: "File",
                    name: filename,
                });
            }
            Err(e) => return Err(e.into()),
        }

        let locator = uri.to_string();
        match self
            .repository
            .create_file(user_id, &filename, category, &locator)
        {
            Ok(file) => {
                info!(
                    "Stored {} upload {} ({} bytes) for user {}",
                    category.as_str(),
                    filename,
                    data.len(),
                    user_id
                );
                Ok(file)
            }
            Err(e) => {
                // the insert lost a race; do not leave the object behind
                if let Err(cleanup) = self.blob_store.delete(&uri).await {
                    warn!("Could not remove {} after failed insert: {}", locator, cleanup);
                }
                Err(e)
            }
        }
    }

    /// Resolve a download URL for an owned live file. The backing object is
    /// probed first: a confirmed-missing object tombstones the row and the
    /// download reports gone rather than serving a dead link.
    pub async fn download_url(&self, user_id: i64, file_id: i64) -> Result<String> {
        let file = self
            .repository
            .find_live_file(user_id, file_id)?
            .ok_or(Error::NotFound)?;

        match probe_locator(self.blob_store.as_ref(), &file.locator, self.probe_timeout).await {
            ProbeOutcome::Exists => match Locator::parse(&file.locator) {
                Ok(Locator::Uri(uri)) => Ok(self.blob_store.presign_get(
                    &uri,
                    self.presign_expiry_secs,
                    &file.filename,
                )),
                // rows that predate the blob store carry a bare path
                Ok(Locator::LegacyPath(path)) => Ok(path),
                Err(e) => Err(Error::BlobUnavailable {
                    message: e.to_string(),
                }),
            },
            ProbeOutcome::Missing => {
                warn!(
                    "Backing object for file {} ({}) is gone, tombstoning",
                    file.id, file.locator
                );
                self.repository
                    .soft_delete_file(file.id, DeleteReason::Missing)?;
                Err(Error::Gone)
            }
            ProbeOutcome::Ambiguous(message) => Err(Error::BlobUnavailable { message }),
        }
    }

    pub fn list_files(&self, user_id: i64) -> Result<FileListing> {
        self.repository.list_files_grouped(user_id)
    }

    pub fn fasta_files(&self, user_id: i64) -> Result<Vec<FastaFileView>> {
        self.repository.fasta_files_with_provenance(user_id)
    }

    pub fn fasta_analyses(&self, user_id: i64) -> Result<Vec<FastaAnalysisView>> {
        self.repository.list_fasta_analyses(user_id)
    }

    pub fn fastq_analyses(&self, user_id: i64) -> Result<Vec<FastqAnalysisView>> {
        self.repository.list_fastq_analyses(user_id)
    }
}

/// Normalize an uploaded filename: basename only, lowercased, runs of
/// whitespace collapsed to one underscore, anything outside
/// `[a-z0-9._-]` replaced with an underscore.
pub(crate) fn normalize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let mut out = String::with_capacity(base.len());
    let mut pending_gap = false;
    for c in base.to_lowercase().chars() {
        if c.is_whitespace() {
            pending_gap = true;
            continue;
        }
        if pending_gap {
            out.push('_');
            pending_gap = false;
        }
        out.push(match c {
            'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        });
    }
    if pending_gap {
        out.push('_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::mock_store::MockBlobStore;

    fn fixture() -> (FileService, Arc<ArtifactRepository>, MockBlobStore) {
        fixture_with(AppConfig::default())
    }

    fn fixture_with(config: AppConfig) -> (FileService, Arc<ArtifactRepository>, MockBlobStore) {
        let repository = Arc::new(ArtifactRepository::open_in_memory().unwrap());
        let mock = MockBlobStore::new();
        let service = FileService::new(Arc::clone(&repository), Arc::new(mock.clone()), &config);
        (service, repository, mock)
    }

    #[test]
    fn test_normalize_filename_rules() {
        assert_eq!(
            normalize_filename("My Genome (v2).FASTA"),
            "my_genome__v2_.fasta"
        );
        assert_eq!(normalize_filename("path/to/reads.fa"), "reads.fa");
        assert_eq!(normalize_filename("C:\\uploads\\reads.fa"), "reads.fa");
        assert_eq!(normalize_filename("tabs\tand  spaces.fa"), "tabs_and_spaces.fa");
        assert_eq!(normalize_filename("plain.fasta"), "plain.fasta");
        assert_eq!(normalize_filename(""), "");
    }

    #[tokio::test]
    async fn test_upload_stores_object_and_row() {
        let (service, _repository, mock) = fixture();

        let file = service
            .upload(1, "genomic", "Genome One.FASTA", b">seq1\nACGT\n")
            .await
            .unwrap();
        assert_eq!(file.filename, "genome_one.fasta");
        assert_eq!(file.category, FileCategory::Genomic);
        assert_eq!(
            file.locator,
            "vault://seqvault-userdata/1/genomic/genome_one.fasta"
        );
        assert!(mock.contains("seqvault-userdata", "1/genomic/genome_one.fasta"));
    }

    #[tokio::test]
    async fn test_upload_rejects_unuploadable_categories() {
        let (service, _repository, mock) = fixture();

        for category in ["fastq", "pcr", "weird"] {
            let err = service
                .upload(1, category, "reads.fasta", b"data")
                .await
                .unwrap_err();
            match err {
                Error::Validation { message } => {
                    assert_eq!(message, "Invalid category. Use 'genomic' or 'primer'")
                }
                other => panic!("unexpected error: {:?}", other),
            }
        }
        assert_eq!(mock.object_count(), 0);
    }

    #[tokio::test]
    async fn test_upload_rejects_disallowed_extensions() {
        let (service, _repository, mock) = fixture();

        for name in ["payload.EXE", "run.sh", "inject.js", "old.bat"] {
            let err = service.upload(1, "genomic", name, b"data").await.unwrap_err();
            match err {
                Error::Validation { message } => assert_eq!(message, "Disallowed file type"),
                other => panic!("unexpected error: {:?}", other),
            }
        }
        assert_eq!(mock.object_count(), 0);
    }

    #[tokio::test]
    async fn test_upload_rejects_empty_body() {
        let (service, _repository, _mock) = fixture();

        let err = service.upload(1, "genomic", "reads.fasta", b"").await.unwrap_err();
        match err {
            Error::Validation { message } => assert_eq!(message, "No file uploaded"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upload_rejects_oversized_body() {
        let mut config = AppConfig::default();
        config.server.max_payload_size = 16;
        let (service, _repository, mock) = fixture_with(config);

        let err = service
            .upload(1, "genomic", "reads.fasta", &[b'A'; 17])
            .await
            .unwrap_err();
        match err {
            Error::Validation { message } => {
                assert_eq!(message, "File too large. Max size is 10MB.")
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(mock.object_count(), 0);
    }

    #[tokio::test]
    async fn test_upload_duplicate_name_is_rejected() {
        let (service, _repository, mock) = fixture();

        service.upload(1, "genomic", "reads.fasta", b"one").await.unwrap();
        let err = service
            .upload(1, "genomic", "reads.fasta", b"two")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "File reads.fasta already exists");
        assert_eq!(mock.object_count(), 1);
    }

    #[tokio::test]
    async fn test_upload_enforces_sequence_file_quota() {
        let (service, _repository, _mock) = fixture();

        for i in 0..MAX_SEQUENCE_FILES {
            service
                .upload(1, "genomic", &format!("reads_{}.fasta", i), b"data")
                .await
                .unwrap();
        }
        let err = service
            .upload(1, "primer", "one_more.fasta", b"data")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { limit: 6 }));
    }

    #[tokio::test]
    async fn test_download_presigns_live_file() {
        let (service, _repository, _mock) = fixture();

        let file = service
            .upload(1, "genomic", "reads.fasta", b">seq1\nACGT\n")
            .await
            .unwrap();
        let url = service.download_url(1, file.id).await.unwrap();
        assert!(url.starts_with("http://mock.local/blobs/seqvault-userdata/1/genomic/reads.fasta?"));
        assert!(url.contains("signature="));
        assert!(url.contains("filename=reads.fasta"));
    }

    #[tokio::test]
    async fn test_download_of_drifted_object_tombstones_row() {
        let (service, repository, _mock) = fixture();

        // row whose object was never written, as if it vanished out of band
        let file = repository
            .create_file(
                1,
                "ghost.fasta",
                FileCategory::Genomic,
                "vault://seqvault-userdata/1/genomic/ghost.fasta",
            )
            .unwrap();

        let err = service.download_url(1, file.id).await.unwrap_err();
        assert!(matches!(err, Error::Gone));

        let row = repository.get_file(file.id).unwrap().unwrap();
        assert_eq!(row.delete_reason, Some(DeleteReason::Missing));
        assert!(repository.find_live_file(1, file.id).unwrap().is_none());

        // a second request no longer sees the row at all
        let err = service.download_url(1, file.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[tokio::test]
    async fn test_download_legacy_row_returns_raw_path() {
        let (service, repository, _mock) = fixture();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old_reads.fasta");
        std::fs::write(&path, b">seq1\nACGT\n").unwrap();
        let file = repository
            .create_file(1, "old_reads.fasta", FileCategory::Genomic, path.to_str().unwrap())
            .unwrap();

        let url = service.download_url(1, file.id).await.unwrap();
        assert_eq!(url, path.to_str().unwrap());
    }

    #[tokio::test]
    async fn test_download_with_unanswerable_probe_is_unavailable() {
        let (service, repository, mock) = fixture();

        let file = service
            .upload(1, "genomic", "reads.fasta", b"data")
            .await
            .unwrap();
        mock.set_probe_fault(
            "seqvault-userdata",
            "1/genomic/reads.fasta",
            crate::blob::mock_store::ProbeFault::Transient,
        );

        let err = service.download_url(1, file.id).await.unwrap_err();
        assert!(matches!(err, Error::BlobUnavailable { .. }));
        // an unanswerable probe must never tombstone
        assert!(repository.find_live_file(1, file.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_download_foreign_file_is_not_found() {
        let (service, _repository, _mock) = fixture();

        let file = service
            .upload(1, "genomic", "reads.fasta", b"data")
            .await
            .unwrap();
        let err = service.download_url(2, file.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }
}
