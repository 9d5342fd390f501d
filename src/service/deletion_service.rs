//! User-initiated deletion of files and FASTQ analyses
//!
//! Single-file deletion removes the backing object before tombstoning
//! the row, so a failed removal leaves the row live and the request
//! retryable. Analysis deletion inverts the order: the cascade
//! tombstones the analysis with both output rows in one transaction,
//! then object cleanup runs best-effort and anything left behind is
//! the sweeper's problem.

use std::sync::Arc;

use log::{info, warn};

use crate::blob::{BlobStore, BlobUri, Locator};
use crate::db::{ArtifactRepository, DeleteReason};
use crate::error::{Error, Result};

pub struct DeletionService {
    repository: Arc<ArtifactRepository>,
    blob_store: Arc<dyn BlobStore>,
}

impl DeletionService {
    pub fn new(repository: Arc<ArtifactRepository>, blob_store: Arc<dyn BlobStore>) -> Self {
        Self {
            repository,
            blob_store,
        }
    }

    /// Delete an owned live file: backing object first, then the tombstone.
    pub async fn delete_file(&self, user_id: i64, file_id: i64) -> Result<()> {
        let file = self
            .repository
            .find_live_file(user_id, file_id)?
            .ok_or(Error::NotFound)?;

        match Locator::parse(&file.locator) {
            Ok(Locator::Uri(uri)) => {
                self.blob_store
                    .delete(&uri)
                    .await
                    .map_err(|e| Error::BlobUnavailable {
                        message: format!("could not delete {}: {}", file.locator, e),
                    })?;
            }
            Ok(Locator::LegacyPath(path)) => {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(Error::BlobUnavailable {
                            message: format!("could not delete {}: {}", path, e),
                        });
                    }
                }
            }
            Err(e) => {
                // nothing physical can be addressed; let the row go
                warn!(
                    "File {} has unparseable locator {}: {}",
                    file.id, file.locator, e
                );
            }
        }

        self.repository.soft_delete_file(file.id, DeleteReason::User)?;
        info!(
            "Deleted file {} ({}) for user {}",
            file.id, file.filename, user_id
        );
        Ok(())
    }

    /// Delete an owned FASTQ analysis together with both generated files.
    pub async fn delete_fastq_analysis(&self, user_id: i64, analysis_id: i64) -> Result<()> {
        let outcome = self
            .repository
            .soft_delete_fastq_cascade(user_id, analysis_id)?
            .ok_or(Error::NotFound)?;

        let mut uris = Vec::new();
        for locator in &outcome.locators {
            match Locator::parse(locator) {
                Ok(Locator::Uri(uri)) => uris.push(uri),
                Ok(Locator::LegacyPath(path)) => {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!("Could not remove {}: {}", path, e);
                        }
                    }
                }
                Err(e) => warn!("Skipping unparseable locator {}: {}", locator, e),
            }
        }
        self.delete_uris_best_effort(&uris).await;

        info!(
            "Deleted FASTQ analysis {} for user {} ({} objects released)",
            analysis_id,
            user_id,
            outcome.locators.len()
        );
        Ok(())
    }

    /// Batch-delete with per-key fallback. Cleanup here is advisory: the
    /// rows are already tombstoned and the sweeper owns anything left
    /// behind.
    async fn delete_uris_best_effort(&self, uris: &[BlobUri]) {
        for chunk in uris.chunks(self.blob_store.max_batch().max(1)) {
            let failed: Vec<BlobUri> = match self.blob_store.delete_batch(chunk).await {
                Ok(report) => {
                    for (uri, reason) in &report.failed {
                        warn!("Batch delete left {} behind: {}", uri, reason);
                    }
                    report.failed.into_iter().map(|(uri, _)| uri).collect()
                }
                Err(e) => {
                    warn!("Batch delete of {} objects failed: {}", chunk.len(), e);
                    chunk.to_vec()
                }
            };
            for uri in failed {
                if let Err(e) = self.blob_store.delete(&uri).await {
                    warn!("Could not delete {}: {}", uri, e);
                }
            }
        }
    }
}
