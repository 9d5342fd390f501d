//! Application state wiring
//!
//! Builds the repository, blob store and services from configuration and
//! hands them to the HTTP layer as one shared state value.

use std::sync::Arc;

use log::info;

use crate::blob::{local_store::LocalFsBlobStore, mock_store::MockBlobStore, BlobStore};
use crate::config::{AppConfig, BlobBackend, DatabaseBackend};
use crate::db::ArtifactRepository;
use crate::error::Result;
use crate::pipeline::StageRunner;
use crate::service::{DeletionService, FileService, ReconcileWorker};

/// Shared state for the HTTP layer
#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<ArtifactRepository>,
    pub blob_store: Arc<dyn BlobStore>,
    pub file_service: Arc<FileService>,
    pub stage_runner: Arc<StageRunner>,
    pub deletion_service: Arc<DeletionService>,
    pub reconcile_worker: Arc<ReconcileWorker>,
    pub config: AppConfig,
}

impl AppState {
    /// Build application state from configuration
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let blob_store: Arc<dyn BlobStore> = match config.blob.backend {
            BlobBackend::LocalFs => {
                info!(
                    "Using local filesystem blob backend with base_path: {}, bucket: {}",
                    config.blob.base_path, config.blob.bucket
                );
                Arc::new(LocalFsBlobStore::new(&config.blob))
            }
            BlobBackend::Mock => {
                info!("Using mock blob backend");
                Arc::new(MockBlobStore::new())
            }
        };

        let repository = match config.database.backend {
            DatabaseBackend::SQLite => {
                info!(
                    "Using SQLite catalog at {} (wal_mode: {})",
                    config.database.db_path, config.database.wal_mode
                );
                Arc::new(ArtifactRepository::open(&config.database)?)
            }
            DatabaseBackend::Memory => {
                info!("Using in-memory catalog");
                Arc::new(ArtifactRepository::open_in_memory()?)
            }
        };

        let file_service = Arc::new(FileService::new(
            Arc::clone(&repository),
            Arc::clone(&blob_store),
            &config,
        ));
        let stage_runner = Arc::new(StageRunner::new(
            Arc::clone(&repository),
            Arc::clone(&blob_store),
            &config.pipeline,
            &config.blob,
        ));
        let deletion_service = Arc::new(DeletionService::new(
            Arc::clone(&repository),
            Arc::clone(&blob_store),
        ));
        let reconcile_worker = Arc::new(ReconcileWorker::new(
            Arc::clone(&repository),
            Arc::clone(&blob_store),
            &config.reconcile,
        ));

        info!("Application state initialized successfully");
        Ok(Self {
            repository,
            blob_store,
            file_service,
            stage_runner,
            deletion_service,
            reconcile_worker,
            config,
        })
    }

    /// State for tests: forces the in-memory catalog and mock blob store
    /// onto the given configuration
    pub fn new_for_testing(mut config: AppConfig) -> Self {
        config.database.backend = DatabaseBackend::Memory;
        config.blob.backend = BlobBackend::Mock;
        // the mock presigns with a fixed URL base and secret; signature
        // verification has to use the same values
        config.blob.public_url = "http://mock.local/blobs".to_string();
        config.blob.signing_secret = "mock-secret".to_string();
        Self::from_config(config).expect("in-memory state initializes")
    }
}
