//! Local filesystem blob store
//!
//! Objects live at `{base_path}/{bucket}/{key}`. Conditional creation uses
//! `create_new`, so the filesystem itself arbitrates concurrent uploads of
//! the same key.

use async_trait::async_trait;
use log::info;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::blob::{presigned_url, BatchDeleteReport, BlobError, BlobStore, BlobUri};
use crate::config::BlobConfig;

pub struct LocalFsBlobStore {
    base_path: PathBuf,
    public_url: String,
    signing_secret: String,
}

impl LocalFsBlobStore {
    pub fn new(config: &BlobConfig) -> Self {
        let base_path = PathBuf::from(&config.base_path);
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path).expect("Failed to create blob storage directory");
        }
        info!("Using local blob store at {}", base_path.display());
        Self {
            base_path,
            public_url: config.public_url.clone(),
            signing_secret: config.signing_secret.clone(),
        }
    }

    /// Resolve an object path. Keys come from normalized filenames, but a
    /// stored locator is never trusted enough to walk out of the base
    /// directory.
    fn object_path(&self, uri: &BlobUri) -> Result<PathBuf, BlobError> {
        let traversal = uri.bucket == ".."
            || uri.key.starts_with('/')
            || uri.key.split('/').any(|segment| segment == "..");
        if traversal {
            return Err(BlobError::InvalidLocator(uri.to_string()));
        }
        Ok(self.base_path.join(&uri.bucket).join(&uri.key))
    }
}

#[async_trait]
impl BlobStore for LocalFsBlobStore {
    async fn put_if_absent(&self, uri: &BlobUri, data: &[u8]) -> Result<(), BlobError> {
        let path = self.object_path(uri)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(BlobError::AlreadyExists)
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(data).await?;
        file.flush().await?;
        info!("Stored {} ({} bytes)", uri, data.len());
        Ok(())
    }

    async fn get(&self, uri: &BlobUri) -> Result<Vec<u8>, BlobError> {
        let path = self.object_path(uri)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BlobError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn head(&self, uri: &BlobUri) -> Result<bool, BlobError> {
        let path = self.object_path(uri)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn delete(&self, uri: &BlobUri) -> Result<(), BlobError> {
        let path = self.object_path(uri)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted {}", uri);
                Ok(())
            }
            // absent is success
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_batch(&self, uris: &[BlobUri]) -> Result<BatchDeleteReport, BlobError> {
        if uris.len() > self.max_batch() {
            return Err(BlobError::Backend(format!(
                "batch of {} exceeds per-call limit {}",
                uris.len(),
                self.max_batch()
            )));
        }
        let mut report = BatchDeleteReport::default();
        for uri in uris {
            if let Err(e) = self.delete(uri).await {
                report.failed.push((uri.clone(), e.to_string()));
            }
        }
        Ok(report)
    }

    fn presign_get(&self, uri: &BlobUri, expires_in_secs: u64, download_filename: &str) -> String {
        presigned_url(
            &self.public_url,
            &self.signing_secret,
            uri,
            expires_in_secs,
            download_filename,
        )
    }
}
