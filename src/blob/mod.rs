//! Blob Store Client
//!
//! This module provides an abstraction over the object store that holds
//! file payloads, allowing the system to use different storage backends
//! (local filesystem, in-memory mock) without affecting higher-level
//! services. Metadata rows reference objects through locators; everything
//! here operates on locators and raw bytes and knows nothing about files,
//! users or analyses.

pub mod local_store;
pub mod mock_store;

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by blob store backends
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("object already exists")]
    AlreadyExists,
    #[error("object not found")]
    NotFound,
    #[error("invalid locator: {0}")]
    InvalidLocator(String),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Scheme prefix of locators this service writes
pub const URI_SCHEME: &str = "vault://";

/// Parsed `vault://{bucket}/{key}` locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobUri {
    pub bucket: String,
    pub key: String,
}

impl BlobUri {
    pub fn new(bucket: &str, key: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    pub fn parse(locator: &str) -> Result<Self, BlobError> {
        let rest = locator
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| BlobError::InvalidLocator(locator.to_string()))?;
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| BlobError::InvalidLocator(locator.to_string()))?;
        if bucket.is_empty() || key.is_empty() {
            return Err(BlobError::InvalidLocator(locator.to_string()));
        }
        Ok(Self::new(bucket, key))
    }
}

impl std::fmt::Display for BlobUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}/{}", URI_SCHEME, self.bucket, self.key)
    }
}

/// A stored locator. New rows always carry vault URIs; rows migrated from
/// the pre-bucket era carry bare filesystem paths, which are still read and
/// deleted but never created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Uri(BlobUri),
    LegacyPath(String),
}

impl Locator {
    pub fn parse(raw: &str) -> Result<Self, BlobError> {
        if raw.starts_with(URI_SCHEME) {
            return Ok(Locator::Uri(BlobUri::parse(raw)?));
        }
        if raw.is_empty() {
            return Err(BlobError::InvalidLocator(raw.to_string()));
        }
        Ok(Locator::LegacyPath(raw.to_string()))
    }
}

/// Result of a batch delete. An empty report means every key is gone
/// (or already was).
#[derive(Debug, Default)]
pub struct BatchDeleteReport {
    /// Keys the backend could not delete, with its message for each
    pub failed: Vec<(BlobUri, String)>,
}

impl BatchDeleteReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Trait defining the blob storage interface
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write an object only if the key is vacant; fails `AlreadyExists`
    /// when another writer got there first
    async fn put_if_absent(&self, uri: &BlobUri, data: &[u8]) -> Result<(), BlobError>;

    /// Fetch the full object body
    async fn get(&self, uri: &BlobUri) -> Result<Vec<u8>, BlobError>;

    /// Existence check. `Ok(false)` is confirmed absence; an `Err` means
    /// the backend could not answer and says nothing about the object.
    async fn head(&self, uri: &BlobUri) -> Result<bool, BlobError>;

    /// Delete an object. Deleting an absent key succeeds.
    async fn delete(&self, uri: &BlobUri) -> Result<(), BlobError>;

    /// Delete up to `max_batch()` objects in one call, reporting per-key
    /// failures instead of failing the whole batch
    async fn delete_batch(&self, uris: &[BlobUri]) -> Result<BatchDeleteReport, BlobError>;

    /// Largest slice `delete_batch` accepts per call
    fn max_batch(&self) -> usize {
        1000
    }

    /// Time-limited read-only URL for an object
    fn presign_get(&self, uri: &BlobUri, expires_in_secs: u64, download_filename: &str) -> String;
}

/// Signature token over (secret, bucket/key, expiry)
pub(crate) fn sign_token(secret: &str, uri: &BlobUri, expires_at: i64) -> String {
    let payload = format!("{}:{}/{}:{}", secret, uri.bucket, uri.key, expires_at);
    hex::encode(md5::compute(payload.as_bytes()).0)
}

/// Check a download token against the expected signature and expiry
pub(crate) fn verify_token(
    secret: &str,
    uri: &BlobUri,
    expires_at: i64,
    token: &str,
    now: i64,
) -> bool {
    now <= expires_at && sign_token(secret, uri, expires_at) == token
}

/// Build the presigned download URL both backends hand out. Filenames are
/// normalized to URL-safe characters before they ever reach a locator, so
/// no encoding is applied here.
pub(crate) fn presigned_url(
    public_url: &str,
    secret: &str,
    uri: &BlobUri,
    expires_in_secs: u64,
    download_filename: &str,
) -> String {
    let expires_at = Utc::now().timestamp() + expires_in_secs as i64;
    let token = sign_token(secret, uri, expires_at);
    format!(
        "{}/{}/{}?expires={}&signature={}&filename={}",
        public_url.trim_end_matches('/'),
        uri.bucket,
        uri.key,
        expires_at,
        token,
        download_filename
    )
}

/// What a storage probe learned about one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Exists,
    /// Confirmed absent; safe to act on
    Missing,
    /// The probe could not get an answer in time; proves nothing
    Ambiguous(String),
}

/// Probe a stored locator with a bounded wait. URI locators go through the
/// store's `head`; legacy paths are checked on the local filesystem. A
/// locator that does not parse is treated as ambiguous, never as absent.
pub async fn probe_locator(
    store: &dyn BlobStore,
    locator: &str,
    timeout: Duration,
) -> ProbeOutcome {
    match Locator::parse(locator) {
        Ok(Locator::Uri(uri)) => match tokio::time::timeout(timeout, store.head(&uri)).await {
            Ok(Ok(true)) => ProbeOutcome::Exists,
            Ok(Ok(false)) => ProbeOutcome::Missing,
            Ok(Err(e)) => ProbeOutcome::Ambiguous(e.to_string()),
            Err(_) => ProbeOutcome::Ambiguous(format!("probe timed out after {:?}", timeout)),
        },
        Ok(Locator::LegacyPath(path)) => {
            match tokio::time::timeout(timeout, tokio::fs::try_exists(path)).await {
                Ok(Ok(true)) => ProbeOutcome::Exists,
                Ok(Ok(false)) => ProbeOutcome::Missing,
                Ok(Err(e)) => ProbeOutcome::Ambiguous(e.to_string()),
                Err(_) => ProbeOutcome::Ambiguous(format!("probe timed out after {:?}", timeout)),
            }
        }
        Err(e) => ProbeOutcome::Ambiguous(e.to_string()),
    }
}
