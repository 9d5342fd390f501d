//! Mock implementation of BlobStore for testing
//!
//! In-memory object map plus per-key fault injection, so reconciliation
//! and deletion paths can be driven through their failure branches without
//! a real backend.

use async_trait::async_trait;
use log::info;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::blob::{presigned_url, BatchDeleteReport, BlobError, BlobStore, BlobUri};

/// Behavior injected into `head` for one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFault {
    /// The probe fails with a backend error
    Transient,
    /// The probe never answers within any sane timeout
    Hang,
}

/// Behavior injected into deletes for one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteFault {
    /// Fails inside `delete_batch` but succeeds as an individual `delete`
    BatchOnly,
    /// Fails both ways
    Always,
}

/// Mock implementation of BlobStore for testing
#[derive(Clone)]
pub struct MockBlobStore {
    // "bucket/key" -> body
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    probe_faults: Arc<Mutex<HashMap<String, ProbeFault>>>,
    delete_faults: Arc<Mutex<HashMap<String, DeleteFault>>>,
    delete_calls: Arc<Mutex<Vec<String>>>,
    batch_sizes: Arc<Mutex<Vec<usize>>>,
    max_batch: usize,
    public_url: String,
    signing_secret: String,
}

fn object_key(uri: &BlobUri) -> String {
    format!("{}/{}", uri.bucket, uri.key)
}

impl MockBlobStore {
    pub fn new() -> Self {
        Self {
            objects: Arc::new(Mutex::new(HashMap::new())),
            probe_faults: Arc::new(Mutex::new(HashMap::new())),
            delete_faults: Arc::new(Mutex::new(HashMap::new())),
            delete_calls: Arc::new(Mutex::new(Vec::new())),
            batch_sizes: Arc::new(Mutex::new(Vec::new())),
            max_batch: 1000,
            public_url: "http://mock.local/blobs".to_string(),
            signing_secret: "mock-secret".to_string(),
        }
    }

    /// Lower the per-call batch limit, for chunking tests
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    /// Seed an object without going through `put_if_absent`
    pub fn insert_object(&self, bucket: &str, key: &str, data: &[u8]) {
        let mut objects = self.objects.lock().unwrap();
        objects.insert(format!("{}/{}", bucket, key), data.to_vec());
    }

    /// Number of objects currently held
    pub fn object_count(&self) -> usize {
        let objects = self.objects.lock().unwrap();
        objects.len()
    }

    /// Check whether an object is present
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        let objects = self.objects.lock().unwrap();
        objects.contains_key(&format!("{}/{}", bucket, key))
    }

    pub fn set_probe_fault(&self, bucket: &str, key: &str, fault: ProbeFault) {
        let mut faults = self.probe_faults.lock().unwrap();
        faults.insert(format!("{}/{}", bucket, key), fault);
    }

    pub fn clear_probe_fault(&self, bucket: &str, key: &str) {
        let mut faults = self.probe_faults.lock().unwrap();
        faults.remove(&format!("{}/{}", bucket, key));
    }

    pub fn set_delete_fault(&self, bucket: &str, key: &str, fault: DeleteFault) {
        let mut faults = self.delete_faults.lock().unwrap();
        faults.insert(format!("{}/{}", bucket, key), fault);
    }

    /// Keys passed to individual `delete` calls, in order
    pub fn delete_calls(&self) -> Vec<String> {
        let calls = self.delete_calls.lock().unwrap();
        calls.clone()
    }

    /// Sizes of the `delete_batch` calls made, in order
    pub fn batch_sizes(&self) -> Vec<usize> {
        let sizes = self.batch_sizes.lock().unwrap();
        sizes.clone()
    }
}

impl Default for MockBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MockBlobStore {
    async fn put_if_absent(&self, uri: &BlobUri, data: &[u8]) -> Result<(), BlobError> {
        let mut objects = self.objects.lock().unwrap();
        let key = object_key(uri);
        if objects.contains_key(&key) {
            return Err(BlobError::AlreadyExists);
        }
        objects.insert(key, data.to_vec());
        info!("Mock: stored {} ({} bytes)", uri, data.len());
        Ok(())
    }

    async fn get(&self, uri: &BlobUri) -> Result<Vec<u8>, BlobError> {
        let objects = self.objects.lock().unwrap();
        objects
            .get(&object_key(uri))
            .cloned()
            .ok_or(BlobError::NotFound)
    }

    async fn head(&self, uri: &BlobUri) -> Result<bool, BlobError> {
        let fault = {
            let faults = self.probe_faults.lock().unwrap();
            faults.get(&object_key(uri)).copied()
        };
        match fault {
            Some(ProbeFault::Transient) => {
                return Err(BlobError::Backend("injected transient fault".to_string()))
            }
            Some(ProbeFault::Hang) => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                return Err(BlobError::Backend("hung probe released".to_string()));
            }
            None => {}
        }
        let objects = self.objects.lock().unwrap();
        Ok(objects.contains_key(&object_key(uri)))
    }

    async fn delete(&self, uri: &BlobUri) -> Result<(), BlobError> {
        let key = object_key(uri);
        {
            let mut calls = self.delete_calls.lock().unwrap();
            calls.push(key.clone());
        }
        let fault = {
            let faults = self.delete_faults.lock().unwrap();
            faults.get(&key).copied()
        };
        if fault == Some(DeleteFault::Always) {
            return Err(BlobError::Backend("injected delete fault".to_string()));
        }
        let mut objects = self.objects.lock().unwrap();
        objects.remove(&key);
        Ok(())
    }

    async fn delete_batch(&self, uris: &[BlobUri]) -> Result<BatchDeleteReport, BlobError> {
        if uris.len() > self.max_batch {
            return Err(BlobError::Backend(format!(
                "batch of {} exceeds per-call limit {}",
                uris.len(),
                self.max_batch
            )));
        }
        {
            let mut sizes = self.batch_sizes.lock().unwrap();
            sizes.push(uris.len());
        }
        let mut report = BatchDeleteReport::default();
        for uri in uris {
            let key = object_key(uri);
            let fault = {
                let faults = self.delete_faults.lock().unwrap();
                faults.get(&key).copied()
            };
            if fault.is_some() {
                report
                    .failed
                    .push((uri.clone(), "injected batch delete fault".to_string()));
                continue;
            }
            let mut objects = self.objects.lock().unwrap();
            objects.remove(&key);
        }
        Ok(report)
    }

    fn max_batch(&self) -> usize {
        self.max_batch
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_blob_store_basic_operations() {
        let store = MockBlobStore::new();
        let uri = BlobUri::new("b", "1/genomic/reads.fasta");

        assert_eq!(store.object_count(), 0);
        store.put_if_absent(&uri, b"data").await.unwrap();
        assert_eq!(store.object_count(), 1);
        assert!(store.contains("b", "1/genomic/reads.fasta"));
        assert_eq!(store.get(&uri).await.unwrap(), b"data");
        assert!(store.head(&uri).await.unwrap());

        let err = store.put_if_absent(&uri, b"again").await.unwrap_err();
        assert!(matches!(err, BlobError::AlreadyExists));

        store.delete(&uri).await.unwrap();
        assert!(!store.head(&uri).await.unwrap());
        // absent delete succeeds
        store.delete(&uri).await.unwrap();
        assert_eq!(store.delete_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_probe_fault_injection() {
        let store = MockBlobStore::new();
        store.insert_object("b", "k", b"data");

        store.set_probe_fault("b", "k", ProbeFault::Transient);
        assert!(store.head(&BlobUri::new("b", "k")).await.is_err());

        store.clear_probe_fault("b", "k");
        assert!(store.head(&BlobUri::new("b", "k")).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_fault_modes() {
        let store = MockBlobStore::new();
        store.insert_object("b", "batch-only", b"1");
        store.insert_object("b", "always", b"2");
        store.set_delete_fault("b", "batch-only", DeleteFault::BatchOnly);
        store.set_delete_fault("b", "always", DeleteFault::Always);

        let report = store
            .delete_batch(&[BlobUri::new("b", "batch-only"), BlobUri::new("b", "always")])
            .await
            .unwrap();
        assert_eq!(report.failed.len(), 2);

        // individual delete recovers the batch-only key but not the other
        store.delete(&BlobUri::new("b", "batch-only")).await.unwrap();
        assert!(!store.contains("b", "batch-only"));
        assert!(store.delete(&BlobUri::new("b", "always")).await.is_err());
        assert!(store.contains("b", "always"));
    }

    #[tokio::test]
    async fn test_batch_limit_enforced_and_sizes_recorded() {
        let store = MockBlobStore::new().with_max_batch(2);
        let uris: Vec<BlobUri> = (0..3).map(|i| BlobUri::new("b", &format!("k{}", i))).collect();

        assert!(store.delete_batch(&uris).await.is_err());
        store.delete_batch(&uris[..2]).await.unwrap();
        store.delete_batch(&uris[2..]).await.unwrap();
        assert_eq!(store.batch_sizes(), vec![2, 1]);
    }
}
