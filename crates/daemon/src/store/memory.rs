//! In-process certificate store

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use renewd_common::CertificateRecord;
use tracing::trace;

use super::CertificateStore;
use crate::error::StorageError;

/// Records held in memory, ordered by path
///
/// Can be switched offline to make every operation fail with
/// [`StorageError::Comms`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, CertificateRecord>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable backend
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn check_online(&self) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Comms("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CertificateStore for MemoryStore {
    async fn fetch_all(&self) -> Result<Vec<CertificateRecord>, StorageError> {
        self.check_online()?;
        Ok(self.records.read().values().cloned().collect())
    }

    async fn load(&self, path: &str) -> Result<CertificateRecord, StorageError> {
        self.check_online()?;
        self.records
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn save(&self, path: &str, record: &CertificateRecord) -> Result<(), StorageError> {
        self.check_online()?;
        let mut stored = record.clone();
        stored.path = path.to_string();
        stored.created_at = Some(Utc::now());

        trace!(path = %path, "Saved record in memory");
        self.records.write().insert(path.to_string(), stored);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.check_online()?;
        self.records.write().remove(path);
        Ok(())
    }
}
