//! Certificate store
//!
//! The engine persists one [`CertificateRecord`] per hostname at the path
//! derived from it (see [`renewd_common::path`]). Backends assign
//! `created_at` on write and report it on load.
//!
//! [`StorageError::NotFound`] is the expected answer for a hostname that has
//! never been saved; the engine treats it as "issue a new certificate".

mod file;
mod memory;

use async_trait::async_trait;
use renewd_common::{host_from_path, CertificateRecord};

use crate::error::StorageError;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Persistence for certificate records, keyed by path
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Every stored record, with `path` and `created_at` filled in
    async fn fetch_all(&self) -> Result<Vec<CertificateRecord>, StorageError>;

    /// The record at `path`, or [`StorageError::NotFound`]
    async fn load(&self, path: &str) -> Result<CertificateRecord, StorageError>;

    /// Create or replace the record at `path`
    async fn save(&self, path: &str, record: &CertificateRecord) -> Result<(), StorageError>;

    /// Remove the record at `path`
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// Hostnames of every stored record whose path decodes
    async fn list_hostnames(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .fetch_all()
            .await?
            .iter()
            .filter_map(|record| host_from_path(&record.path))
            .collect())
    }
}
