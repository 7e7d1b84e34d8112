//! File-backed certificate store
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! └── certs/
//!     ├── 6578616d706c652e636f6d.json   # one document per hostname (hex)
//!     └── ...
//! ```
//!
//! Each document wraps the record with its write time:
//!
//! ```json
//! { "value": { "source": "...", "type": "user", ... }, "version_created_at": "2026-01-01T00:00:00Z" }
//! ```
//!
//! Directories are created 0700 and documents written 0600 on Unix. Writes go
//! to a temporary file first and are renamed into place.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use renewd_common::{CertificateRecord, CERT_PATH_PREFIX};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::CertificateStore;
use crate::error::StorageError;

const CERTS_DIR: &str = "certs";
const EXTENSION: &str = "json";

/// On-disk document
#[derive(Debug, Serialize, Deserialize)]
struct StoredDocument {
    value: CertificateRecord,
    version_created_at: DateTime<Utc>,
}

/// Certificate store in a local directory
#[derive(Debug, Clone)]
pub struct FileStore {
    /// Base storage directory
    base_path: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `base_path`
    pub fn new(base_path: &Path) -> Result<Self, StorageError> {
        let certs_path = base_path.join(CERTS_DIR);
        fs::create_dir_all(&certs_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o700);
            fs::set_permissions(base_path, perms.clone())?;
            fs::set_permissions(&certs_path, perms)?;
        }

        info!(storage_path = %base_path.display(), "Initialized certificate storage");

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn certs_path(&self) -> PathBuf {
        self.base_path.join(CERTS_DIR)
    }

    /// File holding the record at a store path
    ///
    /// Only paths of the form `/certs/<hex>` are accepted, so a path can
    /// never escape the store directory.
    fn file_for(&self, path: &str) -> Result<PathBuf, StorageError> {
        let encoded = path
            .strip_prefix(CERT_PATH_PREFIX)
            .filter(|e| !e.is_empty() && e.bytes().all(|b| b.is_ascii_hexdigit()))
            .ok_or_else(|| StorageError::InvalidStructure(format!("invalid record path {}", path)))?;

        Ok(self.certs_path().join(format!("{}.{}", encoded, EXTENSION)))
    }

    fn read_document(file: &Path, path: &str) -> Result<CertificateRecord, StorageError> {
        let content = match fs::read_to_string(file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let document: StoredDocument = serde_json::from_str(&content)?;
        let mut record = document.value;
        record.path = path.to_string();
        record.created_at = Some(document.version_created_at);
        Ok(record)
    }

    /// Load the record at `path`
    pub fn load_sync(&self, path: &str) -> Result<CertificateRecord, StorageError> {
        let file = self.file_for(path)?;
        let record = Self::read_document(&file, path)?;
        trace!(path = %path, "Loaded stored record");
        Ok(record)
    }

    /// Write the record at `path`
    pub fn save_sync(&self, path: &str, record: &CertificateRecord) -> Result<(), StorageError> {
        let file = self.file_for(path)?;
        let document = StoredDocument {
            value: record.clone(),
            version_created_at: Utc::now(),
        };
        let content = serde_json::to_vec_pretty(&document)?;

        let tmp = file.with_extension("json.tmp");
        {
            let mut out = fs::File::create(&tmp)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                out.set_permissions(fs::Permissions::from_mode(0o600))?;
            }
            out.write_all(&content)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &file)?;

        debug!(path = %path, source = %record.source, "Saved record to storage");
        Ok(())
    }

    /// Remove the record at `path`
    pub fn delete_sync(&self, path: &str) -> Result<(), StorageError> {
        let file = self.file_for(path)?;
        match fs::remove_file(&file) {
            Ok(()) => {
                info!(path = %path, "Deleted stored record");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path, "Record to delete not found");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Every stored record, ordered by path
    pub fn fetch_all_sync(&self) -> Result<Vec<CertificateRecord>, StorageError> {
        let certs_path = self.certs_path();
        if !certs_path.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(&certs_path)? {
            let entry = entry?;
            let file = entry.path();
            if file.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = file.file_stem().and_then(|s| s.to_str()) {
                files.push((format!("{}{}", CERT_PATH_PREFIX, stem), file.clone()));
            }
        }
        files.sort();

        let mut records = Vec::with_capacity(files.len());
        for (path, file) in files {
            records.push(Self::read_document(&file, &path)?);
        }

        debug!(count = records.len(), "Fetched stored records");
        Ok(records)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(FileStore) -> Result<T, StorageError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
    }
}

#[async_trait]
impl CertificateStore for FileStore {
    async fn fetch_all(&self) -> Result<Vec<CertificateRecord>, StorageError> {
        self.blocking(|store| store.fetch_all_sync()).await
    }

    async fn load(&self, path: &str) -> Result<CertificateRecord, StorageError> {
        let path = path.to_string();
        self.blocking(move |store| store.load_sync(&path)).await
    }

    async fn save(&self, path: &str, record: &CertificateRecord) -> Result<(), StorageError> {
        let path = path.to_string();
        let record = record.clone();
        self.blocking(move |store| store.save_sync(&path, &record)).await
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let path = path.to_string();
        self.blocking(move |store| store.delete_sync(&path)).await
    }
}
