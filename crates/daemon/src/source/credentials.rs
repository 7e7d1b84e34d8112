//! Persisted ACME account credentials
//!
//! An ACME account created by the daemon is written to
//! `<storage>/accounts/<source>.json` so that orders started before a restart
//! (pending manual challenges) can be resumed under the same account.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, trace};

use crate::error::StorageError;

/// Directory under the storage base holding one credentials file per source
const ACCOUNTS_DIR: &str = "accounts";

/// Credentials JSON file for one ACME source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCredentialsFile {
    path: PathBuf,
}

impl AccountCredentialsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The credentials file of `source` under the storage base directory
    pub fn for_source(storage_path: &Path, source: &str) -> Self {
        Self::new(storage_path.join(ACCOUNTS_DIR).join(format!("{}.json", source)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored credentials JSON, `None` if nothing was saved yet
    pub fn load(&self) -> Result<Option<String>, StorageError> {
        if !self.path.exists() {
            trace!(path = %self.path.display(), "No stored ACME credentials found");
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)?;
        debug!(path = %self.path.display(), "Loaded ACME credentials JSON");
        Ok(Some(content))
    }

    /// Write the credentials JSON, readable by the owner only
    pub fn save(&self, json: &str) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
            }
        }

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        }

        fs::rename(&tmp_path, &self.path)?;

        info!(path = %self.path.display(), "Saved ACME credentials JSON");
        Ok(())
    }
}
