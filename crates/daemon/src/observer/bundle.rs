//! Certificate bundle publishing
//!
//! Packs every shippable certificate into one gzip'd tar archive and uploads
//! it to a set of sinks. Archive entries are named `<hex hostname>.crt` and
//! hold the key, certificate and CA chain in a single PEM file.
//!
//! Uploads are debounced separately from the engine's fan-out so a slow
//! sink never holds up the other observers.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use renewd_common::path::encoded_host;
use renewd_common::CertificateRecord;
use tracing::{debug, info, warn};

use crate::debounce::{DebouncedTrigger, TriggerHandle};
use crate::error::ObserverError;
use crate::observer::CertificateObserver;

/// Quiet period before a new archive is uploaded
pub const BUNDLE_QUIET_PERIOD: Duration = Duration::from_secs(30);

// ============================================================================
// Sinks
// ============================================================================

/// Destination for bundle archives
#[async_trait]
pub trait BundleSink: Send + Sync {
    fn name(&self) -> &str;

    /// Replace the stored archive with `data`
    async fn put(&self, data: &[u8]) -> io::Result<()>;
}

/// Writes the archive to a local file, replacing it atomically
#[derive(Debug, Clone)]
pub struct FileSink {
    name: String,
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BundleSink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tokio::fs::rename(&tmp, &self.path).await?;
        info!(path = %self.path.display(), bytes = data.len(), "Wrote certificate bundle");
        Ok(())
    }
}

struct SinkSlot {
    sink: Arc<dyn BundleSink>,
    last_uploaded: tokio::sync::Mutex<Option<Vec<u8>>>,
}

// ============================================================================
// Publisher
// ============================================================================

/// Observer that archives the certificate set and uploads it to sinks
pub struct BundlePublisher {
    our_hostname: String,
    sinks: Vec<SinkSlot>,
    latest: Mutex<Option<Arc<Vec<u8>>>>,
    upload: TriggerHandle,
    trigger: Mutex<Option<DebouncedTrigger>>,
}

impl BundlePublisher {
    /// Create a publisher; the daemon's own hostname is never shipped
    pub fn new(our_hostname: impl Into<String>, sinks: Vec<Arc<dyn BundleSink>>) -> Self {
        let trigger = DebouncedTrigger::new("bundle", BUNDLE_QUIET_PERIOD);
        Self {
            our_hostname: our_hostname.into(),
            sinks: sinks
                .into_iter()
                .map(|sink| SinkSlot {
                    sink,
                    last_uploaded: tokio::sync::Mutex::new(None),
                })
                .collect(),
            latest: Mutex::new(None),
            upload: trigger.handle(),
            trigger: Mutex::new(Some(trigger)),
        }
    }

    /// Upload archives as they settle, until the task is dropped
    pub async fn run(self: Arc<Self>) {
        let Some(trigger) = self.trigger.lock().take() else {
            warn!("Bundle upload loop already running");
            return;
        };

        let publisher = Arc::clone(&self);
        trigger
            .run(move || {
                let publisher = Arc::clone(&publisher);
                async move { publisher.upload_latest().await }
            })
            .await;
    }

    /// The most recently built archive
    pub fn latest(&self) -> Option<Arc<Vec<u8>>> {
        self.latest.lock().clone()
    }

    /// Write the latest archive to every sink that does not already have it
    pub async fn upload_latest(&self) -> Result<(), ObserverError> {
        let Some(data) = self.latest() else {
            debug!("No bundle built yet, nothing to upload");
            return Ok(());
        };

        let mut first_error = None;
        for slot in &self.sinks {
            let mut last = slot.last_uploaded.lock().await;
            if last.as_deref() == Some(data.as_slice()) {
                debug!(sink = slot.sink.name(), "Bundle unchanged, skipping upload");
                continue;
            }

            match slot.sink.put(&data).await {
                Ok(()) => *last = Some(data.to_vec()),
                Err(source) => {
                    warn!(sink = slot.sink.name(), error = %source, "Bundle upload failed");
                    first_error.get_or_insert(ObserverError::Sink {
                        sink: slot.sink.name().to_string(),
                        source,
                    });
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn ships(&self, record: &CertificateRecord) -> Option<String> {
        let hostname = record.hostname()?;
        if hostname == self.our_hostname || !record.is_issued() {
            return None;
        }
        Some(hostname)
    }

    /// Build the gzip'd tar archive for `records`
    pub fn build_archive(&self, records: &[CertificateRecord]) -> Result<Vec<u8>, ObserverError> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for record in records {
            let Some(hostname) = self.ships(record) else {
                continue;
            };

            let contents = record.bundle_pem();
            let mtime = record
                .created_at
                .map_or(0, |t| u64::try_from(t.timestamp()).unwrap_or(0));

            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o600);
            header.set_mtime(mtime);
            header.set_entry_type(tar::EntryType::Regular);

            builder.append_data(
                &mut header,
                format!("{}.crt", encoded_host(&hostname)),
                contents.as_bytes(),
            )?;
        }

        let mut encoder = builder.into_inner()?;
        encoder.flush()?;
        Ok(encoder.finish()?)
    }
}

impl std::fmt::Debug for BundlePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundlePublisher")
            .field("our_hostname", &self.our_hostname)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[async_trait]
impl CertificateObserver for BundlePublisher {
    fn name(&self) -> &str {
        "bundle"
    }

    async fn on_certificates_updated(
        &self,
        records: &[CertificateRecord],
    ) -> Result<(), ObserverError> {
        let archive = self.build_archive(records)?;
        debug!(bytes = archive.len(), "Built certificate bundle");

        *self.latest.lock() = Some(Arc::new(archive));
        self.upload.signal();
        Ok(())
    }
}
