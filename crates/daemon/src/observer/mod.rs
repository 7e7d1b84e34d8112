//! Observers of the certificate set
//!
//! After issuance settles, the engine hands the full set of stored records
//! to every registered observer, in registration order. A failing observer
//! does not stop the others; the whole fan-out is retried later.

mod bundle;
mod listener;

use async_trait::async_trait;
use renewd_common::CertificateRecord;

use crate::error::ObserverError;

pub use bundle::{BundlePublisher, BundleSink, FileSink, BUNDLE_QUIET_PERIOD};
pub use listener::ListenerCertificate;

/// Reacts to an updated certificate set
#[async_trait]
pub trait CertificateObserver: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Receive every stored record
    async fn on_certificates_updated(&self, records: &[CertificateRecord]) -> Result<(), ObserverError>;
}
