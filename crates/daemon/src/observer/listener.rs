//! Certificate for the daemon's own TLS listener.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use renewd_common::CertificateRecord;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, info};

use crate::error::ObserverError;
use crate::observer::CertificateObserver;

/// Keeps the daemon's own certificate current for its TLS listener
///
/// Picks the record matching our hostname out of each update and swaps it in
/// atomically; handshakes in flight keep the key they started with.
#[derive(Clone)]
pub struct ListenerCertificate {
    hostname: String,
    current: Arc<ArcSwapOption<CertifiedKey>>,
}

impl ListenerCertificate {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            current: Arc::new(ArcSwapOption::empty()),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The certificate currently served, if one has been installed
    pub fn current(&self) -> Option<Arc<CertifiedKey>> {
        self.current.load_full()
    }

    /// Whether a certificate has been installed yet
    pub fn is_ready(&self) -> bool {
        self.current.load().is_some()
    }

    fn install(&self, record: &CertificateRecord) -> Result<(), ObserverError> {
        let key = certified_key(record)?;
        self.current.store(Some(Arc::new(key)));
        info!(hostname = %self.hostname, "Installed listener certificate");
        Ok(())
    }
}

impl std::fmt::Debug for ListenerCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerCertificate")
            .field("hostname", &self.hostname)
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[async_trait]
impl CertificateObserver for ListenerCertificate {
    fn name(&self) -> &str {
        "listener"
    }

    async fn on_certificates_updated(
        &self,
        records: &[CertificateRecord],
    ) -> Result<(), ObserverError> {
        let ours = records
            .iter()
            .find(|r| r.hostname().as_deref() == Some(self.hostname.as_str()));

        match ours {
            Some(record) if record.is_issued() => self.install(record),
            _ => {
                debug!(hostname = %self.hostname, "No issued certificate for our hostname yet");
                Ok(())
            }
        }
    }
}

impl ResolvesServerCert for ListenerCertificate {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current()
    }
}

/// Build a rustls key from a record's leaf, CA chain and private key
fn certified_key(record: &CertificateRecord) -> Result<CertifiedKey, ObserverError> {
    let mut certs: Vec<CertificateDer<'static>> = Vec::new();
    for pem in [&record.certificate_pem, &record.ca_chain_pem] {
        let mut reader = pem.as_bytes();
        for cert in rustls_pemfile::certs(&mut reader) {
            certs.push(cert.map_err(|e| ObserverError::Tls(e.to_string()))?);
        }
    }

    if certs.is_empty() {
        return Err(ObserverError::Tls("no certificates in record".to_string()));
    }

    let key = rustls_pemfile::private_key(&mut record.private_key_pem.as_bytes())
        .map_err(|e| ObserverError::Tls(e.to_string()))?
        .ok_or_else(|| ObserverError::Tls("no private key in record".to_string()))?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)?;

    Ok(CertifiedKey::new(certs, signing_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::IssuanceKey;
    use renewd_common::material::encode_certificate;
    use renewd_common::{path_from_host, RecordType};
    use std::time::Duration;

    fn record_for(hostname: &str) -> CertificateRecord {
        let key = IssuanceKey::generate().unwrap();
        let der = key
            .self_signed_der(hostname, Duration::from_secs(86400))
            .unwrap();
        CertificateRecord {
            certificate_pem: encode_certificate(&der),
            private_key_pem: key.private_key_pem().unwrap(),
            path: path_from_host(hostname),
            ..CertificateRecord::unissued("self", RecordType::Admin)
        }
    }

    #[tokio::test]
    async fn test_installs_matching_record() {
        let listener = ListenerCertificate::new("renewd.example.com");
        assert!(!listener.is_ready());

        let records = vec![record_for("other.example.com"), record_for("renewd.example.com")];
        listener.on_certificates_updated(&records).await.unwrap();

        let key = listener.current().unwrap();
        assert_eq!(key.cert.len(), 1);
    }

    #[tokio::test]
    async fn test_ignores_unissued_and_foreign_records() {
        let listener = ListenerCertificate::new("renewd.example.com");
        let unissued = CertificateRecord {
            path: path_from_host("renewd.example.com"),
            ..CertificateRecord::unissued("self", RecordType::Admin)
        };

        listener
            .on_certificates_updated(&[unissued, record_for("other.example.com")])
            .await
            .unwrap();
        assert!(!listener.is_ready());
    }

    #[tokio::test]
    async fn test_replaces_previous_certificate() {
        let listener = ListenerCertificate::new("renewd.example.com");
        listener
            .on_certificates_updated(&[record_for("renewd.example.com")])
            .await
            .unwrap();
        let first = listener.current().unwrap();

        listener
            .on_certificates_updated(&[record_for("renewd.example.com")])
            .await
            .unwrap();
        let second = listener.current().unwrap();

        assert_ne!(first.cert[0], second.cert[0]);
    }

    #[tokio::test]
    async fn test_broken_key_is_error() {
        let listener = ListenerCertificate::new("renewd.example.com");
        let mut record = record_for("renewd.example.com");
        record.private_key_pem = String::new();

        assert!(matches!(
            listener.on_certificates_updated(&[record]).await,
            Err(ObserverError::Tls(_))
        ));
        assert!(!listener.is_ready());
    }
}
