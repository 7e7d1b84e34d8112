//! Self-signed certificate source

use std::time::Duration;

use async_trait::async_trait;
use renewd_common::ChallengeDescriptor;
use tokio::sync::Mutex;
use tracing::debug;

use super::{CertificateChain, CertificateSource};
use crate::error::IssuanceError;
use crate::keys::IssuanceKey;

/// Validity of a self-signed certificate (90 days)
pub const SELF_SIGNED_VALIDITY: Duration = Duration::from_secs(90 * 24 * 3600);

/// Issues certificates signed by their own key, with no external calls
///
/// Useful for bootstrapping listeners before a CA-issued certificate exists.
#[derive(Debug)]
pub struct SelfSignedSource {
    validity: Duration,
    lock: Mutex<()>,
}

impl SelfSignedSource {
    pub fn new() -> Self {
        Self::with_validity(SELF_SIGNED_VALIDITY)
    }

    pub fn with_validity(validity: Duration) -> Self {
        Self {
            validity,
            lock: Mutex::new(()),
        }
    }
}

impl Default for SelfSignedSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CertificateSource for SelfSignedSource {
    async fn auto_fetch(
        &self,
        key: &IssuanceKey,
        hostname: &str,
    ) -> Result<CertificateChain, IssuanceError> {
        let _guard = self.lock.lock().await;

        debug!(hostname = %hostname, validity_days = self.validity.as_secs() / 86400, "Issuing self-signed certificate");
        Ok(vec![key.self_signed_der(hostname, self.validity)?])
    }

    async fn manual_start_challenge(
        &self,
        _hostname: &str,
    ) -> Result<ChallengeDescriptor, IssuanceError> {
        Err(IssuanceError::ManualUnsupported("self-signed".to_string()))
    }

    async fn complete_challenge(
        &self,
        _key: &IssuanceKey,
        _hostname: &str,
        _challenge: &ChallengeDescriptor,
    ) -> Result<CertificateChain, IssuanceError> {
        Err(IssuanceError::ManualUnsupported("self-signed".to_string()))
    }

    fn supports_manual(&self) -> bool {
        false
    }
}
