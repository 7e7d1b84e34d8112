//! Per-issuance key material
//!
//! Every issuance uses a fresh RSA-2048 key. The key signs the CSR sent to
//! the CA (or the certificate itself for self-signed issuance) and is stored
//! alongside the result as a PKCS#1 `RSA PRIVATE KEY` block.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_RSA_SHA256};
use renewd_common::material::{encode_rsa_private_key, pkcs8_to_pkcs1};

use crate::error::IssuanceError;

/// A freshly generated RSA key pair for one issuance
pub struct IssuanceKey {
    key_pair: KeyPair,
}

impl IssuanceKey {
    /// Generate a new RSA-2048 key
    pub fn generate() -> Result<Self, IssuanceError> {
        let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)?;
        Ok(Self { key_pair })
    }

    /// Certificate parameters with CN and SAN set to `hostname`
    fn params(hostname: &str) -> Result<CertificateParams, IssuanceError> {
        let mut params = CertificateParams::new(vec![hostname.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, hostname);
        Ok(params)
    }

    /// DER-encoded certificate signing request for `hostname`
    pub fn csr_der(&self, hostname: &str) -> Result<Vec<u8>, IssuanceError> {
        let csr = Self::params(hostname)?.serialize_request(&self.key_pair)?;
        Ok(csr.der().to_vec())
    }

    /// DER-encoded certificate for `hostname` signed by this key
    pub fn self_signed_der(
        &self,
        hostname: &str,
        validity: std::time::Duration,
    ) -> Result<Vec<u8>, IssuanceError> {
        let mut params = Self::params(hostname)?;

        let now = time::OffsetDateTime::now_utc();
        let validity = time::Duration::try_from(validity)
            .map_err(|e| IssuanceError::KeyGeneration(e.to_string()))?;
        params.not_before = now - time::Duration::hours(1);
        params.not_after = now + validity;

        let cert = params.self_signed(&self.key_pair)?;
        Ok(cert.der().to_vec())
    }

    /// PKCS#1 PEM encoding of the private key
    pub fn private_key_pem(&self) -> Result<String, IssuanceError> {
        let pkcs1 = pkcs8_to_pkcs1(&self.key_pair.serialize_der())?;
        Ok(encode_rsa_private_key(&pkcs1))
    }
}

impl std::fmt::Debug for IssuanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuanceKey").finish_non_exhaustive()
    }
}
