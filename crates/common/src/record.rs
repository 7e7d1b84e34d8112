//! Certificate records as persisted in the credential store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::material::{certificate_not_after, PemError};
use crate::path::host_from_path;

/// Who a record belongs to
///
/// `Admin` records protect the daemon's own listeners and can never be
/// deleted by operators; `User` records can.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Admin,
    #[default]
    User,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of an in-flight manual (DNS-01) challenge
///
/// Holds the operator instructions plus the opaque CA handles needed to
/// resume the order once the DNS record has been published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeDescriptor {
    /// Human-readable instructions (which TXT record to create)
    pub message: String,
    /// URL of the CA order to resume
    pub order_url: String,
    /// URL of the DNS-01 challenge to accept
    pub challenge_url: String,
    /// DNS name the TXT record must be published under
    pub record_name: String,
    /// Value of the TXT record
    pub record_value: String,
}

impl ChallengeDescriptor {
    /// Build a descriptor for a DNS-01 challenge on `hostname`
    pub fn dns01(
        hostname: &str,
        record_value: impl Into<String>,
        order_url: impl Into<String>,
        challenge_url: impl Into<String>,
    ) -> Self {
        let record_name = format!("_acme-challenge.{}.", hostname);
        let record_value = record_value.into();
        let message = format!(
            "Create DNS TXT record:\nName:  {}\nValue: {}",
            record_name, record_value
        );
        Self {
            message,
            order_url: order_url.into(),
            challenge_url: challenge_url.into(),
            record_name,
            record_value,
        }
    }

    /// Instructions to show the operator
    pub fn instructions(&self) -> &str {
        &self.message
    }
}

/// One tracked hostname and its certificate material
///
/// Empty PEM strings mean "not yet issued". The storage path is the record's
/// key and is not part of the stored value; `created_at` is assigned by the
/// store on write and filled in on load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CertificateRecord {
    /// Name of the certificate source that issues this record
    pub source: String,

    #[serde(rename = "type", default)]
    pub record_type: RecordType,

    #[serde(rename = "ca", default)]
    pub ca_chain_pem: String,

    #[serde(rename = "certificate", default)]
    pub certificate_pem: String,

    #[serde(rename = "private_key", default)]
    pub private_key_pem: String,

    #[serde(rename = "challenge", default)]
    pub pending_challenge: Option<ChallengeDescriptor>,

    #[serde(skip)]
    pub path: String,

    #[serde(skip)]
    pub created_at: Option<DateTime<Utc>>,
}

impl CertificateRecord {
    /// A record for a newly added hostname: chosen source, nothing issued
    pub fn unissued(source: impl Into<String>, record_type: RecordType) -> Self {
        Self {
            source: source.into(),
            record_type,
            ..Default::default()
        }
    }

    /// Hostname this record was loaded for, if its path decodes
    pub fn hostname(&self) -> Option<String> {
        host_from_path(&self.path)
    }

    /// Whether certificate material has been issued
    pub fn is_issued(&self) -> bool {
        !self.certificate_pem.trim().is_empty()
    }

    /// Whether a manual challenge is waiting for operator completion
    pub fn has_pending_challenge(&self) -> bool {
        self.pending_challenge.is_some()
    }

    /// Expiry of the issued leaf certificate
    pub fn not_after(&self) -> Result<DateTime<Utc>, PemError> {
        certificate_not_after(&self.certificate_pem)
    }

    /// Whole days until expiry, or `None` when nothing is issued
    pub fn days_remaining(&self, now: DateTime<Utc>) -> Result<Option<i64>, PemError> {
        if !self.is_issued() {
            return Ok(None);
        }
        Ok(Some((self.not_after()? - now).num_days()))
    }

    /// Key, certificate and CA chain, trimmed and newline-joined
    ///
    /// This is the single-file bundle layout consumed downstream.
    pub fn bundle_pem(&self) -> String {
        let mut out = [
            self.private_key_pem.trim(),
            self.certificate_pem.trim(),
            self.ca_chain_pem.trim(),
        ]
        .join("\n");
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::path_from_host;

    #[test]
    fn test_serialized_field_names() {
        let record = CertificateRecord {
            source: "letsencrypt".to_string(),
            record_type: RecordType::Admin,
            ca_chain_pem: "ca".to_string(),
            certificate_pem: "cert".to_string(),
            private_key_pem: "key".to_string(),
            pending_challenge: None,
            path: "/certs/00".to_string(),
            created_at: Some(Utc::now()),
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["source"], "letsencrypt");
        assert_eq!(json["type"], "admin");
        assert_eq!(json["ca"], "ca");
        assert_eq!(json["certificate"], "cert");
        assert_eq!(json["private_key"], "key");
        assert!(json["challenge"].is_null());
        assert!(json.get("path").is_none());
        assert!(json.get("created_at").is_none());
    }

    #[test]
    fn test_deserialize_minimal_record() {
        let record: CertificateRecord = serde_json::from_str(r#"{"source":"self"}"#).unwrap();
        assert_eq!(record.source, "self");
        assert_eq!(record.record_type, RecordType::User);
        assert!(!record.is_issued());
        assert!(!record.has_pending_challenge());
    }

    #[test]
    fn test_hostname_from_path() {
        let record = CertificateRecord {
            path: path_from_host("www.example.com"),
            ..Default::default()
        };
        assert_eq!(record.hostname().as_deref(), Some("www.example.com"));
    }

    #[test]
    fn test_dns01_descriptor_message() {
        let chal = ChallengeDescriptor::dns01("example.com", "abc123", "https://ca/order/1", "https://ca/chall/1");
        assert_eq!(chal.record_name, "_acme-challenge.example.com.");
        assert_eq!(
            chal.instructions(),
            "Create DNS TXT record:\nName:  _acme-challenge.example.com.\nValue: abc123"
        );
    }

    #[test]
    fn test_bundle_pem_layout() {
        let record = CertificateRecord {
            private_key_pem: "KEY\n".to_string(),
            certificate_pem: "\nCERT\n".to_string(),
            ca_chain_pem: "CA".to_string(),
            ..Default::default()
        };
        assert_eq!(record.bundle_pem(), "KEY\nCERT\nCA\n");
    }

    #[test]
    fn test_days_remaining_unissued() {
        let record = CertificateRecord::unissued("self", RecordType::User);
        assert_eq!(record.days_remaining(Utc::now()).unwrap(), None);
    }
}
