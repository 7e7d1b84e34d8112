//! Error types for the renewal daemon
//!
//! Each layer has its own error type. [`RenewError`] is what the engine and
//! its operator-facing operations return; its messages are shown to
//! operators verbatim.

use std::io;
use std::time::Duration;

use chrono::{DateTime, Utc};
use renewd_common::PemError;
use thiserror::Error;

// ============================================================================
// Storage
// ============================================================================

/// Errors from a certificate store backend
#[derive(Debug, Error)]
pub enum StorageError {
    /// No record at the requested path
    #[error("no record found at {0}")]
    NotFound(String),

    /// The backend could not be reached
    #[error("store unreachable: {0}")]
    Comms(String),

    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize/deserialize a stored value
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The stored value is not shaped like a certificate record
    #[error("bad data from store: {0}")]
    InvalidStructure(String),
}

impl StorageError {
    /// Whether this is the expected "nothing stored yet" condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the backend itself was unreachable
    pub fn is_comms_related(&self) -> bool {
        match self {
            Self::Comms(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

// ============================================================================
// Issuance
// ============================================================================

/// Errors from a certificate source while obtaining a certificate
#[derive(Debug, Error)]
pub enum IssuanceError {
    /// ACME protocol or transport error
    #[error("ACME protocol error: {0}")]
    Protocol(String),

    /// The order needs no challenge; there is nothing for the operator to do
    #[error("already authorized, no challenge needed")]
    AlreadyAuthorized,

    /// The CA offered no challenge of the required type
    #[error("no supported challenge type found (wanted {0})")]
    NoSupportedChallenge(&'static str),

    /// An authorization did not become valid
    #[error("authorization for '{hostname}' failed with status {status}")]
    Authorization { hostname: String, status: String },

    /// The order ended in an unexpected state
    #[error("invalid order status {0:?}")]
    OrderStatus(String),

    /// The order finished without a certificate
    #[error("no certs returned")]
    NoCertificate,

    /// Manual challenges were requested from a source that has none
    #[error("source '{0}' does not support manual challenges")]
    ManualUnsupported(String),

    /// The operation exceeded its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Key or CSR generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// The CA returned unusable certificate material
    #[error("invalid certificate material: {0}")]
    Material(#[from] PemError),

    /// Stored account credentials could not be read or written
    #[error("account credentials: {0}")]
    Credentials(#[from] StorageError),
}

impl From<instant_acme::Error> for IssuanceError {
    fn from(e: instant_acme::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<rcgen::Error> for IssuanceError {
    fn from(e: rcgen::Error) -> Self {
        Self::KeyGeneration(e.to_string())
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Errors surfaced by the renewal engine
#[derive(Debug, Error)]
pub enum RenewError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Issuance(#[from] IssuanceError),

    #[error(transparent)]
    Pem(#[from] PemError),

    /// A manual challenge is in flight; automatic renewal is blocked
    #[error("challenge not empty for '{0}', we will not try to auto renew, please complete it manually")]
    PendingChallenge(String),

    /// The certificate is already dead; renewal is left to an operator
    #[error("cert for '{hostname}' already expired at {not_after}, we won't try to auto-renew. do so manually")]
    AlreadyExpired {
        hostname: String,
        not_after: DateTime<Utc>,
    },

    #[error("no cert source found for: {0}")]
    UnknownSource(String),

    #[error("challenge not set for '{0}'")]
    NoPendingChallenge(String),

    #[error("'{0}' is a fixed host and cannot be deleted")]
    FixedHost(String),

    #[error("'{0}' is already managed")]
    AlreadyManaged(String),

    #[error("hostname must not be empty")]
    EmptyHostname,

    /// At least one observer failed during fan-out
    #[error("{failed} of {total} observers failed")]
    ObserversFailed { failed: usize, total: usize },
}

impl RenewError {
    /// Whether the underlying cause is an unreachable store
    pub fn is_comms_related(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_comms_related())
    }
}

// ============================================================================
// Observers
// ============================================================================

/// Errors from an observer reacting to a certificate set update
#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("invalid certificate material: {0}")]
    Material(#[from] PemError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("archive error: {0}")]
    Archive(#[from] io::Error),

    #[error("sink '{sink}' failed: {source}")]
    Sink {
        sink: String,
        #[source]
        source: io::Error,
    },
}

impl From<rustls::Error> for ObserverError {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_kinds() {
        assert!(StorageError::NotFound("/certs/00".into()).is_not_found());
        assert!(!StorageError::NotFound("/certs/00".into()).is_comms_related());
        assert!(StorageError::Comms("connection refused".into()).is_comms_related());
        assert!(StorageError::Io(io::Error::from(io::ErrorKind::ConnectionRefused)).is_comms_related());
        assert!(!StorageError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_comms_related());
        assert!(!StorageError::InvalidStructure("x".into()).is_not_found());
    }

    #[test]
    fn test_renew_error_comms_passthrough() {
        let err: RenewError = StorageError::Comms("down".into()).into();
        assert!(err.is_comms_related());
        assert!(!RenewError::EmptyHostname.is_comms_related());
    }

    #[test]
    fn test_operator_messages() {
        assert_eq!(
            RenewError::UnknownSource("corp".into()).to_string(),
            "no cert source found for: corp"
        );
        assert_eq!(
            IssuanceError::AlreadyAuthorized.to_string(),
            "already authorized, no challenge needed"
        );
    }
}
