//! renewd common types
//!
//! Shared by the configuration and daemon crates:
//!
//! - [`CertificateRecord`] and friends: what the daemon persists per hostname
//! - [`path`]: reversible hostname to storage-path encoding
//! - [`material`]: strict PEM encoding/decoding and certificate expiry

pub mod material;
pub mod path;
pub mod record;

pub use material::PemError;
pub use path::{host_from_path, path_from_host, CERT_PATH_PREFIX};
pub use record::{CertificateRecord, ChallengeDescriptor, RecordType};
