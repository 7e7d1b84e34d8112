//! Configuration for the renewd certificate daemon
//!
//! The daemon reads a single TOML file:
//!
//! ```toml
//! [daemon]
//! period = 3600          # seconds between scans
//! days_before = 32       # renew this many days before expiry
//!
//! [daemon.bootstrap]
//! source = "self-signed" # source for hosts that have no record yet
//!
//! [sources.letsencrypt]
//! type = "acme"
//! directory_url = "https://acme-v02.api.letsencrypt.org/directory"
//! email = "ops@example.com"
//!
//! [sources.self-signed]
//! type = "self-signed"
//!
//! [storage]
//! path = "/var/lib/renewd"
//!
//! [servers.acme_responder]
//! listen = "0.0.0.0:8080"
//!
//! [servers.admin]
//! external_url = "https://renewd.example.com"
//!
//! [[output.bundles]]
//! path = "/var/lib/renewd/out/certs.tar.gz"
//! ```
//!
//! [`Config::validate`] enforces everything the daemon needs before it can
//! start; any [`ConfigError`] is fatal.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

mod error;
pub mod sources;

pub use error::ConfigError;
pub use sources::{SourceConfig, SourceKind, LETSENCRYPT_PRODUCTION, LETSENCRYPT_STAGING};

// ============================================================================
// Configuration Model
// ============================================================================

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Certificate sources by name
    pub sources: BTreeMap<String, SourceConfig>,
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
    pub servers: ServersConfig,
    pub output: OutputConfig,
}

/// Renewal schedule settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Seconds between scans (required, non-zero)
    pub period: u64,
    /// Renew when a certificate expires within this many days (required, non-zero)
    pub days_before: u32,
    pub bootstrap: BootstrapConfig,
}

/// Source used for hosts that have never been issued
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub source: String,
}

/// File-backed credential store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/renewd"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServersConfig {
    pub acme_responder: ResponderConfig,
    pub admin: AdminConfig,
}

/// Plain HTTP listener serving HTTP-01 challenge responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    pub listen: String,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

/// The administrative listener; its external hostname is the daemon's own
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub external_url: String,
}

/// Downstream bundle publishing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub bundles: Vec<BundleConfig>,
}

/// A local file receiving the certificate bundle archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleConfig {
    pub path: PathBuf,
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(ConfigError::NoPath);
        }

        debug!(path = %path.display(), "Loading configuration file");

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without validating it
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        trace!(
            sources = config.sources.len(),
            bundles = config.output.bundles.len(),
            "Parsed configuration"
        );
        Ok(config)
    }

    /// Check everything the daemon requires before it starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.period == 0 {
            return Err(ConfigError::MissingPeriod);
        }
        if self.daemon.days_before == 0 {
            return Err(ConfigError::MissingDaysBefore);
        }

        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        for (name, source) in &self.sources {
            source.validate(name)?;
        }

        if !self.sources.contains_key(&self.daemon.bootstrap.source) {
            return Err(ConfigError::UnknownBootstrapSource(
                self.daemon.bootstrap.source.clone(),
            ));
        }

        self.admin_hostname()?;
        self.responder_addr()?;

        Ok(())
    }

    /// Hostname of the admin listener's external URL
    pub fn admin_hostname(&self) -> Result<String, ConfigError> {
        let raw = &self.servers.admin.external_url;
        if raw.trim().is_empty() {
            return Err(ConfigError::MissingExternalUrl);
        }

        let url = url::Url::parse(raw).map_err(|e| ConfigError::InvalidExternalUrl {
            url: raw.clone(),
            reason: e.to_string(),
        })?;

        match url.host_str() {
            Some(host) if !host.is_empty() => Ok(host.to_string()),
            _ => Err(ConfigError::MissingExternalUrl),
        }
    }

    /// Socket address of the challenge responder
    pub fn responder_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.servers
            .acme_responder
            .listen
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddress(self.servers.acme_responder.listen.clone()))
    }
}
