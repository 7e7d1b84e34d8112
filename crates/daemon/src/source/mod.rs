//! Certificate sources
//!
//! A source turns a hostname and a fresh key into an issued certificate
//! chain (DER, leaf first). Two kinds exist:
//!
//! - [`AcmeSource`]: an ACME CA, automated via HTTP-01 or manual via DNS-01
//! - [`SelfSignedSource`]: local self-signed issuance, automated only
//!
//! Sources are built once at startup into a [`SourceRegistry`] and looked up
//! by name. Each source serializes its own operations; callers bound them
//! with a deadline.

mod acme;
mod acme_api;
mod credentials;
mod self_signed;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use renewd_common::ChallengeDescriptor;
use renewd_config::{Config, ConfigError, SourceKind};
use tracing::info;

use crate::bridge::ChallengeResponder;
use crate::error::IssuanceError;
use crate::keys::IssuanceKey;

pub use acme::AcmeSource;
pub use acme_api::{
    AcmeApi, AuthorizationInfo, AuthorizationState, ChallengeInfo, ChallengeKind, InstantAcmeApi,
    OrderHandle, OrderState,
};
pub use credentials::AccountCredentialsFile;
pub use self_signed::SelfSignedSource;

/// Issued chain, DER encoded, leaf first
pub type CertificateChain = Vec<Vec<u8>>;

/// One configured issuance source
#[async_trait]
pub trait CertificateSource: Send + Sync {
    /// Obtain a certificate for `hostname` without operator involvement
    async fn auto_fetch(
        &self,
        key: &IssuanceKey,
        hostname: &str,
    ) -> Result<CertificateChain, IssuanceError>;

    /// Begin a manual challenge and describe what the operator must do
    async fn manual_start_challenge(
        &self,
        hostname: &str,
    ) -> Result<ChallengeDescriptor, IssuanceError>;

    /// Resume a manual challenge started earlier and issue the certificate
    async fn complete_challenge(
        &self,
        key: &IssuanceKey,
        hostname: &str,
        challenge: &ChallengeDescriptor,
    ) -> Result<CertificateChain, IssuanceError>;

    /// Whether manual challenges are available
    fn supports_manual(&self) -> bool;
}

/// Sources by name
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<dyn CertificateSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured source
    ///
    /// ACME sources publish their HTTP-01 responses through `bridge` and keep
    /// their account credentials under the storage directory.
    pub fn from_config(config: &Config, bridge: &ChallengeResponder) -> Result<Self, ConfigError> {
        let mut registry = Self::new();

        for (name, source) in &config.sources {
            let kind = source.validate(name)?;
            let built: Arc<dyn CertificateSource> = match kind {
                SourceKind::SelfSigned => Arc::new(SelfSignedSource::new()),
                SourceKind::Acme => {
                    let api = InstantAcmeApi::from_config(source).with_credentials_file(
                        AccountCredentialsFile::for_source(&config.storage.path, name),
                    );
                    Arc::new(AcmeSource::new(name.clone(), Box::new(api), bridge.clone()))
                }
            };
            info!(source = %name, kind = kind.as_str(), "Configured certificate source");
            registry.insert(name.clone(), built);
        }

        if registry.is_empty() {
            return Err(ConfigError::NoSources);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, name: impl Into<String>, source: Arc<dyn CertificateSource>) {
        self.sources.insert(name.into(), source);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn CertificateSource>> {
        self.sources.get(name)
    }

    /// Source names, sorted
    pub fn names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[daemon]
period = 60
days_before = 30

[daemon.bootstrap]
source = "self"

[sources.self]
type = "self-signed"

[sources.le]
type = "acme"
directory_url = "https://acme-staging-v02.api.letsencrypt.org/directory"
email = "ops@example.com"

[servers.admin]
external_url = "https://renewd.example.com"
"#;

    #[test]
    fn test_registry_from_config() {
        let config = Config::from_toml(CONFIG).unwrap();
        let registry = SourceRegistry::from_config(&config, &ChallengeResponder::new()).unwrap();

        assert_eq!(registry.names(), vec!["le".to_string(), "self".to_string()]);
        assert!(registry.get("le").unwrap().supports_manual());
        assert!(!registry.get("self").unwrap().supports_manual());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_registry_rejects_unknown_type() {
        let config = Config::from_toml(&CONFIG.replace("type = \"self-signed\"", "type = \"venafi\"")).unwrap();
        assert!(matches!(
            SourceRegistry::from_config(&config, &ChallengeResponder::new()),
            Err(ConfigError::UnknownSourceType { .. })
        ));
    }
}
