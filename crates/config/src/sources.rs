//! Certificate source configuration.

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Let's Encrypt production directory URL
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory URL
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Recognized certificate source types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// ACME CA: automated HTTP-01 and manual DNS-01 issuance
    Acme,
    /// Locally generated, self-signed certificates
    SelfSigned,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acme => "acme",
            Self::SelfSigned => "self-signed",
        }
    }
}

/// One `[sources.<name>]` table
///
/// The type is kept as a string so an unrecognized value is reported as a
/// configuration error naming the offending source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub kind: String,

    /// ACME directory URL
    pub directory_url: Option<String>,

    /// ACME account contact email
    pub email: Option<String>,

    /// Serialized ACME account credentials (JSON) to reuse an existing account
    pub account_credentials: Option<String>,
}

impl SourceConfig {
    /// Resolve the configured type for the source called `name`
    pub fn kind(&self, name: &str) -> Result<SourceKind, ConfigError> {
        match self.kind.as_str() {
            "acme" => Ok(SourceKind::Acme),
            "self-signed" => Ok(SourceKind::SelfSigned),
            other => Err(ConfigError::UnknownSourceType {
                name: name.to_string(),
                kind: other.to_string(),
            }),
        }
    }

    /// Validate type-specific required fields
    pub fn validate(&self, name: &str) -> Result<SourceKind, ConfigError> {
        let kind = self.kind(name)?;

        if kind == SourceKind::Acme {
            if self.directory_url.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::IncompleteAcmeSource {
                    name: name.to_string(),
                    field: "directory_url",
                });
            }
            if self.email.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::IncompleteAcmeSource {
                    name: name.to_string(),
                    field: "email",
                });
            }
        }

        Ok(kind)
    }
}
