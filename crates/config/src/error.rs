//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that make the daemon refuse to start
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("must specify a config path")]
    NoPath,

    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("period must be specified and non-zero. should be in seconds")]
    MissingPeriod,

    #[error("days before must be specified and non-zero. should be in days")]
    MissingDaysBefore,

    #[error("must specify at least one cert source")]
    NoSources,

    #[error("unknown cert source type '{kind}' for source '{name}'")]
    UnknownSourceType { name: String, kind: String },

    #[error("acme source '{name}' requires '{field}'")]
    IncompleteAcmeSource { name: String, field: &'static str },

    #[error("bootstrap source '{0}' is not a configured source")]
    UnknownBootstrapSource(String),

    #[error("admin external url must be specified")]
    MissingExternalUrl,

    #[error("invalid admin external url '{url}': {reason}")]
    InvalidExternalUrl { url: String, reason: String },

    #[error("invalid listen address '{0}'")]
    InvalidListenAddress(String),
}
