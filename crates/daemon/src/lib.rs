//! renewd Daemon Library
//!
//! Keeps TLS certificates for a set of hostnames issued and current:
//!
//! - **Renewal engine**: periodic scan deciding, per hostname, whether a new
//!   certificate is needed, plus the operator operations around it
//! - **Certificate sources**: ACME (automated HTTP-01, manual DNS-01) and
//!   self-signed issuance behind one trait
//! - **Challenge responder**: plain HTTP server answering CA validation
//!   requests from a shared challenge bridge
//! - **Store**: persistence of certificate records keyed by hostname path
//! - **Observers**: debounced fan-out of the certificate set to the
//!   daemon's own TLS listener and to bundle sinks
//!
//! # Example
//!
//! ```ignore
//! use renewd::{EngineSettings, MemoryStore, Metrics, RenewalEngine, SourceRegistry};
//!
//! let engine = Arc::new(RenewalEngine::new(
//!     EngineSettings::from_config(&config)?,
//!     SourceRegistry::from_config(&config, &bridge)?,
//!     Arc::new(MemoryStore::new()),
//!     observers,
//!     Metrics::new()?,
//! )?);
//! let (scan, publish) = engine.spawn();
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod bridge;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod observer;
pub mod responder;
pub mod source;
pub mod store;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Errors
pub use error::{IssuanceError, ObserverError, RenewError, StorageError};

// Engine
pub use engine::{
    renewal_decision, EngineSettings, InventoryEntry, RenewalDecision, RenewalEngine, ScanReport,
    BOOTSTRAP_HOST,
};

// Sources
pub use keys::IssuanceKey;
pub use source::{AcmeSource, CertificateChain, CertificateSource, SelfSignedSource, SourceRegistry};

// Challenge bridge and responder
pub use bridge::{challenge_path, ChallengeGuard, ChallengeResponder};
pub use responder::ChallengeServer;

// Storage
pub use store::{CertificateStore, FileStore, MemoryStore};

// Observers
pub use debounce::{DebouncedTrigger, TriggerHandle};
pub use observer::{BundlePublisher, BundleSink, CertificateObserver, FileSink, ListenerCertificate};

// Metrics
pub use metrics::{Metrics, Task};
