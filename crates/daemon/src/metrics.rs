//! Daemon metrics
//!
//! One [`Metrics`] instance is built at startup and shared by the engine,
//! the observers and the responder. Metrics live in their own registry
//! rather than the process-global default.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Labels for `renewd_errors_total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Periodic scan cycle
    Scan,
    /// Single host renewal
    Renew,
    /// Observer fan-out as a whole
    Publish,
    /// An individual observer
    Observer,
}

impl Task {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Renew => "renew",
            Self::Publish => "publish",
            Self::Observer => "observer",
        }
    }
}

/// Prometheus metrics collector
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    /// Errors by task
    /// Labels: task
    errors: IntCounterVec,

    /// Certificates issued
    /// Labels: source
    issued: IntCounterVec,
}

impl Metrics {
    /// Create the metrics and register them in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let errors = IntCounterVec::new(
            Opts::new("renewd_errors_total", "Errors encountered, by task"),
            &["task"],
        )?;
        registry.register(Box::new(errors.clone()))?;

        let issued = IntCounterVec::new(
            Opts::new("renewd_issued_total", "Certificates issued, by source"),
            &["source"],
        )?;
        registry.register(Box::new(issued.clone()))?;

        Ok(Self {
            registry,
            errors,
            issued,
        })
    }

    pub fn record_error(&self, task: Task) {
        self.errors.with_label_values(&[task.as_str()]).inc();
    }

    pub fn record_issued(&self, source: &str) {
        self.issued.with_label_values(&[source]).inc();
    }

    pub fn error_count(&self, task: Task) -> u64 {
        self.errors.with_label_values(&[task.as_str()]).get()
    }

    pub fn issued_count(&self, source: &str) -> u64 {
        self.issued.with_label_values(&[source]).get()
    }

    /// Text exposition of every metric
    pub fn export(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}
