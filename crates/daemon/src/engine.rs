//! Renewal engine
//!
//! Owns the renewal schedule for every tracked hostname:
//!
//! - a periodic scan that decides, per host, whether a new certificate is
//!   needed and issues it through the host's certificate source
//! - a debounced publish loop that hands the full certificate set to every
//!   observer once issuance has gone quiet
//!
//! The two loops share nothing but the store and a bounded signal queue.
//!
//! # Fixed hosts
//!
//! The bootstrap sentinel ([`BOOTSTRAP_HOST`]) and the daemon's own hostname
//! are always tracked, always scanned first (in that order) and can never be
//! deleted. Their records are typed `admin`; every other record is `user`.
//!
//! # Renewal decision
//!
//! See [`renewal_decision`]. Records with a pending manual challenge and
//! records whose certificate has already expired are never renewed
//! automatically; both surface as errors so an operator notices.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use renewd_common::material::split_chain;
use renewd_common::{
    host_from_path, path_from_host, CertificateRecord, ChallengeDescriptor, RecordType,
};
use renewd_config::{Config, ConfigError};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::debounce::{DebouncedTrigger, TriggerHandle};
use crate::error::{IssuanceError, RenewError};
use crate::keys::IssuanceKey;
use crate::metrics::{Metrics, Task};
use crate::observer::CertificateObserver;
use crate::source::{CertificateChain, CertificateSource, SourceRegistry};
use crate::store::CertificateStore;

/// Sentinel hostname scanned before anything else
pub const BOOTSTRAP_HOST: &str = "proxy-bootstrap";

/// Deadline for a single certificate source operation
pub const ISSUANCE_DEADLINE: Duration = Duration::from_secs(60);

/// Scan interval while the store is unreachable during startup
pub const BOOTSTRAP_RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// Quiet period before observers are notified
pub const PUBLISH_QUIET_PERIOD: Duration = Duration::from_secs(30);

/// Delay before the first publish after startup
pub const INITIAL_PUBLISH_DELAY: Duration = Duration::from_secs(5);

// ============================================================================
// Settings
// ============================================================================

/// Schedule settings for the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Time between scans
    pub period: Duration,
    /// Renew certificates expiring within this many days
    pub days_before: u32,
    /// Source for hostnames that have no record yet
    pub bootstrap_source: String,
    /// The daemon's own hostname
    pub our_hostname: String,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            period: Duration::from_secs(config.daemon.period),
            days_before: config.daemon.days_before,
            bootstrap_source: config.daemon.bootstrap.source.clone(),
            our_hostname: config.admin_hostname()?,
        })
    }
}

/// Operator-supplied hostname with surrounding whitespace removed
fn normalize_hostname(hostname: &str) -> Result<&str, RenewError> {
    let hostname = hostname.trim();
    if hostname.is_empty() {
        return Err(RenewError::EmptyHostname);
    }
    Ok(hostname)
}

// ============================================================================
// Renewal Decision
// ============================================================================

/// What the scan should do for one hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalDecision {
    /// Certificate is fine
    NoAction,
    /// Issue a new certificate from the named source
    NeedsNew { source: String },
}

/// Decide whether `hostname` needs a new certificate
///
/// - no record: new certificate from the bootstrap source
/// - pending manual challenge: [`RenewError::PendingChallenge`]
/// - nothing issued yet: new certificate from the record's source
/// - already expired: [`RenewError::AlreadyExpired`]
/// - expiring within `days_before` days: new certificate from the record's source
/// - otherwise: no action
///
/// Stored certificate material that fails to parse is an error.
pub fn renewal_decision(
    hostname: &str,
    record: Option<&CertificateRecord>,
    bootstrap_source: &str,
    days_before: u32,
    now: DateTime<Utc>,
) -> Result<RenewalDecision, RenewError> {
    let Some(record) = record else {
        return Ok(RenewalDecision::NeedsNew {
            source: bootstrap_source.to_string(),
        });
    };

    if record.has_pending_challenge() {
        return Err(RenewError::PendingChallenge(hostname.to_string()));
    }

    if !record.is_issued() {
        return Ok(RenewalDecision::NeedsNew {
            source: record.source.clone(),
        });
    }

    let not_after = record.not_after()?;
    if not_after < now {
        return Err(RenewError::AlreadyExpired {
            hostname: hostname.to_string(),
            not_after,
        });
    }

    if not_after < now + chrono::Duration::days(i64::from(days_before)) {
        return Ok(RenewalDecision::NeedsNew {
            source: record.source.clone(),
        });
    }

    Ok(RenewalDecision::NoAction)
}

// ============================================================================
// Reports
// ============================================================================

/// Outcome of one scan cycle that reached the store
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Hostnames evaluated
    pub checked: usize,
    /// Hostnames issued a new certificate
    pub renewed: usize,
    /// Hostnames that failed
    pub failed: usize,
    /// Whether any failure was an unreachable store
    pub comms_error: bool,
    /// The last failure seen
    pub last_error: Option<RenewError>,
}

impl ScanReport {
    pub fn is_success(&self) -> bool {
        self.last_error.is_none()
    }
}

/// One stored record as shown to operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    /// Hostname, or `cannot decode: <path>`
    pub name: String,
    pub path: String,
    pub source: String,
    pub record_type: RecordType,
    /// Whole days until expiry; -1 when nothing is issued
    pub days_remaining: i64,
    pub can_delete: bool,
    pub can_manual: bool,
    /// Instructions of a pending manual challenge
    pub pending_instructions: Option<String>,
}

/// How a certificate is obtained from its source
enum Issue {
    Auto,
    Complete(ChallengeDescriptor),
}

// ============================================================================
// Engine
// ============================================================================

/// The renewal engine
///
/// Wrap in an [`Arc`] and call [`RenewalEngine::spawn`] to start both loops;
/// the operator operations can be called concurrently from anywhere.
pub struct RenewalEngine {
    settings: EngineSettings,
    fixed_hosts: Vec<String>,
    sources: SourceRegistry,
    store: Arc<dyn CertificateStore>,
    observers: Vec<Arc<dyn CertificateObserver>>,
    metrics: Metrics,
    publish: TriggerHandle,
    publish_trigger: parking_lot::Mutex<Option<DebouncedTrigger>>,
}

impl RenewalEngine {
    /// Create an engine, validating its schedule and sources
    pub fn new(
        settings: EngineSettings,
        sources: SourceRegistry,
        store: Arc<dyn CertificateStore>,
        observers: Vec<Arc<dyn CertificateObserver>>,
        metrics: Metrics,
    ) -> Result<Self, ConfigError> {
        if settings.period.is_zero() {
            return Err(ConfigError::MissingPeriod);
        }
        if settings.days_before == 0 {
            return Err(ConfigError::MissingDaysBefore);
        }
        if sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        if !sources.contains(&settings.bootstrap_source) {
            return Err(ConfigError::UnknownBootstrapSource(
                settings.bootstrap_source.clone(),
            ));
        }

        let fixed_hosts = vec![BOOTSTRAP_HOST.to_string(), settings.our_hostname.clone()];

        let trigger = DebouncedTrigger::new("publish", PUBLISH_QUIET_PERIOD)
            .with_initial_delay(INITIAL_PUBLISH_DELAY);

        info!(
            period_secs = settings.period.as_secs(),
            days_before = settings.days_before,
            bootstrap_source = %settings.bootstrap_source,
            our_hostname = %settings.our_hostname,
            sources = ?sources.names(),
            observers = observers.len(),
            "Initialized renewal engine"
        );

        Ok(Self {
            settings,
            fixed_hosts,
            sources,
            store,
            observers,
            metrics,
            publish: trigger.handle(),
            publish_trigger: parking_lot::Mutex::new(Some(trigger)),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn fixed_hosts(&self) -> &[String] {
        &self.fixed_hosts
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Handle for requesting an observer fan-out
    pub fn publish_handle(&self) -> TriggerHandle {
        self.publish.clone()
    }

    fn is_fixed_host(&self, hostname: &str) -> bool {
        self.fixed_hosts.iter().any(|h| h == hostname)
    }

    fn source(&self, name: &str) -> Result<Arc<dyn CertificateSource>, RenewError> {
        self.sources
            .get(name)
            .cloned()
            .ok_or_else(|| RenewError::UnknownSource(name.to_string()))
    }

    // ========================================================================
    // Background Loops
    // ========================================================================

    /// Start the scan loop and the publish loop
    pub fn spawn(self: &Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let scan = tokio::spawn(Arc::clone(self).run_scan_loop());
        let publish = tokio::spawn(Arc::clone(self).run_publish_loop());
        (scan, publish)
    }

    /// Scan forever, sleeping `period` between cycles
    ///
    /// Until one cycle succeeds, a cycle that hit an unreachable store is
    /// retried after [`BOOTSTRAP_RETRY_INTERVAL`] instead.
    pub async fn run_scan_loop(self: Arc<Self>) {
        let mut bootstrapped = false;

        loop {
            let mut next_sleep = self.settings.period;

            info!("Starting periodic scan");
            let comms_error = match self.periodic_scan().await {
                Ok(report) if report.is_success() => {
                    info!(
                        checked = report.checked,
                        renewed = report.renewed,
                        "Periodic scan finished successfully"
                    );
                    bootstrapped = true;
                    false
                }
                Ok(report) => {
                    warn!(
                        checked = report.checked,
                        renewed = report.renewed,
                        failed = report.failed,
                        "Periodic scan finished with errors"
                    );
                    report.comms_error
                }
                Err(e) => {
                    error!(error = %e, "Periodic scan aborted");
                    self.metrics.record_error(Task::Scan);
                    e.is_comms_related()
                }
            };

            if comms_error && !bootstrapped {
                info!("Store looks unreachable, reducing sleep time");
                next_sleep = BOOTSTRAP_RETRY_INTERVAL;
            }

            debug!(sleep_secs = next_sleep.as_secs(), "Sleeping until next scan");
            sleep(next_sleep).await;
        }
    }

    /// Notify observers after issuance goes quiet, until the task is dropped
    pub async fn run_publish_loop(self: Arc<Self>) {
        let Some(trigger) = self.publish_trigger.lock().take() else {
            warn!("Publish loop already running");
            return;
        };

        let engine = Arc::clone(&self);
        trigger
            .run(move || {
                let engine = Arc::clone(&engine);
                async move { engine.update_observers().await }
            })
            .await;
    }

    /// Run one scan cycle
    ///
    /// Fails only when the store cannot list records; per-host failures are
    /// collected in the report.
    pub async fn periodic_scan(&self) -> Result<ScanReport, RenewError> {
        // Make sure the store is reachable before talking to any CA
        let records = self.store.fetch_all().await?;

        let mut report = ScanReport::default();

        for hostname in &self.fixed_hosts {
            self.scan_host(hostname, &mut report).await;
        }

        for record in &records {
            let Some(hostname) = host_from_path(&record.path) else {
                warn!(path = %record.path, "Cannot decode hostname from path, skipping");
                continue;
            };
            if self.is_fixed_host(&hostname) {
                continue;
            }
            self.scan_host(&hostname, &mut report).await;
        }

        Ok(report)
    }

    async fn scan_host(&self, hostname: &str, report: &mut ScanReport) {
        report.checked += 1;
        match self.renew_cert_if_needed(hostname).await {
            Ok(true) => report.renewed += 1,
            Ok(false) => {}
            Err(e) => {
                error!(hostname = %hostname, error = %e, "Error renewing, continuing with others");
                self.metrics.record_error(Task::Renew);
                report.failed += 1;
                report.comms_error |= e.is_comms_related();
                report.last_error = Some(e);
            }
        }
    }

    /// Renew `hostname` if [`renewal_decision`] says so; returns whether it did
    pub async fn renew_cert_if_needed(&self, hostname: &str) -> Result<bool, RenewError> {
        let record = match self.store.load(&path_from_host(hostname)).await {
            Ok(record) => Some(record),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        let decision = renewal_decision(
            hostname,
            record.as_ref(),
            &self.settings.bootstrap_source,
            self.settings.days_before,
            Utc::now(),
        )?;

        match decision {
            RenewalDecision::NoAction => {
                debug!(hostname = %hostname, "Certificate is still valid");
                Ok(false)
            }
            RenewalDecision::NeedsNew { source } => {
                info!(hostname = %hostname, source = %source, "Certificate needs renewal");
                self.renew_cert_now(hostname, &source).await?;
                Ok(true)
            }
        }
    }

    /// Fetch every record and hand it to each observer in order
    pub async fn update_observers(&self) -> Result<(), RenewError> {
        let records = match self.store.fetch_all().await {
            Ok(records) => records,
            Err(e) => {
                self.metrics.record_error(Task::Publish);
                return Err(e.into());
            }
        };

        info!(records = records.len(), observers = self.observers.len(), "Updating observers");

        let mut failed = 0;
        for observer in &self.observers {
            if let Err(e) = observer.on_certificates_updated(&records).await {
                error!(
                    observer = observer.name(),
                    error = %e,
                    "Error updating observer, continuing with others"
                );
                self.metrics.record_error(Task::Observer);
                failed += 1;
            }
        }

        if failed > 0 {
            self.metrics.record_error(Task::Publish);
            return Err(RenewError::ObserversFailed {
                failed,
                total: self.observers.len(),
            });
        }

        info!("Updating observers completed successfully");
        Ok(())
    }

    // ========================================================================
    // Issuance
    // ========================================================================

    async fn get_cert_and_save(
        &self,
        hostname: &str,
        source_name: &str,
        issue: Issue,
    ) -> Result<(), RenewError> {
        let source = self.source(source_name)?;
        let key = IssuanceKey::generate()?;

        let fetch = async {
            match &issue {
                Issue::Auto => source.auto_fetch(&key, hostname).await,
                Issue::Complete(challenge) => source.complete_challenge(&key, hostname, challenge).await,
            }
        };
        let chain: CertificateChain = timeout(ISSUANCE_DEADLINE, fetch)
            .await
            .map_err(|_| IssuanceError::Timeout(ISSUANCE_DEADLINE))??;

        let (certificate_pem, ca_chain_pem) = split_chain(&chain)?;

        let record_type = if self.can_delete(hostname) {
            RecordType::User
        } else {
            RecordType::Admin
        };

        let record = CertificateRecord {
            source: source_name.to_string(),
            record_type,
            ca_chain_pem,
            certificate_pem,
            private_key_pem: key.private_key_pem()?,
            pending_challenge: None,
            ..Default::default()
        };

        self.store.save(&path_from_host(hostname), &record).await?;

        info!(
            hostname = %hostname,
            source = %source_name,
            record_type = %record_type,
            "Saved new certificate"
        );
        self.metrics.record_issued(source_name);
        self.publish.signal();

        Ok(())
    }

    // ========================================================================
    // Operator Operations
    // ========================================================================

    /// Configured source names, sorted
    pub fn sources(&self) -> Vec<String> {
        self.sources.names()
    }

    /// Whether an operator may delete `hostname`
    pub fn can_delete(&self, hostname: &str) -> bool {
        !self.is_fixed_host(hostname)
    }

    /// Whether `source` exists and supports manual challenges
    pub fn source_can_manual(&self, source: &str) -> bool {
        self.sources
            .get(source)
            .is_some_and(|s| s.supports_manual())
    }

    /// Whether `hostname` should be shipped to downstream proxies
    pub fn ship_to_proxy(&self, hostname: &str) -> bool {
        hostname != self.settings.our_hostname
    }

    /// Issue a certificate for `hostname` from `source` right now
    pub async fn renew_cert_now(&self, hostname: &str, source: &str) -> Result<(), RenewError> {
        self.get_cert_and_save(hostname, source, Issue::Auto).await
    }

    /// Renew `hostname` now with the source of its existing record
    pub async fn renew_existing(&self, hostname: &str) -> Result<(), RenewError> {
        let hostname = normalize_hostname(hostname)?;
        let record = self.store.load(&path_from_host(hostname)).await?;
        self.renew_cert_now(hostname, &record.source).await
    }

    /// Start a manual challenge and store its instructions on the record
    pub async fn start_manual_challenge(&self, hostname: &str) -> Result<(), RenewError> {
        let hostname = normalize_hostname(hostname)?;
        let path = path_from_host(hostname);
        let mut record = self.store.load(&path).await?;
        let source = self.source(&record.source)?;

        let challenge = timeout(ISSUANCE_DEADLINE, source.manual_start_challenge(hostname))
            .await
            .map_err(|_| IssuanceError::Timeout(ISSUANCE_DEADLINE))??;

        info!(hostname = %hostname, source = %record.source, "Manual challenge started");
        record.pending_challenge = Some(challenge);
        self.store.save(&path, &record).await?;
        Ok(())
    }

    /// Complete the stored manual challenge and save the issued certificate
    pub async fn complete_challenge(&self, hostname: &str) -> Result<(), RenewError> {
        let hostname = normalize_hostname(hostname)?;
        let record = self.store.load(&path_from_host(hostname)).await?;
        let challenge = record
            .pending_challenge
            .ok_or_else(|| RenewError::NoPendingChallenge(hostname.to_string()))?;

        self.get_cert_and_save(hostname, &record.source, Issue::Complete(challenge))
            .await
    }

    /// Start tracking `hostname`; it is issued on the next scan
    pub async fn add_host(&self, hostname: &str, source: &str) -> Result<(), RenewError> {
        let hostname = normalize_hostname(hostname)?;
        if !self.sources.contains(source) {
            return Err(RenewError::UnknownSource(source.to_string()));
        }

        let path = path_from_host(hostname);
        match self.store.load(&path).await {
            Ok(_) => return Err(RenewError::AlreadyManaged(hostname.to_string())),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let record_type = if self.can_delete(hostname) {
            RecordType::User
        } else {
            RecordType::Admin
        };
        self.store
            .save(&path, &CertificateRecord::unissued(source, record_type))
            .await?;

        info!(hostname = %hostname, source = %source, "Added host");
        Ok(())
    }

    /// Stop tracking `hostname`
    pub async fn delete_host(&self, hostname: &str) -> Result<(), RenewError> {
        let hostname = normalize_hostname(hostname)?;
        if !self.can_delete(hostname) {
            return Err(RenewError::FixedHost(hostname.to_string()));
        }

        self.store.delete(&path_from_host(hostname)).await?;
        info!(hostname = %hostname, "Deleted host");
        self.publish.signal();
        Ok(())
    }

    /// Change the source used for future renewals of `hostname`
    pub async fn set_source(&self, hostname: &str, source: &str) -> Result<(), RenewError> {
        let hostname = normalize_hostname(hostname)?;
        if !self.sources.contains(source) {
            return Err(RenewError::UnknownSource(source.to_string()));
        }

        let path = path_from_host(hostname);
        let mut record = self.store.load(&path).await?;
        record.source = source.to_string();
        self.store.save(&path, &record).await?;

        info!(hostname = %hostname, source = %source, "Changed certificate source");
        Ok(())
    }

    /// Every stored record summarized for operators, sorted by name
    pub async fn inventory(&self) -> Result<Vec<InventoryEntry>, RenewError> {
        let now = Utc::now();
        let mut entries = Vec::new();

        for record in self.store.fetch_all().await? {
            let name = record
                .hostname()
                .unwrap_or_else(|| format!("cannot decode: {}", record.path));

            entries.push(InventoryEntry {
                days_remaining: record.days_remaining(now)?.unwrap_or(-1),
                can_delete: self.can_delete(&name),
                can_manual: self.source_can_manual(&record.source),
                pending_instructions: record
                    .pending_challenge
                    .as_ref()
                    .map(|c| c.instructions().to_string()),
                source: record.source,
                record_type: record.record_type,
                path: record.path,
                name,
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

impl std::fmt::Debug for RenewalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalEngine")
            .field("settings", &self.settings)
            .field("fixed_hosts", &self.fixed_hosts)
            .field("sources", &self.sources)
            .field("observers", &self.observers.len())
            .finish()
    }
}
