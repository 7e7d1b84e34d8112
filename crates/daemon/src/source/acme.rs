//! ACME certificate source
//!
//! Drives the issuance flows against an [`AcmeApi`] session:
//!
//! - automated: HTTP-01, responses published through the challenge bridge
//!   for exactly as long as the flow runs
//! - manual: DNS-01, started and completed in two separate calls with the
//!   operator publishing the TXT record in between
//!
//! The account is registered lazily. A failed registration is not fatal
//! (the account usually exists already) but is retried on the next call
//! until one succeeds.

use async_trait::async_trait;
use renewd_common::material::decode_certificate_chain;
use renewd_common::{ChallengeDescriptor, PemError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::acme_api::{AcmeApi, AuthorizationState, ChallengeKind, OrderState};
use super::{CertificateChain, CertificateSource};
use crate::bridge::{challenge_path, ChallengeGuard, ChallengeResponder};
use crate::error::IssuanceError;
use crate::keys::IssuanceKey;

/// Per-source state guarded by the issuance lock
#[derive(Debug, Default)]
struct AcmeState {
    known_registered: bool,
}

/// A certificate source backed by an ACME CA
pub struct AcmeSource {
    name: String,
    api: Box<dyn AcmeApi>,
    bridge: ChallengeResponder,
    /// Serializes issuance flows; the CA session is not meant for concurrent use
    state: Mutex<AcmeState>,
}

impl AcmeSource {
    pub fn new(name: impl Into<String>, api: Box<dyn AcmeApi>, bridge: ChallengeResponder) -> Self {
        Self {
            name: name.into(),
            api,
            bridge,
            state: Mutex::new(AcmeState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_registered(&self, state: &mut AcmeState) {
        if state.known_registered {
            return;
        }

        match self.api.register().await {
            Ok(()) => {
                info!(source = %self.name, "Registered with ACME CA");
                state.known_registered = true;
            }
            Err(e) => {
                // Usually means the account already exists; retried on the next call
                warn!(
                    source = %self.name,
                    error = %e,
                    "Error registering with ACME CA, likely already registered, ignoring"
                );
            }
        }
    }

    /// Finalize a ready order with a CSR for `key` and decode the chain
    async fn issue(
        &self,
        order_url: &str,
        key: &IssuanceKey,
        hostname: &str,
    ) -> Result<CertificateChain, IssuanceError> {
        let csr = key.csr_der(hostname)?;

        debug!(source = %self.name, hostname = %hostname, "Finalizing ACME order");
        let pem = self.api.finalize(order_url, &csr).await?;

        let chain = decode_certificate_chain(&pem).map_err(|e| match e {
            PemError::EmptyChain => IssuanceError::NoCertificate,
            other => IssuanceError::Material(other),
        })?;
        info!(source = %self.name, hostname = %hostname, chain_len = chain.len(), "Certificate issued");
        Ok(chain)
    }

    async fn await_valid_authorization(&self, order_url: &str, hostname: &str) -> Result<(), IssuanceError> {
        match self.api.wait_authorization(order_url, hostname).await? {
            AuthorizationState::Valid => Ok(()),
            state => Err(IssuanceError::Authorization {
                hostname: hostname.to_string(),
                status: state.as_str().to_string(),
            }),
        }
    }

    async fn await_ready_order(&self, order_url: &str) -> Result<(), IssuanceError> {
        match self.api.wait_order(order_url).await? {
            OrderState::Ready | OrderState::Valid => Ok(()),
            state => Err(IssuanceError::OrderStatus(state.as_str().to_string())),
        }
    }
}

#[async_trait]
impl CertificateSource for AcmeSource {
    async fn auto_fetch(
        &self,
        key: &IssuanceKey,
        hostname: &str,
    ) -> Result<CertificateChain, IssuanceError> {
        let mut state = self.state.lock().await;
        self.ensure_registered(&mut state).await;

        let order = self.api.new_order(hostname).await?;

        // Published responses stay up until this flow returns
        let mut published: Vec<ChallengeGuard> = Vec::new();

        match order.state {
            OrderState::Ready | OrderState::Valid => {
                info!(source = %self.name, hostname = %hostname, "Order already validated");
            }
            OrderState::Pending => {
                for auth in self.api.authorizations(&order.url).await? {
                    if auth.state == AuthorizationState::Valid {
                        continue;
                    }

                    let challenge = auth
                        .challenge(ChallengeKind::Http01)
                        .ok_or(IssuanceError::NoSupportedChallenge("http-01"))?;

                    published.push(
                        self.bridge
                            .publish(&challenge_path(&challenge.token), challenge.http01_value.clone()),
                    );

                    debug!(source = %self.name, hostname = %auth.identifier, "Accepting HTTP-01 challenge");
                    self.api.accept_challenge(&order.url, &challenge.url).await?;
                    self.await_valid_authorization(&order.url, &auth.identifier).await?;
                }

                self.await_ready_order(&order.url).await?;
            }
            other => return Err(IssuanceError::OrderStatus(other.as_str().to_string())),
        }

        let chain = self.issue(&order.url, key, hostname).await;
        drop(published);
        chain
    }

    async fn manual_start_challenge(
        &self,
        hostname: &str,
    ) -> Result<ChallengeDescriptor, IssuanceError> {
        let mut state = self.state.lock().await;
        self.ensure_registered(&mut state).await;

        let order = self.api.new_order(hostname).await?;
        match order.state {
            OrderState::Pending => {}
            OrderState::Ready | OrderState::Valid => return Err(IssuanceError::AlreadyAuthorized),
            other => return Err(IssuanceError::OrderStatus(other.as_str().to_string())),
        }

        let mut selected = None;
        for auth in self.api.authorizations(&order.url).await? {
            if auth.state == AuthorizationState::Valid {
                continue;
            }
            let challenge = auth
                .challenge(ChallengeKind::Dns01)
                .ok_or(IssuanceError::NoSupportedChallenge("dns-01"))?;
            selected.get_or_insert_with(|| challenge.clone());
        }

        let challenge = selected.ok_or(IssuanceError::AlreadyAuthorized)?;
        info!(source = %self.name, hostname = %hostname, "Started manual DNS-01 challenge");

        Ok(ChallengeDescriptor::dns01(
            hostname,
            challenge.dns01_value,
            order.url,
            challenge.url,
        ))
    }

    async fn complete_challenge(
        &self,
        key: &IssuanceKey,
        hostname: &str,
        challenge: &ChallengeDescriptor,
    ) -> Result<CertificateChain, IssuanceError> {
        let mut state = self.state.lock().await;
        self.ensure_registered(&mut state).await;

        let order = self.api.resume_order(&challenge.order_url).await?;
        debug!(
            source = %self.name,
            hostname = %hostname,
            status = order.state.as_str(),
            "Accepting DNS-01 challenge"
        );

        self.api
            .accept_challenge(&challenge.order_url, &challenge.challenge_url)
            .await?;
        self.await_valid_authorization(&challenge.order_url, hostname).await?;
        self.await_ready_order(&challenge.order_url).await?;

        self.issue(&challenge.order_url, key, hostname).await
    }

    fn supports_manual(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for AcmeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeSource").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::acme_api::{AuthorizationInfo, ChallengeInfo, OrderHandle};
    use parking_lot::Mutex as SyncMutex;
    use renewd_common::material::encode_certificate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Scripted CA session recording every call
    struct FakeAcme {
        bridge: ChallengeResponder,
        register_failures: SyncMutex<u32>,
        order_state: OrderState,
        auth_state: AuthorizationState,
        offered: Vec<ChallengeKind>,
        validation_result: AuthorizationState,
        calls: Arc<SyncMutex<Vec<String>>>,
        /// Whether the HTTP-01 response was visible when the challenge was accepted
        seen_during_accept: Arc<SyncMutex<Option<Vec<u8>>>>,
        chain_pem: String,
        /// How long a new order takes to be created
        order_delay: Duration,
        /// Orders created but not yet finalized, and the most seen at once
        open_orders: Arc<AtomicUsize>,
        max_open_orders: Arc<AtomicUsize>,
    }

    impl FakeAcme {
        fn new(bridge: &ChallengeResponder) -> Self {
            let key = rcgen::KeyPair::generate().unwrap();
            let cert = rcgen::CertificateParams::new(vec!["example.com".to_string()])
                .unwrap()
                .self_signed(&key)
                .unwrap();
            let der = cert.der().to_vec();
            Self {
                bridge: bridge.clone(),
                register_failures: SyncMutex::new(0),
                order_state: OrderState::Pending,
                auth_state: AuthorizationState::Pending,
                offered: vec![ChallengeKind::Http01, ChallengeKind::Dns01],
                validation_result: AuthorizationState::Valid,
                calls: Arc::default(),
                seen_during_accept: Arc::default(),
                chain_pem: format!("{}{}", encode_certificate(&der), encode_certificate(&der)),
                order_delay: Duration::ZERO,
                open_orders: Arc::default(),
                max_open_orders: Arc::default(),
            }
        }

        fn record(&self, call: &str) {
            self.calls.lock().push(call.to_string());
        }
    }

    #[async_trait]
    impl AcmeApi for FakeAcme {
        async fn register(&self) -> Result<(), IssuanceError> {
            self.record("register");
            let mut failures = self.register_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(IssuanceError::Protocol("account exists".to_string()));
            }
            Ok(())
        }

        async fn new_order(&self, _hostname: &str) -> Result<OrderHandle, IssuanceError> {
            self.record("new_order");
            let open = self.open_orders.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_open_orders.fetch_max(open, Ordering::SeqCst);
            if !self.order_delay.is_zero() {
                tokio::time::sleep(self.order_delay).await;
            }
            Ok(OrderHandle {
                url: "https://ca/order/1".to_string(),
                state: self.order_state,
            })
        }

        async fn resume_order(&self, order_url: &str) -> Result<OrderHandle, IssuanceError> {
            self.record("resume_order");
            Ok(OrderHandle {
                url: order_url.to_string(),
                state: OrderState::Pending,
            })
        }

        async fn authorizations(&self, _order_url: &str) -> Result<Vec<AuthorizationInfo>, IssuanceError> {
            self.record("authorizations");
            Ok(vec![AuthorizationInfo {
                identifier: "example.com".to_string(),
                state: self.auth_state,
                challenges: self
                    .offered
                    .iter()
                    .map(|kind| ChallengeInfo {
                        kind: *kind,
                        url: format!("https://ca/chall/{:?}", kind),
                        token: "tok".to_string(),
                        http01_value: "tok.thumb".to_string(),
                        dns01_value: "digest".to_string(),
                    })
                    .collect(),
            }])
        }

        async fn accept_challenge(&self, _order_url: &str, challenge_url: &str) -> Result<(), IssuanceError> {
            self.record(&format!("accept {}", challenge_url));
            *self.seen_during_accept.lock() = self.bridge.get("/.well-known/acme-challenge/tok");
            Ok(())
        }

        async fn wait_authorization(
            &self,
            _order_url: &str,
            _hostname: &str,
        ) -> Result<AuthorizationState, IssuanceError> {
            self.record("wait_authorization");
            Ok(self.validation_result)
        }

        async fn wait_order(&self, _order_url: &str) -> Result<OrderState, IssuanceError> {
            self.record("wait_order");
            Ok(OrderState::Ready)
        }

        async fn finalize(&self, _order_url: &str, csr_der: &[u8]) -> Result<String, IssuanceError> {
            self.record("finalize");
            self.open_orders.fetch_sub(1, Ordering::SeqCst);
            assert!(!csr_der.is_empty());
            Ok(self.chain_pem.clone())
        }
    }

    fn source_with(fake: FakeAcme, bridge: &ChallengeResponder) -> AcmeSource {
        AcmeSource::new("le", Box::new(fake), bridge.clone())
    }

    #[tokio::test]
    async fn test_auto_fetch_http01_flow() {
        let bridge = ChallengeResponder::new();
        let fake = FakeAcme::new(&bridge);
        let calls = fake.calls.clone();
        let seen = fake.seen_during_accept.clone();
        let source = source_with(fake, &bridge);

        let key = IssuanceKey::generate().unwrap();
        let chain = source.auto_fetch(&key, "example.com").await.unwrap();

        assert_eq!(chain.len(), 2);
        assert_eq!(seen.lock().as_deref(), Some(&b"tok.thumb"[..]));
        assert_eq!(bridge.pending_count(), 0);
        assert_eq!(
            *calls.lock(),
            vec![
                "register",
                "new_order",
                "authorizations",
                "accept https://ca/chall/Http01",
                "wait_authorization",
                "wait_order",
                "finalize",
            ]
        );
    }

    #[tokio::test]
    async fn test_auto_fetch_clears_bridge_on_failure() {
        let bridge = ChallengeResponder::new();
        let mut fake = FakeAcme::new(&bridge);
        fake.validation_result = AuthorizationState::Invalid;
        let seen = fake.seen_during_accept.clone();
        let source = source_with(fake, &bridge);

        let key = IssuanceKey::generate().unwrap();
        let err = source.auto_fetch(&key, "example.com").await.unwrap_err();

        assert!(matches!(err, IssuanceError::Authorization { .. }));
        assert!(seen.lock().is_some());
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_auto_fetch_ready_order_skips_challenges() {
        let bridge = ChallengeResponder::new();
        let mut fake = FakeAcme::new(&bridge);
        fake.order_state = OrderState::Ready;
        let calls = fake.calls.clone();
        let source = source_with(fake, &bridge);

        let key = IssuanceKey::generate().unwrap();
        source.auto_fetch(&key, "example.com").await.unwrap();

        assert_eq!(*calls.lock(), vec!["register", "new_order", "finalize"]);
    }

    #[tokio::test]
    async fn test_auto_fetch_without_http01() {
        let bridge = ChallengeResponder::new();
        let mut fake = FakeAcme::new(&bridge);
        fake.offered = vec![ChallengeKind::Dns01];
        let source = source_with(fake, &bridge);

        let key = IssuanceKey::generate().unwrap();
        assert!(matches!(
            source.auto_fetch(&key, "example.com").await,
            Err(IssuanceError::NoSupportedChallenge("http-01"))
        ));
    }

    #[tokio::test]
    async fn test_auto_fetch_invalid_order() {
        let bridge = ChallengeResponder::new();
        let mut fake = FakeAcme::new(&bridge);
        fake.order_state = OrderState::Invalid;
        let source = source_with(fake, &bridge);

        let key = IssuanceKey::generate().unwrap();
        assert!(matches!(
            source.auto_fetch(&key, "example.com").await,
            Err(IssuanceError::OrderStatus(ref s)) if s == "invalid"
        ));
    }

    #[tokio::test]
    async fn test_registration_retried_until_success() {
        let bridge = ChallengeResponder::new();
        let fake = FakeAcme::new(&bridge);
        *fake.register_failures.lock() = 1;
        let calls = fake.calls.clone();
        let source = source_with(fake, &bridge);

        let key = IssuanceKey::generate().unwrap();
        // A failed registration does not block issuance
        source.auto_fetch(&key, "example.com").await.unwrap();
        source.auto_fetch(&key, "example.com").await.unwrap();
        source.auto_fetch(&key, "example.com").await.unwrap();

        let registrations = calls.lock().iter().filter(|c| *c == "register").count();
        assert_eq!(registrations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_flows_are_serialized() {
        let bridge = ChallengeResponder::new();
        let mut fake = FakeAcme::new(&bridge);
        fake.order_state = OrderState::Ready;
        fake.order_delay = Duration::from_secs(5);
        let calls = fake.calls.clone();
        let max_open = fake.max_open_orders.clone();
        let source = source_with(fake, &bridge);

        let first_key = IssuanceKey::generate().unwrap();
        let second_key = IssuanceKey::generate().unwrap();
        let started = tokio::time::Instant::now();
        let (first, second) = tokio::join!(
            source.auto_fetch(&first_key, "a.example.com"),
            source.auto_fetch(&second_key, "b.example.com"),
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(max_open.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(
            *calls.lock(),
            vec!["register", "new_order", "finalize", "new_order", "finalize"]
        );
    }

    #[tokio::test]
    async fn test_manual_start_dns01() {
        let bridge = ChallengeResponder::new();
        let fake = FakeAcme::new(&bridge);
        let source = source_with(fake, &bridge);

        let descriptor = source.manual_start_challenge("example.com").await.unwrap();

        assert_eq!(descriptor.order_url, "https://ca/order/1");
        assert_eq!(descriptor.challenge_url, "https://ca/chall/Dns01");
        assert_eq!(descriptor.record_value, "digest");
        assert_eq!(
            descriptor.instructions(),
            "Create DNS TXT record:\nName:  _acme-challenge.example.com.\nValue: digest"
        );
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_manual_start_already_authorized() {
        let bridge = ChallengeResponder::new();
        let mut fake = FakeAcme::new(&bridge);
        fake.order_state = OrderState::Ready;
        let source = source_with(fake, &bridge);

        let err = source.manual_start_challenge("example.com").await.unwrap_err();
        assert_eq!(err.to_string(), "already authorized, no challenge needed");
    }

    #[tokio::test]
    async fn test_manual_start_without_dns01() {
        let bridge = ChallengeResponder::new();
        let mut fake = FakeAcme::new(&bridge);
        fake.offered = vec![ChallengeKind::Http01];
        let source = source_with(fake, &bridge);

        assert!(matches!(
            source.manual_start_challenge("example.com").await,
            Err(IssuanceError::NoSupportedChallenge("dns-01"))
        ));
    }

    #[tokio::test]
    async fn test_complete_challenge() {
        let bridge = ChallengeResponder::new();
        let fake = FakeAcme::new(&bridge);
        let calls = fake.calls.clone();
        let source = source_with(fake, &bridge);

        let descriptor = ChallengeDescriptor::dns01(
            "example.com",
            "digest",
            "https://ca/order/9",
            "https://ca/chall/9",
        );
        let key = IssuanceKey::generate().unwrap();
        let chain = source
            .complete_challenge(&key, "example.com", &descriptor)
            .await
            .unwrap();

        assert_eq!(chain.len(), 2);
        assert_eq!(
            *calls.lock(),
            vec![
                "register",
                "resume_order",
                "accept https://ca/chall/9",
                "wait_authorization",
                "wait_order",
                "finalize",
            ]
        );
    }
}
