//! ACME protocol session
//!
//! [`AcmeApi`] is the narrow view of a CA session the issuance flows need.
//! [`InstantAcmeApi`] implements it with `instant-acme`, keeping the account
//! and any in-flight orders in memory. Orders are addressed by URL so a
//! manual challenge can be resumed after the operator publishes its record.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use renewd_config::SourceConfig;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use super::credentials::AccountCredentialsFile;
use crate::error::IssuanceError;

/// Delay between status polls
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Polls before giving up on a status change
const MAX_POLLS: u32 = 30;

// ============================================================================
// Protocol Types
// ============================================================================

/// Order status as reported by the CA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }
}

impl From<OrderStatus> for OrderState {
    fn from(status: OrderStatus) -> Self {
        match status {
            OrderStatus::Pending => Self::Pending,
            OrderStatus::Ready => Self::Ready,
            OrderStatus::Processing => Self::Processing,
            OrderStatus::Valid => Self::Valid,
            OrderStatus::Invalid => Self::Invalid,
        }
    }
}

/// Authorization status as reported by the CA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationState {
    Pending,
    Valid,
    Invalid,
    /// Revoked, expired or deactivated
    Dead,
}

impl AuthorizationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Dead => "dead",
        }
    }
}

impl From<AuthorizationStatus> for AuthorizationState {
    fn from(status: AuthorizationStatus) -> Self {
        match status {
            AuthorizationStatus::Pending => Self::Pending,
            AuthorizationStatus::Valid => Self::Valid,
            AuthorizationStatus::Invalid => Self::Invalid,
            _ => Self::Dead,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Http01,
    Dns01,
    Other,
}

/// A challenge offered for one authorization, with its expected responses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeInfo {
    pub kind: ChallengeKind,
    pub url: String,
    pub token: String,
    /// Body to serve at the HTTP-01 path
    pub http01_value: String,
    /// Value of the DNS-01 TXT record
    pub dns01_value: String,
}

/// One identifier's authorization within an order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationInfo {
    pub identifier: String,
    pub state: AuthorizationState,
    pub challenges: Vec<ChallengeInfo>,
}

impl AuthorizationInfo {
    /// First offered challenge of the given kind
    pub fn challenge(&self, kind: ChallengeKind) -> Option<&ChallengeInfo> {
        self.challenges.iter().find(|c| c.kind == kind)
    }
}

/// A CA order, addressed by URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderHandle {
    pub url: String,
    pub state: OrderState,
}

// ============================================================================
// Session Trait
// ============================================================================

/// Operations against a CA session
///
/// Implementations need not be safe for concurrent flows; callers hold a
/// per-source lock.
#[async_trait]
pub trait AcmeApi: Send + Sync {
    /// Register (or re-register) the account with the CA
    async fn register(&self) -> Result<(), IssuanceError>;

    /// Create an order for a single DNS identifier
    async fn new_order(&self, hostname: &str) -> Result<OrderHandle, IssuanceError>;

    /// Fetch the current state of an existing order
    async fn resume_order(&self, order_url: &str) -> Result<OrderHandle, IssuanceError>;

    /// Authorizations of an order, with their challenges
    async fn authorizations(&self, order_url: &str) -> Result<Vec<AuthorizationInfo>, IssuanceError>;

    /// Tell the CA a challenge is ready to be validated
    async fn accept_challenge(&self, order_url: &str, challenge_url: &str) -> Result<(), IssuanceError>;

    /// Wait for the authorization of `hostname` to leave the pending state
    async fn wait_authorization(
        &self,
        order_url: &str,
        hostname: &str,
    ) -> Result<AuthorizationState, IssuanceError>;

    /// Wait for the order to leave the pending and processing states
    async fn wait_order(&self, order_url: &str) -> Result<OrderState, IssuanceError>;

    /// Finalize the order with a CSR and return the issued PEM chain
    async fn finalize(&self, order_url: &str, csr_der: &[u8]) -> Result<String, IssuanceError>;
}

// ============================================================================
// instant-acme Session
// ============================================================================

#[derive(Default)]
struct Session {
    account: Option<Account>,
    orders: HashMap<String, Order>,
}

/// [`AcmeApi`] over `instant-acme`
///
/// The account is restored on [`AcmeApi::register`] from configured
/// credentials, else from the credentials file, and only created when neither
/// exists. A newly created account is written to the credentials file.
/// Orders live in memory keyed by URL; an unknown URL is restored from the CA.
pub struct InstantAcmeApi {
    directory_url: String,
    email: String,
    credentials: Option<String>,
    credentials_file: Option<AccountCredentialsFile>,
    session: Mutex<Session>,
}

impl InstantAcmeApi {
    pub fn new(directory_url: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
            email: email.into(),
            credentials: None,
            credentials_file: None,
            session: Mutex::new(Session::default()),
        }
    }

    /// Build from a validated `acme` source configuration
    pub fn from_config(config: &SourceConfig) -> Self {
        let mut api = Self::new(
            config.directory_url.clone().unwrap_or_default(),
            config.email.clone().unwrap_or_default(),
        );
        api.credentials = config.account_credentials.clone();
        api
    }

    /// Persist created accounts to `file` and restore them from it
    pub fn with_credentials_file(mut self, file: AccountCredentialsFile) -> Self {
        self.credentials_file = Some(file);
        self
    }

    /// Credentials to restore the account from, if any
    ///
    /// Configured credentials take precedence over the credentials file.
    fn stored_credentials(&self) -> Result<Option<String>, IssuanceError> {
        if let Some(json) = &self.credentials {
            return Ok(Some(json.clone()));
        }
        match &self.credentials_file {
            Some(file) => Ok(file.load()?),
            None => Ok(None),
        }
    }

    async fn create_account(&self) -> Result<Account, IssuanceError> {
        if let Some(json) = self.stored_credentials()? {
            let credentials: AccountCredentials = serde_json::from_str(&json)
                .map_err(|e| IssuanceError::Protocol(format!("invalid account credentials: {}", e)))?;
            let account = Account::from_credentials(credentials).await?;
            info!(directory = %self.directory_url, "Restored ACME account from credentials");
            return Ok(account);
        }

        let contact = format!("mailto:{}", self.email);
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&contact],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;

        info!(directory = %self.directory_url, email = %self.email, "Registered ACME account");

        match &self.credentials_file {
            Some(file) => {
                let json = serde_json::to_string(&credentials).map_err(|e| {
                    IssuanceError::Protocol(format!("cannot serialize account credentials: {}", e))
                })?;
                file.save(&json)?;
            }
            None => warn!(
                directory = %self.directory_url,
                "ACME account credentials are not persisted; pending orders will not survive a restart"
            ),
        }

        Ok(account)
    }

    fn not_registered() -> IssuanceError {
        IssuanceError::Protocol("ACME account not registered".to_string())
    }

    /// The order at `order_url`, restored from the CA if not held in memory
    async fn order_mut<'s>(
        session: &'s mut Session,
        order_url: &str,
    ) -> Result<&'s mut Order, IssuanceError> {
        if !session.orders.contains_key(order_url) {
            let account = session.account.as_ref().ok_or_else(Self::not_registered)?;
            debug!(order = %order_url, "Restoring ACME order");
            let order = account.order(order_url.to_string()).await?;
            session.orders.insert(order_url.to_string(), order);
        }
        session
            .orders
            .get_mut(order_url)
            .ok_or_else(|| IssuanceError::Protocol(format!("unknown order {}", order_url)))
    }

    fn describe_authorizations(
        order: &Order,
        authorizations: &[instant_acme::Authorization],
    ) -> Vec<AuthorizationInfo> {
        authorizations
            .iter()
            .map(|auth| {
                let identifier = match &auth.identifier {
                    Identifier::Dns(name) => name.clone(),
                };
                let challenges = auth
                    .challenges
                    .iter()
                    .map(|challenge| {
                        let key_auth = order.key_authorization(challenge);
                        let kind = match challenge.r#type {
                            ChallengeType::Http01 => ChallengeKind::Http01,
                            ChallengeType::Dns01 => ChallengeKind::Dns01,
                            _ => ChallengeKind::Other,
                        };
                        ChallengeInfo {
                            kind,
                            url: challenge.url.clone(),
                            token: challenge.token.clone(),
                            http01_value: key_auth.as_str().to_string(),
                            dns01_value: key_auth.dns_value(),
                        }
                    })
                    .collect();
                AuthorizationInfo {
                    identifier,
                    state: auth.status.into(),
                    challenges,
                }
            })
            .collect()
    }
}

#[async_trait]
impl AcmeApi for InstantAcmeApi {
    async fn register(&self) -> Result<(), IssuanceError> {
        let account = self.create_account().await?;
        self.session.lock().await.account = Some(account);
        Ok(())
    }

    async fn new_order(&self, hostname: &str) -> Result<OrderHandle, IssuanceError> {
        let mut session = self.session.lock().await;
        let account = session.account.as_ref().ok_or_else(Self::not_registered)?;

        let identifiers = [Identifier::Dns(hostname.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let handle = OrderHandle {
            url: order.url().to_string(),
            state: order.state().status.into(),
        };
        debug!(hostname = %hostname, order = %handle.url, status = handle.state.as_str(), "Created ACME order");

        session.orders.insert(handle.url.clone(), order);
        Ok(handle)
    }

    async fn resume_order(&self, order_url: &str) -> Result<OrderHandle, IssuanceError> {
        let mut session = self.session.lock().await;
        let order = Self::order_mut(&mut session, order_url).await?;
        order.refresh().await?;

        Ok(OrderHandle {
            url: order_url.to_string(),
            state: order.state().status.into(),
        })
    }

    async fn authorizations(&self, order_url: &str) -> Result<Vec<AuthorizationInfo>, IssuanceError> {
        let mut session = self.session.lock().await;
        let order = Self::order_mut(&mut session, order_url).await?;
        let authorizations = order.authorizations().await?;
        Ok(Self::describe_authorizations(order, &authorizations))
    }

    async fn accept_challenge(&self, order_url: &str, challenge_url: &str) -> Result<(), IssuanceError> {
        let mut session = self.session.lock().await;
        let order = Self::order_mut(&mut session, order_url).await?;
        order.set_challenge_ready(challenge_url).await?;
        debug!(order = %order_url, challenge = %challenge_url, "Accepted ACME challenge");
        Ok(())
    }

    async fn wait_authorization(
        &self,
        order_url: &str,
        hostname: &str,
    ) -> Result<AuthorizationState, IssuanceError> {
        let mut session = self.session.lock().await;
        let order = Self::order_mut(&mut session, order_url).await?;

        for attempt in 0..MAX_POLLS {
            let authorizations = order.authorizations().await?;
            let state = authorizations
                .iter()
                .find(|auth| matches!(&auth.identifier, Identifier::Dns(name) if name == hostname))
                .map(|auth| AuthorizationState::from(auth.status))
                .ok_or_else(|| {
                    IssuanceError::Protocol(format!("no authorization for '{}' in order", hostname))
                })?;

            trace!(hostname = %hostname, attempt, status = state.as_str(), "Polled ACME authorization");
            if state != AuthorizationState::Pending {
                return Ok(state);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        Err(IssuanceError::Timeout(POLL_INTERVAL * MAX_POLLS))
    }

    async fn wait_order(&self, order_url: &str) -> Result<OrderState, IssuanceError> {
        let mut session = self.session.lock().await;
        let order = Self::order_mut(&mut session, order_url).await?;

        for attempt in 0..MAX_POLLS {
            order.refresh().await?;
            let state = OrderState::from(order.state().status);

            trace!(order = %order_url, attempt, status = state.as_str(), "Polled ACME order");
            if !matches!(state, OrderState::Pending | OrderState::Processing) {
                return Ok(state);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        Err(IssuanceError::Timeout(POLL_INTERVAL * MAX_POLLS))
    }

    async fn finalize(&self, order_url: &str, csr_der: &[u8]) -> Result<String, IssuanceError> {
        let mut session = self.session.lock().await;
        let order = Self::order_mut(&mut session, order_url).await?;

        if order.state().status != OrderStatus::Valid {
            order.finalize(csr_der).await?;
        }

        let mut chain = None;
        for _ in 0..MAX_POLLS {
            if let Some(pem) = order.certificate().await? {
                chain = Some(pem);
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        session.orders.remove(order_url);
        chain.ok_or(IssuanceError::NoCertificate)
    }
}

impl std::fmt::Debug for InstantAcmeApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstantAcmeApi")
            .field("directory_url", &self.directory_url)
            .field("email", &self.email)
            .field("has_credentials", &self.credentials.is_some())
            .field("credentials_file", &self.credentials_file.as_ref().map(|f| f.path()))
            .finish()
    }
}
