//! ACME directory client
//!
//! `AcmeClient` is the seam between the certificate lifecycle automaton and
//! the ACME wire protocol: account creation, `newOrder`, authorization
//! fetches, challenge responses, `finalize` and certificate download. The
//! production implementation speaks to a real directory through instant-acme;
//! tests drive the automaton with a mock.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, ExternalAccountKey,
    Identifier, NewAccount, NewOrder, Order, OrderStatus,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::AcmeConfig;

/// Remote order status as the automaton sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderPhase {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// Remote authorization status for one domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthzPhase {
    Pending,
    Valid,
    Invalid,
}

/// Validation method requested for an order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Http01,
    Dns01,
}

/// Challenge material for one domain within an order
#[derive(Debug, Clone)]
pub struct ChallengeInfo {
    pub domain: String,
    pub token: String,
    /// For HTTP-01 this is the full key authorization; for DNS-01 it is the
    /// TXT record value (digest form).
    pub key_authorization: String,
}

/// Operations the lifecycle automaton performs against an ACME directory.
///
/// One in-flight order per primary domain; all methods are keyed by it.
#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Place a new order covering `domains`. Returns challenge material per
    /// domain, in the same order as `domains`.
    async fn place_order(
        &self,
        primary: &str,
        domains: &[String],
        kind: ChallengeKind,
    ) -> anyhow::Result<Vec<ChallengeInfo>>;

    /// Refresh and report the order status.
    async fn order_phase(&self, primary: &str) -> anyhow::Result<OrderPhase>;

    /// Poll the authorization status for one domain of the order.
    async fn authorization_phase(&self, primary: &str, domain: &str)
        -> anyhow::Result<AuthzPhase>;

    /// Tell the directory the challenge for `domain` is ready to validate.
    async fn mark_challenge_ready(&self, primary: &str, domain: &str) -> anyhow::Result<()>;

    /// Submit the CSR for a ready order.
    async fn finalize(&self, primary: &str, csr_der: &[u8]) -> anyhow::Result<()>;

    /// Download the issued certificate chain (PEM); None while still issuing.
    async fn download_certificate(&self, primary: &str) -> anyhow::Result<Option<String>>;

    /// Full authorization detail for a failed order, for the fatal log line.
    async fn failure_detail(&self, primary: &str) -> String;

    /// Drop all client-side state for the order.
    async fn discard_order(&self, primary: &str);
}

/// Stored ACME account wrapper (metadata around the opaque credentials)
#[derive(Debug, Clone, Deserialize, Serialize)]
struct StoredAccount {
    directory_url: String,
    email: Option<String>,
    created: String,
    credentials: serde_json::Value,
}

struct OrderHandle {
    order: Order,
    /// domain -> challenge URL, for mark_challenge_ready
    challenge_urls: HashMap<String, String>,
}

/// ACME client backed by a real directory via instant-acme
pub struct DirectoryAcmeClient {
    account: Account,
    orders: Mutex<HashMap<String, OrderHandle>>,
}

impl DirectoryAcmeClient {
    /// Load the persisted account or register a new one with the directory.
    pub async fn connect(config: &AcmeConfig) -> anyhow::Result<Self> {
        let account = get_or_create_account(config).await?;
        Ok(Self {
            account,
            orders: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl AcmeClient for DirectoryAcmeClient {
    async fn place_order(
        &self,
        primary: &str,
        domains: &[String],
        kind: ChallengeKind,
    ) -> anyhow::Result<Vec<ChallengeInfo>> {
        let identifiers: Vec<Identifier> =
            domains.iter().map(|d| Identifier::Dns(d.clone())).collect();
        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let wanted = match kind {
            ChallengeKind::Http01 => ChallengeType::Http01,
            ChallengeKind::Dns01 => ChallengeType::Dns01,
        };

        let authorizations = order.authorizations().await?;
        let mut by_domain: HashMap<String, ChallengeInfo> = HashMap::new();
        let mut challenge_urls = HashMap::new();

        for authz in &authorizations {
            let Identifier::Dns(domain) = &authz.identifier;
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == wanted)
                .ok_or_else(|| {
                    anyhow::anyhow!("No {:?} challenge offered for {}", wanted, domain)
                })?;
            let key_auth = order.key_authorization(challenge);
            let key_authorization = match kind {
                ChallengeKind::Http01 => key_auth.as_str().to_string(),
                ChallengeKind::Dns01 => key_auth.dns_value(),
            };
            challenge_urls.insert(domain.clone(), challenge.url.clone());
            by_domain.insert(
                domain.clone(),
                ChallengeInfo {
                    domain: domain.clone(),
                    token: challenge.token.clone(),
                    key_authorization,
                },
            );
        }

        let mut infos = Vec::with_capacity(domains.len());
        for domain in domains {
            let info = by_domain.remove(domain).ok_or_else(|| {
                anyhow::anyhow!("Directory returned no authorization for {}", domain)
            })?;
            infos.push(info);
        }

        self.orders.lock().await.insert(
            primary.to_string(),
            OrderHandle {
                order,
                challenge_urls,
            },
        );
        info!("Order placed for {} ({} domain(s))", primary, domains.len());
        Ok(infos)
    }

    async fn order_phase(&self, primary: &str) -> anyhow::Result<OrderPhase> {
        let mut orders = self.orders.lock().await;
        let handle = orders
            .get_mut(primary)
            .ok_or_else(|| anyhow::anyhow!("No in-flight order for {}", primary))?;
        handle.order.refresh().await?;
        Ok(match handle.order.state().status {
            OrderStatus::Pending => OrderPhase::Pending,
            OrderStatus::Ready => OrderPhase::Ready,
            OrderStatus::Processing => OrderPhase::Processing,
            OrderStatus::Valid => OrderPhase::Valid,
            OrderStatus::Invalid => OrderPhase::Invalid,
        })
    }

    async fn authorization_phase(
        &self,
        primary: &str,
        domain: &str,
    ) -> anyhow::Result<AuthzPhase> {
        let mut orders = self.orders.lock().await;
        let handle = orders
            .get_mut(primary)
            .ok_or_else(|| anyhow::anyhow!("No in-flight order for {}", primary))?;
        let authorizations = handle.order.authorizations().await?;
        for authz in &authorizations {
            let Identifier::Dns(d) = &authz.identifier;
            if d == domain {
                return Ok(authz_phase_from(authz.status));
            }
        }
        anyhow::bail!("Order for {} has no authorization for {}", primary, domain)
    }

    async fn mark_challenge_ready(&self, primary: &str, domain: &str) -> anyhow::Result<()> {
        let mut orders = self.orders.lock().await;
        let handle = orders
            .get_mut(primary)
            .ok_or_else(|| anyhow::anyhow!("No in-flight order for {}", primary))?;
        let url = handle
            .challenge_urls
            .get(domain)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No challenge URL recorded for {}", domain))?;
        handle.order.set_challenge_ready(&url).await?;
        Ok(())
    }

    async fn finalize(&self, primary: &str, csr_der: &[u8]) -> anyhow::Result<()> {
        let mut orders = self.orders.lock().await;
        let handle = orders
            .get_mut(primary)
            .ok_or_else(|| anyhow::anyhow!("No in-flight order for {}", primary))?;
        handle.order.finalize(csr_der).await?;
        Ok(())
    }

    async fn download_certificate(&self, primary: &str) -> anyhow::Result<Option<String>> {
        let mut orders = self.orders.lock().await;
        let handle = orders
            .get_mut(primary)
            .ok_or_else(|| anyhow::anyhow!("No in-flight order for {}", primary))?;
        Ok(handle.order.certificate().await?)
    }

    async fn failure_detail(&self, primary: &str) -> String {
        let mut orders = self.orders.lock().await;
        let Some(handle) = orders.get_mut(primary) else {
            return format!("no in-flight order for {}", primary);
        };
        match handle.order.authorizations().await {
            Ok(authorizations) => format!("{:#?}", authorizations),
            Err(e) => format!("authorization fetch failed: {}", e),
        }
    }

    async fn discard_order(&self, primary: &str) {
        self.orders.lock().await.remove(primary);
    }
}

/// Collapse a directory authorization status into the automaton's view:
/// anything terminally unusable counts as invalid, anything in flight as
/// pending.
fn authz_phase_from(status: AuthorizationStatus) -> AuthzPhase {
    match status {
        AuthorizationStatus::Valid => AuthzPhase::Valid,
        AuthorizationStatus::Invalid
        | AuthorizationStatus::Revoked
        | AuthorizationStatus::Expired => AuthzPhase::Invalid,
        _ => AuthzPhase::Pending,
    }
}

/// Load the stored account when it matches the configured directory, or
/// register a new one (with External Account Binding when configured).
async fn get_or_create_account(config: &AcmeConfig) -> anyhow::Result<Account> {
    if config.account_path.exists() {
        if let Ok(stored) = load_stored_account(&config.account_path) {
            if stored.directory_url == config.directory_url {
                info!("Loading ACME account from {:?}", config.account_path);
                let credentials: AccountCredentials = serde_json::from_value(stored.credentials)?;
                return Ok(Account::from_credentials(credentials).await?);
            }
            warn!(
                "Stored account is for directory {}, creating a new one",
                stored.directory_url
            );
        }
    }

    info!("Creating ACME account with {}", config.directory_url);
    let contact = config
        .email
        .as_ref()
        .map(|e| vec![format!("mailto:{}", e)])
        .unwrap_or_default();
    let new_account = NewAccount {
        contact: &contact.iter().map(String::as_str).collect::<Vec<_>>(),
        terms_of_service_agreed: config.accept_tos,
        only_return_existing: false,
    };

    let external_account = match (&config.eab_kid, &config.eab_hmac_key) {
        (Some(kid), Some(hmac_key)) => {
            info!("Using External Account Binding");
            let hmac_bytes = base64::Engine::decode(
                &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                hmac_key,
            )
            .or_else(|_| {
                base64::Engine::decode(&base64::engine::general_purpose::STANDARD, hmac_key)
            })?;
            Some(ExternalAccountKey::new(kid.clone(), &hmac_bytes))
        }
        _ => None,
    };

    let (account, credentials) = Account::create(
        &new_account,
        &config.directory_url,
        external_account.as_ref(),
    )
    .await?;

    let stored = StoredAccount {
        directory_url: config.directory_url.clone(),
        email: config.email.clone(),
        created: chrono::Utc::now().to_rfc3339(),
        credentials: serde_json::to_value(&credentials)?,
    };
    if let Some(parent) = config.account_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&config.account_path, serde_json::to_string_pretty(&stored)?)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&config.account_path, fs::Permissions::from_mode(0o600))?;
    }
    info!("ACME account saved to {:?}", config.account_path);
    Ok(account)
}

fn load_stored_account(path: &Path) -> anyhow::Result<StoredAccount> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Generate a fresh key pair and CSR for an order's domain set.
///
/// Returns the DER-encoded CSR and the private key PEM that will be persisted
/// alongside the downloaded certificate. Only ECDSA keys can be generated;
/// rcgen has no RSA key generation, so `use_ecdsa = false` is rejected here
/// and at config validation.
pub fn generate_csr(domains: &[String], use_ecdsa: bool) -> anyhow::Result<(Vec<u8>, String)> {
    use rcgen::{CertificateParams, DistinguishedName, KeyPair};

    if !use_ecdsa {
        anyhow::bail!("RSA certificate keys are not supported; set use_ecdsa = true");
    }
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
    let mut params = CertificateParams::new(domains.to_vec())?;
    params.distinguished_name = DistinguishedName::new();
    let csr = params.serialize_request(&key_pair)?;
    Ok((csr.der().to_vec(), key_pair.serialize_pem()))
}
