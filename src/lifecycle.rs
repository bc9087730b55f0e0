//! Certificate lifecycle manager
//!
//! A single control loop detects certificates that are missing or close to
//! expiry, drives one ACME order per primary domain through its challenges,
//! and installs the issued certificate into the TLS store. Each wake cycle
//! advances every in-flight order by at most one step, so a misbehaving
//! directory can never wedge the loop inside one iteration.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::acme::{generate_csr, AcmeClient, AuthzPhase, ChallengeInfo, OrderPhase};
use crate::challenge::{ChallengeProvider, Http01TokenStore, ProviderRegistry};
use crate::config::AcmeConfig;
use crate::tls::{cert_not_after, read_entry_from_files, unix_now, CertEntry, CertStore};

/// Per-domain challenge progress, strictly forward-only
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChallengeStatus {
    New,
    Solved,
    Marked,
    Validated,
}

struct DomainChallenge {
    info: ChallengeInfo,
    status: ChallengeStatus,
    /// Set when the artifact was published; gates the propagation pause.
    solved_at: Option<Instant>,
}

/// In-flight order, keyed by primary domain in the manager's table
struct OrderState {
    domains: Vec<String>,
    provider_id: String,
    provider: Arc<dyn ChallengeProvider>,
    use_ecdsa: bool,
    auth_index: usize,
    challenges: Vec<DomainChallenge>,
    csr_sent: bool,
    /// Private key generated with the CSR, persisted with the certificate.
    key_pem: Option<String>,
}

impl OrderState {
    fn all_validated(&self) -> bool {
        self.challenges
            .iter()
            .all(|c| c.status == ChallengeStatus::Validated)
    }
}

/// What one wake cycle accomplished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// At least one order moved forward; wake again soon.
    Progress,
    /// Nothing to do; sleep until the nearest renewal deadline.
    Idle,
    /// An order reached `invalid`. Carries the full authorization detail; the
    /// process must exit rather than retry a permanently rejected order.
    Fatal(String),
}

/// HTTP-01 tokens older than this are leftovers from orders that never
/// completed; each tick sweeps them out.
const TOKEN_MAX_AGE: Duration = Duration::from_secs(3600);

/// Drives certificate issuance and renewal against an ACME directory
pub struct CertManager {
    config: AcmeConfig,
    store: Arc<CertStore>,
    client: Arc<dyn AcmeClient>,
    providers: Arc<ProviderRegistry>,
    tokens: Arc<Http01TokenStore>,
    orders: HashMap<String, OrderState>,
}

impl CertManager {
    pub fn new(
        config: AcmeConfig,
        store: Arc<CertStore>,
        client: Arc<dyn AcmeClient>,
        providers: Arc<ProviderRegistry>,
        tokens: Arc<Http01TokenStore>,
    ) -> Self {
        Self {
            config,
            store,
            client,
            providers,
            tokens,
            orders: HashMap::new(),
        }
    }

    /// Install previously issued certificates from the certs directory so the
    /// renewal check sees their real expiry instead of re-ordering at boot.
    pub fn load_persisted(&self) {
        for cert in &self.config.certificates {
            let primary = cert.primary();
            let cert_path = self.config.certs_dir.join(format!("{}.crt", primary));
            let key_path = self.config.certs_dir.join(format!("{}.key", primary));
            if !cert_path.exists() || !key_path.exists() {
                continue;
            }
            match read_entry_from_files(&cert_path, &key_path, &cert.domains, &cert.provider) {
                Ok(entry) => {
                    if entry.not_after <= unix_now() {
                        warn!("Persisted certificate for {} is expired, ignoring", primary);
                        continue;
                    }
                    match self.store.install(entry) {
                        Ok(()) => info!("Restored persisted certificate for {}", primary),
                        Err(e) => warn!("Failed to install persisted certificate for {}: {}", primary, e),
                    }
                }
                Err(e) => warn!("Failed to read persisted certificate for {}: {}", primary, e),
            }
        }
    }

    /// One control-loop iteration: detect renewal needs, place missing orders,
    /// advance every in-flight order by one step.
    pub async fn tick(&mut self) -> TickOutcome {
        let mut progressed = false;
        self.tokens.purge_older_than(TOKEN_MAX_AGE);

        for cert in self.config.certificates.clone() {
            let primary = cert.primary().to_string();
            if self.orders.contains_key(&primary) {
                // One order per primary domain; a concurrent trigger is a no-op.
                continue;
            }
            if !self.needs_renewal(&primary) {
                continue;
            }
            let Some(provider) = self.providers.get(&cert.provider) else {
                error!("Certificate for {} names unknown provider {:?}", primary, cert.provider);
                continue;
            };
            match self
                .client
                .place_order(&primary, &cert.domains, provider.kind())
                .await
            {
                Ok(infos) => {
                    info!("Renewal started for {} ({} domain(s))", primary, cert.domains.len());
                    self.orders.insert(
                        primary,
                        OrderState {
                            domains: cert.domains.clone(),
                            provider_id: cert.provider.clone(),
                            provider,
                            use_ecdsa: cert.use_ecdsa,
                            auth_index: 0,
                            challenges: infos
                                .into_iter()
                                .map(|info| DomainChallenge {
                                    info,
                                    status: ChallengeStatus::New,
                                    solved_at: None,
                                })
                                .collect(),
                            csr_sent: false,
                            key_pem: None,
                        },
                    );
                    progressed = true;
                }
                Err(e) => warn!("Failed to place order for {}: {}", primary, e),
            }
        }

        let primaries: Vec<String> = self.orders.keys().cloned().collect();
        for primary in primaries {
            match self.advance_order(&primary).await {
                Ok(true) => progressed = true,
                Ok(false) => {}
                Err(Fault::Transient(e)) => {
                    warn!("ACME step failed for {}, retrying next cycle: {}", primary, e);
                }
                Err(Fault::OrderInvalid) => {
                    let detail = self.client.failure_detail(&primary).await;
                    return TickOutcome::Fatal(format!(
                        "order for {} is invalid: {}",
                        primary, detail
                    ));
                }
            }
        }

        if progressed {
            TickOutcome::Progress
        } else {
            TickOutcome::Idle
        }
    }

    /// Run the control loop forever. An invalid order exits the process; a
    /// domain silently drifting past expiry is worse than a restart.
    pub async fn run(mut self) {
        info!(
            "Certificate lifecycle manager running ({} managed certificate(s))",
            self.config.certificates.len()
        );
        loop {
            let outcome = self.tick().await;
            if let TickOutcome::Fatal(detail) = outcome {
                error!("ACME order permanently rejected: {}", detail);
                std::process::exit(1);
            }
            let pause = self.sleep_duration(&outcome);
            debug!("Lifecycle sleeping {:?} (outcome {:?})", pause, outcome);
            tokio::time::sleep(pause).await;
        }
    }

    fn needs_renewal(&self, primary: &str) -> bool {
        let threshold = self.config.renewal_days * 86_400;
        match self.store.expiry(primary) {
            None => true,
            Some(not_after) => unix_now() + threshold >= not_after,
        }
    }

    /// Advance one order by at most one step. Ok(true) when it moved.
    async fn advance_order(&mut self, primary: &str) -> Result<bool, Fault> {
        let phase = self
            .client
            .order_phase(primary)
            .await
            .map_err(Fault::Transient)?;

        let order = self
            .orders
            .get_mut(primary)
            .ok_or_else(|| Fault::Transient(anyhow::anyhow!("order state vanished")))?;

        match phase {
            OrderPhase::Invalid => Err(Fault::OrderInvalid),
            OrderPhase::Processing => Ok(false),
            OrderPhase::Valid => {
                let moved = self.complete_order(primary).await;
                Ok(moved)
            }
            OrderPhase::Ready if order.all_validated() => {
                if order.csr_sent {
                    return Ok(false);
                }
                let (csr_der, key_pem) = generate_csr(&order.domains, order.use_ecdsa)
                    .map_err(Fault::Transient)?;
                order.key_pem = Some(key_pem);
                self.client
                    .finalize(primary, &csr_der)
                    .await
                    .map_err(Fault::Transient)?;
                // Flag set only after the directory accepted the CSR, so a
                // failed finalize is retried with a fresh key next cycle.
                if let Some(order) = self.orders.get_mut(primary) {
                    order.csr_sent = true;
                    info!("CSR submitted for {}", primary);
                }
                Ok(true)
            }
            OrderPhase::Pending | OrderPhase::Ready => {
                self.advance_challenge(primary).await
            }
        }
    }

    /// Move the current authorization's challenge one step forward.
    async fn advance_challenge(&mut self, primary: &str) -> Result<bool, Fault> {
        let order = self
            .orders
            .get_mut(primary)
            .ok_or_else(|| Fault::Transient(anyhow::anyhow!("order state vanished")))?;
        let index = order.auth_index;
        let Some(challenge) = order.challenges.get_mut(index) else {
            return Ok(false);
        };

        match challenge.status {
            ChallengeStatus::New => {
                order
                    .provider
                    .provision(
                        &challenge.info.domain,
                        &challenge.info.token,
                        &challenge.info.key_authorization,
                    )
                    .await
                    .map_err(Fault::Transient)?;
                challenge.status = ChallengeStatus::Solved;
                challenge.solved_at = Some(Instant::now());
                debug!("Challenge provisioned for {}", challenge.info.domain);
                Ok(true)
            }
            ChallengeStatus::Solved => {
                let delay = order.provider.propagation_delay();
                let ready = challenge
                    .solved_at
                    .map(|t| t.elapsed() >= delay)
                    .unwrap_or(true);
                if !ready {
                    debug!(
                        "Waiting out propagation delay for {}",
                        challenge.info.domain
                    );
                    return Ok(false);
                }
                let domain = challenge.info.domain.clone();
                self.client
                    .mark_challenge_ready(primary, &domain)
                    .await
                    .map_err(Fault::Transient)?;
                if let Some(order) = self.orders.get_mut(primary) {
                    if let Some(challenge) = order.challenges.get_mut(index) {
                        challenge.status = ChallengeStatus::Marked;
                    }
                }
                debug!("Challenge marked ready for {}", domain);
                Ok(true)
            }
            ChallengeStatus::Marked => {
                let domain = challenge.info.domain.clone();
                let token = challenge.info.token.clone();
                let authz = self
                    .client
                    .authorization_phase(primary, &domain)
                    .await
                    .map_err(Fault::Transient)?;
                match authz {
                    AuthzPhase::Pending => Ok(false),
                    AuthzPhase::Invalid => Err(Fault::OrderInvalid),
                    AuthzPhase::Valid => {
                        let provider = order.provider.clone();
                        if let Err(e) = provider.cleanup(&domain, &token).await {
                            warn!("Challenge cleanup failed for {}: {}", domain, e);
                        }
                        if let Some(order) = self.orders.get_mut(primary) {
                            if let Some(challenge) = order.challenges.get_mut(index) {
                                challenge.status = ChallengeStatus::Validated;
                            }
                            order.auth_index += 1;
                        }
                        info!("Authorization valid for {}", domain);
                        Ok(true)
                    }
                }
            }
            ChallengeStatus::Validated => Ok(false),
        }
    }

    /// Download, persist and install the issued certificate, then drop the
    /// order state. Failures leave the old certificate serving and let the
    /// renewal check re-trigger on a later cycle.
    async fn complete_order(&mut self, primary: &str) -> bool {
        let pem = match self.client.download_certificate(primary).await {
            Ok(Some(pem)) => pem,
            Ok(None) => {
                debug!("Certificate for {} not issued yet", primary);
                return false;
            }
            Err(e) => {
                warn!("Certificate download failed for {}: {}", primary, e);
                return false;
            }
        };

        let Some(order) = self.orders.get(primary) else {
            return false;
        };
        let Some(key_pem) = order.key_pem.clone() else {
            warn!("Order for {} is valid but carries no key, restarting", primary);
            self.drop_order(primary).await;
            return true;
        };

        let entry = match cert_not_after(pem.as_bytes()) {
            Ok(not_after) => CertEntry {
                hostnames: order.domains.clone(),
                cert_pem: pem,
                key_pem,
                not_after,
                provider: order.provider_id.clone(),
            },
            Err(e) => {
                error!("Downloaded certificate for {} is unparseable: {}", primary, e);
                self.drop_order(primary).await;
                return true;
            }
        };

        if let Err(e) = self.persist_entry(primary, &entry) {
            warn!("Failed to persist certificate for {}: {}", primary, e);
        }
        match self.store.install(entry) {
            Ok(()) => info!("Certificate installed for {}", primary),
            Err(e) => error!("Certificate install failed for {}: {}", primary, e),
        }
        self.drop_order(primary).await;
        true
    }

    async fn drop_order(&mut self, primary: &str) {
        self.orders.remove(primary);
        self.client.discard_order(primary).await;
    }

    fn persist_entry(&self, primary: &str, entry: &CertEntry) -> anyhow::Result<()> {
        fs::create_dir_all(&self.config.certs_dir)?;
        let cert_path = self.config.certs_dir.join(format!("{}.crt", primary));
        let key_path = self.config.certs_dir.join(format!("{}.key", primary));
        fs::write(&cert_path, &entry.cert_pem)?;
        fs::write(&key_path, &entry.key_pem)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
        }
        debug!("Certificate for {} persisted to {:?}", primary, cert_path);
        Ok(())
    }

    /// Short jittered sleep while orders are moving, otherwise scale with the
    /// nearest renewal deadline.
    fn sleep_duration(&self, outcome: &TickOutcome) -> Duration {
        let base = if !self.orders.is_empty() || *outcome == TickOutcome::Progress {
            self.config.min_sleep_secs
        } else {
            let now = unix_now();
            let threshold = self.config.renewal_days * 86_400;
            let nearest = self
                .config
                .certificates
                .iter()
                .map(|cert| match self.store.expiry(cert.primary()) {
                    Some(not_after) => (not_after - threshold - now).max(0),
                    None => 0,
                })
                .min();
            match nearest {
                Some(remaining) => (remaining as u64 / 8)
                    .clamp(self.config.min_sleep_secs, self.config.max_sleep_secs),
                None => self.config.max_sleep_secs,
            }
        };
        jittered(Duration::from_secs(base), self.config.sleep_jitter)
    }
}

enum Fault {
    /// Logged and retried on the next cycle.
    Transient(anyhow::Error),
    /// The directory rejected the order permanently.
    OrderInvalid,
}

/// Scale a duration by a random factor in `1.0 ± jitter`
fn jittered(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return base;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    base.mul_f64(factor.max(0.0))
}
