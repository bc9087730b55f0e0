//! Challenge provisioning providers
//!
//! Each managed certificate names a provider id; the registry resolves ids to
//! implementations once at startup. HTTP-01 publishes tokens into an in-process
//! store served at `/.well-known/acme-challenge/`; DNS-01 delegates TXT record
//! management to configured hook commands.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::acme::ChallengeKind;
use crate::config::ProviderConfig;
use crate::tls::unix_now;

/// A validation-method implementation
#[async_trait]
pub trait ChallengeProvider: Send + Sync {
    /// Which ACME challenge type this provider satisfies
    fn kind(&self) -> ChallengeKind;

    /// Publish the validation artifact for a domain
    async fn provision(
        &self,
        domain: &str,
        token: &str,
        key_authorization: &str,
    ) -> anyhow::Result<()>;

    /// Remove the validation artifact
    async fn cleanup(&self, domain: &str, token: &str) -> anyhow::Result<()>;

    /// Wall-clock pause between provisioning and telling the directory the
    /// challenge is ready. Zero for HTTP-01; DNS needs propagation time.
    fn propagation_delay(&self) -> Duration {
        Duration::ZERO
    }
}

#[derive(Debug, Clone)]
struct TokenEntry {
    key_authorization: String,
    domain: String,
    created_at: i64,
}

/// Shared store of pending HTTP-01 tokens, served by the HTTP pipeline
#[derive(Default)]
pub struct Http01TokenStore {
    tokens: DashMap<String, TokenEntry>,
}

impl Http01TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: String, key_authorization: String, domain: String) {
        self.tokens.insert(
            token,
            TokenEntry {
                key_authorization,
                domain,
                created_at: unix_now(),
            },
        );
    }

    /// Key authorization body for `/.well-known/acme-challenge/{token}`
    pub fn response_for(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|e| e.key_authorization.clone())
    }

    pub fn remove(&self, token: &str) {
        if let Some((_, entry)) = self.tokens.remove(token) {
            debug!("HTTP-01 token cleaned for {}", entry.domain);
        }
    }

    /// Drop tokens older than `max_age`; challenges should never live long.
    pub fn purge_older_than(&self, max_age: Duration) {
        let cutoff = unix_now() - max_age.as_secs() as i64;
        self.tokens.retain(|_, e| e.created_at > cutoff);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// HTTP-01: the token is served from this process itself
pub struct Http01Provider {
    store: Arc<Http01TokenStore>,
}

impl Http01Provider {
    pub fn new(store: Arc<Http01TokenStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ChallengeProvider for Http01Provider {
    fn kind(&self) -> ChallengeKind {
        ChallengeKind::Http01
    }

    async fn provision(
        &self,
        domain: &str,
        token: &str,
        key_authorization: &str,
    ) -> anyhow::Result<()> {
        self.store.insert(
            token.to_string(),
            key_authorization.to_string(),
            domain.to_string(),
        );
        debug!(
            "HTTP-01 token for {} ready at /.well-known/acme-challenge/{}",
            domain, token
        );
        Ok(())
    }

    async fn cleanup(&self, _domain: &str, token: &str) -> anyhow::Result<()> {
        self.store.remove(token);
        Ok(())
    }
}

/// DNS-01 via external hook commands.
///
/// The provision command receives domain, token and the TXT record value as
/// trailing arguments; the cleanup command receives domain and token.
pub struct DnsCommandProvider {
    provision_cmd: String,
    cleanup_cmd: String,
    propagation: Duration,
}

impl DnsCommandProvider {
    pub fn new(provision_cmd: String, cleanup_cmd: String, propagation_secs: u64) -> Self {
        Self {
            provision_cmd,
            cleanup_cmd,
            propagation: Duration::from_secs(propagation_secs),
        }
    }

    async fn run_hook(&self, cmd: &str, args: &[&str]) -> anyhow::Result<()> {
        let mut parts = cmd.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty DNS hook command"))?;
        let output = Command::new(program)
            .args(parts)
            .args(args)
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to run DNS hook {:?}: {}", program, e))?;
        if !output.status.success() {
            anyhow::bail!(
                "DNS hook {:?} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ChallengeProvider for DnsCommandProvider {
    fn kind(&self) -> ChallengeKind {
        ChallengeKind::Dns01
    }

    async fn provision(
        &self,
        domain: &str,
        token: &str,
        key_authorization: &str,
    ) -> anyhow::Result<()> {
        self.run_hook(&self.provision_cmd, &[domain, token, key_authorization])
            .await
    }

    async fn cleanup(&self, domain: &str, token: &str) -> anyhow::Result<()> {
        self.run_hook(&self.cleanup_cmd, &[domain, token]).await
    }

    fn propagation_delay(&self) -> Duration {
        self.propagation
    }
}

/// Provider registry, resolved once from configuration
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ChallengeProvider>>,
}

impl ProviderRegistry {
    pub fn from_config(
        configs: &HashMap<String, ProviderConfig>,
        token_store: Arc<Http01TokenStore>,
    ) -> Self {
        let mut providers: HashMap<String, Arc<dyn ChallengeProvider>> = HashMap::new();
        for (id, cfg) in configs {
            let provider: Arc<dyn ChallengeProvider> = match cfg {
                ProviderConfig::Http01 => Arc::new(Http01Provider::new(token_store.clone())),
                ProviderConfig::Dns01 {
                    provision_cmd,
                    cleanup_cmd,
                    propagation_secs,
                } => Arc::new(DnsCommandProvider::new(
                    provision_cmd.clone(),
                    cleanup_cmd.clone(),
                    *propagation_secs,
                )),
            };
            providers.insert(id.clone(), provider);
        }
        Self { providers }
    }

    /// Registry with a single known provider.
    #[cfg(test)]
    pub(crate) fn with_provider(id: &str, provider: Arc<dyn ChallengeProvider>) -> Self {
        let mut providers: HashMap<String, Arc<dyn ChallengeProvider>> = HashMap::new();
        providers.insert(id.to_string(), provider);
        Self { providers }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ChallengeProvider>> {
        let provider = self.providers.get(id).cloned();
        if provider.is_none() {
            warn!("Unknown challenge provider id {:?}", id);
        }
        provider
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
