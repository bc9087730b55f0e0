//! TLS context store
//!
//! Holds the default certificate plus per-host certificates and exposes them
//! through a rustls SNI resolver. Renewal never mutates a live context: a new
//! `HostContext` is built off to the side and the whole host map is swapped
//! atomically, so in-flight handshakes keep using the context they loaded.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig as RustlsServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tracing::{debug, info, warn};

use crate::config::TlsConfig;

/// An issued certificate with its metadata
#[derive(Debug, Clone)]
pub struct CertEntry {
    /// Primary domain first, then SANs
    pub hostnames: Vec<String>,
    /// Certificate chain (PEM)
    pub cert_pem: String,
    /// Private key (PEM)
    pub key_pem: String,
    /// Expiry, unix seconds
    pub not_after: i64,
    /// Challenge provider this entry was provisioned with
    pub provider: String,
}

impl CertEntry {
    pub fn primary(&self) -> &str {
        self.hostnames.first().map(String::as_str).unwrap_or_default()
    }
}

/// A certificate entry bound to its ready-to-serve rustls key.
///
/// Never mutated after construction.
pub struct HostContext {
    pub entry: CertEntry,
    pub certified: Arc<CertifiedKey>,
}

impl HostContext {
    /// Build the handshake context for an entry, parsing and validating the
    /// PEM material once.
    pub fn build(entry: CertEntry) -> anyhow::Result<Arc<Self>> {
        let chain = parse_cert_chain(entry.cert_pem.as_bytes())?;
        let key = parse_private_key(entry.key_pem.as_bytes())?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| anyhow::anyhow!("Unsupported private key for {}: {}", entry.primary(), e))?;
        let certified = Arc::new(CertifiedKey::new(chain, signing_key));
        Ok(Arc::new(Self { entry, certified }))
    }
}

/// TLS context store shared between the lifecycle manager and all handshakes
pub struct CertStore {
    default_ctx: ArcSwap<HostContext>,
    hosts: ArcSwap<HashMap<String, Arc<HostContext>>>,
}

impl CertStore {
    /// Store with only a default context; per-host entries arrive later via
    /// `install`.
    pub fn new(default_entry: CertEntry) -> anyhow::Result<Self> {
        Ok(Self {
            default_ctx: ArcSwap::new(HostContext::build(default_entry)?),
            hosts: ArcSwap::new(Arc::new(HashMap::new())),
        })
    }

    /// Load the default certificate and any statically configured per-host
    /// certificates from disk.
    pub fn load(tls: &TlsConfig) -> anyhow::Result<Self> {
        let default_entry = read_entry_from_files(&tls.cert_path, &tls.key_path, &[], "static")?;
        let default_ctx = HostContext::build(default_entry)?;

        let mut hosts = HashMap::new();
        for host_cfg in &tls.hosts {
            let entry = read_entry_from_files(
                &host_cfg.cert_path,
                &host_cfg.key_path,
                std::slice::from_ref(&host_cfg.host),
                "static",
            )?;
            let ctx = HostContext::build(entry)?;
            hosts.insert(host_cfg.host.clone(), ctx);
        }
        info!(
            "TLS store loaded: default certificate plus {} per-host contexts",
            hosts.len()
        );

        Ok(Self {
            default_ctx: ArcSwap::new(default_ctx),
            hosts: ArcSwap::new(Arc::new(hosts)),
        })
    }

    /// Install a renewed certificate entry for all of its hostnames.
    ///
    /// The entry must not already be expired. The swap is all-or-nothing: the
    /// context is fully constructed before any handshake can observe it.
    pub fn install(&self, entry: CertEntry) -> anyhow::Result<()> {
        let now = unix_now();
        if entry.not_after <= now {
            anyhow::bail!(
                "refusing to install expired certificate for {} (not_after {} <= now {})",
                entry.primary(),
                entry.not_after,
                now
            );
        }
        let hostnames = entry.hostnames.clone();
        let primary = entry.primary().to_string();
        let ctx = HostContext::build(entry)?;

        let mut next = (**self.hosts.load()).clone();
        for host in &hostnames {
            next.insert(host.clone(), ctx.clone());
        }
        self.hosts.store(Arc::new(next));

        debug!(
            "Installed certificate for {} covering {} name(s)",
            primary,
            hostnames.len()
        );
        Ok(())
    }

    /// Certificate expiry for a host, unix seconds; None when no per-host
    /// context is installed.
    pub fn expiry(&self, host: &str) -> Option<i64> {
        self.hosts.load().get(host).map(|ctx| ctx.entry.not_after)
    }

    /// Look up the context served for a host, if one is registered.
    pub fn context_for(&self, host: &str) -> Option<Arc<HostContext>> {
        self.hosts.load().get(host).cloned()
    }

    pub fn default_context(&self) -> Arc<HostContext> {
        self.default_ctx.load_full()
    }

    /// True when at least one per-host context exists; the handshake router
    /// skips ClientHello peeking entirely otherwise.
    pub fn has_host_contexts(&self) -> bool {
        !self.hosts.load().is_empty()
    }

    /// Build the rustls server configuration backed by this store's SNI
    /// resolver. Certificate swaps are picked up by later handshakes without
    /// rebuilding the config.
    pub fn server_config(self: &Arc<Self>) -> Arc<RustlsServerConfig> {
        let mut config = RustlsServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SniResolver {
                store: self.clone(),
            }));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }
}

/// SNI certificate resolver: per-host lookup with default fallback.
///
/// This is the native rustls hook fired before certificate selection; a
/// missing or unknown server name always falls back to the default context.
pub struct SniResolver {
    store: Arc<CertStore>,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SniResolver")
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = client_hello.server_name() {
            if let Some(ctx) = self.store.context_for(name) {
                return Some(ctx.certified.clone());
            }
            debug!("No context for SNI {:?}, serving default", name);
        }
        Some(self.store.default_context().certified.clone())
    }
}

/// Current unix time in seconds
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Parse a PEM certificate chain
pub fn parse_cert_chain(pem: &[u8]) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem);
    let chain: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificate chain: {}", e))?;
    if chain.is_empty() {
        anyhow::bail!("No certificates found in PEM data");
    }
    Ok(chain)
}

/// Parse a PEM private key, trying PKCS#8 first and RSA as fallback
pub fn parse_private_key(pem: &[u8]) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(pem);
    let pkcs8: Vec<_> = pkcs8_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse PKCS#8 keys: {}", e))?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(PrivateKeyDer::Pkcs8(key));
    }

    let mut reader = std::io::BufReader::new(pem);
    let rsa: Vec<_> = rsa_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse RSA keys: {}", e))?;
    if let Some(key) = rsa.into_iter().next() {
        return Ok(PrivateKeyDer::Pkcs1(key));
    }

    anyhow::bail!("No private key found in PEM data")
}

/// Extract the not-after timestamp (unix seconds) from the first certificate
/// in a PEM chain.
pub fn cert_not_after(pem: &[u8]) -> anyhow::Result<i64> {
    use x509_parser::prelude::{FromDer, X509Certificate};

    let (_, parsed) = x509_parser::pem::parse_x509_pem(pem)
        .map_err(|e| anyhow::anyhow!("Failed to parse PEM: {:?}", e))?;
    let (_, cert) = X509Certificate::from_der(&parsed.contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse certificate: {:?}", e))?;
    Ok(cert.validity().not_after.timestamp())
}

/// Build a certificate entry from PEM files on disk
pub fn read_entry_from_files(
    cert_path: &Path,
    key_path: &Path,
    hostnames: &[String],
    provider: &str,
) -> anyhow::Result<CertEntry> {
    let cert_pem = fs::read_to_string(cert_path)
        .map_err(|e| anyhow::anyhow!("Failed to read certificate {:?}: {}", cert_path, e))?;
    let key_pem = fs::read_to_string(key_path)
        .map_err(|e| anyhow::anyhow!("Failed to read private key {:?}: {}", key_path, e))?;
    let not_after = cert_not_after(cert_pem.as_bytes())?;
    Ok(CertEntry {
        hostnames: hostnames.to_vec(),
        cert_pem,
        key_pem,
        not_after,
        provider: provider.to_string(),
    })
}

/// Generate a self-signed default certificate when none exists yet, so the
/// listener can come up before the first ACME issuance completes.
pub fn ensure_default_cert(cert_path: &Path, key_path: &Path) -> anyhow::Result<()> {
    if cert_path.exists() && key_path.exists() {
        return Ok(());
    }
    warn!(
        "Default certificate missing, generating self-signed pair at {:?}",
        cert_path
    );
    let key = rcgen::KeyPair::generate()?;
    let params = rcgen::CertificateParams::new(vec!["localhost".to_string()])?;
    let cert = params.self_signed(&key)?;
    if let Some(parent) = cert_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if let Some(parent) = key_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(cert_path, cert.pem())?;
    fs::write(key_path, key.serialize_pem())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_install_and_lookup() {
        let store = store_with_default();
        assert!(!store.has_host_contexts());
        assert!(store.expiry("a.example.com").is_none());

        let entry = self_signed_entry(&["a.example.com", "www.a.example.com"]);
        let not_after = entry.not_after;
        store.install(entry).expect("install");

        assert!(store.has_host_contexts());
        assert_eq!(store.expiry("a.example.com"), Some(not_after));
        assert_eq!(store.expiry("www.a.example.com"), Some(not_after));
        assert!(store.context_for("b.example.com").is_none());
    }

    #[test]
    fn test_install_rejects_expired_entry() {
        let store = store_with_default();
        let mut entry = self_signed_entry(&["a.example.com"]);
        entry.not_after = unix_now() - 10;
        assert!(store.install(entry).is_err());
        assert!(!store.has_host_contexts());
    }

    #[test]
    fn test_swap_leaves_old_context_usable() {
        let store = store_with_default();
        store
            .install(self_signed_entry(&["a.example.com"]))
            .expect("install v1");
        let old = store.context_for("a.example.com").expect("v1 present");

        store
            .install(self_signed_entry(&["a.example.com"]))
            .expect("install v2");
        let new = store.context_for("a.example.com").expect("v2 present");

        // The handshake that grabbed the old Arc keeps a fully coherent pair;
        // the store now hands out the replacement.
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(old.entry.primary(), "a.example.com");
        assert_eq!(new.entry.primary(), "a.example.com");
        assert_ne!(old.entry.cert_pem, new.entry.cert_pem);
    }

    #[test]
    fn test_entry_pem_parsers() {
        let entry = self_signed_entry(&["a.example.com"]);
        let chain = parse_cert_chain(entry.cert_pem.as_bytes()).expect("chain");
        assert_eq!(chain.len(), 1);
        parse_private_key(entry.key_pem.as_bytes()).expect("key");
        assert!(entry.not_after > unix_now());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_cert_chain(b"not a pem").is_err());
        assert!(parse_private_key(b"not a pem").is_err());
        assert!(cert_not_after(b"not a pem").is_err());
    }
}
