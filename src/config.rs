//! Configuration module with TOML parsing
//!
//! All tunables are externalized - no hardcoded ports, paths, or limits.
//! The file is read once at startup; every section carries serde defaults so
//! a minimal config only needs `[server]` and `[tls]`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EdgeConfig {
    /// Listener configuration
    pub server: ServerConfig,
    /// Connection and request limits
    pub limits: LimitsConfig,
    /// TLS certificate configuration
    pub tls: TlsConfig,
    /// ACME certificate automation
    pub acme: AcmeConfig,
    /// Per-host reverse proxy targets (host -> upstream)
    pub proxy: ProxyConfig,
    /// Response compression
    pub compression: CompressionConfig,
}

/// Listener and concurrency configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind_address: String,
    /// TCP port for the TLS listener
    pub port: u16,
    /// Optional plaintext HTTP port, used for ACME HTTP-01 validation
    pub http_port: Option<u16>,
    /// Listen backlog
    pub backlog: u32,
    /// Maximum concurrent connection handlers
    pub max_connections: usize,
    /// Keep-alive request budget per connection
    pub max_requests_per_conn: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8443,
            http_port: None,
            backlog: 256,
            max_connections: 512,
            max_requests_per_conn: 100,
        }
    }
}

/// Timeouts and size limits
///
/// Every blocking wait in the connection path has its own timeout; expiry of
/// any of them tears down only the connection it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// TLS handshake timeout (ms)
    pub handshake_timeout_ms: u64,
    /// Idle keep-alive timeout waiting for the next request line (ms)
    pub keepalive_timeout_ms: u64,
    /// Per-header-block read timeout (ms)
    pub header_timeout_ms: u64,
    /// Body read timeout (ms)
    pub body_timeout_ms: u64,
    /// Upstream connect + handshake timeout for proxied requests (ms)
    pub upstream_timeout_ms: u64,
    /// Maximum length of a single header line (bytes)
    pub max_header_line: usize,
    /// Maximum request/response body size (bytes)
    pub max_body_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            keepalive_timeout_ms: 30_000,
            header_timeout_ms: 10_000,
            body_timeout_ms: 30_000,
            upstream_timeout_ms: 15_000,
            max_header_line: 8192,
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

/// TLS certificate configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// Default certificate chain (PEM), served when SNI matches no host
    pub cert_path: PathBuf,
    /// Default private key (PEM)
    pub key_path: PathBuf,
    /// Additional per-host certificates
    pub hosts: Vec<HostCertConfig>,
}

/// A statically configured per-host certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostCertConfig {
    /// Host name this certificate is served for
    pub host: String,
    /// Certificate chain path (PEM)
    pub cert_path: PathBuf,
    /// Private key path (PEM)
    pub key_path: PathBuf,
}

/// ACME configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcmeConfig {
    /// Enable ACME certificate automation
    pub enabled: bool,
    /// ACME directory URL (any ACME-compatible CA)
    pub directory_url: String,
    /// Contact email for account registration
    pub email: Option<String>,
    /// Path to store ACME account credentials
    pub account_path: PathBuf,
    /// Directory where issued certificate/key pairs are persisted
    pub certs_dir: PathBuf,
    /// Renew when a certificate expires within this many days
    pub renewal_days: i64,
    /// Lower bound for the renewal loop sleep (seconds)
    pub min_sleep_secs: u64,
    /// Upper bound for the renewal loop sleep (seconds)
    pub max_sleep_secs: u64,
    /// Jitter fraction applied to the computed sleep (0.0 - 1.0)
    pub sleep_jitter: f64,
    /// Accept terms of service automatically
    pub accept_tos: bool,
    /// External Account Binding key id (required by some CAs)
    pub eab_kid: Option<String>,
    /// External Account Binding HMAC key (base64)
    pub eab_hmac_key: Option<String>,
    /// Certificates to provision and keep renewed
    pub certificates: Vec<CertRequestConfig>,
    /// Challenge providers keyed by identifier
    pub providers: HashMap<String, ProviderConfig>,
}

fn default_directory_url() -> String {
    "https://acme-v02.api.letsencrypt.org/directory".to_string()
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory_url: default_directory_url(),
            email: None,
            account_path: PathBuf::from("/var/lib/edgehost/acme/account.json"),
            certs_dir: PathBuf::from("/var/lib/edgehost/certs"),
            renewal_days: 30,
            min_sleep_secs: 30,
            max_sleep_secs: 6 * 3600,
            sleep_jitter: 0.2,
            accept_tos: true,
            eab_kid: None,
            eab_hmac_key: None,
            certificates: Vec::new(),
            providers: HashMap::new(),
        }
    }
}

/// One managed certificate: a primary domain plus optional SANs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertRequestConfig {
    /// Ordered domain list; the first entry is the primary domain
    pub domains: Vec<String>,
    /// Challenge provider identifier (must exist in `acme.providers`)
    pub provider: String,
    /// Certificate key algorithm switch; only ECDSA P-256 is supported, so
    /// this must stay true (validated at startup)
    #[serde(default = "default_true")]
    pub use_ecdsa: bool,
}

impl CertRequestConfig {
    /// The primary domain keys the order state
    pub fn primary(&self) -> &str {
        self.domains.first().map(String::as_str).unwrap_or_default()
    }
}

/// Challenge provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProviderConfig {
    /// HTTP-01: the token is served from this process
    #[serde(rename = "http-01")]
    Http01,
    /// DNS-01: provisioning delegated to external hook commands
    #[serde(rename = "dns-01")]
    Dns01 {
        /// Command run to publish the TXT record; receives domain, token and
        /// key authorization as arguments
        provision_cmd: String,
        /// Command run to remove the TXT record; receives domain and token
        cleanup_cmd: String,
        /// Wall-clock pause after provisioning before marking the challenge
        /// ready (seconds)
        #[serde(default = "default_propagation_secs")]
        propagation_secs: u64,
    },
}

fn default_propagation_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Reverse proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Host header value -> upstream target
    pub hosts: HashMap<String, ProxyTargetConfig>,
}

/// One upstream target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyTargetConfig {
    /// "http" or "https"
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Upstream host name (also used for SNI and Host rewriting)
    pub upstream_host: String,
    /// Upstream port
    pub upstream_port: u16,
    /// Optional CA bundle overriding system roots for upstream TLS
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// Skip upstream certificate verification (dangerous)
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// Header carrying the client's real IP, set by a trusted fronting layer.
    /// X-Forwarded-For is only injected when this header is present.
    #[serde(default)]
    pub real_ip_header: Option<String>,
}

fn default_scheme() -> String {
    "http".to_string()
}

impl ProxyTargetConfig {
    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }

    /// host:port as written into the rewritten Host header; the port is
    /// omitted when it is the scheme default.
    pub fn host_header(&self) -> String {
        let default_port = if self.is_tls() { 443 } else { 80 };
        if self.upstream_port == default_port {
            self.upstream_host.clone()
        } else {
            format!("{}:{}", self.upstream_host, self.upstream_port)
        }
    }
}

/// Response compression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Enable the compression hook
    pub enabled: bool,
    /// Minimum body size before compression is attempted (bytes)
    pub min_size: usize,
    /// Content types eligible for compression
    pub compress_types: Vec<String>,
    /// gzip/deflate compression level (0-9)
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size: 1024,
            compress_types: vec![
                "text/html".to_string(),
                "text/plain".to_string(),
                "text/css".to_string(),
                "application/json".to_string(),
                "application/javascript".to_string(),
                "image/svg+xml".to_string(),
            ],
            level: 6,
        }
    }
}

impl EdgeConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {:?}: {}", path, e))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config {:?}: {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field consistency
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be non-zero");
        }
        if self.server.max_connections == 0 {
            anyhow::bail!("server.max_connections must be at least 1");
        }
        if self.server.max_requests_per_conn == 0 {
            anyhow::bail!("server.max_requests_per_conn must be at least 1");
        }
        if self.limits.max_header_line == 0 || self.limits.max_body_size == 0 {
            anyhow::bail!("limits.max_header_line and limits.max_body_size must be non-zero");
        }
        if !(0.0..=1.0).contains(&self.acme.sleep_jitter) {
            anyhow::bail!("acme.sleep_jitter must be within 0.0..=1.0");
        }
        if self.acme.min_sleep_secs == 0 || self.acme.min_sleep_secs > self.acme.max_sleep_secs {
            anyhow::bail!("acme.min_sleep_secs must be non-zero and <= acme.max_sleep_secs");
        }
        if self.acme.enabled && self.acme.renewal_days <= 0 {
            anyhow::bail!("acme.renewal_days must be positive");
        }
        for cert in &self.acme.certificates {
            if cert.domains.is_empty() {
                anyhow::bail!("acme.certificates entries need at least one domain");
            }
            if !self.acme.providers.contains_key(&cert.provider) {
                anyhow::bail!(
                    "certificate for {} references unknown provider {:?}",
                    cert.primary(),
                    cert.provider
                );
            }
            // rcgen has no RSA key generation; catch this at startup instead
            // of failing mid-order.
            if !cert.use_ecdsa {
                anyhow::bail!(
                    "certificate for {} requests an RSA key; only ECDSA is supported (use_ecdsa = true)",
                    cert.primary()
                );
            }
        }
        for (host, target) in &self.proxy.hosts {
            if target.scheme != "http" && target.scheme != "https" {
                anyhow::bail!(
                    "proxy target for {} has unsupported scheme {:?}",
                    host,
                    target.scheme
                );
            }
            if target.upstream_port == 0 {
                anyhow::bail!("proxy target for {} needs a non-zero upstream_port", host);
            }
        }
        if self.compression.level > 9 {
            anyhow::bail!("compression.level must be 0-9");
        }
        Ok(())
    }
}
