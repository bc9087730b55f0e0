//! Edgehost - multi-tenant TLS-terminating edge server
//!
//! A single-process HTTPS edge that:
//! - Terminates TLS for many hostnames, selecting certificates by SNI
//! - Provisions and renews its certificates automatically over ACME
//! - Parses HTTP/1.1 on the wire, chunked transfer-encoding included
//! - Reverse-proxies configured hosts to plaintext or TLS upstreams

pub mod acme;
pub mod challenge;
pub mod config;
pub mod content;
pub mod http;
pub mod lifecycle;
pub mod pipeline;
pub mod proxy;
pub mod server;
pub mod sni;
pub mod tls;

// Re-export commonly used types
pub use acme::{AcmeClient, ChallengeKind, DirectoryAcmeClient};
pub use challenge::{ChallengeProvider, Http01TokenStore, ProviderRegistry};
pub use config::EdgeConfig;
pub use content::{ContentResolver, NotFoundResolver, Resolved};
pub use lifecycle::{CertManager, TickOutcome};
pub use pipeline::Pipeline;
pub use server::Server;
pub use tls::{CertEntry, CertStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
