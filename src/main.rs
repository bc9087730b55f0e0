//! Edgehost - multi-tenant TLS-terminating edge server
//!
//! Startup wiring: load configuration, bring up the TLS store (generating a
//! self-signed default pair on first boot), start the certificate lifecycle
//! manager when ACME is enabled, then run the listeners until a shutdown
//! signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use edgehost::acme::DirectoryAcmeClient;
use edgehost::challenge::{Http01TokenStore, ProviderRegistry};
use edgehost::config::EdgeConfig;
use edgehost::content::NotFoundResolver;
use edgehost::lifecycle::CertManager;
use edgehost::pipeline::Pipeline;
use edgehost::server::Server;
use edgehost::tls::{ensure_default_cert, CertStore};

/// Edgehost - multi-tenant TLS edge with automatic ACME certificates
#[derive(Parser, Debug)]
#[command(name = "edgehost")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/edgehost/config.toml", env = "EDGEHOST_CONFIG")]
    config: PathBuf,

    /// Override the TLS listener port
    #[arg(long, env = "EDGEHOST_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "EDGEHOST_LOG_LEVEL")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "EDGEHOST_JSON_LOGS")]
    json_logs: bool,

    /// Run configuration validation only (don't start the server)
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install the rustls CryptoProvider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs)?;

    info!("Starting edgehost v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {:?}", args.config);

    let mut config = EdgeConfig::load(&args.config)?;
    if let Some(port) = args.port {
        config.server.port = port;
        info!("TLS port overridden to {}", port);
    }
    config.validate()?;
    if args.validate {
        info!("Configuration validation successful, exiting");
        return Ok(());
    }
    let config = Arc::new(config);

    ensure_default_cert(&config.tls.cert_path, &config.tls.key_path)?;
    let store = Arc::new(CertStore::load(&config.tls)?);

    let tokens = Arc::new(Http01TokenStore::new());
    let providers = Arc::new(ProviderRegistry::from_config(
        &config.acme.providers,
        tokens.clone(),
    ));

    if config.acme.enabled {
        info!("ACME enabled against {}", config.acme.directory_url);
        let client = Arc::new(DirectoryAcmeClient::connect(&config.acme).await?);
        let manager = CertManager::new(
            config.acme.clone(),
            store.clone(),
            client,
            providers.clone(),
            tokens.clone(),
        );
        manager.load_persisted();
        tokio::spawn(async move {
            manager.run().await;
        });
    }

    let pipeline = Arc::new(Pipeline::new(
        config.clone(),
        tokens,
        Arc::new(NotFoundResolver),
    ));
    let server = Server::new(config.clone(), store, pipeline);

    print_startup_summary(&config);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                return Err(e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, shutting down");
        }
    }

    info!("edgehost shutdown complete");
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    }

    Ok(())
}

/// Wait for OS shutdown signal
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
            unreachable!()
        }
    };
    sigterm.recv().await;
    info!("Received SIGTERM");
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    std::future::pending::<()>().await;
}

/// Print startup summary
fn print_startup_summary(config: &EdgeConfig) {
    info!(
        "TLS listener:     {}:{}",
        config.server.bind_address, config.server.port
    );
    if let Some(port) = config.server.http_port {
        info!("HTTP listener:    {}:{}", config.server.bind_address, port);
    }
    info!("Max connections:  {}", config.server.max_connections);
    info!(
        "ACME:             {}",
        if config.acme.enabled {
            config.acme.directory_url.as_str()
        } else {
            "disabled"
        }
    );
    info!(
        "Managed certs:    {} configured",
        config.acme.certificates.len()
    );
    info!(
        "Proxy targets:    {} configured",
        config.proxy.hosts.len()
    );
}
