//! Connection acceptor
//!
//! Owns the listening sockets and the concurrency ceiling. A semaphore permit
//! is taken before each accept, so once the ceiling is reached no further
//! connections are accepted until a handler finishes and drops its permit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::EdgeConfig;
use crate::pipeline::Pipeline;
use crate::sni::route_handshake;
use crate::tls::CertStore;

pub struct Server {
    config: Arc<EdgeConfig>,
    store: Arc<CertStore>,
    pipeline: Arc<Pipeline>,
}

impl Server {
    pub fn new(config: Arc<EdgeConfig>, store: Arc<CertStore>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            config,
            store,
            pipeline,
        }
    }

    /// Accept connections until the process shuts down.
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.config.server.bind_address, self.config.server.port
        )
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {}", e))?;
        let listener = bind_listener(addr, self.config.server.backlog)?;
        let acceptor = TlsAcceptor::from(self.store.server_config());
        let permits = Arc::new(Semaphore::new(self.config.server.max_connections));
        info!("TLS listener on {}", addr);

        if let Some(http_port) = self.config.server.http_port {
            let addr: SocketAddr =
                format!("{}:{}", self.config.server.bind_address, http_port)
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid bind address: {}", e))?;
            let listener = bind_listener(addr, self.config.server.backlog)?;
            let pipeline = self.pipeline.clone();
            let permits = permits.clone();
            info!("Plaintext listener on {} (ACME HTTP-01)", addr);
            tokio::spawn(async move {
                plain_accept_loop(listener, pipeline, permits).await;
            });
        }

        let handshake_timeout = Duration::from_millis(self.config.limits.handshake_timeout_ms);
        loop {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| anyhow::anyhow!("connection semaphore closed"))?;
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            let store = self.store.clone();
            let acceptor = acceptor.clone();
            let pipeline = self.pipeline.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match route_handshake(&store, &acceptor, stream, handshake_timeout).await {
                    Ok(tls) => pipeline.handle(tls, &peer.to_string()).await,
                    Err(e) => debug!("Handshake with {} failed: {}", peer, e),
                }
            });
        }
    }
}

/// Serve plaintext HTTP off a listener, sharing the connection ceiling.
async fn plain_accept_loop(
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    permits: Arc<Semaphore>,
) {
    loop {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            return;
        };
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Plaintext accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            let _permit = permit;
            pipeline.handle(stream, &peer.to_string()).await;
        });
    }
}

/// Bind a nonblocking listener with SO_REUSEADDR/SO_REUSEPORT and the
/// configured backlog.
pub fn bind_listener(addr: SocketAddr, backlog: u32) -> anyhow::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    Ok(TcpListener::from_std(socket.into())?)
}
