//! TLS termination end-to-end: SNI routing plus the pipeline behind it

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use edgehost::challenge::Http01TokenStore;
use edgehost::config::EdgeConfig;
use edgehost::content::NotFoundResolver;
use edgehost::pipeline::Pipeline;
use edgehost::server::bind_listener;
use edgehost::sni::route_handshake;
use edgehost::tls::{cert_not_after, parse_cert_chain, CertEntry, CertStore};

fn install_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn self_signed_entry(hostnames: &[&str]) -> CertEntry {
    let key = rcgen::KeyPair::generate().expect("keypair");
    let params = rcgen::CertificateParams::new(
        hostnames.iter().map(|h| h.to_string()).collect::<Vec<_>>(),
    )
    .expect("params");
    let cert = params.self_signed(&key).expect("self-sign");
    let cert_pem = cert.pem();
    let not_after = cert_not_after(cert_pem.as_bytes()).expect("not_after");
    CertEntry {
        hostnames: hostnames.iter().map(|h| h.to_string()).collect(),
        cert_pem,
        key_pem: key.serialize_pem(),
        not_after,
        provider: "test".to_string(),
    }
}

/// Client-side verifier for the self-signed test certificates.
#[derive(Debug)]
struct AcceptAny;

impl rustls::client::danger::ServerCertVerifier for AcceptAny {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn client_connector() -> TlsConnector {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAny))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Bring up a TLS listener backed by a store with a default certificate and
/// one per-host certificate for a.example.com.
async fn spawn_tls_server() -> (std::net::SocketAddr, Arc<CertStore>) {
    install_provider();
    let store = Arc::new(CertStore::new(self_signed_entry(&["localhost"])).expect("store"));
    store
        .install(self_signed_entry(&["a.example.com"]))
        .expect("install");

    let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16).expect("bind");
    let addr = listener.local_addr().expect("addr");
    let acceptor = TlsAcceptor::from(store.server_config());
    let pipeline = Arc::new(Pipeline::new(
        Arc::new(EdgeConfig::default()),
        Arc::new(Http01TokenStore::new()),
        Arc::new(NotFoundResolver),
    ));

    let accept_store = store.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                return;
            };
            let store = accept_store.clone();
            let acceptor = acceptor.clone();
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                match route_handshake(&store, &acceptor, stream, Duration::from_secs(5)).await {
                    Ok(tls) => pipeline.handle(tls, &peer.to_string()).await,
                    Err(_) => {}
                }
            });
        }
    });
    (addr, store)
}

async fn request_over_tls(
    addr: std::net::SocketAddr,
    server_name: ServerName<'static>,
    request: &[u8],
) -> (String, Vec<u8>) {
    let tcp = TcpStream::connect(addr).await.expect("connect");
    let mut tls = client_connector()
        .connect(server_name, tcp)
        .await
        .expect("handshake");
    let peer_cert = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .expect("server certificate")
        .to_vec();
    tls.write_all(request).await.expect("send");
    let mut out = Vec::new();
    tls.read_to_end(&mut out).await.expect("receive");
    (String::from_utf8_lossy(&out).to_string(), peer_cert)
}

#[tokio::test]
async fn sni_selects_per_host_certificate() {
    let (addr, store) = spawn_tls_server().await;
    let expected = parse_cert_chain(
        store
            .context_for("a.example.com")
            .expect("context")
            .entry
            .cert_pem
            .as_bytes(),
    )
    .expect("chain")[0]
        .to_vec();

    let (out, peer_cert) = request_over_tls(
        addr,
        ServerName::try_from("a.example.com").unwrap(),
        b"GET /x HTTP/1.1\r\nHost: a.example.com\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert_eq!(peer_cert, expected);
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(out.contains("Content-Length:"));
}

#[tokio::test]
async fn unknown_sni_falls_back_to_default() {
    let (addr, store) = spawn_tls_server().await;
    let expected = parse_cert_chain(store.default_context().entry.cert_pem.as_bytes())
        .expect("chain")[0]
        .to_vec();

    let (out, peer_cert) = request_over_tls(
        addr,
        ServerName::try_from("b.example.com").unwrap(),
        b"GET /x HTTP/1.1\r\nHost: b.example.com\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert_eq!(peer_cert, expected);
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
}

#[tokio::test]
async fn absent_sni_falls_back_to_default() {
    let (addr, store) = spawn_tls_server().await;
    let expected = parse_cert_chain(store.default_context().entry.cert_pem.as_bytes())
        .expect("chain")[0]
        .to_vec();

    // An IP-address server name carries no SNI extension.
    let (out, peer_cert) = request_over_tls(
        addr,
        ServerName::from(std::net::IpAddr::from([127, 0, 0, 1])),
        b"GET /x HTTP/1.1\r\nHost: whatever\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert_eq!(peer_cert, expected);
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
}

#[tokio::test]
async fn renewal_swap_served_to_new_connections() {
    let (addr, store) = spawn_tls_server().await;

    let (_, first) = request_over_tls(
        addr,
        ServerName::try_from("a.example.com").unwrap(),
        b"GET / HTTP/1.1\r\nHost: a.example.com\r\nConnection: close\r\n\r\n",
    )
    .await;

    store
        .install(self_signed_entry(&["a.example.com"]))
        .expect("renewal install");

    let (_, second) = request_over_tls(
        addr,
        ServerName::try_from("a.example.com").unwrap(),
        b"GET / HTTP/1.1\r\nHost: a.example.com\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert_ne!(first, second);
}
