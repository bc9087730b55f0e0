//! Reverse proxy upstream path
//!
//! One upstream connection per proxied request, plaintext or TLS. The inbound
//! request is rebuilt with upstream-facing headers, the response is read in
//! full (chunked, length-delimited or read-to-close) and re-framed with a
//! computed Content-Length before it goes back to the client.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::{LimitsConfig, ProxyTargetConfig};
use crate::http::{
    header_get, read_chunked_body, read_headers, HttpError, Request, Response, WireReader,
};
use crate::tls::parse_cert_chain;

/// Upstream failures; the pipeline reports every variant as a 502.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("upstream connect failed: {0}")]
    Connect(std::io::Error),
    #[error("upstream TLS setup failed: {0}")]
    Tls(String),
    #[error("upstream timed out")]
    Timeout,
    #[error("upstream i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("upstream response malformed: {0}")]
    Protocol(String),
}

impl From<HttpError> for ProxyError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::Io(io) => ProxyError::Io(io),
            HttpError::Timeout => ProxyError::Timeout,
            other => ProxyError::Protocol(other.to_string()),
        }
    }
}

/// Relay one request to its upstream target and return the response to send
/// downstream.
pub async fn proxy_request(
    request: &Request,
    target: &ProxyTargetConfig,
    original_host: &str,
    limits: &LimitsConfig,
) -> Result<Response, ProxyError> {
    let deadline = Duration::from_millis(limits.upstream_timeout_ms);
    let addr = (target.upstream_host.as_str(), target.upstream_port);

    let tcp = timeout(deadline, TcpStream::connect(addr))
        .await
        .map_err(|_| ProxyError::Timeout)?
        .map_err(ProxyError::Connect)?;
    debug!(
        "Proxying {} {} to {}://{}",
        request.method,
        request.path,
        target.scheme,
        target.host_header()
    );

    let wire = build_upstream_request(request, target, original_host);
    let response = if target.is_tls() {
        let connector = tls_connector(target)?;
        let server_name = ServerName::try_from(target.upstream_host.clone())
            .map_err(|e| ProxyError::Tls(format!("invalid upstream host name: {}", e)))?;
        let stream = timeout(deadline, connector.connect(server_name, tcp))
            .await
            .map_err(|_| ProxyError::Timeout)?
            .map_err(|e| ProxyError::Tls(e.to_string()))?;
        exchange(stream, &wire, limits).await?
    } else {
        exchange(tcp, &wire, limits).await?
    };

    Ok(postprocess_response(response, request, original_host))
}

/// Write the rebuilt request, then read the full upstream response.
async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    wire: &[u8],
    limits: &LimitsConfig,
) -> Result<Response, ProxyError> {
    let deadline = Duration::from_millis(limits.upstream_timeout_ms);
    timeout(deadline, stream.write_all(wire))
        .await
        .map_err(|_| ProxyError::Timeout)??;
    stream.flush().await?;
    timeout(deadline, read_upstream_response(stream, limits))
        .await
        .map_err(|_| ProxyError::Timeout)?
}

/// Parse status line, headers and body from the upstream connection.
async fn read_upstream_response<S: AsyncRead + Unpin>(
    stream: S,
    limits: &LimitsConfig,
) -> Result<Response, ProxyError> {
    let mut reader = WireReader::new(stream);
    let status_line = reader.read_line(limits.max_header_line).await?;
    let status = parse_status_line(&status_line)?;
    let headers = read_headers(&mut reader, limits.max_header_line).await?;

    let body = if header_get(&headers, "transfer-encoding")
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
    {
        read_chunked_body(&mut reader, limits.max_body_size).await?
    } else if let Some(len) = header_get(&headers, "content-length") {
        let len: usize = len
            .trim()
            .parse()
            .map_err(|_| ProxyError::Protocol("bad content-length".to_string()))?;
        if len > limits.max_body_size {
            return Err(ProxyError::Protocol("response body exceeds limit".to_string()));
        }
        let mut body = Vec::with_capacity(len.min(64 * 1024));
        reader.read_exact_into(len, &mut body).await?;
        body
    } else {
        // No framing: the upstream signals the end by closing.
        reader.read_to_end_bounded(limits.max_body_size).await?
    };

    Ok(Response {
        status,
        headers,
        body,
    })
}

/// Parse `HTTP/1.x status reason`.
fn parse_status_line(line: &str) -> Result<u16, ProxyError> {
    let mut parts = line.split(' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(ProxyError::Protocol(format!(
            "unexpected status line {:?}",
            line
        )));
    }
    parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProxyError::Protocol(format!("unexpected status line {:?}", line)))
}

/// Serialize the upstream-facing request line and headers.
///
/// Host is rewritten to the target, Origin/Referer values naming the original
/// host are repointed at the upstream, forwarding headers are injected, and
/// hop-by-hop framing headers are dropped and re-emitted from the actual body.
fn build_upstream_request(
    request: &Request,
    target: &ProxyTargetConfig,
    original_host: &str,
) -> Vec<u8> {
    let target_line = match &request.query {
        Some(q) => format!("{}?{}", request.path, q),
        None => request.path.clone(),
    };
    let upstream_host = target.host_header();
    let mut out = format!("{} {} HTTP/1.1\r\n", request.method, target_line);
    out.push_str(&format!("Host: {}\r\n", upstream_host));

    let mut real_ip = None;
    for (name, value) in &request.headers {
        if name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("connection")
        {
            continue;
        }
        if let Some(real_ip_header) = &target.real_ip_header {
            if name.eq_ignore_ascii_case(real_ip_header) {
                real_ip = Some(value.clone());
            }
        }
        let value = if name.eq_ignore_ascii_case("origin") || name.eq_ignore_ascii_case("referer")
        {
            value.replace(original_host, &upstream_host)
        } else {
            value.clone()
        };
        out.push_str(&format!("{}: {}\r\n", name, value));
    }

    out.push_str(&format!("X-Forwarded-Host: {}\r\n", original_host));
    out.push_str("X-Forwarded-Proto: https\r\n");
    if let Some(ip) = real_ip {
        out.push_str(&format!("X-Forwarded-For: {}\r\n", ip));
    }
    out.push_str("Connection: close\r\n");
    if !request.body.is_empty() {
        out.push_str(&format!("Content-Length: {}\r\n", request.body.len()));
    }
    out.push_str("\r\n");

    let mut wire = out.into_bytes();
    wire.extend_from_slice(&request.body);
    wire
}

/// Rewrite response headers for the downstream client: CORS origin echoes
/// point back at the client's origin, cookies are forced Secure and re-scoped
/// to the original host, and upstream framing headers are dropped so the
/// response is re-emitted with a computed Content-Length.
fn postprocess_response(upstream: Response, request: &Request, original_host: &str) -> Response {
    let client_origin = request
        .header("origin")
        .map(|o| o.to_string())
        .unwrap_or_else(|| format!("https://{}", original_host));
    let bare_host = original_host
        .split(':')
        .next()
        .unwrap_or(original_host)
        .to_string();

    let mut headers = Vec::with_capacity(upstream.headers.len());
    for (name, value) in upstream.headers {
        if name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("connection")
        {
            continue;
        }
        let value = if name.eq_ignore_ascii_case("access-control-allow-origin") {
            client_origin.clone()
        } else if name.eq_ignore_ascii_case("set-cookie") {
            rewrite_cookie(&value, &bare_host)
        } else {
            value
        };
        headers.push((name, value));
    }

    Response {
        status: upstream.status,
        headers,
        body: upstream.body,
    }
}

/// Force `Secure` and re-scope `Domain` to the host the client connected to.
fn rewrite_cookie(value: &str, host: &str) -> String {
    let mut parts: Vec<String> = value
        .split(';')
        .map(|part| {
            let trimmed = part.trim();
            if trimmed.to_ascii_lowercase().starts_with("domain=") {
                format!("Domain={}", host)
            } else {
                trimmed.to_string()
            }
        })
        .filter(|p| !p.is_empty())
        .collect();
    if !parts.iter().any(|p| p.eq_ignore_ascii_case("secure")) {
        parts.push("Secure".to_string());
    }
    parts.join("; ")
}

/// TLS connector for an upstream: system roots by default, an explicit CA
/// bundle when configured, or no verification at all when explicitly allowed.
fn tls_connector(target: &ProxyTargetConfig) -> Result<TlsConnector, ProxyError> {
    let config = if target.insecure_skip_verify {
        warn!(
            "Upstream certificate verification disabled for {}",
            target.upstream_host
        );
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        match &target.ca_file {
            Some(path) => {
                let pem = std::fs::read(path).map_err(|e| {
                    ProxyError::Tls(format!("failed to read CA bundle {:?}: {}", path, e))
                })?;
                let certs = parse_cert_chain(&pem)
                    .map_err(|e| ProxyError::Tls(format!("bad CA bundle {:?}: {}", path, e)))?;
                for cert in certs {
                    roots
                        .add(cert)
                        .map_err(|e| ProxyError::Tls(format!("bad CA certificate: {}", e)))?;
                }
            }
            None => {
                let loaded = rustls_native_certs::load_native_certs();
                for cert in loaded.certs {
                    let _ = roots.add(cert);
                }
            }
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Verifier that accepts any upstream certificate, gated behind the explicit
/// `insecure_skip_verify` flag.
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        Request {
            method: "POST".to_string(),
            path: "/api/items".to_string(),
            query: Some("page=2".to_string()),
            version: "1.1".to_string(),
            headers: vec![
                ("Host".to_string(), "a.example.com".to_string()),
                ("Origin".to_string(), "https://a.example.com".to_string()),
                (
                    "Referer".to_string(),
                    "https://a.example.com/app".to_string(),
                ),
                ("Content-Length".to_string(), "4".to_string()),
                ("Connection".to_string(), "keep-alive".to_string()),
                ("CF-Connecting-IP".to_string(), "203.0.113.9".to_string()),
            ],
            body: b"data".to_vec(),
        }
    }

    fn target() -> ProxyTargetConfig {
        ProxyTargetConfig {
            scheme: "http".to_string(),
            upstream_host: "origin.internal".to_string(),
            upstream_port: 8080,
            ca_file: None,
            insecure_skip_verify: false,
            real_ip_header: Some("CF-Connecting-IP".to_string()),
        }
    }

    #[test]
    fn test_build_upstream_request_rewrites() {
        let wire = build_upstream_request(&request(), &target(), "a.example.com");
        let text = String::from_utf8(wire).expect("ascii");

        assert!(text.starts_with("POST /api/items?page=2 HTTP/1.1\r\n"));
        assert!(text.contains("Host: origin.internal:8080\r\n"));
        // The client's Host/Connection/framing headers are dropped.
        assert!(!text.contains("\r\nHost: a.example.com\r\n"));
        assert!(!text.contains("Connection: keep-alive"));
        assert!(text.contains("Origin: https://origin.internal:8080\r\n"));
        assert!(text.contains("Referer: https://origin.internal:8080/app\r\n"));
        assert!(text.contains("X-Forwarded-Host: a.example.com\r\n"));
        assert!(text.contains("X-Forwarded-Proto: https\r\n"));
        assert!(text.contains("X-Forwarded-For: 203.0.113.9\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\ndata"));
    }

    #[test]
    fn test_no_forwarded_for_without_real_ip_header() {
        let mut target = target();
        target.real_ip_header = None;
        let wire = build_upstream_request(&request(), &target, "a.example.com");
        let text = String::from_utf8(wire).expect("ascii");
        assert!(!text.contains("X-Forwarded-For"));
    }

    #[test]
    fn test_postprocess_rewrites_cors_and_cookies() {
        let upstream = Response {
            status: 200,
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Transfer-Encoding".to_string(), "chunked".to_string()),
                (
                    "Access-Control-Allow-Origin".to_string(),
                    "http://origin.internal:8080".to_string(),
                ),
                (
                    "Set-Cookie".to_string(),
                    "sid=abc; Domain=origin.internal; Path=/".to_string(),
                ),
                ("Set-Cookie".to_string(), "theme=dark".to_string()),
            ],
            body: b"{}".to_vec(),
        };
        let resp = postprocess_response(upstream, &request(), "a.example.com");

        assert!(resp.header("transfer-encoding").is_none());
        assert_eq!(
            resp.header("access-control-allow-origin"),
            Some("https://a.example.com")
        );
        let cookies: Vec<_> = resp
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("set-cookie"))
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(
            cookies,
            vec![
                "sid=abc; Domain=a.example.com; Path=/; Secure",
                "theme=dark; Secure"
            ]
        );
    }

    #[test]
    fn test_rewrite_cookie_keeps_existing_secure() {
        let rewritten = rewrite_cookie("sid=abc; Secure; HttpOnly", "a.example.com");
        assert_eq!(rewritten, "sid=abc; Secure; HttpOnly");
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line("HTTP/1.1 200 OK").expect("parse"), 200);
        assert_eq!(
            parse_status_line("HTTP/1.0 404 Not Found").expect("parse"),
            404
        );
        assert!(parse_status_line("ICY 200 OK").is_err());
        assert!(parse_status_line("HTTP/1.1").is_err());
    }

    #[tokio::test]
    async fn test_read_upstream_response_chunked() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\ntest\r\n0\r\n\r\n";
        let resp = read_upstream_response(std::io::Cursor::new(raw.to_vec()), &LimitsConfig::default())
            .await
            .expect("response");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"test");
    }

    #[tokio::test]
    async fn test_read_upstream_response_read_to_close() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nuntil close";
        let resp = read_upstream_response(std::io::Cursor::new(raw.to_vec()), &LimitsConfig::default())
            .await
            .expect("response");
        assert_eq!(resp.body, b"until close");
    }
}
