//! TLS handshake router
//!
//! Before completing a handshake the router peeks the ClientHello off the
//! socket (non-destructively) to learn the SNI host name and the routing
//! policy: a stalled peer or non-TLS bytes fall through to the default
//! context rather than blocking the accept path. Certificate selection itself
//! happens in the store's SNI resolver; the peek implements the observable
//! policy and gives the handshake log its host name.

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, trace};

use crate::tls::CertStore;

/// Upper bound on peeked ClientHello bytes (record header + handshake body)
const MAX_CLIENT_HELLO_SIZE: usize = 4096;

/// Consecutive no-progress peeks before the peer counts as stalled
const MAX_STALLED_PEEKS: u32 = 2;

/// Delay between peek attempts while waiting for more handshake bytes
const PEEK_RETRY_DELAY: Duration = Duration::from_millis(25);

/// Outcome of peeking at the first bytes of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelloPeek {
    /// Complete ClientHello; SNI extension value if the client sent one
    ClientHello { sni: Option<String> },
    /// First byte is not a TLS handshake record
    NotTls,
    /// Peer stopped sending before the handshake body arrived
    Stalled,
}

/// Peek the ClientHello without consuming socket bytes.
///
/// Loops until the full record named by the record header has arrived, the
/// peer makes no progress `MAX_STALLED_PEEKS` times in a row, or the bytes
/// turn out not to be a handshake record.
pub async fn peek_client_hello(stream: &TcpStream) -> io::Result<HelloPeek> {
    let mut buf = vec![0u8; MAX_CLIENT_HELLO_SIZE];
    let mut last_len = 0usize;
    let mut stalls = 0u32;

    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(HelloPeek::Stalled);
        }
        if buf[0] != 0x16 {
            return Ok(HelloPeek::NotTls);
        }
        if n >= 5 {
            let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
            let wanted = (5 + record_len).min(MAX_CLIENT_HELLO_SIZE);
            if n >= wanted {
                return Ok(HelloPeek::ClientHello {
                    sni: extract_sni(&buf[..n]),
                });
            }
        }
        if n <= last_len {
            stalls += 1;
            if stalls >= MAX_STALLED_PEEKS {
                return Ok(HelloPeek::Stalled);
            }
        } else {
            stalls = 0;
            last_len = n;
        }
        tokio::time::sleep(PEEK_RETRY_DELAY).await;
    }
}

/// Extract the SNI host name from raw ClientHello bytes.
///
/// Walks the record layer, handshake header, and the extension list looking
/// for extension type 0 (server_name). Returns None for anything that is not
/// a well-formed ClientHello carrying a host_name entry.
pub fn extract_sni(data: &[u8]) -> Option<String> {
    // Record layer: type(1) + version(2) + length(2)
    if data.len() < 5 || data[0] != 0x16 {
        return None;
    }
    let handshake = &data[5..];

    // Handshake header: type(1) + length(3); 0x01 = ClientHello
    if handshake.len() < 4 || handshake[0] != 0x01 {
        return None;
    }
    let hello = &handshake[4..];
    if hello.len() < 38 {
        return None;
    }

    // Version (2) + random (32)
    let mut offset = 34;

    // Session ID
    let session_id_len = *hello.get(offset)? as usize;
    offset += 1 + session_id_len;

    // Cipher suites
    let cipher_len =
        u16::from_be_bytes([*hello.get(offset)?, *hello.get(offset + 1)?]) as usize;
    offset += 2 + cipher_len;

    // Compression methods
    let compression_len = *hello.get(offset)? as usize;
    offset += 1 + compression_len;

    // Extensions
    let extensions_len =
        u16::from_be_bytes([*hello.get(offset)?, *hello.get(offset + 1)?]) as usize;
    offset += 2;
    let extensions_end = (offset + extensions_len).min(hello.len());

    while offset + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([hello[offset], hello[offset + 1]]);
        let ext_len = u16::from_be_bytes([hello[offset + 2], hello[offset + 3]]) as usize;
        offset += 4;
        if offset + ext_len > hello.len() {
            return None;
        }
        if ext_type == 0 {
            return parse_server_name(&hello[offset..offset + ext_len]);
        }
        offset += ext_len;
    }
    None
}

/// Parse the server_name extension body: list length (2), name type (1,
/// must be 0 = host_name), name length (2), name bytes.
fn parse_server_name(data: &[u8]) -> Option<String> {
    if data.len() < 5 || data[2] != 0x00 {
        return None;
    }
    let name_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    let name = data.get(5..5 + name_len)?;
    std::str::from_utf8(name).ok().map(str::to_string)
}

/// Accept one TLS connection: peek for routing policy, then drive the
/// handshake to completion. The peek and the handshake share one deadline,
/// so a slow client cannot stretch the budget by stalling in both phases.
///
/// A timeout or handshake failure tears the connection down; a partially
/// connected session is never returned.
pub async fn route_handshake(
    store: &CertStore,
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    handshake_timeout: Duration,
) -> io::Result<TlsStream<TcpStream>> {
    let deadline = tokio::time::Instant::now() + handshake_timeout;
    if store.has_host_contexts() {
        match tokio::time::timeout_at(deadline, peek_client_hello(&stream)).await {
            Ok(Ok(HelloPeek::ClientHello { sni: Some(name) })) => {
                if store.context_for(&name).is_some() {
                    trace!("SNI {:?}: serving per-host context", name);
                } else {
                    trace!("SNI {:?}: no per-host context, serving default", name);
                }
            }
            Ok(Ok(HelloPeek::ClientHello { sni: None })) => {
                trace!("ClientHello without SNI, serving default context");
            }
            Ok(Ok(HelloPeek::NotTls)) => {
                // Not a handshake record: proceed and let rustls produce the
                // protocol error on the real handshake.
                debug!("Peeked bytes are not a TLS handshake record");
            }
            Ok(Ok(HelloPeek::Stalled)) => {
                debug!("Peer stalled during ClientHello peek, proceeding with default");
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "TLS handshake timed out during ClientHello peek",
                ));
            }
        }
    }

    match tokio::time::timeout_at(deadline, acceptor.accept(stream)).await {
        Ok(Ok(tls_stream)) => Ok(tls_stream),
        Ok(Err(e)) => Err(io::Error::new(io::ErrorKind::ConnectionAborted, e)),
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "TLS handshake timed out",
        )),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::build_client_hello;
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_extract_sni_present() {
        let hello = build_client_hello(Some("a.example.com"));
        assert_eq!(extract_sni(&hello).as_deref(), Some("a.example.com"));
    }

    #[test]
    fn test_extract_sni_absent() {
        let hello = build_client_hello(None);
        assert_eq!(extract_sni(&hello), None);
    }

    #[test]
    fn test_extract_sni_rejects_non_tls() {
        assert_eq!(extract_sni(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(extract_sni(&[]), None);
        assert_eq!(extract_sni(&[0x16, 0x03]), None);
    }

    #[test]
    fn test_extract_sni_rejects_truncated_extension() {
        let mut hello = build_client_hello(Some("a.example.com"));
        let cut = hello.len() - 4;
        hello.truncate(cut);
        // Record header still says the full length; the extension walk must
        // bail instead of reading past the buffer.
        assert_eq!(extract_sni(&hello), None);
    }

    #[tokio::test]
    async fn test_peek_client_hello_complete() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.expect("connect");
            stream
                .write_all(&build_client_hello(Some("a.example.com")))
                .await
                .expect("write");
            stream
        });

        let (server_stream, _) = listener.accept().await.expect("accept");
        let peek = peek_client_hello(&server_stream).await.expect("peek");
        assert_eq!(
            peek,
            HelloPeek::ClientHello {
                sni: Some("a.example.com".to_string())
            }
        );
        drop(client.await.expect("client"));
    }

    #[tokio::test]
    async fn test_peek_client_hello_not_tls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.expect("connect");
            stream.write_all(b"GET / HTTP/1.1\r\n").await.expect("write");
            stream
        });

        let (server_stream, _) = listener.accept().await.expect("accept");
        let peek = peek_client_hello(&server_stream).await.expect("peek");
        assert_eq!(peek, HelloPeek::NotTls);
        drop(client.await.expect("client"));
    }

    #[tokio::test]
    async fn test_stalled_handshake_shares_one_deadline() {
        use crate::tls::test_support::{self_signed_entry, store_with_default};
        use std::sync::Arc;

        let store = Arc::new(store_with_default());
        store
            .install(self_signed_entry(&["a.example.com"]))
            .expect("install");
        let acceptor = TlsAcceptor::from(store.server_config());

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.expect("connect");
            // Announce a full record but never deliver it, stalling both the
            // peek and the handshake itself.
            stream
                .write_all(&[0x16, 0x03, 0x01, 0x01, 0x00])
                .await
                .expect("write");
            tokio::time::sleep(Duration::from_secs(5)).await;
            stream
        });

        let (server_stream, _) = listener.accept().await.expect("accept");
        let budget = Duration::from_millis(200);
        let started = tokio::time::Instant::now();
        let result = route_handshake(&store, &acceptor, server_stream, budget).await;
        let elapsed = started.elapsed();

        assert_eq!(
            result.err().map(|e| e.kind()),
            Some(io::ErrorKind::TimedOut)
        );
        assert!(
            elapsed < budget * 2,
            "stalled peer held the acceptor for {:?}",
            elapsed
        );
        client.abort();
    }

    #[tokio::test]
    async fn test_peek_client_hello_stalled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.expect("connect");
            // Send only a record header announcing more than we deliver.
            stream
                .write_all(&[0x16, 0x03, 0x01, 0x01, 0x00])
                .await
                .expect("write");
            // Keep the socket open so the peek sees no progress.
            tokio::time::sleep(Duration::from_millis(500)).await;
            stream
        });

        let (server_stream, _) = listener.accept().await.expect("accept");
        let peek = peek_client_hello(&server_stream).await.expect("peek");
        assert_eq!(peek, HelloPeek::Stalled);
        drop(client.await.expect("client"));
    }
}
