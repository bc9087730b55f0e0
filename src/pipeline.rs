//! Per-connection HTTP pipeline
//!
//! Parses keep-alive request sequences off one negotiated stream, enforces
//! size and time limits, serves the ACME HTTP-01 endpoint, and dispatches to
//! the reverse proxy or the content resolver. Every rejected request gets a
//! well-formed response; transport failures tear the connection down quietly.

use std::sync::Arc;
use std::time::Duration;

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::challenge::Http01TokenStore;
use crate::config::{CompressionConfig, EdgeConfig};
use crate::content::ContentResolver;
use crate::http::{
    parse_request_line, read_chunked_body, read_headers, HttpError, Request, Response, WireReader,
};
use crate::proxy::proxy_request;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Shared request-handling context, one instance for the whole server
pub struct Pipeline {
    config: Arc<EdgeConfig>,
    tokens: Arc<Http01TokenStore>,
    resolver: Arc<dyn ContentResolver>,
}

impl Pipeline {
    pub fn new(
        config: Arc<EdgeConfig>,
        tokens: Arc<Http01TokenStore>,
        resolver: Arc<dyn ContentResolver>,
    ) -> Self {
        Self {
            config,
            tokens,
            resolver,
        }
    }

    /// Serve requests off one connection until it closes, errors out, or the
    /// keep-alive budget is spent.
    pub async fn handle<S: AsyncRead + AsyncWrite + Unpin>(&self, stream: S, peer: &str) {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = WireReader::new(read_half);
        self.serve_loop(&mut reader, &mut writer, peer).await;
        // Orderly shutdown so TLS peers get a close_notify.
        let _ = writer.shutdown().await;
    }

    async fn serve_loop<R, W>(&self, reader: &mut WireReader<R>, writer: &mut W, peer: &str)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut served: u32 = 0;

        loop {
            let request = match self.read_request(reader).await {
                Ok(request) => request,
                Err(e) => {
                    match e.status() {
                        Some(status) => {
                            debug!("Rejecting request from {}: {}", peer, e);
                            let mut resp = Response::error(status);
                            resp.set_header("Connection", "close");
                            let _ = resp.write_to(writer).await;
                        }
                        None => debug!("Connection from {} ended: {}", peer, e),
                    }
                    return;
                }
            };
            served += 1;

            let close = wants_close(&request)
                || served >= self.config.server.max_requests_per_conn;

            let response = match self.dispatch(&request).await {
                Some(response) => response,
                // Sentinel: already handled, nothing to write or post-process.
                None => {
                    if close {
                        return;
                    }
                    continue;
                }
            };

            let mut response = response;
            maybe_compress(&request, &mut response, &self.config.compression);
            response.set_header(
                "Connection",
                if close { "close" } else { "keep-alive" },
            );
            if let Err(e) = response.write_to(writer).await {
                debug!("Write to {} failed: {}", peer, e);
                return;
            }
            if close {
                return;
            }
        }
    }

    /// Read one full request under the keepalive/header/body timeouts.
    async fn read_request<R: AsyncRead + Unpin>(
        &self,
        reader: &mut WireReader<R>,
    ) -> Result<Request, HttpError> {
        let limits = &self.config.limits;

        let line = timeout(
            Duration::from_millis(limits.keepalive_timeout_ms),
            reader.read_line(limits.max_header_line),
        )
        .await
        .map_err(|_| HttpError::Timeout)??;
        let (method, path, query, version) = parse_request_line(&line)?;

        let headers = timeout(
            Duration::from_millis(limits.header_timeout_ms),
            read_headers(reader, limits.max_header_line),
        )
        .await
        .map_err(|_| HttpError::Timeout)??;

        let mut request = Request {
            method,
            path,
            query,
            version,
            headers,
            body: Vec::new(),
        };
        if request.host().is_none() {
            return Err(HttpError::BadRequest("missing Host header"));
        }

        if let Some(te) = request.header("transfer-encoding") {
            if !te.eq_ignore_ascii_case("chunked") {
                return Err(HttpError::UnsupportedTransferEncoding(te.to_string()));
            }
            request.body = timeout(
                Duration::from_millis(limits.body_timeout_ms),
                read_chunked_body(reader, limits.max_body_size),
            )
            .await
            .map_err(|_| HttpError::Timeout)??;
        } else if let Some(len) = request.header("content-length") {
            let len: usize = len
                .trim()
                .parse()
                .map_err(|_| HttpError::BadRequest("invalid Content-Length"))?;
            if len > limits.max_body_size {
                return Err(HttpError::BodyTooLarge);
            }
            if len > 0 {
                let mut body = Vec::with_capacity(len.min(64 * 1024));
                timeout(
                    Duration::from_millis(limits.body_timeout_ms),
                    reader.read_exact_into(len, &mut body),
                )
                .await
                .map_err(|_| HttpError::Timeout)??;
                request.body = body;
            }
        }
        Ok(request)
    }

    /// Route one request; None is the "already handled" sentinel.
    async fn dispatch(&self, request: &Request) -> Option<Response> {
        if request.method == "GET" {
            if let Some(token) = request.path.strip_prefix(ACME_CHALLENGE_PREFIX) {
                return Some(match self.tokens.response_for(token) {
                    Some(key_auth) => Response::with_body(200, "text/plain", key_auth),
                    None => Response::error(404),
                });
            }
        }

        // Host header may carry a port; proxy targets are keyed by bare host.
        let host = request.host().unwrap_or_default();
        let bare_host = host.split(':').next().unwrap_or(host);
        if let Some(target) = self.config.proxy.hosts.get(bare_host) {
            return Some(
                match proxy_request(request, target, host, &self.config.limits).await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("Proxy to {} failed: {}", target.host_header(), e);
                        Response::error(502)
                    }
                },
            );
        }

        match self.resolver.resolve(request).await {
            Some(resolved) => Some(Response {
                status: resolved.status,
                headers: resolved.headers,
                body: resolved.body,
            }),
            None => None,
        }
    }
}

/// True when this must be the last response on the connection.
fn wants_close(request: &Request) -> bool {
    match request.header("connection") {
        Some(value) => value
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case("close")),
        // HTTP/1.0 defaults to close unless keep-alive is requested.
        None => request.version == "1.0",
    }
}

/// Compress the response body in place when the client accepts it, the
/// content type is eligible and the body is worth the cycles.
fn maybe_compress(request: &Request, response: &mut Response, config: &CompressionConfig) {
    if !config.enabled || response.body.len() < config.min_size {
        return;
    }
    if response.header("content-encoding").is_some() {
        return;
    }
    let eligible = response
        .header("content-type")
        .map(|ct| {
            let base = ct.split(';').next().unwrap_or(ct).trim();
            config.compress_types.iter().any(|t| t == base)
        })
        .unwrap_or(false);
    if !eligible {
        return;
    }
    let Some(encoding) = preferred_encoding(request.header("accept-encoding")) else {
        return;
    };

    let level = Compression::new(config.level);
    let compressed = match encoding {
        "gzip" => {
            let mut encoder = GzEncoder::new(Vec::new(), level);
            std::io::Write::write_all(&mut encoder, &response.body)
                .and_then(|_| encoder.finish())
        }
        _ => {
            let mut encoder = ZlibEncoder::new(Vec::new(), level);
            std::io::Write::write_all(&mut encoder, &response.body)
                .and_then(|_| encoder.finish())
        }
    };
    match compressed {
        Ok(body) if body.len() < response.body.len() => {
            response.body = body;
            response.set_header("Content-Encoding", encoding);
            response.set_header("Vary", "Accept-Encoding");
        }
        Ok(_) => {}
        Err(e) => debug!("Compression failed, serving identity: {}", e),
    }
}

/// Pick gzip over deflate from an Accept-Encoding value, honoring q=0 optouts.
fn preferred_encoding(accept: Option<&str>) -> Option<&'static str> {
    let accept = accept?;
    let mut gzip = None;
    let mut deflate = None;
    for token in accept.split(',') {
        let mut parts = token.trim().splitn(2, ';');
        let name = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let q = parts
            .next()
            .and_then(|p| p.trim().strip_prefix("q="))
            .and_then(|v| v.trim().parse::<f32>().ok())
            .unwrap_or(1.0);
        match name.as_str() {
            "gzip" => gzip = Some(q),
            "deflate" => deflate = Some(q),
            _ => {}
        }
    }
    if gzip.map(|q| q > 0.0).unwrap_or(false) {
        Some("gzip")
    } else if deflate.map(|q| q > 0.0).unwrap_or(false) {
        Some("deflate")
    } else {
        None
    }
}
