//! HTTP/1.1 wire layer
//!
//! Hand-rolled request-line/header/body parsing over an async byte stream,
//! including chunked transfer-encoding in both directions. Header order and
//! duplicates are preserved (Vec of pairs) so multi-value headers such as
//! Set-Cookie survive the proxy path intact.

use std::io;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Error taxonomy for the request path.
///
/// Client protocol violations map to a 4xx response; transport conditions
/// (timeout, closed socket) tear the connection down silently.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("malformed request: {0}")]
    BadRequest(&'static str),
    #[error("header line exceeds limit")]
    HeaderTooLarge,
    #[error("unsupported transfer encoding: {0}")]
    UnsupportedTransferEncoding(String),
    #[error("body exceeds configured limit")]
    BodyTooLarge,
    #[error("timed out")]
    Timeout,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl HttpError {
    /// HTTP status this error is reported as, or None for silent teardown.
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::BadRequest(_)
            | HttpError::HeaderTooLarge
            | HttpError::UnsupportedTransferEncoding(_) => Some(400),
            HttpError::BodyTooLarge => Some(413),
            HttpError::Timeout | HttpError::ConnectionClosed | HttpError::Io(_) => None,
        }
    }
}

/// One parsed request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    /// "1.0" or "1.1"
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// First header value matching `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }
}

/// First header value matching `name`, case-insensitive.
pub fn header_get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Buffered reader over an async byte stream.
///
/// Keeps its own buffer so line reads and exact-length body reads can be
/// interleaved without losing pipelined bytes.
pub struct WireReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Read one CRLF-terminated line, stripping the terminator.
    ///
    /// Returns ConnectionClosed on EOF, HeaderTooLarge once the line grows
    /// past `max_len` without a terminator.
    pub async fn read_line(&mut self, max_len: usize) -> Result<String, HttpError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                if pos + 1 > max_len.saturating_add(2) {
                    return Err(HttpError::HeaderTooLarge);
                }
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                let line = String::from_utf8(line.to_vec())
                    .map_err(|_| HttpError::BadRequest("non-ascii bytes in header block"))?;
                if !line.is_ascii() {
                    return Err(HttpError::BadRequest("non-ascii bytes in header block"));
                }
                return Ok(line);
            }
            if self.buf.len() > max_len.saturating_add(2) {
                return Err(HttpError::HeaderTooLarge);
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(HttpError::ConnectionClosed);
            }
        }
    }

    /// Read exactly `len` bytes into `out`.
    pub async fn read_exact_into(
        &mut self,
        len: usize,
        out: &mut Vec<u8>,
    ) -> Result<(), HttpError> {
        let mut remaining = len;
        while remaining > 0 {
            if self.buf.is_empty() {
                let n = self.inner.read_buf(&mut self.buf).await?;
                if n == 0 {
                    return Err(HttpError::ConnectionClosed);
                }
            }
            let take = remaining.min(self.buf.len());
            out.extend_from_slice(&self.buf[..take]);
            self.buf.advance(take);
            remaining -= take;
        }
        Ok(())
    }

    /// Read until EOF, bounded by `max`.
    pub async fn read_to_end_bounded(&mut self, max: usize) -> Result<Vec<u8>, HttpError> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.buf);
        self.buf.clear();
        loop {
            if out.len() > max {
                return Err(HttpError::BodyTooLarge);
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&self.buf);
            self.buf.clear();
        }
    }
}

/// Parse `METHOD SP path[?query] SP HTTP/1.0|1.1`.
pub fn parse_request_line(line: &str) -> Result<(String, String, Option<String>, String), HttpError> {
    let mut parts = line.split(' ');
    let method = parts
        .next()
        .filter(|m| !m.is_empty())
        .ok_or(HttpError::BadRequest("empty request line"))?;
    let target = parts
        .next()
        .ok_or(HttpError::BadRequest("request line missing target"))?;
    let version = parts
        .next()
        .ok_or(HttpError::BadRequest("request line missing version"))?;
    if parts.next().is_some() {
        return Err(HttpError::BadRequest("request line has trailing fields"));
    }
    if !method.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(HttpError::BadRequest("invalid method"));
    }
    let version = match version {
        "HTTP/1.1" => "1.1",
        "HTTP/1.0" => "1.0",
        _ => return Err(HttpError::BadRequest("unsupported protocol version")),
    };
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (target.to_string(), None),
    };
    if path.is_empty() || !path.starts_with('/') {
        return Err(HttpError::BadRequest("invalid request target"));
    }
    Ok((method.to_string(), path, query, version.to_string()))
}

/// Read header lines until the empty separator line.
///
/// Each line must fit `max_line` bytes, be pure ASCII, and have a
/// `name: value` shape with a non-empty name.
pub async fn read_headers<R: AsyncRead + Unpin>(
    reader: &mut WireReader<R>,
    max_line: usize,
) -> Result<Vec<(String, String)>, HttpError> {
    let mut headers = Vec::new();
    loop {
        let line = reader.read_line(max_line).await?;
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(HttpError::BadRequest("header line without colon"))?;
        let name = name.trim();
        if name.is_empty() || name.contains(' ') {
            return Err(HttpError::BadRequest("malformed header name"));
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }
}

/// Decode a chunked body: hex size line (chunk extensions ignored), data,
/// CRLF, repeated until the zero chunk, then trailers until an empty line.
///
/// The cumulative decoded size is checked against `max_size` before each
/// chunk is buffered, so an oversized body aborts early with BodyTooLarge.
pub async fn read_chunked_body<R: AsyncRead + Unpin>(
    reader: &mut WireReader<R>,
    max_size: usize,
) -> Result<Vec<u8>, HttpError> {
    let mut body = Vec::new();
    loop {
        let size_line = reader.read_line(1024).await?;
        let size_str = size_line
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        let chunk_size = usize::from_str_radix(size_str, 16)
            .map_err(|_| HttpError::BadRequest("invalid chunk size"))?;
        if chunk_size == 0 {
            break;
        }
        if body.len().saturating_add(chunk_size) > max_size {
            return Err(HttpError::BodyTooLarge);
        }
        reader.read_exact_into(chunk_size, &mut body).await?;
        let sep = reader.read_line(16).await?;
        if !sep.is_empty() {
            return Err(HttpError::BadRequest("missing chunk terminator"));
        }
    }
    // Trailer section: consume header-shaped lines until the blank line.
    loop {
        let line = reader.read_line(1024).await?;
        if line.is_empty() {
            return Ok(body);
        }
    }
}

/// Encode `data` with chunked transfer-encoding, splitting into chunks of at
/// most `chunk_size` bytes and appending the zero-chunk terminator.
pub fn encode_chunked(data: &[u8], chunk_size: usize) -> Vec<u8> {
    let chunk_size = chunk_size.max(1);
    let mut out = Vec::with_capacity(data.len() + 32);
    for chunk in data.chunks(chunk_size) {
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

/// One response on its way to the client
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
            body: body.into(),
        }
    }

    /// Short plain-text response for an error status.
    pub fn error(status: u16) -> Self {
        let body = format!("{} {}\n", status, reason_phrase(status));
        Self::with_body(status, "text/plain", body)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(slot) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            slot.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }

    /// Serialize status line, headers and body. Content-Length is always
    /// emitted from the actual body size so every response is well-formed.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status,
            reason_phrase(self.status)
        );
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
            {
                continue;
            }
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        writer.write_all(head.as_bytes()).await?;
        writer.write_all(&self.body).await?;
        writer.flush().await
    }
}

/// Reason phrase for a status code
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(bytes: &[u8]) -> WireReader<std::io::Cursor<Vec<u8>>> {
        WireReader::new(std::io::Cursor::new(bytes.to_vec()))
    }

    #[test]
    fn test_parse_request_line() {
        let (method, path, query, version) =
            parse_request_line("GET /x?a=1&b=2 HTTP/1.1").expect("parse");
        assert_eq!(method, "GET");
        assert_eq!(path, "/x");
        assert_eq!(query.as_deref(), Some("a=1&b=2"));
        assert_eq!(version, "1.1");

        let (_, path, query, version) = parse_request_line("POST / HTTP/1.0").expect("parse");
        assert_eq!(path, "/");
        assert!(query.is_none());
        assert_eq!(version, "1.0");
    }

    #[test]
    fn test_parse_request_line_rejects_garbage() {
        assert!(parse_request_line("").is_err());
        assert!(parse_request_line("GET /x").is_err());
        assert!(parse_request_line("GET /x HTTP/2.0").is_err());
        assert!(parse_request_line("get /x HTTP/1.1").is_err());
        assert!(parse_request_line("GET x HTTP/1.1").is_err());
        assert!(parse_request_line("GET /x HTTP/1.1 extra").is_err());
    }

    #[tokio::test]
    async fn test_read_headers() {
        let mut r = reader(b"Host: a.example.com\r\nX-Thing: v1\r\nX-Thing: v2\r\n\r\n");
        let headers = read_headers(&mut r, 8192).await.expect("headers");
        assert_eq!(headers.len(), 3);
        assert_eq!(header_get(&headers, "HOST"), Some("a.example.com"));
        // Duplicates preserved in order
        let things: Vec<_> = headers
            .iter()
            .filter(|(k, _)| k == "X-Thing")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(things, vec!["v1", "v2"]);
    }

    #[tokio::test]
    async fn test_read_headers_rejects_shapes() {
        let mut r = reader(b"no-colon-here\r\n\r\n");
        assert!(matches!(
            read_headers(&mut r, 8192).await,
            Err(HttpError::BadRequest(_))
        ));

        let mut r = reader(b"bad name: value\r\n\r\n");
        assert!(read_headers(&mut r, 8192).await.is_err());

        let mut r = reader(b"X-Bin: v\xffalue\r\n\r\n");
        assert!(read_headers(&mut r, 8192).await.is_err());
    }

    #[tokio::test]
    async fn test_header_line_limit() {
        let long = format!("X-Long: {}\r\n\r\n", "a".repeat(100));
        let mut r = reader(long.as_bytes());
        assert!(matches!(
            read_headers(&mut r, 32).await,
            Err(HttpError::HeaderTooLarge)
        ));
    }

    #[tokio::test]
    async fn test_chunked_round_trip() {
        // Round-trip law: decode(encode(x)) == x for several sizes including
        // bodies larger than one chunk and the empty body.
        for body in [&b""[..], b"test", b"hello world, this is a longer body"] {
            for chunk_size in [1usize, 3, 4, 64] {
                let encoded = encode_chunked(body, chunk_size);
                let mut r = reader(&encoded);
                let decoded = read_chunked_body(&mut r, 1024).await.expect("decode");
                assert_eq!(decoded, body, "chunk_size {}", chunk_size);
            }
        }
    }

    #[tokio::test]
    async fn test_chunked_decode_with_extensions_and_trailers() {
        let mut r = reader(b"4;ext=1\r\ntest\r\n0\r\nX-Trailer: t\r\n\r\n");
        let body = read_chunked_body(&mut r, 1024).await.expect("decode");
        assert_eq!(body, b"test");
    }

    #[tokio::test]
    async fn test_chunked_decode_enforces_max_size() {
        // 16-byte chunks against an 8-byte cap: must abort before buffering.
        let encoded = encode_chunked(&[0u8; 16], 16);
        let mut r = reader(&encoded);
        assert!(matches!(
            read_chunked_body(&mut r, 8).await,
            Err(HttpError::BodyTooLarge)
        ));
    }

    #[tokio::test]
    async fn test_chunked_decode_rejects_huge_chunk_size() {
        // A size line near usize::MAX must trip the cap instead of wrapping
        // the cumulative-size check.
        let mut r = reader(b"1\r\nA\r\nffffffffffffffff\r\n");
        assert!(matches!(
            read_chunked_body(&mut r, 1024).await,
            Err(HttpError::BodyTooLarge)
        ));
    }

    #[tokio::test]
    async fn test_chunked_decode_rejects_bad_size() {
        let mut r = reader(b"zz\r\ntest\r\n0\r\n\r\n");
        assert!(read_chunked_body(&mut r, 1024).await.is_err());
    }

    #[tokio::test]
    async fn test_read_exact_into() {
        let mut r = reader(b"0123456789");
        let mut out = Vec::new();
        r.read_exact_into(4, &mut out).await.expect("read");
        assert_eq!(out, b"0123");
        r.read_exact_into(6, &mut out).await.expect("read");
        assert_eq!(out, b"0123456789");
        assert!(r.read_exact_into(1, &mut out).await.is_err());
    }

    #[tokio::test]
    async fn test_response_serialization() {
        let mut resp = Response::with_body(200, "text/plain", "hello");
        resp.set_header("Connection", "keep-alive");
        let mut out = Vec::new();
        resp.write_to(&mut out).await.expect("write");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn test_response_strips_stale_framing_headers() {
        let mut resp = Response::with_body(200, "text/plain", "ok");
        resp.headers
            .push(("Transfer-Encoding".to_string(), "chunked".to_string()));
        resp.headers
            .push(("Content-Length".to_string(), "999".to_string()));
        let mut out = Vec::new();
        resp.write_to(&mut out).await.expect("write");
        let text = String::from_utf8(out).expect("utf8");
        assert!(!text.contains("Transfer-Encoding"));
        assert!(text.contains("Content-Length: 2\r\n"));
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(HttpError::BadRequest("x").status(), Some(400));
        assert_eq!(HttpError::HeaderTooLarge.status(), Some(400));
        assert_eq!(HttpError::BodyTooLarge.status(), Some(413));
        assert_eq!(
            HttpError::UnsupportedTransferEncoding("gzip".into()).status(),
            Some(400)
        );
        assert_eq!(HttpError::Timeout.status(), None);
        assert_eq!(HttpError::ConnectionClosed.status(), None);
    }
}
