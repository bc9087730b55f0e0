//! Content resolution seam
//!
//! Virtual-host content lookup lives outside this process core; the pipeline
//! hands requests that are not proxied to a `ContentResolver` and writes back
//! whatever it returns. A `None` return is the explicit "already handled"
//! signal: the pipeline writes nothing and applies no post-processing.

use async_trait::async_trait;

use crate::http::Request;

/// A resolved response body plus metadata
#[derive(Debug, Clone)]
pub struct Resolved {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Resolved {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// External content lookup for hosts that are not proxy targets
#[async_trait]
pub trait ContentResolver: Send + Sync {
    /// Resolve a request into a response, or `None` when the request was
    /// already handled and no response should be written.
    async fn resolve(&self, request: &Request) -> Option<Resolved>;
}

/// Fallback resolver serving a plain 404 for every request
pub struct NotFoundResolver;

#[async_trait]
impl ContentResolver for NotFoundResolver {
    async fn resolve(&self, request: &Request) -> Option<Resolved> {
        Some(
            Resolved::new(404, format!("no content for {}\n", request.path))
                .with_header("Content-Type", "text/plain"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Request;

    #[tokio::test]
    async fn test_not_found_resolver() {
        let request = Request {
            method: "GET".to_string(),
            path: "/missing".to_string(),
            query: None,
            version: "HTTP/1.1".to_string(),
            headers: vec![("Host".to_string(), "a.example.com".to_string())],
            body: Vec::new(),
        };
        let resolved = NotFoundResolver.resolve(&request).await.expect("resolved");
        assert_eq!(resolved.status, 404);
        assert!(String::from_utf8_lossy(&resolved.body).contains("/missing"));
    }
}
