//! Provider abstraction and prefix routing
//!
//! A provider turns a downstream request into an upstream one: it rewrites the
//! path, filters headers, and injects its own credentials. The pipeline only
//! sees this trait, so adding a provider means implementing it and
//! registering a prefix.

pub mod headers;
pub mod registry;

pub use registry::Registry;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, Url};
use std::future::Future;
use std::pin::Pin;

/// Errors from provider operations and registry construction.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider {0} has no valid credentials")]
    Unavailable(String),

    #[error("building upstream request failed: {0}")]
    Build(String),

    #[error("invalid provider registration: {0}")]
    Registry(String),
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Boxed future returned by the dyn-compatible [`Provider`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Inbound request after the body has been read.
#[derive(Debug, Clone)]
pub struct DownstreamRequest {
    pub method: Method,
    pub headers: HeaderMap,
    /// Raw query string without the leading `?`
    pub query: Option<String>,
    pub body: Bytes,
}

/// Fully assembled request ready to send upstream.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// One upstream API bound to one credential source.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Provider>`).
pub trait Provider: Send + Sync {
    /// Stable name for logs and health output (e.g. "claude", "chatgpt")
    fn id(&self) -> &str;

    /// Whether a valid access token is available right now.
    fn is_available(&self) -> BoxFuture<'_, bool>;

    /// Build the upstream request for `request`, whose path has already had
    /// the routing prefix removed (`trimmed_path` always starts with `/`).
    ///
    /// Hop-by-hop headers and any inbound `Authorization` never reach the
    /// result.
    fn build_upstream_request<'a>(
        &'a self,
        request: &'a DownstreamRequest,
        trimmed_path: &'a str,
    ) -> BoxFuture<'a, Result<UpstreamRequest>>;

    /// Release background resources (credential refresh loops).
    fn shutdown(&self) -> BoxFuture<'_, ()>;
}

/// Join `base` and `path`, keeping any path `base` already carries, then
/// attach `query`.
///
/// `https://chatgpt.com/backend-api/codex` + `/responses` becomes
/// `https://chatgpt.com/backend-api/codex/responses`.
pub fn upstream_url(base: &Url, path: &str, query: Option<&str>) -> Result<Url> {
    let mut url = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url.set_query(query.filter(|q| !q.is_empty()));
    if url.cannot_be_a_base() {
        return Err(ProviderError::Build(format!("invalid upstream base URL {base}")));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_base_path_and_query() {
        let base = Url::parse("https://chatgpt.com/backend-api/codex").unwrap();
        let url = upstream_url(&base, "/responses", Some("stream=true")).unwrap();
        assert_eq!(url.as_str(), "https://chatgpt.com/backend-api/codex/responses?stream=true");
    }

    #[test]
    fn joins_root_base_without_double_slash() {
        let base = Url::parse("https://api.anthropic.com/").unwrap();
        let url = upstream_url(&base, "/v1/messages", None).unwrap();
        assert_eq!(url.as_str(), "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn empty_query_is_dropped() {
        let base = Url::parse("http://127.0.0.1:9000").unwrap();
        let url = upstream_url(&base, "/", Some("")).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/");
    }

    #[test]
    fn rejects_non_hierarchical_base() {
        let base = Url::parse("mailto:ops@example.com").unwrap();
        assert!(matches!(
            upstream_url(&base, "/x", None),
            Err(ProviderError::Build(_))
        ));
    }
}
