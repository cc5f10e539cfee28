//! Concrete Claude and ChatGPT providers
//!
//! Both bind a credential manager to an upstream base URL. They differ only in
//! path normalization and in how they treat the `anthropic-beta` header.

use credential_manager::CredentialManager;
use credentials::constants::CLAUDE_OAUTH_BETA;
use provider::headers::{forwardable_request_headers, header_value, merge_into};
use provider::{
    BoxFuture, DownstreamRequest, Provider, ProviderError, UpstreamRequest, upstream_url,
};
use reqwest::Url;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName};
use tracing::debug;

const ANTHROPIC_BETA: &str = "anthropic-beta";

/// Set the manager's bearer token and extra headers on `headers`.
async fn inject_credentials(
    id: &str,
    manager: &CredentialManager,
    headers: &mut HeaderMap,
) -> provider::Result<()> {
    let auth = manager
        .authorization_header()
        .await
        .map_err(|_| ProviderError::Unavailable(id.to_string()))?;
    headers.insert(AUTHORIZATION, header_value("authorization", &auth)?);

    let extra = manager
        .extra_headers()
        .await
        .map_err(|e| ProviderError::Build(e.to_string()))?;
    merge_into(headers, extra);
    Ok(())
}

/// Anthropic API via a Claude subscription.
pub struct ClaudeProvider {
    manager: CredentialManager,
    base_url: Url,
}

impl ClaudeProvider {
    pub fn new(manager: CredentialManager, base_url: Url) -> Self {
        Self { manager, base_url }
    }
}

impl Provider for ClaudeProvider {
    fn id(&self) -> &str {
        "claude"
    }

    fn is_available(&self) -> BoxFuture<'_, bool> {
        Box::pin(self.manager.is_available())
    }

    fn build_upstream_request<'a>(
        &'a self,
        request: &'a DownstreamRequest,
        trimmed_path: &'a str,
    ) -> BoxFuture<'a, provider::Result<UpstreamRequest>> {
        Box::pin(async move {
            let mut headers = forwardable_request_headers(&request.headers);
            merge_beta_headers(&mut headers)?;
            inject_credentials(self.id(), &self.manager, &mut headers).await?;

            Ok(UpstreamRequest {
                method: request.method.clone(),
                url: upstream_url(&self.base_url, trimmed_path, request.query.as_deref())?,
                headers,
                body: request.body.clone(),
            })
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.manager.shutdown())
    }
}

/// Put the OAuth beta flag first, then any client-supplied flags, deduplicated.
///
/// Multiple `anthropic-beta` headers collapse into one comma-separated value.
fn merge_beta_headers(headers: &mut HeaderMap) -> provider::Result<()> {
    let mut flags: Vec<String> = vec![CLAUDE_OAUTH_BETA.to_string()];

    for value in headers.get_all(ANTHROPIC_BETA) {
        let Ok(text) = value.to_str() else {
            continue;
        };
        for flag in text.split(',') {
            let trimmed = flag.trim().to_string();
            if !trimmed.is_empty() && !flags.contains(&trimmed) {
                flags.push(trimmed);
            }
        }
    }

    let merged = header_value(ANTHROPIC_BETA, &flags.join(","))?;
    headers.insert(HeaderName::from_static(ANTHROPIC_BETA), merged);
    Ok(())
}

/// ChatGPT backend (Codex responses API) via a ChatGPT subscription.
pub struct ChatGptProvider {
    manager: CredentialManager,
    base_url: Url,
}

impl ChatGptProvider {
    pub fn new(manager: CredentialManager, base_url: Url) -> Self {
        Self { manager, base_url }
    }
}

impl Provider for ChatGptProvider {
    fn id(&self) -> &str {
        "chatgpt"
    }

    fn is_available(&self) -> BoxFuture<'_, bool> {
        Box::pin(self.manager.is_available())
    }

    fn build_upstream_request<'a>(
        &'a self,
        request: &'a DownstreamRequest,
        trimmed_path: &'a str,
    ) -> BoxFuture<'a, provider::Result<UpstreamRequest>> {
        Box::pin(async move {
            let mut headers = forwardable_request_headers(&request.headers);
            // The backend rejects requests carrying Anthropic beta flags.
            headers.remove(ANTHROPIC_BETA);
            inject_credentials(self.id(), &self.manager, &mut headers).await?;

            let path = strip_version_segment(trimmed_path);
            if path != trimmed_path {
                debug!(from = trimmed_path, to = path, "stripped /v1 for chatgpt backend");
            }

            Ok(UpstreamRequest {
                method: request.method.clone(),
                url: upstream_url(&self.base_url, path, request.query.as_deref())?,
                headers,
                body: request.body.clone(),
            })
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.manager.shutdown())
    }
}

/// The backend serves OpenAI-style routes without the `/v1` segment.
fn strip_version_segment(path: &str) -> &str {
    if path == "/v1" {
        return "/";
    }
    match path.strip_prefix("/v1/") {
        Some(_) => &path[3..],
        None => path,
    }
}
