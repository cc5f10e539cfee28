//! Service assembly
//!
//! Turns a validated [`Config`] into credential managers, providers and the
//! routing registry, and owns their start/stop.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use credential_manager::{CredentialManager, ManagerOptions};
use credentials::constants::{
    CHATGPT_BASE_URL, CHATGPT_TOKEN_ENDPOINT, CLAUDE_BASE_URL, CLAUDE_TOKEN_ENDPOINT,
};
use credentials::{ChatGptRefresher, ChatGptStore, ClaudeRefresher, ClaudeStore};
use futures_util::future::join_all;
use provider::{Provider, Registry};
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auth::Authenticator;
use crate::config::{Config, ProviderKind};
use crate::error::{Error, Result};
use crate::providers::{ChatGptProvider, ClaudeProvider};
use crate::proxy::ProxyState;

/// Time allowed for in-flight requests to finish after a shutdown signal.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall timeout for token endpoint calls.
const TOKEN_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime counters tracked while the service is running
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Requests whose response body has not finished yet.
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Every enabled provider, wired and ready to serve.
pub struct Service {
    managers: Vec<CredentialManager>,
    state: ProxyState,
}

impl Service {
    /// Load credentials for every enabled provider and build the registry.
    ///
    /// A provider that cannot load its credentials fails the whole service.
    pub async fn new(config: &Config, parent_cancel: Option<CancellationToken>) -> Result<Self> {
        let token_client = reqwest::Client::builder()
            .timeout(TOKEN_ENDPOINT_TIMEOUT)
            .build()
            .map_err(|e| Error::HttpClient(e.to_string()))?;
        // No overall timeout: event streams may stay open for minutes.
        let proxy_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::HttpClient(e.to_string()))?;

        let mut managers = Vec::with_capacity(config.providers.len());
        let mut registrations: Vec<(String, Arc<dyn Provider>)> = Vec::new();

        for &kind in &config.providers {
            let options = ManagerOptions {
                refresh_window: config.refresh_window(kind),
                check_interval: config.check_interval(),
                parent_cancel: parent_cancel.clone(),
            };

            let provider: Arc<dyn Provider> = match kind {
                ProviderKind::Claude => {
                    let store = ClaudeStore::new(config.claude_credential_path());
                    let refresher = ClaudeRefresher::with_endpoint(
                        token_client.clone(),
                        endpoint(&config.upstream.claude_token_endpoint, CLAUDE_TOKEN_ENDPOINT),
                    );
                    let manager =
                        CredentialManager::new(kind.id(), Arc::new(store), Arc::new(refresher), options)
                            .await?;
                    let base = base_url(kind, &config.upstream.claude_base_url, CLAUDE_BASE_URL)?;
                    managers.push(manager.clone());
                    Arc::new(ClaudeProvider::new(manager, base))
                }
                ProviderKind::ChatGpt => {
                    let store = ChatGptStore::new(config.chatgpt_credential_path());
                    store
                        .bootstrap(config.chatgpt_refresh_token.as_ref().map(|t| t.expose().as_str()))
                        .await
                        .map_err(|source| Error::Bootstrap {
                            provider: kind.id(),
                            source,
                        })?;
                    let refresher = ChatGptRefresher::with_endpoint(
                        token_client.clone(),
                        endpoint(&config.upstream.chatgpt_token_endpoint, CHATGPT_TOKEN_ENDPOINT),
                    );
                    let manager =
                        CredentialManager::new(kind.id(), Arc::new(store), Arc::new(refresher), options)
                            .await?;
                    let base = base_url(kind, &config.upstream.chatgpt_base_url, CHATGPT_BASE_URL)?;
                    managers.push(manager.clone());
                    Arc::new(ChatGptProvider::new(manager, base))
                }
            };

            registrations.push((kind.prefix().to_string(), provider));
        }

        let registry = Registry::new(registrations)?;
        for (prefix, id) in registry.routes() {
            info!(prefix, provider = id, "route registered");
        }

        Ok(Self {
            managers,
            state: ProxyState {
                registry: Arc::new(registry),
                authenticator: Arc::new(Authenticator::new(&config.users)),
                client: proxy_client,
                request_timeout: config.request_timeout(),
                max_request_body_bytes: config.max_request_body_bytes,
                metrics: ServiceMetrics::new(),
            },
        })
    }

    /// Run each manager's startup refresh check and launch its loop.
    pub async fn start(&self) {
        join_all(self.managers.iter().map(|m| m.start())).await;
    }

    /// Stop every provider's background work.
    pub async fn shutdown(&self) {
        join_all(self.state.registry.providers().map(|p| p.shutdown())).await;
        info!("all providers shut down");
    }

    /// Handler state for the router.
    pub fn proxy_state(&self) -> ProxyState {
        self.state.clone()
    }
}

fn endpoint(override_url: &Option<String>, default: &str) -> String {
    override_url.clone().unwrap_or_else(|| default.to_string())
}

fn base_url(kind: ProviderKind, override_url: &Option<String>, default: &str) -> Result<Url> {
    let raw = override_url.as_deref().unwrap_or(default);
    let url = Url::parse(raw).map_err(|e| Error::UpstreamUrl {
        provider: kind.id(),
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(Error::UpstreamUrl {
            provider: kind.id(),
            url: raw.to_string(),
            reason: "must be an http(s) base URL".into(),
        });
    }
    Ok(url)
}
