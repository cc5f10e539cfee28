//! Credential manager: snapshot reads, gated refresh, explicit lifecycle
//!
//! Reads take the record lock shared and never wait on the network. Refreshes
//! serialize on a separate gate so the token exchange runs with no record lock
//! held; the record lock is only taken exclusively for the in-memory swap.
//!
//! Every committed refresh bumps a generation counter. A caller that observed
//! generation `g` before queueing on the gate and finds a different value once
//! inside knows someone else already refreshed, and backs off.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use credentials::{CredentialStore, TokenCredentials, TokenRefresher};
use reqwest::header::HeaderMap;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::policy::{is_valid, needs_refresh};
use crate::refresh::spawn_refresh_loop;

/// Timing knobs for one manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Refresh this long before the token expires.
    pub refresh_window: Duration,
    /// How often the background loop re-evaluates the record.
    pub check_interval: Duration,
    /// Process-wide stop signal; the manager's own token is a child of it.
    pub parent_cancel: Option<CancellationToken>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            refresh_window: Duration::from_secs(60),
            check_interval: Duration::from_secs(60),
            parent_cancel: None,
        }
    }
}

/// Result of one `refresh_if_needed` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The record was still fresh enough.
    NotNeeded,
    /// Another caller committed a refresh while this one waited on the gate.
    AlreadyRefreshed,
    /// This call exchanged the refresh token and committed the result.
    Refreshed,
}

impl RefreshOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshOutcome::NotNeeded => "not_needed",
            RefreshOutcome::AlreadyRefreshed => "already_refreshed",
            RefreshOutcome::Refreshed => "refreshed",
        }
    }
}

/// Observable lifecycle of the background loop.
///
/// Transitions: Created → Running (start), Created/Running → Stopped
/// (shutdown). Stopped is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Running,
    Stopped,
}

enum LoopState {
    Created,
    Running(JoinHandle<()>),
    Stopped,
}

struct Snapshot {
    creds: TokenCredentials,
    generation: u64,
}

pub(crate) struct Inner {
    name: String,
    store: Arc<dyn CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    refresh_window: Duration,
    check_interval: Duration,
    state: RwLock<Snapshot>,
    refresh_gate: Mutex<()>,
    lifecycle: Mutex<LoopState>,
    cancel: CancellationToken,
}

/// Owns and refreshes one provider's credentials.
///
/// Cheap to clone; clones share the same record and background loop.
#[derive(Clone)]
pub struct CredentialManager {
    inner: Arc<Inner>,
}

impl CredentialManager {
    /// Load the record from `store`. Fails if the store rejects the file.
    pub async fn new(
        name: impl Into<String>,
        store: Arc<dyn CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
        options: ManagerOptions,
    ) -> Result<Self> {
        let name = name.into();
        let creds = store.load().await.map_err(|source| Error::Load {
            provider: name.clone(),
            path: store.path().display().to_string(),
            source,
        })?;

        info!(
            provider = %name,
            path = %store.path().display(),
            has_access_token = !creds.access_token.is_empty(),
            expires_at = ?creds.expires_at,
            "loaded credentials"
        );

        let cancel = match &options.parent_cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                store,
                refresher,
                refresh_window: options.refresh_window,
                check_interval: options.check_interval,
                state: RwLock::new(Snapshot {
                    creds,
                    generation: 0,
                }),
                refresh_gate: Mutex::new(()),
                lifecycle: Mutex::new(LoopState::Created),
                cancel,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// `Bearer <access token>` if the current token is valid.
    pub async fn authorization_header(&self) -> Result<String> {
        self.authorization_header_at(Utc::now()).await
    }

    pub async fn authorization_header_at(&self, now: DateTime<Utc>) -> Result<String> {
        let state = self.inner.state.read().await;
        if !is_valid(&state.creds, now) {
            return Err(Error::Unavailable(self.inner.name.clone()));
        }
        Ok(format!("Bearer {}", state.creds.access_token))
    }

    /// Provider-specific headers derived from the current metadata.
    pub async fn extra_headers(&self) -> Result<HeaderMap> {
        let state = self.inner.state.read().await;
        state
            .creds
            .metadata
            .extra_headers()
            .map_err(|source| Error::Headers {
                provider: self.inner.name.clone(),
                source,
            })
    }

    pub async fn is_available(&self) -> bool {
        self.is_available_at(Utc::now()).await
    }

    pub async fn is_available_at(&self, now: DateTime<Utc>) -> bool {
        is_valid(&self.inner.state.read().await.creds, now)
    }

    /// Copy of the last committed record.
    pub async fn snapshot(&self) -> TokenCredentials {
        self.inner.state.read().await.creds.clone()
    }

    /// Number of refreshes committed since load.
    pub async fn generation(&self) -> u64 {
        self.inner.state.read().await.generation
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        match *self.inner.lifecycle.lock().await {
            LoopState::Created => Lifecycle::Created,
            LoopState::Running(_) => Lifecycle::Running,
            LoopState::Stopped => Lifecycle::Stopped,
        }
    }

    pub(crate) fn check_interval(&self) -> Duration {
        self.inner.check_interval
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Refresh the record if the policy says it is due.
    pub async fn refresh_if_needed(&self) -> Result<RefreshOutcome> {
        let observed = {
            let state = self.inner.state.read().await;
            if !needs_refresh(&state.creds, Utc::now(), self.inner.refresh_window) {
                return Ok(RefreshOutcome::NotNeeded);
            }
            state.generation
        };

        let result = self.refresh_from(observed).await;
        let outcome = match &result {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        if !matches!(result, Ok(RefreshOutcome::NotNeeded)) {
            metrics::counter!(
                "credential_refresh_total",
                "provider" => self.inner.name.clone(),
                "outcome" => outcome,
            )
            .increment(1);
        }
        result
    }

    /// Refresh unless the record has moved past `observed`.
    async fn refresh_from(&self, observed: u64) -> Result<RefreshOutcome> {
        let _gate = self.inner.refresh_gate.lock().await;

        let refresh_token = {
            let state = self.inner.state.read().await;
            if state.generation != observed {
                debug!(provider = %self.inner.name, "refresh already committed by another caller");
                return Ok(RefreshOutcome::AlreadyRefreshed);
            }
            if !needs_refresh(&state.creds, Utc::now(), self.inner.refresh_window) {
                return Ok(RefreshOutcome::NotNeeded);
            }
            if state.creds.refresh_token.is_empty() {
                return Err(Error::MissingRefreshToken(self.inner.name.clone()));
            }
            state.creds.refresh_token.clone()
        };

        debug!(provider = %self.inner.name, "refreshing access token");
        let mut fresh = self
            .inner
            .refresher
            .refresh(&refresh_token)
            .await
            .map_err(|source| Error::Refresh {
                provider: self.inner.name.clone(),
                source,
            })?;
        if fresh.access_token.is_empty() {
            return Err(Error::Refresh {
                provider: self.inner.name.clone(),
                source: credentials::Error::TokenExchange("empty access token".into()),
            });
        }

        let generation = {
            let mut state = self.inner.state.write().await;
            fresh.metadata.inherit_missing(&state.creds.metadata);
            state.creds = fresh.clone();
            state.generation += 1;
            state.generation
        };

        info!(
            provider = %self.inner.name,
            generation,
            expires_at = ?fresh.expires_at,
            "access token refreshed"
        );

        // The in-memory token is authoritative even if the write-back fails.
        if let Err(e) = self.inner.store.save(&fresh).await {
            warn!(
                provider = %self.inner.name,
                path = %self.inner.store.path().display(),
                error = %e,
                "failed to persist refreshed credentials"
            );
        }

        Ok(RefreshOutcome::Refreshed)
    }

    /// Run one refresh attempt, then launch the background loop.
    ///
    /// Only the first call does anything. A failed attempt is logged; the
    /// loaded token may still be valid.
    pub async fn start(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if !matches!(*lifecycle, LoopState::Created) {
            return;
        }

        match self.refresh_if_needed().await {
            Ok(outcome) => {
                debug!(provider = %self.inner.name, outcome = outcome.label(), "startup refresh check")
            }
            Err(e) => warn!(provider = %self.inner.name, error = %e, "startup refresh failed"),
        }

        *lifecycle = LoopState::Running(spawn_refresh_loop(self));
        info!(
            provider = %self.inner.name,
            check_interval_secs = self.inner.check_interval.as_secs_f64(),
            refresh_window_secs = self.inner.refresh_window.as_secs_f64(),
            "credential refresh loop started"
        );
    }

    /// Stop the background loop and wait for it to exit. Safe to call more
    /// than once and before `start`.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.inner.cancel.cancel();
        match std::mem::replace(&mut *lifecycle, LoopState::Stopped) {
            LoopState::Running(handle) => {
                if let Err(e) = handle.await {
                    warn!(provider = %self.inner.name, error = %e, "refresh loop exited abnormally");
                }
                info!(provider = %self.inner.name, "credential refresh loop stopped");
            }
            LoopState::Created | LoopState::Stopped => {}
        }
    }
}
