//! AI-mux
//!
//! Multi-tenant reverse proxy in front of subscription-backed LLM APIs:
//! 1. Loads OAuth credentials for Claude and ChatGPT from the state directory
//! 2. Keeps them fresh in the background, persisting rotated tokens
//! 3. Routes `/claude/...` and `/chatgpt/...` to the matching upstream with
//!    the subscription's bearer token injected
//! 4. Streams responses back, including long-lived SSE

mod auth;
mod config;
mod error;
mod metrics;
mod providers;
mod proxy;
mod service;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::auth::Authenticator;
use crate::config::Config;
use crate::proxy::ProxyState;
use crate::service::{DRAIN_TIMEOUT, Service};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Everything except `/health` and `/metrics` goes to the proxy handler.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// JSON logs filtered by LOG_LEVEL, then RUST_LOG, then the config file.
fn init_tracing(config_level: Option<&str>) {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .ok()
        .or_else(|| config_level.and_then(|level| EnvFilter::try_new(level).ok()))
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());
    let config_path = Config::resolve_path(cli_config_path);

    // Loaded before tracing so the file can set the log level.
    let loaded = Config::load(&config_path);
    init_tracing(loaded.as_ref().ok().and_then(|c| c.log_level.as_deref()));
    let config = loaded
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        path = %config_path.display(),
        listen_addr = %config.listen_addr,
        state_dir = %config.state_dir.display(),
        providers = ?config.providers,
        users = config.users.len(),
        request_timeout_secs = config.request_timeout_secs,
        "starting ai-mux"
    );

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder().context("failed to install metrics recorder")?;

    let cancel = CancellationToken::new();
    let service = Service::new(&config, Some(cancel.clone()))
        .await
        .context("failed to initialize providers")?;
    service.start().await;

    let proxy_state = service.proxy_state();
    let in_flight = proxy_state.metrics.in_flight.clone();
    reload_users_on_hangup(config_path, Arc::clone(&proxy_state.authenticator), cancel.clone());

    let app = build_router(
        AppState {
            proxy: proxy_state,
            prometheus,
        },
        config.max_connections,
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "accepting requests");

    // The drain timer starts at signal receipt: notify the server to stop
    // accepting, then race the drain against DRAIN_TIMEOUT.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    service.shutdown().await;
    cancel.cancel();

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: per-provider credential state, uptime, request counters.
/// Returns 200 when every provider has a usable token, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = &state.proxy.metrics;
    let uptime = metrics.started_at.elapsed().as_secs();
    let requests = metrics.requests_total.load(Ordering::Relaxed);
    let errors = metrics.errors_total.load(Ordering::Relaxed);

    let mut providers = BTreeMap::new();
    for provider in state.proxy.registry.providers() {
        let available = provider.is_available().await;
        providers.insert(
            provider.id().to_string(),
            if available { "available" } else { "unavailable" },
        );
    }
    let healthy = providers.values().all(|s| *s == "available");

    let status_code = if healthy {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "providers": providers,
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint: text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that proxies every other request.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Re-read the user table from the config file on SIGHUP.
///
/// Only `[[users]]` is applied; every other setting needs a restart.
#[cfg(unix)]
fn reload_users_on_hangup(path: PathBuf, authenticator: Arc<Authenticator>, cancel: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "SIGHUP handler unavailable, user reload disabled");
            return;
        }
    };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }
            match Config::load(&path) {
                Ok(config) => {
                    authenticator.update(&config.users).await;
                    info!(users = config.users.len(), "reloaded users");
                }
                Err(e) => warn!(error = %e, path = %path.display(), "config reload failed, keeping current users"),
            }
        }
    });
}

#[cfg(not(unix))]
fn reload_users_on_hangup(_path: PathBuf, _authenticator: Arc<Authenticator>, _cancel: CancellationToken) {}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
