//! Downstream caller authentication
//!
//! Token to user-name lookup behind a shared lock so the table can be swapped
//! without restarting. The access policy lives in [`Authenticator::authorize`].

use std::collections::HashMap;

use axum::http::HeaderValue;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::UserConfig;

/// Who a request is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// No users are configured; everyone is let in.
    Open,
    /// Users are configured but the request presented no credential.
    Anonymous,
    User(String),
}

impl Caller {
    /// Name for the access log.
    pub fn name(&self) -> &str {
        match self {
            Caller::Open | Caller::Anonymous => "anonymous",
            Caller::User(name) => name,
        }
    }
}

/// Why a request was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("authorization header is not a bearer token")]
    Malformed,
    #[error("unknown bearer token")]
    UnknownToken,
}

/// Lock-protected token to user-name table.
#[derive(Default)]
pub struct Authenticator {
    users: RwLock<HashMap<String, String>>,
}

impl Authenticator {
    pub fn new(users: &[UserConfig]) -> Self {
        Self {
            users: RwLock::new(table(users)),
        }
    }

    /// Atomically replace the table.
    pub async fn update(&self, users: &[UserConfig]) {
        let next = table(users);
        debug!(users = next.len(), "authenticator table replaced");
        *self.users.write().await = next;
    }

    pub async fn has_users(&self) -> bool {
        !self.users.read().await.is_empty()
    }

    /// User name for `token`, if any.
    pub async fn authenticate(&self, token: &str) -> Option<String> {
        self.users.read().await.get(token).cloned()
    }

    /// Apply the access policy to a request's `Authorization` header.
    ///
    /// - no users configured: accept, unattributed
    /// - users configured, no header: accept as anonymous
    /// - header present: must be `Bearer <token>` for a known token
    pub async fn authorize(&self, header: Option<&HeaderValue>) -> Result<Caller, AuthError> {
        if !self.has_users().await {
            return Ok(Caller::Open);
        }
        let Some(header) = header else {
            return Ok(Caller::Anonymous);
        };
        let token = header
            .to_str()
            .ok()
            .and_then(bearer_token)
            .ok_or(AuthError::Malformed)?;
        self.authenticate(token)
            .await
            .map(Caller::User)
            .ok_or(AuthError::UnknownToken)
    }
}

fn table(users: &[UserConfig]) -> HashMap<String, String> {
    users
        .iter()
        .map(|u| (u.token.expose().clone(), u.name.clone()))
        .collect()
}

/// Extract the token from a `Bearer <token>` header value.
fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
