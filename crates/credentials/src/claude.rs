//! Claude credential file and token refresh
//!
//! The Claude CLI keeps its OAuth state in `.credentials.json` under a nested
//! `claudeAiOauth` object with camelCase keys and an `expiresAt` in epoch
//! milliseconds. Other top-level keys in the file belong to the CLI and are
//! preserved on save.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::CLAUDE_CLIENT_ID;
use crate::error::{Error, Result};
use crate::record::{ClaudeMetadata, Metadata, TokenCredentials, non_empty};
use crate::store::{BoxFuture, CredentialStore, TokenRefresher, read_secure, write_atomic};
use crate::token::{exchange, resolve_expiry};

/// Top-level key holding the OAuth object.
const OAUTH_KEY: &str = "claudeAiOauth";

/// Persisted shape of the `claudeAiOauth` object.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaudeOauthFile {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    /// Epoch milliseconds; 0 means no expiry recorded
    #[serde(default)]
    expires_at: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subscription_type: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    is_max: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rate_limit_tier: Option<String>,
}

impl From<ClaudeOauthFile> for TokenCredentials {
    fn from(file: ClaudeOauthFile) -> Self {
        TokenCredentials {
            access_token: file.access_token,
            refresh_token: file.refresh_token,
            expires_at: (file.expires_at > 0)
                .then(|| DateTime::from_timestamp_millis(file.expires_at))
                .flatten(),
            metadata: Metadata::Claude(ClaudeMetadata {
                scopes: file.scopes,
                subscription_type: non_empty(file.subscription_type),
                is_max: file.is_max,
                rate_limit_tier: non_empty(file.rate_limit_tier),
            }),
        }
    }
}

impl From<&TokenCredentials> for ClaudeOauthFile {
    fn from(creds: &TokenCredentials) -> Self {
        let mut file = ClaudeOauthFile {
            access_token: creds.access_token.clone(),
            refresh_token: creds.refresh_token.clone(),
            expires_at: creds.expires_at.map(|t| t.timestamp_millis()).unwrap_or(0),
            ..Default::default()
        };
        if let Metadata::Claude(meta) = &creds.metadata {
            file.scopes = meta.scopes.clone();
            file.subscription_type = meta.subscription_type.clone();
            file.is_max = meta.is_max;
            file.rate_limit_tier = meta.rate_limit_tier.clone();
        }
        file
    }
}

/// Store for the Claude CLI credential file.
///
/// A missing file is fatal: Claude has no bootstrap-by-refresh-token path.
pub struct ClaudeStore {
    path: PathBuf,
}

impl ClaudeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load_file(&self) -> Result<TokenCredentials> {
        let bytes = read_secure(&self.path).await?;
        let mut document: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(&bytes).map_err(|e| {
                Error::CredentialParse(format!("parsing {}: {e}", self.path.display()))
            })?;
        let oauth = document.remove(OAUTH_KEY).ok_or_else(|| {
            Error::CredentialParse(format!(
                "{OAUTH_KEY} field not found in {}",
                self.path.display()
            ))
        })?;
        let file: ClaudeOauthFile = serde_json::from_value(oauth).map_err(|e| {
            Error::CredentialParse(format!("parsing {OAUTH_KEY} in {}: {e}", self.path.display()))
        })?;
        if file.refresh_token.is_empty() {
            return Err(Error::MissingRefreshToken(format!(
                "{} has no {OAUTH_KEY}.refreshToken",
                self.path.display()
            )));
        }
        debug!(path = %self.path.display(), "loaded claude credentials");
        Ok(file.into())
    }

    async fn save_file(&self, creds: &TokenCredentials) -> Result<()> {
        // Keep whatever else the CLI stores next to the OAuth object.
        let mut document = match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                match serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(&bytes) {
                    Ok(document) => document,
                    Err(e) => {
                        warn!(path = %self.path.display(), error = %e, "existing credential file is not a JSON object, other keys will be lost");
                        serde_json::Map::new()
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => serde_json::Map::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "could not read existing credential file, other keys will be lost");
                serde_json::Map::new()
            }
        };
        let oauth = serde_json::to_value(ClaudeOauthFile::from(creds))
            .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;
        document.insert(OAUTH_KEY.to_string(), oauth);

        let json = serde_json::to_vec_pretty(&document)
            .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;
        write_atomic(&self.path, &json).await
    }
}

impl CredentialStore for ClaudeStore {
    fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> BoxFuture<'_, Result<TokenCredentials>> {
        Box::pin(self.load_file())
    }

    fn save<'a>(&'a self, creds: &'a TokenCredentials) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.save_file(creds))
    }
}

/// Token endpoint response for a Claude refresh.
#[derive(Debug, Deserialize)]
struct ClaudeTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<f64>,
    /// Epoch milliseconds
    #[serde(default)]
    expires_at: Option<i64>,
    /// Space-separated scope list
    #[serde(default)]
    scope: Option<String>,
}

/// Refresh-token exchange against the Anthropic console.
pub struct ClaudeRefresher {
    client: reqwest::Client,
    token_endpoint: String,
    client_id: String,
}

impl ClaudeRefresher {
    /// Point the refresher at a different token endpoint (mock servers in tests).
    pub fn with_endpoint(client: reqwest::Client, token_endpoint: impl Into<String>) -> Self {
        Self {
            client,
            token_endpoint: token_endpoint.into(),
            client_id: CLAUDE_CLIENT_ID.to_string(),
        }
    }

    async fn exchange(&self, refresh_token: &str) -> Result<TokenCredentials> {
        if refresh_token.is_empty() {
            return Err(Error::MissingRefreshToken("claude".into()));
        }

        let body = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": self.client_id,
        });
        let response: ClaudeTokenResponse =
            exchange(&self.client, &self.token_endpoint, &body).await?;

        if response.access_token.is_empty() {
            return Err(Error::TokenExchange(
                "refresh response missing access_token".into(),
            ));
        }

        let expires_at = response
            .expires_at
            .filter(|ms| *ms > 0)
            .and_then(DateTime::from_timestamp_millis);

        Ok(TokenCredentials {
            access_token: response.access_token,
            refresh_token: non_empty(response.refresh_token)
                .unwrap_or_else(|| refresh_token.to_string()),
            // The file keeps milliseconds, so memory must too.
            expires_at: resolve_expiry(Utc::now(), expires_at, response.expires_in, None)
                .map(|t| t.trunc_subsecs(3)),
            metadata: Metadata::Claude(ClaudeMetadata {
                scopes: response
                    .scope
                    .map(|s| s.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
                ..Default::default()
            }),
        })
    }
}

impl TokenRefresher for ClaudeRefresher {
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<TokenCredentials>> {
        Box::pin(self.exchange(refresh_token))
    }
}
