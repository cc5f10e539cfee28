//! ChatGPT credential file and token refresh
//!
//! Same `auth.json` layout the Codex CLI uses: an optional API key, a flat
//! `tokens` object, and a `last_refresh` timestamp. We additionally write an
//! explicit `expires_at` so the expiry reported by the token endpoint survives
//! a restart. `"expires_at": null` records an unknown expiry; files without
//! the key at all fall back to `last_refresh` plus the default token lifetime.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::{CHATGPT_CLIENT_ID, CHATGPT_DEFAULT_TOKEN_LIFETIME, CHATGPT_SCOPE};
use crate::error::{Error, Result};
use crate::record::{ChatGptMetadata, Metadata, TokenCredentials, non_empty};
use crate::store::{BoxFuture, CredentialStore, TokenRefresher, read_secure, write_atomic};
use crate::token::{exchange, resolve_expiry};

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChatGptAuthFile {
    #[serde(rename = "OPENAI_API_KEY", default)]
    api_key: Option<String>,
    #[serde(default)]
    tokens: ChatGptTokensFile,
    #[serde(default)]
    last_refresh: Option<DateTime<Utc>>,
    /// Outer `None`: key absent. `Some(None)`: written as null.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    expires_at: Option<Option<DateTime<Utc>>>,
}

fn present<'de, D>(de: D) -> std::result::Result<Option<Option<DateTime<Utc>>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<DateTime<Utc>>::deserialize(de).map(Some)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChatGptTokensFile {
    #[serde(default)]
    access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    account_id: Option<String>,
}

impl From<ChatGptAuthFile> for TokenCredentials {
    fn from(file: ChatGptAuthFile) -> Self {
        let expires_at = match file.expires_at {
            Some(written) => written,
            None => TimeDelta::from_std(CHATGPT_DEFAULT_TOKEN_LIFETIME)
                .ok()
                .and_then(|lifetime| file.last_refresh?.checked_add_signed(lifetime)),
        };
        TokenCredentials {
            access_token: file.tokens.access_token,
            refresh_token: file.tokens.refresh_token,
            expires_at,
            metadata: Metadata::ChatGpt(ChatGptMetadata {
                id_token: non_empty(file.tokens.id_token),
                account_id: non_empty(file.tokens.account_id),
                api_key: non_empty(file.api_key),
            }),
        }
    }
}

/// Store for the Codex-style `auth.json`.
///
/// A missing file loads as an empty record so the first refresh can create
/// it; see [`ChatGptStore::bootstrap`] for seeding the refresh token.
pub struct ChatGptStore {
    path: PathBuf,
}

impl ChatGptStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Seed the credential file from an externally supplied refresh token.
    ///
    /// Does nothing when the file already exists. Without a file and without
    /// `initial_refresh_token` there is no way to ever obtain an access
    /// token, so that case is an error.
    pub async fn bootstrap(&self, initial_refresh_token: Option<&str>) -> Result<()> {
        match tokio::fs::try_exists(&self.path).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => return Err(Error::Io(format!("stat {}: {e}", self.path.display()))),
        }

        let Some(refresh_token) = initial_refresh_token.filter(|t| !t.is_empty()) else {
            return Err(Error::MissingRefreshToken(format!(
                "{} does not exist and no initial ChatGPT refresh token was configured",
                self.path.display()
            )));
        };

        let seed = TokenCredentials {
            refresh_token: refresh_token.to_string(),
            metadata: Metadata::ChatGpt(ChatGptMetadata::default()),
            ..Default::default()
        };
        self.save_file(&seed).await?;
        info!(path = %self.path.display(), "seeded chatgpt credential file from refresh token");
        Ok(())
    }

    async fn load_file(&self) -> Result<TokenCredentials> {
        let bytes = match read_secure(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                debug!(path = %self.path.display(), "no chatgpt credential file yet");
                return Ok(TokenCredentials {
                    metadata: Metadata::ChatGpt(ChatGptMetadata::default()),
                    ..Default::default()
                });
            }
            Err(e) => return Err(e),
        };

        let file: ChatGptAuthFile = serde_json::from_slice(&bytes).map_err(|e| {
            Error::CredentialParse(format!("parsing {}: {e}", self.path.display()))
        })?;
        if file.tokens.refresh_token.is_empty() {
            return Err(Error::MissingRefreshToken(format!(
                "{} has no tokens.refresh_token",
                self.path.display()
            )));
        }
        debug!(path = %self.path.display(), "loaded chatgpt credentials");
        Ok(file.into())
    }

    async fn save_file(&self, creds: &TokenCredentials) -> Result<()> {
        let mut file = ChatGptAuthFile {
            api_key: None,
            tokens: ChatGptTokensFile {
                access_token: creds.access_token.clone(),
                refresh_token: creds.refresh_token.clone(),
                ..Default::default()
            },
            last_refresh: Some(Utc::now()),
            expires_at: Some(creds.expires_at),
        };
        if let Metadata::ChatGpt(meta) = &creds.metadata {
            file.api_key = meta.api_key.clone();
            file.tokens.id_token = meta.id_token.clone();
            file.tokens.account_id = meta.account_id.clone();
        }

        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;
        write_atomic(&self.path, &json).await
    }
}

impl CredentialStore for ChatGptStore {
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

#[derive(Debug, Deserialize)]
struct ChatGptTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<f64>,
    /// Epoch seconds
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    account_id: Option<String>,
}

/// Refresh-token exchange against the OpenAI auth endpoint.
pub struct ChatGptRefresher {
    client: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    scope: String,
}

impl ChatGptRefresher {
    pub fn with_endpoint(client: reqwest::Client, token_endpoint: impl Into<String>) -> Self {
        Self {
            client,
            token_endpoint: token_endpoint.into(),
            client_id: CHATGPT_CLIENT_ID.to_string(),
            scope: CHATGPT_SCOPE.to_string(),
        }
    }

    async fn exchange(&self, refresh_token: &str) -> Result<TokenCredentials> {
        if refresh_token.is_empty() {
            return Err(Error::MissingRefreshToken("chatgpt".into()));
        }

        let body = serde_json::json!({
            "client_id": self.client_id,
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "scope": self.scope,
        });
        let response: ChatGptTokenResponse =
            exchange(&self.client, &self.token_endpoint, &body).await?;

        if response.access_token.is_empty() {
            return Err(Error::TokenExchange(
                "refresh response missing access_token".into(),
            ));
        }

        let expires_at = response
            .expires_at
            .filter(|secs| *secs > 0)
            .and_then(|secs| DateTime::from_timestamp(secs, 0));

        Ok(TokenCredentials {
            access_token: response.access_token,
            refresh_token: non_empty(response.refresh_token)
                .unwrap_or_else(|| refresh_token.to_string()),
            expires_at: resolve_expiry(
                Utc::now(),
                expires_at,
                response.expires_in,
                Some(CHATGPT_DEFAULT_TOKEN_LIFETIME),
            ),
            metadata: Metadata::ChatGpt(ChatGptMetadata {
                id_token: non_empty(response.id_token),
                account_id: non_empty(response.account_id),
                api_key: None,
            }),
        })
    }
}

impl TokenRefresher for ChatGptRefresher {
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<TokenCredentials>> {
        Box::pin(self.exchange(refresh_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    fn sample() -> TokenCredentials {
        TokenCredentials {
            access_token: "eyJ-access".into(),
            refresh_token: "rt_chatgpt".into(),
            expires_at: DateTime::from_timestamp(1_900_000_000, 0),
            metadata: Metadata::ChatGpt(ChatGptMetadata {
                id_token: Some("eyJ-id".into()),
                account_id: Some("acct-42".into()),
                api_key: None,
            }),
        }
    }

    /// Token endpoint that records request bodies and answers with `status`/`body`.
    async fn token_server(
        status: StatusCode,
        body: &'static str,
    ) -> (String, Arc<Mutex<Vec<serde_json::Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new().fallback(move |req_body: axum::body::Bytes| {
                let seen = seen_clone.clone();
                async move {
                    if let Ok(v) = serde_json::from_slice(&req_body) {
                        seen.lock().unwrap().push(v);
                    }
                    (
                        status,
                        [(axum::http::header::CONTENT_TYPE, "application/json")],
                        body,
                    )
                }
            });
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/oauth/token"), seen)
    }

    #[tokio::test]
    async fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatGptStore::new(dir.path().join("chatgpt").join("auth.json"));
        store.save(&sample()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), sample());
    }

    #[tokio::test]
    async fn roundtrip_record_variants() {
        let meta = |id: Option<&str>, acct: Option<&str>, key: Option<&str>| {
            Metadata::ChatGpt(ChatGptMetadata {
                id_token: id.map(str::to_string),
                account_id: acct.map(str::to_string),
                api_key: key.map(str::to_string),
            })
        };
        let cases = [
            ("no expiry", None, meta(Some("eyJ-id"), Some("acct-42"), None)),
            ("sub-millisecond expiry", Some(Utc::now()), meta(None, None, None)),
            (
                "nanosecond expiry",
                DateTime::from_timestamp(1_900_000_000, 123_456_789),
                meta(None, Some("acct-1"), Some("sk-key")),
            ),
            ("api key only", None, meta(None, None, Some("sk-key"))),
            ("id token only", Some(Utc::now()), meta(Some("eyJ-id"), None, None)),
        ];

        let dir = tempfile::tempdir().unwrap();
        for (name, expires_at, metadata) in cases {
            let store = ChatGptStore::new(dir.path().join(name).join("auth.json"));
            let creds = TokenCredentials {
                expires_at,
                metadata,
                ..sample()
            };
            store.save(&creds).await.unwrap();
            assert_eq!(store.load().await.unwrap(), creds, "case: {name}");
        }
    }

    #[tokio::test]
    async fn seed_roundtrips_without_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatGptStore::new(dir.path().join("auth.json"));
        store.bootstrap(Some("rt_seed")).await.unwrap();
        assert!(store.load().await.unwrap().expires_at.is_none());
    }

    #[tokio::test]
    async fn null_expiry_does_not_fall_back_to_last_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        write_atomic(
            &path,
            br#"{"tokens":{"access_token":"at","refresh_token":"rt"},"last_refresh":"2025-01-01T00:00:00Z","expires_at":null}"#,
        )
        .await
        .unwrap();
        assert!(ChatGptStore::new(&path).load().await.unwrap().expires_at.is_none());
    }

    #[tokio::test]
    async fn missing_file_loads_empty_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatGptStore::new(dir.path().join("auth.json"));
        let creds = store.load().await.unwrap();
        assert!(creds.access_token.is_empty());
        assert!(creds.refresh_token.is_empty());
        assert!(matches!(creds.metadata, Metadata::ChatGpt(_)));
    }

    #[tokio::test]
    async fn expiry_falls_back_to_last_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        write_atomic(
            &path,
            br#"{"OPENAI_API_KEY":null,"tokens":{"access_token":"at","refresh_token":"rt","account_id":"acct"},"last_refresh":"2025-01-01T00:00:00Z"}"#,
        )
        .await
        .unwrap();

        let creds = ChatGptStore::new(&path).load().await.unwrap();
        let expected = DateTime::parse_from_rfc3339("2025-01-09T00:00:00Z").unwrap();
        assert_eq!(creds.expires_at.unwrap(), expected);
        assert_eq!(creds.metadata.extra_headers().unwrap()["chatgpt-account-id"], "acct");
    }

    #[tokio::test]
    async fn rejects_file_without_refresh_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        write_atomic(&path, br#"{"tokens":{"access_token":"at"}}"#).await.unwrap();
        let err = ChatGptStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, Error::MissingRefreshToken(_)), "got: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rejects_group_readable_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        let store = ChatGptStore::new(&path);
        store.save(&sample()).await.unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).unwrap();
        let err = store.load().await.unwrap_err();
        assert!(matches!(err, Error::InsecurePermissions(_)), "got: {err}");
    }

    #[tokio::test]
    async fn bootstrap_seeds_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatGptStore::new(dir.path().join("chatgpt").join("auth.json"));
        store.bootstrap(Some("rt_seed")).await.unwrap();

        let creds = store.load().await.unwrap();
        assert_eq!(creds.refresh_token, "rt_seed");
        assert!(creds.access_token.is_empty());
    }

    #[tokio::test]
    async fn bootstrap_leaves_existing_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatGptStore::new(dir.path().join("auth.json"));
        store.save(&sample()).await.unwrap();
        store.bootstrap(Some("rt_other")).await.unwrap();
        assert_eq!(store.load().await.unwrap().refresh_token, "rt_chatgpt");
    }

    #[tokio::test]
    async fn bootstrap_without_file_or_token_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatGptStore::new(dir.path().join("auth.json"));
        let err = store.bootstrap(None).await.unwrap_err();
        assert!(matches!(err, Error::MissingRefreshToken(_)), "got: {err}");
        let err = store.bootstrap(Some("")).await.unwrap_err();
        assert!(matches!(err, Error::MissingRefreshToken(_)), "got: {err}");
    }

    #[tokio::test]
    async fn refresh_sends_scope_and_reads_identity() {
        let (endpoint, seen) = token_server(
            StatusCode::OK,
            r#"{"access_token":"at_new","id_token":"id_new","refresh_token":"rt_new","expires_in":7200.5,"account_id":"acct-9"}"#,
        )
        .await;
        let refresher = ChatGptRefresher::with_endpoint(reqwest::Client::new(), endpoint);

        let before = Utc::now();
        let creds = refresher.refresh("rt_old").await.unwrap();
        assert_eq!(creds.access_token, "at_new");
        assert_eq!(creds.refresh_token, "rt_new");
        assert!(creds.expires_at.unwrap() >= before + TimeDelta::seconds(7200));
        assert_eq!(creds.metadata.extra_headers().unwrap()["chatgpt-account-id"], "acct-9");

        let bodies = seen.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["grant_type"], "refresh_token");
        assert_eq!(bodies[0]["refresh_token"], "rt_old");
        assert_eq!(bodies[0]["client_id"], CHATGPT_CLIENT_ID);
        assert_eq!(bodies[0]["scope"], CHATGPT_SCOPE);
    }

    #[tokio::test]
    async fn refresh_prefers_expires_at_seconds() {
        let (endpoint, _) = token_server(
            StatusCode::OK,
            r#"{"access_token":"at_new","expires_in":60,"expires_at":1900000000}"#,
        )
        .await;
        let refresher = ChatGptRefresher::with_endpoint(reqwest::Client::new(), endpoint);
        let creds = refresher.refresh("rt_old").await.unwrap();
        assert_eq!(creds.expires_at.unwrap().timestamp(), 1_900_000_000);
        assert_eq!(creds.refresh_token, "rt_old");
    }

    #[tokio::test]
    async fn refresh_defaults_to_eight_days() {
        let (endpoint, _) = token_server(StatusCode::OK, r#"{"access_token":"at_new"}"#).await;
        let refresher = ChatGptRefresher::with_endpoint(reqwest::Client::new(), endpoint);

        let before = Utc::now();
        let creds = refresher.refresh("rt").await.unwrap();
        let expires = creds.expires_at.unwrap();
        assert!(expires >= before + TimeDelta::days(8));
        assert!(expires <= Utc::now() + TimeDelta::days(8));
    }

    #[tokio::test]
    async fn refresh_fails_on_bad_status_or_body() {
        let (endpoint, _) = token_server(StatusCode::BAD_GATEWAY, "upstream down").await;
        let refresher = ChatGptRefresher::with_endpoint(reqwest::Client::new(), endpoint);
        assert!(matches!(
            refresher.refresh("rt").await.unwrap_err(),
            Error::TokenExchange(_)
        ));

        let (endpoint, _) = token_server(StatusCode::OK, "not json").await;
        let refresher = ChatGptRefresher::with_endpoint(reqwest::Client::new(), endpoint);
        assert!(matches!(
            refresher.refresh("rt").await.unwrap_err(),
            Error::TokenExchange(_)
        ));

        let (endpoint, _) = token_server(StatusCode::OK, r#"{"id_token":"x"}"#).await;
        let refresher = ChatGptRefresher::with_endpoint(reqwest::Client::new(), endpoint);
        assert!(matches!(
            refresher.refresh("rt").await.unwrap_err(),
            Error::TokenExchange(_)
        ));
    }
}
