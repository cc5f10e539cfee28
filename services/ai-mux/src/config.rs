//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The ChatGPT bootstrap refresh token is loaded from AIMUX_CHATGPT_REFRESH_TOKEN
//! or chatgpt_refresh_token_file, never stored in the config file directly.

use common::Secret;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Minimum length of a downstream user token.
pub const MIN_USER_TOKEN_LEN: usize = 16;

/// Env var holding the ChatGPT bootstrap refresh token.
const CHATGPT_REFRESH_TOKEN_ENV: &str = "AIMUX_CHATGPT_REFRESH_TOKEN";

/// Upstream APIs this proxy knows how to front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Claude,
    ChatGpt,
}

impl ProviderKind {
    pub fn id(&self) -> &'static str {
        match self {
            ProviderKind::Claude => "claude",
            ProviderKind::ChatGpt => "chatgpt",
        }
    }

    /// Routing prefix for this provider.
    pub fn prefix(&self) -> &'static str {
        match self {
            ProviderKind::Claude => "/claude",
            ProviderKind::ChatGpt => "/chatgpt",
        }
    }
}

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub log_level: Option<String>,
    /// Upstream response-header timeout
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,
    #[serde(default)]
    pub providers: Vec<ProviderKind>,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    /// Path to a file containing the ChatGPT bootstrap refresh token
    #[serde(default)]
    pub chatgpt_refresh_token_file: Option<PathBuf>,
    #[serde(skip)]
    pub chatgpt_refresh_token: Option<Secret<String>>,
    /// Upstream endpoint overrides; never read from the config file.
    #[serde(skip)]
    pub upstream: UpstreamOverrides,
}

/// Credential refresh timing
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_claude_window")]
    pub claude_window_secs: u64,
    #[serde(default = "default_chatgpt_window")]
    pub chatgpt_window_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            claude_window_secs: default_claude_window(),
            chatgpt_window_secs: default_chatgpt_window(),
        }
    }
}

/// Downstream client allowed to use the proxy
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub token: Secret<String>,
}

/// Base URL and token endpoint overrides, used to point providers at local
/// mock servers in tests. `None` means the built-in upstream.
#[derive(Debug, Clone, Default)]
pub struct UpstreamOverrides {
    pub claude_base_url: Option<String>,
    pub claude_token_endpoint: Option<String>,
    pub chatgpt_base_url: Option<String>,
    pub chatgpt_token_endpoint: Option<String>,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_state_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".aimux")
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_request_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_check_interval() -> u64 {
    60
}

fn default_claude_window() -> u64 {
    60
}

fn default_chatgpt_window() -> u64 {
    600
}

impl Config {
    /// Load configuration from a TOML (or `.json`) file, validate it, then
    /// overlay environment variables.
    ///
    /// ChatGPT bootstrap token resolution order:
    /// 1. AIMUX_CHATGPT_REFRESH_TOKEN env var
    /// 2. chatgpt_refresh_token_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents, is_json(path))?;
        config.validate()?;

        if let Some(token) = std::env::var(CHATGPT_REFRESH_TOKEN_ENV)
            .ok()
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty())
        {
            config.chatgpt_refresh_token = Some(Secret::new(token));
        } else if let Some(ref token_file) = config.chatgpt_refresh_token_file {
            let token = std::fs::read_to_string(token_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read chatgpt_refresh_token_file {}: {e}",
                    token_file.display()
                ))
            })?;
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.chatgpt_refresh_token = Some(Secret::new(token));
            }
        }

        Ok(config)
    }

    /// Decode without validation or env overlay.
    pub fn parse(contents: &str, json: bool) -> common::Result<Self> {
        if json {
            Ok(serde_json::from_str(contents)?)
        } else {
            Ok(toml::from_str(contents)?)
        }
    }

    /// Check the invariants the service relies on.
    pub fn validate(&self) -> common::Result<()> {
        let positive = [
            ("request_timeout_secs", self.request_timeout_secs),
            ("max_connections", self.max_connections as u64),
            ("max_request_body_bytes", self.max_request_body_bytes as u64),
            ("refresh.check_interval_secs", self.refresh.check_interval_secs),
            ("refresh.claude_window_secs", self.refresh.claude_window_secs),
            ("refresh.chatgpt_window_secs", self.refresh.chatgpt_window_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.state_dir.as_os_str().is_empty() {
            return Err(common::Error::Config("state_dir cannot be empty".into()));
        }

        if self.providers.is_empty() {
            return Err(common::Error::Config(
                "at least one provider must be enabled (claude, chatgpt)".into(),
            ));
        }
        let mut seen_providers = HashSet::new();
        for kind in &self.providers {
            if !seen_providers.insert(kind) {
                return Err(common::Error::Config(format!(
                    "provider {} listed more than once",
                    kind.id()
                )));
            }
        }

        let mut seen_tokens = HashSet::new();
        for user in &self.users {
            if user.name.trim().is_empty() {
                return Err(common::Error::Config("user name cannot be empty".into()));
            }
            if user.token.expose().len() < MIN_USER_TOKEN_LEN {
                return Err(common::Error::Config(format!(
                    "token for user {} must be at least {MIN_USER_TOKEN_LEN} characters",
                    user.name
                )));
            }
            if !seen_tokens.insert(user.token.expose().as_str()) {
                return Err(common::Error::Config(format!(
                    "token for user {} duplicates another user's token",
                    user.name
                )));
            }
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or AIMUX_CONFIG env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("AIMUX_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("ai-mux.toml")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.refresh.check_interval_secs)
    }

    /// Refresh-ahead window for `kind`.
    pub fn refresh_window(&self, kind: ProviderKind) -> Duration {
        Duration::from_secs(match kind {
            ProviderKind::Claude => self.refresh.claude_window_secs,
            ProviderKind::ChatGpt => self.refresh.chatgpt_window_secs,
        })
    }

    pub fn claude_credential_path(&self) -> PathBuf {
        self.state_dir.join("claude").join(".credentials.json")
    }

    pub fn chatgpt_credential_path(&self) -> PathBuf {
        self.state_dir.join("chatgpt").join("auth.json")
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn valid_toml() -> &'static str {
        r#"
listen_addr = "127.0.0.1:9090"
state_dir = "/var/lib/ai-mux"
providers = ["claude", "chatgpt"]

[refresh]
check_interval_secs = 30

[[users]]
name = "alice"
token = "alice-token-0123456789"

[[users]]
name = "bob"
token = "bob-token-0123456789"
"#
    }

    fn write_config(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_valid_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(CHATGPT_REFRESH_TOKEN_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "ai-mux.toml", valid_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9090".parse().unwrap());
        assert_eq!(config.providers, vec![ProviderKind::Claude, ProviderKind::ChatGpt]);
        assert_eq!(config.request_timeout_secs, 60);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.max_request_body_bytes, 10 * 1024 * 1024);
        assert_eq!(config.check_interval(), Duration::from_secs(30));
        assert_eq!(config.refresh_window(ProviderKind::Claude), Duration::from_secs(60));
        assert_eq!(config.refresh_window(ProviderKind::ChatGpt), Duration::from_secs(600));
        assert_eq!(config.users.len(), 2);
        assert_eq!(config.users[0].token.expose(), "alice-token-0123456789");
        assert!(config.chatgpt_refresh_token.is_none());
        assert_eq!(
            config.claude_credential_path(),
            PathBuf::from("/var/lib/ai-mux/claude/.credentials.json")
        );
        assert_eq!(
            config.chatgpt_credential_path(),
            PathBuf::from("/var/lib/ai-mux/chatgpt/auth.json")
        );
    }

    #[test]
    fn test_load_json_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(CHATGPT_REFRESH_TOKEN_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "ai-mux.json",
            r#"{"state_dir": "/tmp/mux", "providers": ["chatgpt"], "request_timeout_secs": 5}"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.providers, vec![ProviderKind::ChatGpt]);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert!(config.users.is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load(Path::new("/nonexistent/path/ai-mux.toml")).is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "bad.toml", "not valid {{{{ toml");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = Config::parse(r#"providers = ["gemini"]"#, false).unwrap_err();
        assert!(matches!(err, common::Error::Toml(_)), "got: {err}");
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            ("providers = []", "at least one provider"),
            (r#"providers = ["claude", "claude"]"#, "more than once"),
            ("providers = [\"claude\"]\nrequest_timeout_secs = 0", "request_timeout_secs"),
            ("providers = [\"claude\"]\nmax_connections = 0", "max_connections"),
            ("providers = [\"claude\"]\nmax_request_body_bytes = 0", "max_request_body_bytes"),
            ("providers = [\"claude\"]\n[refresh]\ncheck_interval_secs = 0", "check_interval_secs"),
            ("providers = [\"claude\"]\n[refresh]\nchatgpt_window_secs = 0", "chatgpt_window_secs"),
            (
                "providers = [\"claude\"]\n[[users]]\nname = \"a\"\ntoken = \"short\"",
                "at least 16 characters",
            ),
            (
                "providers = [\"claude\"]\n[[users]]\nname = \"\"\ntoken = \"0123456789abcdefgh\"",
                "name cannot be empty",
            ),
            (
                "providers = [\"claude\"]\n[[users]]\nname = \"a\"\ntoken = \"0123456789abcdefgh\"\n[[users]]\nname = \"b\"\ntoken = \"0123456789abcdefgh\"",
                "duplicates",
            ),
        ];
        for (toml, expected) in cases {
            let config = Config::parse(toml, false).unwrap();
            let err = config.validate().unwrap_err().to_string();
            assert!(err.contains(expected), "config {toml:?}: expected {expected:?}, got {err}");
        }
    }

    #[test]
    fn test_user_token_is_redacted_in_debug() {
        let config = Config::parse(valid_toml(), false).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("alice-token"), "got: {debug}");
    }

    #[test]
    fn test_chatgpt_token_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "ai-mux.toml", valid_toml());

        unsafe { set_env(CHATGPT_REFRESH_TOKEN_ENV, "rt-from-env") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env(CHATGPT_REFRESH_TOKEN_ENV) };
        assert_eq!(
            config.chatgpt_refresh_token.as_ref().unwrap().expose(),
            "rt-from-env"
        );
    }

    #[test]
    fn test_chatgpt_token_from_file_and_env_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let token_path = write_config(&dir, "chatgpt_rt", "rt-from-file\n");
        let contents = format!(
            "providers = [\"chatgpt\"]\nchatgpt_refresh_token_file = \"{}\"\n",
            token_path.display()
        );
        let path = write_config(&dir, "ai-mux.toml", &contents);

        unsafe { remove_env(CHATGPT_REFRESH_TOKEN_ENV) };
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.chatgpt_refresh_token.as_ref().unwrap().expose(),
            "rt-from-file"
        );

        unsafe { set_env(CHATGPT_REFRESH_TOKEN_ENV, "rt-env-wins") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env(CHATGPT_REFRESH_TOKEN_ENV) };
        assert_eq!(
            config.chatgpt_refresh_token.as_ref().unwrap().expose(),
            "rt-env-wins",
            "env var must take precedence over chatgpt_refresh_token_file"
        );
    }

    #[test]
    fn test_empty_token_file_yields_none() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let token_path = write_config(&dir, "chatgpt_rt", "  \n  ");
        let contents = format!(
            "providers = [\"chatgpt\"]\nchatgpt_refresh_token_file = \"{}\"\n",
            token_path.display()
        );
        let path = write_config(&dir, "ai-mux.toml", &contents);

        unsafe { remove_env(CHATGPT_REFRESH_TOKEN_ENV) };
        let config = Config::load(&path).unwrap();
        assert!(config.chatgpt_refresh_token.is_none());
    }

    #[test]
    fn test_missing_token_file_is_an_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "ai-mux.toml",
            "providers = [\"chatgpt\"]\nchatgpt_refresh_token_file = \"/nonexistent/rt\"\n",
        );
        unsafe { remove_env(CHATGPT_REFRESH_TOKEN_ENV) };
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_resolve_path_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("AIMUX_CONFIG") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("ai-mux.toml"));

        unsafe { set_env("AIMUX_CONFIG", "/env/path.toml") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("/env/path.toml"));
        assert_eq!(
            Config::resolve_path(Some("/cli/wins.toml")),
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over AIMUX_CONFIG env var"
        );
        unsafe { remove_env("AIMUX_CONFIG") };
    }
}
