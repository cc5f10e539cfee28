//! Upstream OAuth and API constants
//!
//! Public client configuration matching the vendor CLIs. These values are not
//! secrets; they identify public client applications. The actual secrets
//! (access/refresh tokens) live in the credential files.

use std::time::Duration;

/// Anthropic inference API base URL
pub const CLAUDE_BASE_URL: &str = "https://api.anthropic.com";

/// Anthropic console token endpoint used for refresh-token exchange
pub const CLAUDE_TOKEN_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/token";

/// Anthropic's public OAuth client ID (same as Claude CLI)
pub const CLAUDE_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Beta flag required for OAuth bearer tokens on the Anthropic API
pub const CLAUDE_OAUTH_BETA: &str = "oauth-2025-04-20";

/// ChatGPT backend base URL (Codex responses API)
pub const CHATGPT_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";

/// OpenAI auth token endpoint
pub const CHATGPT_TOKEN_ENDPOINT: &str = "https://auth.openai.com/oauth/token";

/// OpenAI's public OAuth client ID (same as Codex CLI)
pub const CHATGPT_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

/// Scopes requested on every ChatGPT refresh
pub const CHATGPT_SCOPE: &str = "openid profile email";

/// Lifetime assumed for ChatGPT access tokens when neither the token
/// response nor the credential file carries an expiry.
pub const CHATGPT_DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(8 * 24 * 60 * 60);

/// Upper bound on a token endpoint response body
pub const MAX_TOKEN_RESPONSE_BYTES: usize = 1 << 20;

/// Permission bits for credential files
pub const CREDENTIAL_FILE_MODE: u32 = 0o600;

/// Permission bits for directories created to hold credential files
pub const CREDENTIAL_DIR_MODE: u32 = 0o700;
