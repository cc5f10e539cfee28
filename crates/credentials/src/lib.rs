//! OAuth credential records, persistence, and refresh-token exchange
//!
//! Two upstream subscriptions are supported, each with its own on-disk
//! schema and token endpoint contract. Both normalize into the same
//! [`TokenCredentials`] record so the credential manager can treat them
//! uniformly:
//!
//! - Claude: `claude/.credentials.json` with a nested `claudeAiOauth` object,
//!   refreshed against the Anthropic console token endpoint.
//! - ChatGPT: `chatgpt/auth.json` with a flat `tokens` object plus a
//!   `last_refresh` timestamp, refreshed against the OpenAI auth endpoint.
//!
//! Credential files must be owner read/write only; loading a file with
//! broader permissions fails.

pub mod chatgpt;
pub mod claude;
pub mod constants;
pub mod error;
pub mod record;
pub mod store;
mod token;

pub use chatgpt::{ChatGptRefresher, ChatGptStore};
pub use claude::{ClaudeRefresher, ClaudeStore};
pub use error::{Error, Result};
pub use record::{ChatGptMetadata, ClaudeMetadata, Metadata, TokenCredentials};
pub use store::{BoxFuture, CredentialStore, TokenRefresher};
