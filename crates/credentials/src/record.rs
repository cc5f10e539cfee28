//! Normalized in-memory credential record
//!
//! Each provider's on-disk schema converts into [`TokenCredentials`]. The
//! provider-specific parts travel in [`Metadata`], a closed sum type over the
//! known shapes, so header construction is a pattern match rather than a
//! runtime downcast.

use std::fmt;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{Error, Result};

/// Header carrying the ChatGPT workspace/account identifier.
pub const CHATGPT_ACCOUNT_HEADER: &str = "chatgpt-account-id";

/// OAuth credentials for one provider.
///
/// An empty `access_token` means "unset". `expires_at == None` means the
/// token has no known expiry and is treated as perpetually valid.
#[derive(Clone, Default, PartialEq)]
pub struct TokenCredentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

impl fmt::Debug for TokenCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCredentials")
            .field("access_token", &common::mask_token(&self.access_token))
            .field("refresh_token", &common::mask_token(&self.refresh_token))
            .field("expires_at", &self.expires_at)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Provider-specific credential metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Metadata {
    #[default]
    None,
    Claude(ClaudeMetadata),
    ChatGpt(ChatGptMetadata),
}

/// Subscription details stored alongside Claude tokens.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaudeMetadata {
    pub scopes: Vec<String>,
    pub subscription_type: Option<String>,
    pub is_max: bool,
    pub rate_limit_tier: Option<String>,
}

/// Identity details stored alongside ChatGPT tokens.
#[derive(Clone, Default, PartialEq)]
pub struct ChatGptMetadata {
    pub id_token: Option<String>,
    pub account_id: Option<String>,
    pub api_key: Option<String>,
}

impl fmt::Debug for ChatGptMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatGptMetadata")
            .field("id_token", &self.id_token.as_deref().map(common::mask_token))
            .field("account_id", &self.account_id.as_deref().map(common::mask_token))
            .field("api_key", &self.api_key.as_deref().map(common::mask_token))
            .finish()
    }
}

impl Metadata {
    /// Extra upstream headers derived from this metadata.
    ///
    /// Claude needs none. ChatGPT sends the account identifier when known.
    pub fn extra_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        match self {
            Metadata::None | Metadata::Claude(_) => {}
            Metadata::ChatGpt(meta) => {
                if let Some(account_id) = meta.account_id.as_deref().filter(|a| !a.is_empty()) {
                    let value = HeaderValue::from_str(account_id).map_err(|e| {
                        Error::InvalidHeader(format!("{CHATGPT_ACCOUNT_HEADER}: {e}"))
                    })?;
                    headers.insert(HeaderName::from_static(CHATGPT_ACCOUNT_HEADER), value);
                }
            }
        }
        Ok(headers)
    }

    /// Fill fields this record lacks from `previous`.
    ///
    /// Token endpoints often omit identity details on refresh; without this
    /// the account header would disappear after the first refresh.
    pub fn inherit_missing(&mut self, previous: &Metadata) {
        if matches!(self, Metadata::None) {
            *self = previous.clone();
            return;
        }
        match (self, previous) {
            (Metadata::Claude(cur), Metadata::Claude(prev)) => {
                if cur.scopes.is_empty() {
                    cur.scopes = prev.scopes.clone();
                }
                if cur.subscription_type.is_none() {
                    cur.subscription_type = prev.subscription_type.clone();
                }
                if cur.rate_limit_tier.is_none() {
                    cur.rate_limit_tier = prev.rate_limit_tier.clone();
                }
                cur.is_max |= prev.is_max;
            }
            (Metadata::ChatGpt(cur), Metadata::ChatGpt(prev)) => {
                if cur.id_token.is_none() {
                    cur.id_token = prev.id_token.clone();
                }
                if cur.account_id.is_none() {
                    cur.account_id = prev.account_id.clone();
                }
                if cur.api_key.is_none() {
                    cur.api_key = prev.api_key.clone();
                }
            }
            _ => {}
        }
    }
}

/// Treat empty strings from credential files and token responses as absent.
pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
