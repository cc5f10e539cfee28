//! Shared refresh-token exchange plumbing
//!
//! Both providers POST a JSON body to their token endpoint and get a JSON
//! token response back. Only the request fields and the expiry conventions
//! differ, so the HTTP handling lives here.

use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;

use crate::constants::MAX_TOKEN_RESPONSE_BYTES;
use crate::error::{Error, Result};

/// POST `body` to `endpoint` and decode the token response.
///
/// Non-200 responses are hard failures; 401/403 are reported as
/// `InvalidCredentials` because they mean the refresh token was revoked.
pub(crate) async fn exchange<T: DeserializeOwned>(
    client: &reqwest::Client,
    endpoint: &str,
    body: &serde_json::Value,
) -> Result<T> {
    let response = client
        .post(endpoint)
        .header(reqwest::header::ACCEPT, "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    let bytes = read_capped(response).await?;

    if status != reqwest::StatusCode::OK {
        let text = String::from_utf8_lossy(&bytes);
        let text = text.trim();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::InvalidCredentials(format!(
                "token endpoint returned {status}: {text}"
            )));
        }
        return Err(Error::TokenExchange(format!(
            "token endpoint returned {status}: {text}"
        )));
    }

    serde_json::from_slice(&bytes)
        .map_err(|e| Error::TokenExchange(format!("invalid token response: {e}")))
}

/// Read a response body, refusing anything larger than the token response cap.
async fn read_capped(mut response: reqwest::Response) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| Error::Http(format!("reading token response: {e}")))?
    {
        if buf.len() + chunk.len() > MAX_TOKEN_RESPONSE_BYTES {
            return Err(Error::TokenExchange(format!(
                "token response exceeds {MAX_TOKEN_RESPONSE_BYTES} bytes"
            )));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

/// Longest relative lifetime we accept from a token endpoint.
const MAX_EXPIRES_IN: TimeDelta = TimeDelta::days(365);

/// Pick the expiry from an absolute timestamp, then a relative lifetime,
/// then the provider default. Non-positive and non-finite values count as
/// absent; lifetimes beyond [`MAX_EXPIRES_IN`] are clamped to it.
pub(crate) fn resolve_expiry(
    now: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    expires_in_secs: Option<f64>,
    default_lifetime: Option<std::time::Duration>,
) -> Option<DateTime<Utc>> {
    if let Some(at) = expires_at {
        return Some(at);
    }
    if let Some(secs) = expires_in_secs.filter(|s| s.is_finite() && *s > 0.0) {
        let max_secs = MAX_EXPIRES_IN.num_seconds() as f64;
        let delta = if secs >= max_secs {
            MAX_EXPIRES_IN
        } else {
            TimeDelta::milliseconds((secs * 1000.0) as i64)
        };
        if let Some(at) = now.checked_add_signed(delta) {
            return Some(at);
        }
    }
    default_lifetime
        .and_then(|d| TimeDelta::from_std(d).ok())
        .and_then(|d| now.checked_add_signed(d))
}
