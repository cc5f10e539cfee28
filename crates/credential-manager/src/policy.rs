//! Expiry policy
//!
//! Pure functions over a record and a clock reading so the state machine can
//! be tested without sleeping.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use credentials::TokenCredentials;

/// A refresh is due when there is no access token, or the token expires
/// within `window` of `now`. Records without an expiry never need one.
pub fn needs_refresh(creds: &TokenCredentials, now: DateTime<Utc>, window: Duration) -> bool {
    if creds.access_token.is_empty() {
        return true;
    }
    let Some(expires_at) = creds.expires_at else {
        return false;
    };
    let deadline = TimeDelta::from_std(window)
        .ok()
        .and_then(|w| now.checked_add_signed(w))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    expires_at < deadline
}

/// The access token may be presented upstream right now.
pub fn is_valid(creds: &TokenCredentials, now: DateTime<Utc>) -> bool {
    !creds.access_token.is_empty() && creds.expires_at.is_none_or(|at| at > now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(access: &str, expires_in: Option<i64>, now: DateTime<Utc>) -> TokenCredentials {
        TokenCredentials {
            access_token: access.into(),
            refresh_token: "rt".into(),
            expires_at: expires_in.map(|s| now + TimeDelta::seconds(s)),
            ..Default::default()
        }
    }

    #[test]
    fn empty_access_token_needs_refresh_and_is_invalid() {
        let now = Utc::now();
        let c = creds("", Some(3600), now);
        assert!(needs_refresh(&c, now, Duration::from_secs(60)));
        assert!(!is_valid(&c, now));
    }

    #[test]
    fn refreshes_inside_window_only() {
        let now = Utc::now();
        let window = Duration::from_secs(60);
        assert!(needs_refresh(&creds("at", Some(30), now), now, window));
        assert!(!needs_refresh(&creds("at", Some(120), now), now, window));
        // Inside the window the old token still serves.
        assert!(is_valid(&creds("at", Some(30), now), now));
    }

    #[test]
    fn expired_token_is_invalid() {
        let now = Utc::now();
        let c = creds("at", Some(-1), now);
        assert!(!is_valid(&c, now));
        assert!(needs_refresh(&c, now, Duration::ZERO));
    }

    #[test]
    fn missing_expiry_is_perpetually_valid() {
        let now = Utc::now();
        let c = creds("at", None, now);
        assert!(is_valid(&c, now + TimeDelta::days(3650)));
        assert!(!needs_refresh(&c, now, Duration::from_secs(600)));
    }

    #[test]
    fn huge_window_saturates() {
        let now = Utc::now();
        let c = creds("at", Some(3600), now);
        assert!(needs_refresh(&c, now, Duration::MAX));
    }
}
