//! Secret wrapper for bearer tokens and refresh tokens

use serde::{Deserialize, Deserializer};
use std::fmt;
use zeroize::Zeroize;

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Create a new secret value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<'de, T: Zeroize + Deserialize<'de>> Deserialize<'de> for Secret<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Secret::new)
    }
}

/// Mask a token for logging: first 8 characters followed by `...`.
///
/// Values of 8 characters or fewer are fully hidden as `***`.
pub fn mask_token(token: &str) -> String {
    match token.char_indices().nth(8) {
        Some((idx, _)) => format!("{}...", &token[..idx]),
        None => "***".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_redacts_debug() {
        let secret = Secret::new(String::from("user-token-0123456789"));
        let debug = format!("{:?}", secret);
        assert_eq!(debug, "[REDACTED]");
        assert!(!debug.contains("user-token"));
    }

    #[test]
    fn test_secret_exposes_value() {
        let secret = Secret::new(String::from("user-token-0123456789"));
        assert_eq!(secret.expose(), "user-token-0123456789");
    }

    #[test]
    fn mask_token_keeps_short_prefix() {
        assert_eq!(mask_token("sk-ant-oat01-abcdef"), "sk-ant-o...");
        assert_eq!(mask_token("123456789"), "12345678...");
    }

    #[test]
    fn mask_token_hides_short_values() {
        assert_eq!(mask_token(""), "***");
        assert_eq!(mask_token("12345678"), "***");
    }

    #[test]
    fn mask_token_respects_char_boundaries() {
        assert_eq!(mask_token("ééééééééé"), "éééééééé...");
    }

    #[test]
    fn secret_deserializes_from_toml() {
        #[derive(serde::Deserialize)]
        struct Holder {
            token: Secret<String>,
        }
        let holder: Holder = toml::from_str(r#"token = "abcdefghijklmnop""#).unwrap();
        assert_eq!(holder.token.expose(), "abcdefghijklmnop");
        assert_eq!(mask_token(holder.token.expose()), "abcdefgh...");
    }
}
