//! Error types for credential manager operations

/// Errors from credential manager operations.
///
/// Every variant names the provider so callers can log it without extra
/// context.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{provider}: loading credentials from {path} failed: {source}")]
    Load {
        provider: String,
        path: String,
        #[source]
        source: credentials::Error,
    },

    #[error("{0}: no valid access token")]
    Unavailable(String),

    #[error("{0}: refresh token is empty")]
    MissingRefreshToken(String),

    #[error("{provider}: token refresh failed: {source}")]
    Refresh {
        provider: String,
        #[source]
        source: credentials::Error,
    },

    #[error("{provider}: building credential headers failed: {source}")]
    Headers {
        provider: String,
        #[source]
        source: credentials::Error,
    },
}

impl Error {
    /// Whether the refresh token was rejected by the token endpoint.
    pub fn is_revoked(&self) -> bool {
        matches!(
            self,
            Error::Refresh {
                source: credentials::Error::InvalidCredentials(_),
                ..
            }
        )
    }
}

/// Result alias for credential manager operations.
pub type Result<T> = std::result::Result<T, Error>;
