//! Error types for credential persistence and refresh

/// Errors from credential store and token refresh operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("refresh token rejected: {0}")]
    InvalidCredentials(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("credential file not found: {0}")]
    NotFound(String),

    #[error("insecure credential file permissions: {0}")]
    InsecurePermissions(String),

    #[error("refresh token is missing: {0}")]
    MissingRefreshToken(String),

    #[error("invalid header value: {0}")]
    InvalidHeader(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Whether this error means the credential file does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Result alias for credential operations.
pub type Result<T> = std::result::Result<T, Error>;
