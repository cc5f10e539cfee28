//! Service-specific error types

use thiserror::Error;

/// Service construction errors.
///
/// Per-request failures (unknown prefix, unavailable credentials, rejected
/// caller, upstream transport errors) are handled directly by the proxy
/// handler as HTTP responses and never propagate as Rust errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{provider}: credential bootstrap failed: {source}")]
    Bootstrap {
        provider: &'static str,
        #[source]
        source: credentials::Error,
    },

    #[error(transparent)]
    Credentials(#[from] credential_manager::Error),

    #[error(transparent)]
    Registry(#[from] provider::ProviderError),

    #[error("{provider}: invalid upstream URL {url:?}: {reason}")]
    UpstreamUrl {
        provider: &'static str,
        url: String,
        reason: String,
    },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
