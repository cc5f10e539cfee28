//! Per-provider credential lifecycle
//!
//! A [`CredentialManager`] owns one provider's [`credentials::TokenCredentials`]
//! record. Request handlers read it through cheap shared-lock snapshots; a
//! single background task per provider refreshes it ahead of expiry and writes
//! the result back through the provider's store.

pub mod error;
pub mod manager;
pub mod policy;
mod refresh;

pub use error::{Error, Result};
pub use manager::{CredentialManager, Lifecycle, ManagerOptions, RefreshOutcome};
