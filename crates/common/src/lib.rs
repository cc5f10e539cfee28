//! Common types shared by the ai-mux crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::{Secret, mask_token};
