//! The caller-facing handle returned by a [`Provider`](crate::provider::Provider) for one
//! registered secret.
//!
//! A [`Fetcher`] is a thin closure over provider-owned state: reading it must not perform
//! network I/O beyond whatever the owning provider already buffers in the background.

use async_trait::async_trait;
use thiserror::Error;

/// Failure returned by [`Fetcher::fetch`].
#[derive(Debug, Error)]
pub enum FetchError {
    /// No cached payload exists for the underlying object (deleted, or never observed).
    #[error("secret {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    /// The payload exists but does not contain the requested key.
    #[error("secret {namespace}/{name} does not contain key: {key}")]
    MissingKey {
        namespace: String,
        name: String,
        key: String,
    },

    /// Surfaced verbatim from a provider-specific failure (e.g. an invalid per-secret config).
    #[error("{0}")]
    Other(String),

    /// Raised by [`crate::manager::ProviderManager::fetch`] for a name the last accepted
    /// snapshot never registered.
    #[error("secret \"{0}\" not found")]
    EntryNotFound(String),
}

/// A one-shot read of the current plaintext for a single secret reference.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Returns the current plaintext value, or the reason it is currently unavailable.
    async fn fetch(&self) -> Result<String, FetchError>;
}
