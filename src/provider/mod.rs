//! The provider contract (component B) and the Kubernetes watch provider (component C).
//!
//! A [`Provider`] owns the lifecycle of [`Fetcher`](crate::fetcher::Fetcher)s for one provider
//! kind. [`ProviderConfig`] is the factory + identity half of the contract: it builds a
//! `Provider` bound to a cancellation scope, and its serialized form defines whether two
//! snapshots of the same provider kind are considered equal (see [`ConfigFingerprint`]).

pub mod kube;

use crate::fetcher::Fetcher;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by [`Provider::add`]/[`Provider::update`]/[`Provider::remove`] and by
/// [`ProviderConfig::new_provider`].
///
/// On any of these failing, the provider must leave its internal bookkeeping unchanged: no
/// partial allocation may become visible to subsequent calls.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The config passed to `new_provider`, `add`, or `update` was structurally invalid.
    #[error("invalid provider config: {0}")]
    InvalidConfig(String),

    /// A registration was referenced (e.g. by `update`/`remove`) that the provider has no
    /// record of.
    #[error("unregistered config")]
    NotFound,

    /// The backing API or transport failed.
    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Owns the lifecycle of [`Fetcher`]s for one provider kind.
///
/// Implementations are free to implement [`Provider::update`] as `remove` + `add` or as an
/// in-place mutation when cheaper; in either case the Fetcher returned by `update` replaces the
/// one returned by the prior `add`/`update`, which must not be used again.
///
/// `Add`/`Update` are not required to be idempotent across distinct configs that happen to be
/// equal: two such calls may share underlying resources, but each must produce one logical
/// registration owned independently by its caller. `Remove` of an unknown config is a silent
/// no-op (`Ok(())`), so callers can issue cleanup Removes without needing reverse bookkeeping.
#[async_trait]
pub trait Provider<T>: Send + Sync {
    /// Registers a new secret, returning a live Fetcher for it.
    async fn add(&self, cfg: &T) -> Result<Arc<dyn Fetcher>, ProviderError>;

    /// Atomically transitions a registration from `before` to `after`, returning a Fetcher
    /// bound to the new config. The Fetcher returned by the prior `add`/`update` for `before`
    /// must not be used again.
    async fn update(&self, before: &T, after: &T) -> Result<Arc<dyn Fetcher>, ProviderError>;

    /// Releases resources proportional to `cfg`. A no-op if `cfg` is not currently registered.
    async fn remove(&self, cfg: &T) -> Result<(), ProviderError>;
}

/// Factory + identity for a [`Provider`].
///
/// `ProviderConfig` values are compared for equality via [`ConfigFingerprint`], not
/// `derive(PartialEq)`: the fingerprint is computed only from the fields that survive
/// serialization, so private/runtime-only fields never trigger a spurious rebuild.
#[async_trait]
pub trait ProviderConfig<T>: ConfigFingerprint + Send + Sync {
    /// A human-readable name for logging and diagnostics.
    fn name(&self) -> &str;

    /// Builds a fresh `Provider` bound to `cancel`. The provider must terminate all background
    /// work when `cancel` fires.
    async fn new_provider(&self, cancel: CancellationToken) -> Result<Arc<dyn Provider<T>>, ProviderError>;
}

/// Semantic identity over a canonical serialized form.
///
/// Implemented via a blanket impl for every `Serialize` type: the canonical form is the value's
/// `serde_json` encoding, which emits struct fields in declaration order, giving a stable,
/// deterministic byte sequence for any fixed config type. Fields that must never influence the
/// comparison should be marked `#[serde(skip)]` on the concrete config type.
pub trait ConfigFingerprint {
    /// Returns the canonical serialized form used for equality comparisons.
    fn fingerprint(&self) -> Result<String, ProviderError>;
}

impl<T: Serialize> ConfigFingerprint for T {
    fn fingerprint(&self) -> Result<String, ProviderError> {
        serde_json::to_string(self).map_err(|e| ProviderError::InvalidConfig(e.to_string()))
    }
}

/// Returns whether `a` and `b` are semantically equal per their canonical serialized form.
pub fn fingerprints_eq<A: ConfigFingerprint, B: ConfigFingerprint>(
    a: &A,
    b: &B,
) -> Result<bool, ProviderError> {
    Ok(a.fingerprint()? == b.fingerprint()?)
}
