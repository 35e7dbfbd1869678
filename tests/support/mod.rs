//! Shared test doubles: a toy prefix-concatenation provider exercising the Manager's
//! reconciliation logic independent of any concrete backend.

use async_trait::async_trait;
use secretwatch::{ConfigFingerprint, FetchError, Fetcher, Provider, ProviderConfig, ProviderError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-secret config for the toy provider: `{foo: value}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToySecretConfig {
    pub foo: String,
}

impl ToySecretConfig {
    pub fn new(foo: impl Into<String>) -> Self {
        Self { foo: foo.into() }
    }
}

/// Provider-level config for the toy provider: `{prefix: value}` plus a non-serialized build
/// counter used by tests to observe whether a rebuild happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToyProviderConfig {
    pub prefix: String,
    /// Never influences `ConfigFingerprint`: excluded from serialization.
    #[serde(skip)]
    pub build_count: Arc<AtomicUsize>,
    /// Another private field: changing only this must never trigger a rebuild.
    #[serde(skip)]
    pub label: String,
}

impl ToyProviderConfig {
    pub fn new(prefix: impl Into<String>, build_count: Arc<AtomicUsize>) -> Self {
        Self {
            prefix: prefix.into(),
            build_count,
            label: String::new(),
        }
    }
}

#[async_trait]
impl ProviderConfig<ToySecretConfig> for ToyProviderConfig {
    fn name(&self) -> &str {
        "toy"
    }

    async fn new_provider(
        &self,
        _cancel: CancellationToken,
    ) -> Result<Arc<dyn Provider<ToySecretConfig>>, ProviderError> {
        self.build_count.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ToyProvider {
            prefix: self.prefix.clone(),
            counter: AtomicUsize::new(0),
        }))
    }
}

/// Renders `{prefix}-{ordinal}-foo: {value}`, numbering registrations in the order `add` is
/// called. A `foo` value of `"FAIL"` makes `add` return an error, for exercising per-entry
/// failure isolation.
pub struct ToyProvider {
    prefix: String,
    counter: AtomicUsize,
}

#[async_trait]
impl Provider<ToySecretConfig> for ToyProvider {
    async fn add(&self, cfg: &ToySecretConfig) -> Result<Arc<dyn Fetcher>, ProviderError> {
        if cfg.foo == "FAIL" {
            return Err(ProviderError::InvalidConfig("injected failure".to_string()));
        }
        let ordinal = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(ToyFetcher {
            value: format!("{}-{}-foo: {}", self.prefix, ordinal, cfg.foo),
        }))
    }

    async fn update(
        &self,
        _before: &ToySecretConfig,
        after: &ToySecretConfig,
    ) -> Result<Arc<dyn Fetcher>, ProviderError> {
        self.add(after).await
    }

    async fn remove(&self, _cfg: &ToySecretConfig) -> Result<(), ProviderError> {
        Ok(())
    }
}

struct ToyFetcher {
    value: String,
}

#[async_trait]
impl Fetcher for ToyFetcher {
    async fn fetch(&self) -> Result<String, FetchError> {
        Ok(self.value.clone())
    }
}

/// Sanity check that the fingerprint mechanism itself is exercised by these test doubles.
pub fn fingerprint_of(cfg: &ToyProviderConfig) -> String {
    cfg.fingerprint().expect("toy config always serializes")
}
