//! The Provider Manager: reconciles desired-state snapshots against the currently running set
//! of Fetchers.

use crate::fetcher::{FetchError, Fetcher};
use crate::metrics::SecretMetrics;
use crate::provider::{fingerprints_eq, ConfigFingerprint, Provider, ProviderConfig, ProviderError};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// One desired entry in a snapshot passed to [`ProviderManager::apply_config`].
#[derive(Debug, Clone)]
pub struct NamedConfig<T> {
    pub name: String,
    pub config: T,
}

impl<T> NamedConfig<T> {
    pub fn new(name: impl Into<String>, config: T) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

/// Failure from [`ProviderManager::apply_config`].
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Step 2 failed: building the new provider errored. The previous generation, if any, is
    /// left untouched and continues serving `Fetch`.
    #[error("failed to build provider: {0}")]
    ProviderBuild(#[source] ProviderError),

    /// One or more per-secret operations failed (duplicate names, Add/Update/Remove failures).
    /// The snapshot was still applied for every name that succeeded — this is advisory, not
    /// fatal.
    #[error("{}", .0.join("; "))]
    Partial(Vec<String>),
}

struct Entry<T> {
    config: T,
    fetcher: Arc<dyn Fetcher>,
}

/// Reconciles a declarative set of named secret references into live Fetchers, backed by one
/// [`Provider`] at a time.
///
/// The Manager is single-writer: callers must serialize their own `apply_config`/`close`
/// invocations. `fetch` is safe to call concurrently with itself and with a running
/// `apply_config`, since it only ever reads the currently-committed `entries` map.
pub struct ProviderManager<T, C>
where
    T: ConfigFingerprint + Clone + Send + Sync + 'static,
    C: ProviderConfig<T> + Clone + Send + Sync + 'static,
{
    root_cancel: CancellationToken,
    provider_scope: Option<CancellationToken>,
    provider_cfg: Option<C>,
    provider: Option<Arc<dyn Provider<T>>>,
    entries: IndexMap<String, Entry<T>>,
    metrics: SecretMetrics,
}

impl<T, C> ProviderManager<T, C>
where
    T: ConfigFingerprint + Clone + Send + Sync + 'static,
    C: ProviderConfig<T> + Clone + Send + Sync + 'static,
{
    pub fn new(metrics: SecretMetrics) -> Self {
        Self {
            root_cancel: CancellationToken::new(),
            provider_scope: None,
            provider_cfg: None,
            provider: None,
            entries: IndexMap::new(),
            metrics,
        }
    }

    /// The seven-step reconciliation algorithm: short-circuit on an empty snapshot, rebuild the
    /// provider if its identity changed, detect duplicate names, reconcile each surviving entry,
    /// clean up what's left of the old set, commit, and report any partial failures.
    pub async fn apply_config(
        &mut self,
        provider_cfg: C,
        configs: Vec<NamedConfig<T>>,
    ) -> Result<(), ManagerError> {
        // Step 1 — empty snapshot short-circuit.
        if configs.is_empty() {
            if let Some(scope) = self.provider_scope.take() {
                scope.cancel();
            }
            self.provider = None;
            self.provider_cfg = None;
            self.entries.clear();
            self.metrics.record(0, 0);
            return Ok(());
        }

        // Step 2 — provider identity check.
        let needs_rebuild = match &self.provider_cfg {
            Some(old) => !fingerprints_eq(old, &provider_cfg).unwrap_or(false),
            None => true,
        };

        if needs_rebuild || self.provider.is_none() {
            let new_scope = self.root_cancel.child_token();
            let built = provider_cfg.new_provider(new_scope.clone()).await;
            let provider = match built {
                Ok(provider) => provider,
                Err(e) => {
                    new_scope.cancel();
                    return Err(ManagerError::ProviderBuild(e));
                }
            };

            if let Some(old_scope) = self.provider_scope.take() {
                old_scope.cancel();
            }
            self.provider_scope = Some(new_scope);
            self.provider = Some(provider);
            self.provider_cfg = Some(provider_cfg);
            self.entries.clear();
        }

        let provider = self.provider.as_ref().expect("provider set above").clone();
        let mut errors: Vec<String> = Vec::new();

        // Step 3 — duplicate detection.
        let mut enabled: HashMap<String, bool> = HashMap::new();
        for nc in &configs {
            if enabled.contains_key(&nc.name) {
                enabled.insert(nc.name.clone(), false);
                errors.push(format!("duplicate secret key \"{}\"", nc.name));
            } else {
                enabled.insert(nc.name.clone(), true);
            }
        }

        // Step 4 — reconciliation.
        let mut old_entries = std::mem::take(&mut self.entries);
        let mut next: IndexMap<String, Entry<T>> = IndexMap::new();

        for nc in &configs {
            if !*enabled.get(&nc.name).unwrap_or(&false) {
                continue;
            }

            if let Some(old_entry) = old_entries.shift_remove(&nc.name) {
                if configs_equal(&old_entry.config, &nc.config) {
                    next.insert(nc.name.clone(), old_entry);
                } else {
                    match provider.update(&old_entry.config, &nc.config).await {
                        Ok(fetcher) => {
                            next.insert(
                                nc.name.clone(),
                                Entry {
                                    config: nc.config.clone(),
                                    fetcher,
                                },
                            );
                        }
                        Err(e) => errors.push(e.to_string()),
                    }
                }
            } else {
                match provider.add(&nc.config).await {
                    Ok(fetcher) => {
                        next.insert(
                            nc.name.clone(),
                            Entry {
                                config: nc.config.clone(),
                                fetcher,
                            },
                        );
                    }
                    Err(e) => errors.push(e.to_string()),
                }
            }
        }

        // Step 5 — cleanup: remove what's left of the old entries.
        for (_, old_entry) in old_entries.into_iter() {
            if let Err(e) = provider.remove(&old_entry.config).await {
                errors.push(e.to_string());
            }
        }

        // Step 6 — commit. `enabled_count` is the number of distinct names in the snapshot,
        // duplicates included — not the number still marked valid after collision detection.
        let enabled_count = enabled.len();
        let accepted_count = next.len();
        self.entries = next;
        self.metrics.record(enabled_count, accepted_count);

        // Step 7.
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::Partial(errors))
        }
    }

    /// The gauges tracking the health of the last accepted snapshot.
    pub fn metrics(&self) -> &SecretMetrics {
        &self.metrics
    }

    pub async fn fetch(&self, name: &str) -> Result<String, FetchError> {
        match self.entries.get(name) {
            Some(entry) => entry.fetcher.fetch().await,
            None => Err(FetchError::EntryNotFound(name.to_string())),
        }
    }

    /// Cancel the root scope (propagating to every Watcher's reconnect loop) and unregister
    /// metrics. Calling `apply_config` after `close` leaves the Manager rebuilding a provider
    /// bound to an already-cancelled scope, which fails fast.
    pub fn close(&mut self) {
        self.root_cancel.cancel();
        self.metrics.unregister();
    }
}

fn configs_equal<T: ConfigFingerprint>(a: &T, b: &T) -> bool {
    fingerprints_eq(a, b).unwrap_or(false)
}
