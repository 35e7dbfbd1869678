//! The Kubernetes-backed watching provider.
//!
//! Maintains exactly one watch per distinct `(namespace, name)` Secret object and multiplexes
//! any number of per-key [`Fetcher`]s over it. A background task per object owns reconnection
//! with jittered backoff; everything else is a one-shot `Get` plus bookkeeping serialized by the
//! [`crate::manager::ProviderManager`] that owns this provider.

pub mod backend;

pub use backend::{KubeApiBackend, KubeSecretBackend, WatchEvent};
#[cfg(any(test, feature = "testing"))]
pub use backend::mock::MockKubeSecretBackend;

use super::{Provider, ProviderConfig, ProviderError};
use crate::fetcher::{FetchError, Fetcher};
use async_trait::async_trait;
use futures::StreamExt;
use indexmap::IndexMap;
use k8s_openapi::api::core::v1::Secret;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The concrete per-secret config type `T` for the Kubernetes provider.
///
/// `(namespace, name)` identifies the watched object; `key` selects a field within it. Two
/// configs with the same object identity share one watch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KubeSecretConfig {
    pub namespace: String,
    pub name: String,
    pub key: String,
}

impl KubeSecretConfig {
    fn object_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Factory + identity for [`KubeWatchProvider`] (component F applied to C).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeProviderConfig {
    /// Human-readable name, surfaced via `ProviderConfig::name`.
    #[serde(default = "default_provider_name")]
    pub name: String,
    /// Path to an explicit kubeconfig file. `None` infers in-cluster config, then the default
    /// kubeconfig, then environment variables, matching `kube::Config::infer`.
    pub kubeconfig_path: Option<String>,
}

fn default_provider_name() -> String {
    "kubernetes".to_string()
}

#[async_trait]
impl ProviderConfig<KubeSecretConfig> for KubeProviderConfig {
    fn name(&self) -> &str {
        &self.name
    }

    async fn new_provider(
        &self,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn Provider<KubeSecretConfig>>, ProviderError> {
        let client = build_client(self.kubeconfig_path.as_deref()).await?;
        let backend = Arc::new(KubeApiBackend::new(client));
        Ok(Arc::new(KubeWatchProvider::new(backend, cancel)))
    }
}

async fn build_client(kubeconfig_path: Option<&str>) -> Result<kube::Client, ProviderError> {
    let config = match kubeconfig_path {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)
                .map_err(|e| ProviderError::Backend(Box::new(e)))?;
            kube::Config::from_kubeconfig(&kubeconfig)
                .await
                .map_err(|e| ProviderError::Backend(Box::new(e)))?
        }
        None => kube::Config::infer()
            .await
            .map_err(|e| ProviderError::Backend(Box::new(e)))?,
    };
    kube::Client::try_from(config).map_err(|e| ProviderError::Backend(Box::new(e)))
}

/// Mutable, mutex-guarded state for one watched object.
struct WatcherState {
    /// Per-key reference counts. The object-level reference count is the sum of these.
    key_refs: HashMap<String, usize>,
    /// The last observed payload, or `None` ("absent").
    cached: Option<Secret>,
}

impl WatcherState {
    fn total_refs(&self) -> usize {
        self.key_refs.values().sum()
    }
}

/// Per-object bookkeeping unit, one per distinct `(namespace, name)`.
struct Watcher {
    namespace: String,
    name: String,
    state: Mutex<WatcherState>,
    /// Child of the provider's cancellation scope. Cancelled either by the provider tearing
    /// down wholesale, or directly by `remove` once the object's refcount reaches zero — either
    /// way the reconnect loop observes the same signal.
    cancel: CancellationToken,
}

impl Watcher {
    fn object_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// The Kubernetes Watch Provider (component C).
pub struct KubeWatchProvider {
    backend: Arc<dyn KubeSecretBackend>,
    cancel: CancellationToken,
    watchers: Mutex<IndexMap<String, Arc<Watcher>>>,
}

impl KubeWatchProvider {
    pub fn new(backend: Arc<dyn KubeSecretBackend>, cancel: CancellationToken) -> Self {
        Self {
            backend,
            cancel,
            watchers: Mutex::new(IndexMap::new()),
        }
    }

    /// Opens a brand new Watcher for `cfg`'s object, seeds its cache, and spawns the
    /// background reconnect loop.
    async fn open_watcher(&self, cfg: &KubeSecretConfig) -> Result<Arc<Watcher>, ProviderError> {
        let cached = self.backend.get(&cfg.namespace, &cfg.name).await?;

        let mut key_refs = HashMap::new();
        key_refs.insert(cfg.key.clone(), 1usize);

        let watcher = Arc::new(Watcher {
            namespace: cfg.namespace.clone(),
            name: cfg.name.clone(),
            state: Mutex::new(WatcherState { key_refs, cached }),
            cancel: self.cancel.child_token(),
        });

        self.watchers
            .lock()
            .unwrap()
            .insert(cfg.object_key(), watcher.clone());

        tokio::spawn(run_reconnect_loop(watcher.clone(), self.backend.clone()));

        Ok(watcher)
    }

    /// Number of distinct objects currently watched. Exposed for introspection and tests.
    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().unwrap().len()
    }
}

#[async_trait]
impl Provider<KubeSecretConfig> for KubeWatchProvider {
    async fn add(&self, cfg: &KubeSecretConfig) -> Result<Arc<dyn Fetcher>, ProviderError> {
        let existing = self.watchers.lock().unwrap().get(&cfg.object_key()).cloned();

        let watcher = match existing {
            Some(watcher) => {
                let mut state = watcher.state.lock().unwrap();
                *state.key_refs.entry(cfg.key.clone()).or_insert(0) += 1;
                watcher
            }
            None => self.open_watcher(cfg).await?,
        };

        Ok(Arc::new(KubeFetcher {
            watcher,
            key: cfg.key.clone(),
        }))
    }

    async fn update(
        &self,
        before: &KubeSecretConfig,
        after: &KubeSecretConfig,
    ) -> Result<Arc<dyn Fetcher>, ProviderError> {
        if before.object_key() == after.object_key() {
            let watcher = self
                .watchers
                .lock()
                .unwrap()
                .get(&before.object_key())
                .cloned()
                .ok_or(ProviderError::NotFound)?;

            {
                let mut state = watcher.state.lock().unwrap();
                decrement_key(&mut state.key_refs, &before.key);
                *state.key_refs.entry(after.key.clone()).or_insert(0) += 1;
            }

            return Ok(Arc::new(KubeFetcher {
                watcher,
                key: after.key.clone(),
            }));
        }

        self.remove(before).await?;
        self.add(after).await
    }

    async fn remove(&self, cfg: &KubeSecretConfig) -> Result<(), ProviderError> {
        let object_key = cfg.object_key();
        let watcher = self.watchers.lock().unwrap().get(&object_key).cloned();

        let Some(watcher) = watcher else {
            return Ok(());
        };

        let drained = {
            let mut state = watcher.state.lock().unwrap();
            decrement_key(&mut state.key_refs, &cfg.key);
            state.total_refs() == 0
        };

        if drained {
            self.watchers.lock().unwrap().shift_remove(&object_key);
            watcher.cancel.cancel();
        }

        Ok(())
    }
}

fn decrement_key(key_refs: &mut HashMap<String, usize>, key: &str) {
    if let Some(count) = key_refs.get_mut(key) {
        if *count <= 1 {
            key_refs.remove(key);
        } else {
            *count -= 1;
        }
    }
}

/// The background task owning reconnection for one Watcher.
async fn run_reconnect_loop(watcher: Arc<Watcher>, backend: Arc<dyn KubeSecretBackend>) {
    loop {
        let stream = match backend.watch(&watcher.namespace, &watcher.name).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(
                    object = %watcher.object_key(),
                    error = %err,
                    "failed to open kubernetes watch stream"
                );
                if !sleep_with_jitter_or_cancelled(&watcher).await {
                    return;
                }
                if total_refs(&watcher) == 0 || watcher.cancel.is_cancelled() {
                    return;
                }
                continue;
            }
        };
        tokio::pin!(stream);

        let cancelled = run_inner_loop(&watcher, &mut stream).await;
        if cancelled {
            return;
        }

        // Outer loop: decide whether to reconnect.
        if total_refs(&watcher) == 0 {
            return;
        }
        if !sleep_with_jitter_or_cancelled(&watcher).await {
            return;
        }
        if total_refs(&watcher) == 0 {
            return;
        }
    }
}

/// Consumes events until the stream closes or the watcher is cancelled. Returns `true` if exit
/// was due to cancellation (the whole task should stop), `false` if the channel simply closed
/// (the outer loop should decide whether to reconnect).
async fn run_inner_loop(
    watcher: &Arc<Watcher>,
    stream: &mut (impl futures::Stream<Item = WatchEvent> + Unpin),
) -> bool {
    loop {
        tokio::select! {
            _ = watcher.cancel.cancelled() => {
                debug!(object = %watcher.object_key(), "watcher cancelled");
                return true;
            }
            item = stream.next() => {
                match item {
                    Some(event) => apply_event(watcher, event),
                    None => return false,
                }
            }
        }
    }
}

/// Applies a decoded watch event to the Watcher's cached state.
fn apply_event(watcher: &Watcher, event: WatchEvent) {
    let mut state = watcher.state.lock().unwrap();
    match event {
        WatchEvent::Added(secret) | WatchEvent::Modified(secret) => {
            state.cached = Some(secret);
        }
        WatchEvent::Deleted(_) => {
            state.cached = None;
        }
        WatchEvent::Bookmark => {}
        WatchEvent::Error(err) => {
            warn!(
                namespace = %watcher.namespace,
                name = %watcher.name,
                error = %err,
                "kubernetes watch stream reported an error"
            );
        }
    }
}

fn total_refs(watcher: &Watcher) -> usize {
    watcher.state.lock().unwrap().total_refs()
}

/// Sleeps 1 second plus up to 30 seconds of jitter before a reconnect attempt (see DESIGN.md
/// for why this is seconds rather than nanoseconds). Returns `false` if the watcher was
/// cancelled mid-sleep.
async fn sleep_with_jitter_or_cancelled(watcher: &Arc<Watcher>) -> bool {
    let jitter_secs: f64 = rand::thread_rng().gen_range(0.0..30.0);
    let sleep_for = Duration::from_secs(1) + Duration::from_secs_f64(jitter_secs);

    tokio::select! {
        _ = watcher.cancel.cancelled() => false,
        _ = tokio::time::sleep(sleep_for) => true,
    }
}

/// Key resolution against a Watcher's cached payload.
struct KubeFetcher {
    watcher: Arc<Watcher>,
    key: String,
}

#[async_trait]
impl Fetcher for KubeFetcher {
    async fn fetch(&self) -> Result<String, FetchError> {
        let state = self.watcher.state.lock().unwrap();
        let Some(secret) = state.cached.as_ref() else {
            return Err(FetchError::NotFound {
                namespace: self.watcher.namespace.clone(),
                name: self.watcher.name.clone(),
            });
        };

        if let Some(value) = secret
            .data
            .as_ref()
            .and_then(|data| data.get(&self.key))
        {
            let revealed = SecretString::new(String::from_utf8_lossy(&value.0).into_owned().into());
            return Ok(revealed.expose_secret().to_string());
        }

        if let Some(value) = secret
            .string_data
            .as_ref()
            .and_then(|data| data.get(&self.key))
        {
            let revealed = SecretString::new(value.clone().into());
            return Ok(revealed.expose_secret().to_string());
        }

        Err(FetchError::MissingKey {
            namespace: self.watcher.namespace.clone(),
            name: self.watcher.name.clone(),
            key: self.key.clone(),
        })
    }
}
