//! The narrow seam between this crate and the Kubernetes client library.
//!
//! [`KubeSecretBackend`] states the Kubernetes dependency as a trait: a one-shot `Get` plus a
//! `Watch` that yields decoded events. Production code implements it over `kube::Api<Secret>`;
//! tests implement it with an in-memory, channel-driven double so the reconnect loop, refcounting,
//! and key-resolution logic can be exercised deterministically without a live cluster.

use super::ProviderError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Secret;

/// A decoded Kubernetes watch event.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(Secret),
    Modified(Secret),
    Deleted(Secret),
    /// Bookmarks are disabled at subscription time; arrival is a protocol anomaly, not an error.
    Bookmark,
    /// A server-side error frame. Logged by the caller; does not mutate cached state.
    Error(String),
}

/// Abstracts `CoreV1.Secrets(ns).Get` and `.Watch` behind a trait object so the Kubernetes
/// watch provider can be driven by a mock in tests.
#[async_trait]
pub trait KubeSecretBackend: Send + Sync {
    /// One-shot read of the named Secret. Returns `Ok(None)` if the object does not exist;
    /// any other failure is propagated.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ProviderError>;

    /// Opens a watch stream scoped to exactly `metadata.name == name` in `namespace`, with
    /// bookmarks disabled. The returned stream ends when the underlying channel closes; it
    /// does not retry internally — reconnection is the caller's (the reconnect loop's)
    /// responsibility.
    async fn watch(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BoxStream<'static, WatchEvent>, ProviderError>;
}

/// Production [`KubeSecretBackend`] backed by a real `kube::Client`.
pub struct KubeApiBackend {
    client: kube::Client,
}

impl KubeApiBackend {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeSecretBackend for KubeApiBackend {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ProviderError> {
        use kube::api::Api;

        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(ProviderError::Backend(Box::new(e))),
        }
    }

    async fn watch(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BoxStream<'static, WatchEvent>, ProviderError> {
        use futures::StreamExt;
        use kube::api::{Api, ListParams};

        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().fields(&format!("metadata.name={name}"));

        let stream = api
            .watch(&lp, "0")
            .await
            .map_err(|e| ProviderError::Backend(Box::new(e)))?;

        let mapped = stream.map(|item| match item {
            Ok(kube::api::WatchEvent::Added(secret)) => WatchEvent::Added(secret),
            Ok(kube::api::WatchEvent::Modified(secret)) => WatchEvent::Modified(secret),
            Ok(kube::api::WatchEvent::Deleted(secret)) => WatchEvent::Deleted(secret),
            Ok(kube::api::WatchEvent::Bookmark(_)) => WatchEvent::Bookmark,
            Ok(kube::api::WatchEvent::Error(e)) => WatchEvent::Error(e.to_string()),
            Err(e) => WatchEvent::Error(e.to_string()),
        });

        Ok(Box::pin(mapped))
    }
}

/// In-memory [`KubeSecretBackend`] double for tests.
///
/// Each `(namespace, name)` pair gets its own scripted event channel. `get` answers from a
/// separately seeded map so tests can exercise "object absent at Add time, created later"
/// scenarios independent of the watch stream.
#[cfg(any(test, feature = "testing"))]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    pub struct MockKubeSecretBackend {
        seeded: Mutex<HashMap<(String, String), Secret>>,
        senders: Mutex<HashMap<(String, String), mpsc::Sender<WatchEvent>>>,
        open_counts: Mutex<HashMap<(String, String), usize>>,
    }

    impl Default for MockKubeSecretBackend {
        fn default() -> Self {
            Self {
                seeded: Mutex::new(HashMap::new()),
                senders: Mutex::new(HashMap::new()),
                open_counts: Mutex::new(HashMap::new()),
            }
        }
    }

    impl MockKubeSecretBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds the object returned by the next `get` for `(namespace, name)`.
        pub fn seed(&self, namespace: &str, name: &str, secret: Secret) {
            self.seeded
                .lock()
                .unwrap()
                .insert((namespace.to_string(), name.to_string()), secret);
        }

        /// Pushes an event to whichever watch stream is currently open for `(namespace, name)`,
        /// if any. Silently dropped if nothing is currently watching.
        pub fn push(&self, namespace: &str, name: &str, event: WatchEvent) {
            if let Some(tx) = self
                .senders
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
            {
                let _ = tx.try_send(event);
            }
        }

        /// Closes the currently open watch stream for `(namespace, name)`, simulating a
        /// server-side disconnect. The next `watch` call reopens a fresh channel.
        pub fn kill_stream(&self, namespace: &str, name: &str) {
            self.senders
                .lock()
                .unwrap()
                .remove(&(namespace.to_string(), name.to_string()));
        }

        /// Cumulative number of times `watch` has been called for `(namespace, name)` — used to
        /// assert that multiple registrations against the same object share one stream, and that
        /// a killed stream is reopened.
        pub fn open_count(&self, namespace: &str, name: &str) -> usize {
            *self
                .open_counts
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .unwrap_or(&0)
        }
    }

    #[async_trait]
    impl KubeSecretBackend for MockKubeSecretBackend {
        async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ProviderError> {
            Ok(self
                .seeded
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }

        async fn watch(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<BoxStream<'static, WatchEvent>, ProviderError> {
            let (tx, rx) = mpsc::channel(16);
            let key = (namespace.to_string(), name.to_string());
            self.senders.lock().unwrap().insert(key.clone(), tx);
            *self.open_counts.lock().unwrap().entry(key).or_insert(0) += 1;
            Ok(Box::pin(ReceiverStream::new(rx)))
        }
    }
}
