//! # secretwatch
//!
//! `secretwatch` is a reconciling secret provider manager: a long-lived, reconfigurable
//! in-process service that materializes a declarative set of named secret references into live
//! [`Fetcher`](fetcher::Fetcher)s, each exposing the current plaintext value of one secret.
//!
//! The [`manager::ProviderManager`] accepts full desired-state snapshots and diffs them against
//! the previously accepted one, dispatching `Add`/`Update`/`Remove` to whichever
//! [`provider::Provider`] backs the current [`provider::ProviderConfig`]. The bundled concrete
//! provider, [`provider::kube::KubeWatchProvider`], maintains one Kubernetes watch per referenced
//! `Secret` object and multiplexes any number of per-key fetchers over it.
//!
//! This crate has no CLI, config-file loading, or HTTP surface of its own — those are the
//! responsibility of whatever application embeds it.

pub mod fetcher;
pub mod manager;
pub mod metrics;
pub mod provider;

pub use fetcher::{FetchError, Fetcher};
pub use manager::{ManagerError, NamedConfig, ProviderManager};
pub use metrics::{MetricsError, SecretMetrics};
pub use provider::{ConfigFingerprint, Provider, ProviderConfig, ProviderError};
