//! Observability: two process-wide integer gauges tracking the health of the last accepted
//! snapshot.
//!
//! The gauge handle is injected at Manager construction rather than held in a global —
//! registration and unregistration are scoped to the Manager's lifetime.

use prometheus::{IntGauge, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Register(#[from] prometheus::Error),
}

/// The two gauges: `secrets_total` and `failed_secret_configs`.
pub struct SecretMetrics {
    registry: Option<Registry>,
    secrets_total: IntGauge,
    failed_secret_configs: IntGauge,
}

impl SecretMetrics {
    /// Builds the gauges and, if `registry` is supplied, registers them against it. Construction
    /// without a registry is valid — the gauges are simply never scraped.
    pub fn new(registry: Option<Registry>) -> Result<Self, MetricsError> {
        let secrets_total = IntGauge::new("secrets_total", "count of names in the last accepted snapshot")?;
        let failed_secret_configs = IntGauge::new(
            "failed_secret_configs",
            "count of names from the last snapshot that failed to register or reconcile",
        )?;

        if let Some(registry) = &registry {
            registry.register(Box::new(secrets_total.clone()))?;
            registry.register(Box::new(failed_secret_configs.clone()))?;
        }

        Ok(Self {
            registry,
            secrets_total,
            failed_secret_configs,
        })
    }

    /// `secrets_total = |enabled|`, `failed_secret_configs = |enabled| - |accepted|`.
    pub fn record(&self, enabled: usize, accepted: usize) {
        self.secrets_total.set(enabled as i64);
        self.failed_secret_configs
            .set(enabled.saturating_sub(accepted) as i64);
    }

    /// Current value of `secrets_total`.
    pub fn secrets_total(&self) -> i64 {
        self.secrets_total.get()
    }

    /// Current value of `failed_secret_configs`.
    pub fn failed_secret_configs(&self) -> i64 {
        self.failed_secret_configs.get()
    }

    /// Unregister from the backing registry, if any.
    pub fn unregister(&self) {
        if let Some(registry) = &self.registry {
            let _ = registry.unregister(Box::new(self.secrets_total.clone()));
            let _ = registry.unregister(Box::new(self.failed_secret_configs.clone()));
        }
    }
}
