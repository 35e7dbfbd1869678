//! Integration tests for the Provider Manager's reconciliation logic, exercised against the toy
//! prefix-concatenation provider in `support` so they run independent of any concrete backend.

mod support;

use secretwatch::{ManagerError, NamedConfig, ProviderManager, SecretMetrics};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use support::{ToyProviderConfig, ToySecretConfig};

fn manager() -> ProviderManager<ToySecretConfig, ToyProviderConfig> {
    let metrics = SecretMetrics::new(None).expect("metrics construct");
    ProviderManager::new(metrics)
}

/// Applying a snapshot builds the provider once and registers every named entry; each fetches
/// its own rendered value.
#[tokio::test]
async fn apply_then_fetch_returns_rendered_values() {
    let mut mgr = manager();
    let build_count = Arc::new(AtomicUsize::new(0));
    let cfg = ToyProviderConfig::new("i", build_count.clone());

    let result = mgr
        .apply_config(
            cfg,
            vec![
                NamedConfig::new("abc", ToySecretConfig::new("green")),
                NamedConfig::new("xyz", ToySecretConfig::new("orange")),
            ],
        )
        .await;

    assert!(result.is_ok());
    assert_eq!(mgr.fetch("abc").await.unwrap(), "i-1-foo: green");
    assert_eq!(mgr.fetch("xyz").await.unwrap(), "i-2-foo: orange");
}

/// Applying the same snapshot twice must not rebuild the provider, and fetches must be
/// unchanged.
#[tokio::test]
async fn reapplying_unchanged_snapshot_does_not_rebuild() {
    let mut mgr = manager();
    let build_count = Arc::new(AtomicUsize::new(0));
    let cfg = ToyProviderConfig::new("i", build_count.clone());

    let snapshot = || {
        vec![
            NamedConfig::new("abc", ToySecretConfig::new("green")),
            NamedConfig::new("xyz", ToySecretConfig::new("orange")),
        ]
    };

    mgr.apply_config(cfg.clone(), snapshot()).await.unwrap();
    assert_eq!(build_count.load(Ordering::SeqCst), 1);
    let first_fetch = mgr.fetch("abc").await.unwrap();

    mgr.apply_config(cfg, snapshot()).await.unwrap();
    assert_eq!(
        build_count.load(Ordering::SeqCst),
        1,
        "re-applying an unchanged provider config must not rebuild the provider"
    );
    assert_eq!(
        mgr.fetch("abc").await.unwrap(),
        first_fetch,
        "fetches must be unchanged by a no-op re-apply"
    );
}

/// Mutating only a private (non-serialized) field of `ProviderConfig` across two applies must
/// not cause a rebuild.
#[tokio::test]
async fn private_field_change_does_not_rebuild_provider() {
    let mut mgr = manager();
    let build_count = Arc::new(AtomicUsize::new(0));

    let mut cfg = ToyProviderConfig::new("i", build_count.clone());
    mgr.apply_config(
        cfg.clone(),
        vec![NamedConfig::new("abc", ToySecretConfig::new("green"))],
    )
    .await
    .unwrap();
    assert_eq!(build_count.load(Ordering::SeqCst), 1);

    cfg.label = "changed-but-private".to_string();
    mgr.apply_config(
        cfg,
        vec![NamedConfig::new("abc", ToySecretConfig::new("green"))],
    )
    .await
    .unwrap();

    assert_eq!(
        build_count.load(Ordering::SeqCst),
        1,
        "a private-field-only change must not rebuild the provider"
    );
}

/// Changing a serialized field of `ProviderConfig` must rebuild the provider, dropping and
/// recreating all previously registered entries.
#[tokio::test]
async fn serialized_field_change_rebuilds_provider() {
    let mut mgr = manager();
    let build_count = Arc::new(AtomicUsize::new(0));

    mgr.apply_config(
        ToyProviderConfig::new("i", build_count.clone()),
        vec![NamedConfig::new("abc", ToySecretConfig::new("green"))],
    )
    .await
    .unwrap();
    assert_eq!(mgr.fetch("abc").await.unwrap(), "i-1-foo: green");

    mgr.apply_config(
        ToyProviderConfig::new("j", build_count.clone()),
        vec![NamedConfig::new("abc", ToySecretConfig::new("green"))],
    )
    .await
    .unwrap();

    assert_eq!(
        build_count.load(Ordering::SeqCst),
        2,
        "changing the serialized prefix must rebuild the provider"
    );
    assert_eq!(
        mgr.fetch("abc").await.unwrap(),
        "j-1-foo: green",
        "the re-created provider renumbers registrations from scratch"
    );
}

/// Duplicate names within one snapshot are rejected.
#[tokio::test]
async fn duplicate_name_in_snapshot_is_rejected() {
    let mut mgr = manager();
    let build_count = Arc::new(AtomicUsize::new(0));

    let result = mgr
        .apply_config(
            ToyProviderConfig::new("i", build_count),
            vec![
                NamedConfig::new("a", ToySecretConfig::new("x")),
                NamedConfig::new("a", ToySecretConfig::new("y")),
            ],
        )
        .await;

    match result {
        Err(ManagerError::Partial(errors)) => {
            assert!(errors.iter().any(|e| e == "duplicate secret key \"a\""));
        }
        other => panic!("expected a partial error, got {other:?}"),
    }

    let fetch_err = mgr.fetch("a").await.unwrap_err();
    assert_eq!(fetch_err.to_string(), "secret \"a\" not found");

    assert_eq!(
        mgr.metrics().secrets_total(),
        1,
        "secrets_total counts the one distinct name in the snapshot, duplicates collapsed"
    );
    assert_eq!(
        mgr.metrics().failed_secret_configs(),
        1,
        "the sole name failed to register, so it counts as failed"
    );
}

/// Exactly one duplicate error per collision; both entries are dropped.
#[tokio::test]
async fn duplicate_detection_drops_both_colliding_entries() {
    let mut mgr = manager();
    let build_count = Arc::new(AtomicUsize::new(0));

    let result = mgr
        .apply_config(
            ToyProviderConfig::new("i", build_count),
            vec![
                NamedConfig::new("dup", ToySecretConfig::new("x")),
                NamedConfig::new("dup", ToySecretConfig::new("y")),
                NamedConfig::new("unique", ToySecretConfig::new("z")),
            ],
        )
        .await;

    let errors = match result {
        Err(ManagerError::Partial(errors)) => errors,
        other => panic!("expected a partial error, got {other:?}"),
    };
    let dup_count = errors
        .iter()
        .filter(|e| e.as_str() == "duplicate secret key \"dup\"")
        .count();
    assert_eq!(dup_count, 1);

    assert!(mgr.fetch("dup").await.is_err());
    assert!(mgr.fetch("unique").await.is_ok());
}

/// A failing per-secret Add does not affect registration of any other secret in the same
/// snapshot.
#[tokio::test]
async fn failing_add_does_not_affect_other_entries() {
    let mut mgr = manager();
    let build_count = Arc::new(AtomicUsize::new(0));

    let result = mgr
        .apply_config(
            ToyProviderConfig::new("i", build_count),
            vec![
                NamedConfig::new("good", ToySecretConfig::new("ok")),
                NamedConfig::new("bad", ToySecretConfig::new("FAIL")),
            ],
        )
        .await;

    assert!(matches!(result, Err(ManagerError::Partial(_))));
    assert!(mgr.fetch("good").await.is_ok());
    assert!(mgr.fetch("bad").await.is_err());
}

/// Applying an empty snapshot drains the Manager entirely.
#[tokio::test]
async fn empty_snapshot_drains_entries() {
    let mut mgr = manager();
    let build_count = Arc::new(AtomicUsize::new(0));

    mgr.apply_config(
        ToyProviderConfig::new("i", build_count.clone()),
        vec![NamedConfig::new("abc", ToySecretConfig::new("green"))],
    )
    .await
    .unwrap();
    assert!(mgr.fetch("abc").await.is_ok());

    mgr.apply_config(ToyProviderConfig::new("i", build_count), vec![])
        .await
        .unwrap();

    assert!(mgr.fetch("abc").await.is_err());
}
