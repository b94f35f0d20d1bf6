//! Instance lifecycle and connection reference counting.

use serde_json::json;
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tailstore::{Config, ConnectionRegistry, Store, StoreError};
use tempfile::TempDir;

fn open_store(dir: &TempDir, registry: &Arc<ConnectionRegistry>) -> Store {
    Store::open_with(
        Config {
            path: dir.path().join("data"),
            ..Default::default()
        },
        Arc::clone(registry),
    )
    .unwrap()
}

#[test]
fn test_reference_counting() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ConnectionRegistry::new());

    let a = open_store(&dir, &registry);
    let b = open_store(&dir, &registry);
    let c = open_store(&dir, &registry);
    assert_eq!(registry.connection_count(), 1);

    // Destroying two of three leaves the shared connection open.
    a.destroy().unwrap();
    b.destroy().unwrap();
    assert_eq!(registry.connection_count(), 1);
    c.publish("still-up", &[json!(1)]).unwrap();

    // The last destroy closes it.
    c.destroy().unwrap();
    assert_eq!(registry.connection_count(), 0);
}

#[test]
fn test_destroy_races_with_reopen() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ConnectionRegistry::new());

    // Destroying the last instance on one thread while another opens the
    // same path must never surface a spurious lock failure.
    for _ in 0..50 {
        let store = open_store(&dir, &registry);

        let opener_registry = Arc::clone(&registry);
        let path = dir.path().join("data");
        let opener = std::thread::spawn(move || {
            Store::open_with(
                Config {
                    path,
                    ..Default::default()
                },
                opener_registry,
            )
        });

        store.destroy().unwrap();
        let reopened = opener.join().unwrap().unwrap();
        reopened.destroy().unwrap();
        assert_eq!(registry.connection_count(), 0);
    }
}

#[test]
fn test_surviving_instances_keep_working() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ConnectionRegistry::new());

    let doomed = open_store(&dir, &registry);
    let subscriber = open_store(&dir, &registry);
    let publisher = open_store(&dir, &registry);

    doomed.destroy().unwrap();

    let (tx, rx) = mpsc::channel();
    subscriber
        .subscribe("after", move |args| {
            tx.send(args.to_vec()).unwrap();
        })
        .unwrap();
    publisher.publish("after", &[json!("alive")]).unwrap();

    let args = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(args, vec![json!("alive")]);
}

#[test]
fn test_destroy_closes_own_subscriptions_only() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ConnectionRegistry::new());

    let a = open_store(&dir, &registry);
    let b = open_store(&dir, &registry);
    let publisher = open_store(&dir, &registry);

    let (tx_a, rx_a) = mpsc::channel();
    a.subscribe("topic", move |_| {
        let _ = tx_a.send(());
    })
    .unwrap();

    let (tx_b, rx_b) = mpsc::channel();
    b.subscribe("topic", move |_| {
        tx_b.send(()).unwrap();
    })
    .unwrap();

    a.destroy().unwrap();
    publisher.publish("topic", &[json!(1)]).unwrap();

    assert!(rx_b.recv_timeout(Duration::from_secs(1)).is_ok());
    assert!(rx_a.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn test_operations_after_destroy_fail() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ConnectionRegistry::new());
    let store = open_store(&dir, &registry);

    store.destroy().unwrap();

    assert!(matches!(
        store.publish("x", &[]),
        Err(StoreError::Destroyed)
    ));
    assert!(matches!(store.stats(), Err(StoreError::Destroyed)));
    assert!(matches!(
        store.destroy_client("c", None),
        Err(StoreError::Destroyed)
    ));
    assert!(matches!(store.destroy(), Err(StoreError::Destroyed)));
}

#[test]
fn test_drop_without_destroy_releases() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ConnectionRegistry::new());

    let keeper = open_store(&dir, &registry);
    {
        let _dropped = open_store(&dir, &registry);
        assert_eq!(registry.connection_count(), 1);
    }

    // Dropping an undestroyed instance released its reference; the
    // keeper's connection is untouched.
    assert_eq!(registry.connection_count(), 1);
    keeper.publish("x", &[json!(1)]).unwrap();
    keeper.destroy().unwrap();
    assert_eq!(registry.connection_count(), 0);
}

#[test]
fn test_paths_get_separate_connections() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let registry = Arc::new(ConnectionRegistry::new());

    let a = open_store(&dir_a, &registry);
    let _b = open_store(&dir_b, &registry);
    assert_eq!(registry.connection_count(), 2);

    a.destroy().unwrap();
    assert_eq!(registry.connection_count(), 1);
}

#[test]
fn test_version_exported() {
    assert!(!tailstore::VERSION.is_empty());
}
