//! End-to-end behaviour of the pool over an in-memory store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use service_registry::net::{Connection, TcpConnector};
use service_registry::store::MemoryStore;
use service_registry::{ServicePool, TcpServicePool};

mod common;

use common::{eventually, start_pool, test_config, MockConnector};

#[tokio::test]
async fn test_bulk_load_then_delete() {
    let store = Arc::new(MemoryStore::new());
    store.put("/backends/auth/i1", "10.0.0.1:9000").unwrap();
    let connector = MockConnector::new();
    connector.reachable("10.0.0.1:9000");

    let pool = start_pool(&test_config(), &store, &connector).await;
    let handle = pool.get_service("auth").expect("auth should be live after bulk load");
    assert_eq!(handle.address(), "10.0.0.1:9000");

    store.remove("/backends/auth/i1").unwrap();
    eventually("auth to empty", || pool.get_service("auth").is_none()).await;
    assert_eq!(handle.closes(), 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_updates_never_duplicate_a_key() {
    let store = Arc::new(MemoryStore::new());
    let connector = MockConnector::new();
    for port in 0..5 {
        connector.reachable(&format!("10.0.0.1:{port}"));
    }
    let pool = start_pool(&test_config(), &store, &connector).await;

    for port in 0..5 {
        store.put("/backends/auth/i1", &format!("10.0.0.1:{port}")).unwrap();
        assert!(pool.all_services("auth").len() <= 1);
    }
    eventually("last address applied", || {
        pool.get_service_with_id("auth", "i1")
            .map_or(false, |h| h.address() == "10.0.0.1:4")
    })
    .await;

    assert_eq!(pool.all_services("auth").len(), 1);
    // every replaced handle closed exactly once, the live one not at all
    let counts = connector.close_counts();
    assert_eq!(counts.len(), 5);
    for (address, closes) in counts {
        let expected = usize::from(address != "10.0.0.1:4");
        assert_eq!(closes, expected, "{address}");
    }
    pool.shutdown().await;
}

#[tokio::test]
async fn test_add_then_remove_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let connector = MockConnector::new();
    connector.reachable("10.0.0.7:9000");
    let pool = start_pool(&test_config(), &store, &connector).await;

    store.put("/backends/auth/k", "10.0.0.7:9000").unwrap();
    eventually("k to arrive", || pool.get_service_with_id("auth", "k").is_some()).await;

    store.remove("/backends/auth/k").unwrap();
    eventually("k to leave", || pool.get_service_with_id("auth", "k").is_none()).await;
    assert!(!pool.all_services("auth").contains_key("/backends/auth/k"));
    pool.shutdown().await;
}

#[tokio::test]
async fn test_round_robin_covers_each_endpoint_once() {
    let store = Arc::new(MemoryStore::new());
    let connector = MockConnector::new();
    for i in 0..4 {
        let address = format!("10.0.0.{i}:9000");
        connector.reachable(&address);
        store.put(&format!("/backends/auth/i{i}"), &address).unwrap();
    }
    let pool = start_pool(&test_config(), &store, &connector).await;

    let picked: HashSet<String> = (0..4)
        .map(|_| pool.get_service("auth").unwrap().address().to_string())
        .collect();
    assert_eq!(picked.len(), 4);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_retry_converges_once_reachable() {
    let store = Arc::new(MemoryStore::new());
    store.put("/backends/auth/i1", "10.0.0.1:9000").unwrap();
    let connector = MockConnector::new();
    let pool = start_pool(&test_config(), &store, &connector).await;

    assert!(pool.get_service("auth").is_none());
    assert_eq!(pool.pending_retries(), vec!["/backends/auth/i1".to_string()]);

    assert_eq!(pool.sweep_retries().await.failed, 1);
    connector.reachable("10.0.0.1:9000");
    assert_eq!(pool.sweep_retries().await.recovered, 1);

    assert!(pool.get_service("auth").is_some());
    assert!(pool.get_service_with_id("auth", "i1").is_some());
    assert!(pool.pending_retries().is_empty());
    pool.shutdown().await;
}

#[tokio::test]
async fn test_retry_picks_up_changed_address() {
    let store = Arc::new(MemoryStore::new());
    store.put("/backends/auth/i1", "10.0.0.1:9000").unwrap();
    let connector = MockConnector::new();
    connector.reachable("10.0.0.2:9000");
    let pool = start_pool(&test_config(), &store, &connector).await;
    assert!(pool.get_service("auth").is_none());

    // the watch applies the new address and clears the pending retry
    store.put("/backends/auth/i1", "10.0.0.2:9000").unwrap();
    eventually("new address applied", || pool.get_service("auth").is_some()).await;
    assert_eq!(pool.get_service("auth").unwrap().address(), "10.0.0.2:9000");
    assert!(pool.pending_retries().is_empty());
    pool.shutdown().await;
}

#[tokio::test]
async fn test_retry_exhaustion() {
    let store = Arc::new(MemoryStore::new());
    store.put("/backends/auth/i1", "10.0.0.1:9000").unwrap();
    let connector = MockConnector::new();
    let config = test_config();
    let pool = start_pool(&config, &store, &connector).await;

    for _ in 1..config.retry.max_attempts {
        assert_eq!(pool.sweep_retries().await.failed, 1);
    }
    assert_eq!(pool.sweep_retries().await.given_up, 1);
    assert!(pool.pending_retries().is_empty());
    // bulk load dial plus one per sweep
    assert_eq!(connector.attempts("10.0.0.1:9000"), 1 + config.retry.max_attempts as usize);

    connector.reachable("10.0.0.1:9000");
    assert!(pool.sweep_retries().await.is_empty());
    assert!(pool.get_service("auth").is_none());

    // a fresh store event brings it back
    store.put("/backends/auth/i1", "10.0.0.1:9000").unwrap();
    eventually("fresh event reconnects", || pool.get_service("auth").is_some()).await;
    pool.shutdown().await;
}

#[tokio::test]
async fn test_late_subscriber_replay() {
    let store = Arc::new(MemoryStore::new());
    let connector = MockConnector::new();
    for i in 1..=2 {
        let address = format!("10.0.0.{i}:9000");
        connector.reachable(&address);
        store.put(&format!("/backends/auth/i{i}"), &address).unwrap();
    }
    connector.reachable("10.0.0.3:9000");
    let pool = start_pool(&test_config(), &store, &connector).await;

    let (tx, mut rx) = mpsc::channel(16);
    pool.register_callback("auth", tx);
    let mut replayed = vec![rx.try_recv().unwrap(), rx.try_recv().unwrap()];
    replayed.sort();
    assert_eq!(replayed, vec!["/backends/auth/i1", "/backends/auth/i2"]);

    store.put("/backends/auth/i3", "10.0.0.3:9000").unwrap();
    let arrival = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(arrival, "/backends/auth/i3");
    pool.shutdown().await;
}

#[tokio::test]
async fn test_allow_list_filters_events() {
    let store = Arc::new(MemoryStore::new());
    store.put("/backends/chat/c0", "10.0.1.0:9000").unwrap();
    let connector = MockConnector::new();
    connector.reachable("10.0.0.1:9000");
    connector.reachable("10.0.1.0:9000");
    connector.reachable("10.0.1.1:9000");

    let mut config = test_config();
    config.services.known = vec!["auth".into()];
    let pool = start_pool(&config, &store, &connector).await;

    store.put("/backends/chat/c1", "10.0.1.1:9000").unwrap();
    store.put("/backends/auth/i1", "10.0.0.1:9000").unwrap();
    eventually("auth to arrive", || pool.get_service("auth").is_some()).await;

    assert!(pool.get_service("chat").is_none());
    assert!(!pool.table().contains_service("/backends/chat"));
    assert_eq!(connector.attempts("10.0.1.0:9000"), 0);
    assert_eq!(connector.attempts("10.0.1.1:9000"), 0);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let store = Arc::new(MemoryStore::new());
    let connector = MockConnector::new();
    for i in 0..3 {
        let address = format!("10.0.0.{i}:9000");
        connector.reachable(&address);
        store.put(&format!("/backends/svc{i}/a"), &address).unwrap();
    }
    let pool = start_pool(&test_config(), &store, &connector).await;
    pool.shutdown().await;
    pool.shutdown().await;

    assert!(connector.close_counts().iter().all(|(_, closes)| *closes == 1));
    assert!(pool.get_service("svc0").is_none());
}

#[tokio::test]
async fn test_over_real_tcp() {
    let (addr, accepted) = common::start_tcp_backend().await;
    let store = Arc::new(MemoryStore::new());
    store.put("/backends/echo/e1", &addr).unwrap();

    let pool: TcpServicePool = ServicePool::start(&test_config(), store, TcpConnector::new())
        .await
        .unwrap();
    let channel = pool.get_service("echo").unwrap();
    assert_eq!(channel.address(), addr);
    assert!(!channel.is_closed());
    eventually("backend accepted", || {
        accepted.load(std::sync::atomic::Ordering::SeqCst) == 1
    })
    .await;

    pool.shutdown().await;
    assert!(channel.is_closed());
}
