//! End-to-end behaviour of the balance feed, driven through the engine's scripted fakes.
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use balance_feed_engine::{
    events::{EventHandlers, EventHooks},
    normalize,
    test_utils::{prepare_test_env, FakeRefresher, FakeTransport},
    AppLifecycle,
    ConnectionManager,
    ConnectionStatus,
    CredentialStore,
    Credentials,
    HubEvent,
    MemoryCredentialStore,
    RefreshCoordinator,
    RefreshError,
    ReconnectPolicy,
    SyncError,
    SyncState,
    TokenPair,
    TransportError,
};
use serde_json::json;
use tokio::sync::mpsc;

type Manager = ConnectionManager<FakeTransport, MemoryCredentialStore, FakeRefresher>;

fn store() -> Arc<MemoryCredentialStore> {
    Arc::new(MemoryCredentialStore::new(Credentials::new("access-0", "refresh-0").with_account_id("merchant-9")))
}

fn manager(transport: &FakeTransport, refresher: FakeRefresher, store: Arc<MemoryCredentialStore>) -> Manager {
    prepare_test_env();
    ConnectionManager::new(transport.clone(), store, refresher, Arc::new(SyncState::new()))
}

#[test]
fn normalizer_is_total() {
    let cases = [
        (json!(100), 100.0),
        (json!({"balance": 50}), 50.0),
        (json!({"amount": 25}), 25.0),
        (json!({"balance": 1, "amount": 2}), 1.0),
        (json!(null), 0.0),
        (json!("12"), 0.0),
        (json!([1, 2]), 0.0),
        (json!({"balance": "7"}), 0.0),
        (json!({}), 0.0),
    ];
    for (payload, expected) in cases {
        assert_eq!(normalize(&payload), expected, "payload: {payload}");
    }
}

#[tokio::test]
async fn concurrent_connects_share_one_connection() {
    let transport = FakeTransport::default().with_start_delay(Duration::from_millis(50));
    let manager = Arc::new(manager(&transport, FakeRefresher::succeeding("a", "r"), store()));
    let tasks = (0..4)
        .map(|_| {
            let m = Arc::clone(&manager);
            tokio::spawn(async move { m.connect().await })
        })
        .collect::<Vec<_>>();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(transport.start_count(), 1);
    assert_eq!(manager.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn concurrent_refreshes_hit_the_network_once() {
    prepare_test_env();
    let refresher = FakeRefresher::succeeding("access-1", "refresh-1").with_delay(Duration::from_millis(50));
    let calls = refresher.calls();
    let coordinator = Arc::new(RefreshCoordinator::new(store(), refresher));
    let tasks = (0..16)
        .map(|_| {
            let c = Arc::clone(&coordinator);
            tokio::spawn(async move { c.refresh().await })
        })
        .collect::<Vec<_>>();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), TokenPair::new("access-1", "refresh-1"));
    }
    assert_eq!(calls.count(), 1);
}

#[tokio::test]
async fn reconnect_rejoins_with_the_same_entity() {
    let transport = FakeTransport::default();
    let manager = Arc::new(manager(&transport, FakeRefresher::succeeding("a", "r"), store()));
    let mut state = manager.state().subscribe_connection();
    manager.connect().await.unwrap();
    transport.emit(HubEvent::Reconnecting { reason: "network changed".into() }).await;
    transport.emit(HubEvent::Reconnected).await;
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| s.group_id.is_some() && s.status.is_live()))
        .await
        .unwrap()
        .unwrap();
    let connection = transport.last_connection().unwrap();
    let joins = connection.invocations();
    assert_eq!(joins.len(), 2);
    assert!(joins.iter().all(|(method, args)| method == "JoinGroup" && args == &vec![json!("balance-group-merchant-9")]));
}

#[tokio::test(start_paused = true)]
async fn five_attempts_then_exhausted() {
    let transport = FakeTransport::default().always_fail(TransportError::Network("no route to host".into()));
    let manager = Arc::new(manager(&transport, FakeRefresher::succeeding("a", "r"), store()));
    let started = tokio::time::Instant::now();
    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, SyncError::ConnectionExhausted { attempts: 5, .. }), "was {err:?}");
    assert_eq!(transport.start_count(), 5);
    // 1s + 2s + 4s + 8s of backoff, and no pause after the last attempt
    assert_eq!(started.elapsed(), Duration::from_secs(15));
}

#[tokio::test]
async fn rejected_refresh_logs_out_without_retrying() {
    let transport = FakeTransport::default().always_fail(TransportError::Unauthorized(401));
    let store = store();
    let manager = Arc::new(manager(
        &transport,
        FakeRefresher::failing(RefreshError::Rejected("refresh token revoked".into())),
        Arc::clone(&store),
    ));
    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, SyncError::AuthenticationFailed(_)), "was {err:?}");
    assert_eq!(transport.start_count(), 1);
    assert!(!manager.refresh_coordinator().is_refreshing());
    assert!(store.access_token().is_none());
    assert!(store.refresh_token().is_none());
    assert!(store.entity_id().is_none());
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let transport = FakeTransport::default();
    let manager = Arc::new(manager(&transport, FakeRefresher::succeeding("a", "r"), store()));
    manager.disconnect().await;
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    manager.connect().await.unwrap();
    manager.disconnect().await;
    manager.disconnect().await;
    assert_eq!(transport.start_count(), 1);
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.balance, None);
    assert!(!snapshot.connected);
}

#[tokio::test]
async fn hooks_see_balance_and_connection_changes() {
    prepare_test_env();
    let balances = Arc::new(Mutex::new(Vec::new()));
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let mut hooks = EventHooks::default();
    let b = Arc::clone(&balances);
    hooks.on_balance_updated(move |ev| {
        let b = Arc::clone(&b);
        Box::pin(async move {
            b.lock().unwrap().push(ev.balance);
        })
    });
    let s = Arc::clone(&statuses);
    hooks.on_connection_changed(move |ev| {
        let s = Arc::clone(&s);
        Box::pin(async move {
            s.lock().unwrap().push(ev.status);
        })
    });
    let handlers = EventHandlers::new(8, hooks);
    let producers = handlers.producers();
    handlers.start_handlers().await;

    let transport = FakeTransport::default();
    let manager = Arc::new(manager(&transport, FakeRefresher::succeeding("a", "r"), store()).with_event_producers(producers));
    manager.connect().await.unwrap();
    transport.emit(HubEvent::Invocation { target: "ReceiveBalance".into(), payload: json!(3) }).await;
    transport.emit(HubEvent::Invocation { target: "BalanceUpdated".into(), payload: json!({"balance": 4}) }).await;
    let mut snapshot = manager.subscribe();
    tokio::time::timeout(Duration::from_secs(2), snapshot.wait_for(|s| s.balance == Some(4.0))).await.unwrap().unwrap();
    manager.disconnect().await;

    for _ in 0..100 {
        if statuses.lock().unwrap().last() == Some(&ConnectionStatus::Disconnected) && balances.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*balances.lock().unwrap(), vec![3.0, 4.0]);
    assert_eq!(*statuses.lock().unwrap(), vec![
        ConnectionStatus::Connecting,
        ConnectionStatus::Connected,
        ConnectionStatus::Disconnected
    ]);
}

#[tokio::test]
async fn lifecycle_signals_drive_the_connection() {
    let transport = FakeTransport::default();
    let (lifecycle, signals) = mpsc::channel(4);
    let manager = Arc::new(
        manager(&transport, FakeRefresher::succeeding("a", "r"), store())
            .with_policy(ReconnectPolicy { max_attempts: 2, ..Default::default() })
            .with_lifecycle(signals),
    );
    let mut state = manager.state().subscribe_connection();
    manager.start().await.unwrap();

    lifecycle.send(AppLifecycle::Background).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| s.status == ConnectionStatus::Disconnected))
        .await
        .unwrap()
        .unwrap();
    lifecycle.send(AppLifecycle::Foreground).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| s.status == ConnectionStatus::Connected))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transport.start_count(), 2);
    manager.stop().await;
}
