//! Foreground/background handling.
//!
//! The host application reports its lifecycle on an `mpsc` channel handed to
//! [`ConnectionManager::with_lifecycle`]. Coming to the foreground connects, going to the background disconnects.
//! The observer only holds a weak reference to the manager, so it never keeps it alive and stops on its own once the
//! manager is gone or the sender side of the channel is dropped.
use std::sync::Weak;

use log::*;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    credentials::CredentialStore,
    manager::ConnectionManager,
    refresh::TokenRefresher,
    transport::HubTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppLifecycle {
    Foreground,
    Background,
}

pub fn start_lifecycle_observer<T, C, R>(
    manager: Weak<ConnectionManager<T, C, R>>,
    mut signals: mpsc::Receiver<AppLifecycle>,
) -> JoinHandle<()>
where
    T: HubTransport,
    C: CredentialStore,
    R: TokenRefresher,
{
    tokio::spawn(async move {
        info!("🔌️ Lifecycle observer started");
        while let Some(signal) = signals.recv().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };
            match signal {
                AppLifecycle::Foreground => {
                    debug!("🔌️ App is in the foreground. Connecting.");
                    // Connect in the background so that a later Background signal can cancel a slow connect
                    let epoch = manager.current_epoch();
                    tokio::spawn(async move {
                        if let Err(e) = manager.connect_since(epoch).await {
                            warn!("🔌️ Could not connect after returning to the foreground. {e}");
                        }
                    });
                },
                AppLifecycle::Background => {
                    debug!("🔌️ App is in the background. Disconnecting.");
                    manager.disconnect().await;
                },
            }
        }
        info!("🔌️ Lifecycle observer stopped");
    })
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        credentials::{Credentials, MemoryCredentialStore},
        state::{ConnectionStatus, SyncState},
        test_utils::{prepare_test_env, FakeRefresher, FakeTransport},
    };

    #[tokio::test]
    async fn follows_foreground_and_background() {
        prepare_test_env();
        let transport = FakeTransport::default();
        let store = Arc::new(MemoryCredentialStore::new(Credentials::new("a", "r").with_user_id("u1")));
        let (tx, rx) = mpsc::channel(4);
        let manager = ConnectionManager::new(
            transport.clone(),
            store,
            FakeRefresher::succeeding("a", "r"),
            Arc::new(SyncState::new()),
        )
        .with_lifecycle(rx);
        let manager = Arc::new(manager);
        let mut status = manager.state().subscribe_connection();
        manager.connect().await.unwrap();

        tx.send(AppLifecycle::Background).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| s.status == ConnectionStatus::Disconnected))
            .await
            .unwrap()
            .unwrap();
        assert!(transport.last_connection().unwrap().is_stopped());

        tx.send(AppLifecycle::Foreground).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| s.status == ConnectionStatus::Connected))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transport.start_count(), 2);
    }

    #[tokio::test]
    async fn observer_stops_when_manager_dropped() {
        prepare_test_env();
        let store = Arc::new(MemoryCredentialStore::new(Credentials::new("a", "r")));
        let manager = Arc::new(ConnectionManager::new(
            FakeTransport::default(),
            store,
            FakeRefresher::succeeding("a", "r"),
            Arc::new(SyncState::new()),
        ));
        let (tx, rx) = mpsc::channel(1);
        let observer = start_lifecycle_observer(Arc::downgrade(&manager), rx);
        drop(manager);
        tx.send(AppLifecycle::Foreground).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), observer).await.unwrap().unwrap();
    }
}
