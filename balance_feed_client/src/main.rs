use std::sync::Arc;

use anyhow::{anyhow, Result};
use balance_feed_client::{
    cli::{display_envs, normalize_payload, Arguments, Command},
    ClientConfig,
    HttpTokenRefresher,
    SignalRTransport,
};
use balance_feed_engine::{
    events::{EventHandlers, EventHooks},
    AppLifecycle,
    ConnectionManager,
    CredentialStore,
    MemoryCredentialStore,
    RefreshCoordinator,
    SyncState,
};
use clap::Parser;
use dotenvy::dotenv;
use log::*;
use tokio::sync::mpsc;

const EVENT_BUFFER: usize = 32;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::init();
    let args = Arguments::parse();
    match args.command {
        Command::Watch => watch(ClientConfig::from_env_or_default()).await,
        Command::Refresh => refresh_once(ClientConfig::from_env_or_default()).await,
        Command::Normalize { payload } => {
            println!("{}", normalize_payload(&payload));
            Ok(())
        },
        Command::Env => {
            display_envs();
            Ok(())
        },
    }
}

async fn watch(config: ClientConfig) -> Result<()> {
    let store = Arc::new(MemoryCredentialStore::new(config.credentials()));
    let refresher = HttpTokenRefresher::new(config.auth_url.clone())?;
    let transport = SignalRTransport::new(config.hub_options())?;

    let mut hooks = EventHooks::default();
    hooks.on_balance_updated(|ev| {
        Box::pin(async move {
            println!("{} 💰️ {} via {}", ev.received_at.format("%H:%M:%S"), ev.balance, ev.event_name);
        })
    });
    hooks.on_connection_changed(|ev| {
        Box::pin(async move {
            let group = ev.group_id.map(|g| format!(" ({g})")).unwrap_or_default();
            let reason = ev.reason.map(|r| format!(". {r}")).unwrap_or_default();
            println!("🔌️ {}{group}{reason}", ev.status);
        })
    });
    let handlers = EventHandlers::new(EVENT_BUFFER, hooks);
    let producers = handlers.producers();
    handlers.start_handlers().await;

    let (lifecycle, signals) = mpsc::channel(4);
    let manager = ConnectionManager::new(transport, store, refresher, Arc::new(SyncState::new()))
        .with_policy(config.policy)
        .with_event_producers(producers)
        .with_event_buffer(EVENT_BUFFER)
        .with_lifecycle(signals);
    let manager = Arc::new(manager);
    forward_lifecycle_signals(lifecycle)?;

    info!("🚀️ Starting the balance feed for {}", config.hub_url);
    manager.start().await?;
    tokio::signal::ctrl_c().await?;
    info!("🚀️ Shutting down");
    manager.stop().await;
    let snapshot = manager.snapshot();
    debug!("💰️ Final snapshot: {snapshot:?}");
    Ok(())
}

async fn refresh_once(config: ClientConfig) -> Result<()> {
    let store = Arc::new(MemoryCredentialStore::new(config.credentials()));
    let refresher = HttpTokenRefresher::new(config.auth_url.clone())?;
    let coordinator = RefreshCoordinator::new(Arc::clone(&store), refresher);
    let pair = coordinator.refresh().await.map_err(|e| anyhow!("Token refresh failed. {e}"))?;
    println!("Access token:  {}", pair.access_token.hint(8));
    println!("Refresh token: {}", pair.refresh_token.hint(8));
    debug!("🔑️ Store updated: {}", store.access_token().is_some());
    Ok(())
}

/// SIGUSR1 moves the feed to the background, SIGUSR2 brings it back to the foreground.
#[cfg(unix)]
fn forward_lifecycle_signals(lifecycle: mpsc::Sender<AppLifecycle>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut background = signal(SignalKind::user_defined1())?;
    let mut foreground = signal(SignalKind::user_defined2())?;
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                Some(()) = background.recv() => AppLifecycle::Background,
                Some(()) = foreground.recv() => AppLifecycle::Foreground,
                else => break,
            };
            info!("🚀️ Lifecycle signal: {next:?}");
            if lifecycle.send(next).await.is_err() {
                break;
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn forward_lifecycle_signals(lifecycle: mpsc::Sender<AppLifecycle>) -> Result<()> {
    debug!("🚀️ Lifecycle signals are only available on unix");
    drop(lifecycle);
    Ok(())
}
