//! The connection lifecycle manager.
//!
//! [`ConnectionManager`] owns the one live hub connection of the process. It establishes the connection (retrying
//! with exponential backoff, refreshing the access token when the hub rejects it), joins the merchant's balance group,
//! and runs an event pump that feeds hub events into the published [`SyncState`].
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Reconnecting
//!                     |             |              |
//!                     +-------------+--------------+--> Disconnected
//! ```
//!
//! Errors from an explicit [`ConnectionManager::connect`] are returned to the caller. Problems after that (drops,
//! reconnects, failed group joins) only show up as state changes.
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex as StdMutex,
        PoisonError,
    },
    time::Duration,
};

use log::*;
use tokio::{
    sync::{mpsc, watch, Mutex, Notify},
    task::JoinHandle,
};

use crate::{
    credentials::CredentialStore,
    errors::SyncError,
    events::{BalanceUpdatedEvent, ConnectionChangedEvent, EventProducers},
    groups,
    lifecycle::{start_lifecycle_observer, AppLifecycle},
    normalizer::is_balance_event,
    refresh::{token_factory, RefreshCoordinator, TokenRefresher},
    state::{BalanceSnapshot, ConnectionStatus, SyncState},
    transport::{HubConnection, HubEvent, HubTransport},
};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_EVENT_BUFFER: usize = 64;

/// How hard `connect()` tries before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_attempts: DEFAULT_MAX_ATTEMPTS, base_delay: DEFAULT_BASE_DELAY, max_delay: DEFAULT_MAX_DELAY }
    }
}

impl ReconnectPolicy {
    /// The pause after the `failures`-th failed attempt: `base * 2^(failures - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent).min(self.max_delay)
    }
}

struct LiveConnection<H> {
    id: u64,
    handle: Arc<H>,
    pump: JoinHandle<()>,
}

type ConnectionSlot<H> = Arc<Mutex<Option<LiveConnection<H>>>>;

pub struct ConnectionManager<T, C, R>
where
    T: HubTransport,
    C: CredentialStore,
    R: TokenRefresher,
{
    transport: T,
    credentials: Arc<C>,
    refresher: Arc<RefreshCoordinator<C, R>>,
    state: Arc<SyncState>,
    policy: ReconnectPolicy,
    producers: EventProducers,
    event_buffer: usize,
    slot: ConnectionSlot<T::Connection>,
    connect_lock: Mutex<()>,
    cancel_epoch: AtomicU64,
    cancelled: Notify,
    next_id: AtomicU64,
    lifecycle: StdMutex<Option<mpsc::Receiver<AppLifecycle>>>,
    observer: StdMutex<Option<JoinHandle<()>>>,
}

impl<T, C, R> ConnectionManager<T, C, R>
where
    T: HubTransport,
    C: CredentialStore,
    R: TokenRefresher,
{
    pub fn new(transport: T, credentials: Arc<C>, refresher: R, state: Arc<SyncState>) -> Self {
        let refresher = Arc::new(RefreshCoordinator::new(Arc::clone(&credentials), refresher));
        Self {
            transport,
            credentials,
            refresher,
            state,
            policy: ReconnectPolicy::default(),
            producers: EventProducers::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
            slot: Arc::new(Mutex::new(None)),
            connect_lock: Mutex::new(()),
            cancel_epoch: AtomicU64::new(0),
            cancelled: Notify::new(),
            next_id: AtomicU64::new(1),
            lifecycle: StdMutex::new(None),
            observer: StdMutex::new(None),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_event_producers(mut self, producers: EventProducers) -> Self {
        self.producers = producers;
        self
    }

    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size.max(1);
        self
    }

    /// Foreground/background transitions to follow once the manager has been started.
    pub fn with_lifecycle(self, signals: mpsc::Receiver<AppLifecycle>) -> Self {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) = Some(signals);
        self
    }

    pub fn state(&self) -> &Arc<SyncState> {
        &self.state
    }

    pub fn snapshot(&self) -> BalanceSnapshot {
        self.state.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<BalanceSnapshot> {
        self.state.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    pub fn refresh_coordinator(&self) -> &Arc<RefreshCoordinator<C, R>> {
        &self.refresher
    }

    pub async fn has_live_connection(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Starts the balance feed. Same as [`Self::connect`].
    pub async fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        self.connect().await
    }

    /// Stops the balance feed. Same as [`Self::disconnect`].
    pub async fn stop(&self) {
        self.disconnect().await
    }

    /// Establishes the hub connection, unless one already exists.
    ///
    /// Concurrent calls are serialized, and every call after the first one that succeeded returns immediately, so at
    /// most one transport connection is ever live. A [`Self::disconnect`] issued while this is retrying makes it
    /// return `Ok(())` without connecting.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SyncError> {
        let epoch = self.current_epoch();
        self.ensure_lifecycle_observer();
        self.connect_since(epoch).await
    }

    /// Connects unless a disconnect has happened since `epoch` was read.
    pub(crate) async fn connect_since(&self, epoch: u64) -> Result<(), SyncError> {
        let _guard = self.connect_lock.lock().await;
        if self.is_cancelled(epoch) {
            debug!("🔌️ Connect request superseded by a disconnect");
            return Ok(());
        }
        if self.has_live_connection().await {
            debug!("🔌️ Already connected to the balance hub");
            return Ok(());
        }
        self.set_status(ConnectionStatus::Connecting, None).await;
        let result = self.establish(epoch).await;
        if result.is_err() || !self.has_live_connection().await {
            self.set_status(ConnectionStatus::Disconnected, None).await;
        }
        result
    }

    async fn establish(&self, epoch: u64) -> Result<(), SyncError> {
        let mut failures = 0u32;
        let mut refreshed = false;
        loop {
            if self.is_cancelled(epoch) {
                info!("🔌️ Connect cancelled");
                return Ok(());
            }
            if self.credentials.access_token().filter(|t| !t.is_empty()).is_none() {
                warn!("🔌️ Cannot connect to the balance hub without an access token");
                return Err(SyncError::AuthError);
            }
            info!("🔌️ Connecting to the balance hub (attempt {}/{})", failures + 1, self.policy.max_attempts);
            let (sender, events) = mpsc::channel(self.event_buffer);
            match self.transport.start(token_factory(Arc::clone(&self.refresher)), sender).await {
                Ok(connection) => {
                    if self.is_cancelled(epoch) {
                        info!("🔌️ Connect cancelled while the connection was being set up. Closing it.");
                        connection.stop().await;
                        return Ok(());
                    }
                    self.install(connection, events, epoch).await;
                    return Ok(());
                },
                Err(e) if e.is_auth_error() => {
                    if refreshed {
                        error!("🔑️ The hub rejected a freshly refreshed token. Logging out. {e}");
                        self.credentials.logout();
                        return Err(SyncError::AuthenticationFailed(e.to_string()));
                    }
                    warn!("🔑️ The hub rejected the access token. Refreshing it. {e}");
                    match self.refresher.refresh().await {
                        Ok(_) => refreshed = true,
                        Err(refresh_err) => {
                            error!("🔑️ Could not refresh the access token. Logging out. {refresh_err}");
                            self.credentials.logout();
                            return Err(SyncError::AuthenticationFailed(refresh_err.to_string()));
                        },
                    }
                },
                Err(e) => {
                    failures += 1;
                    if failures >= self.policy.max_attempts {
                        error!("🔌️ Giving up on the balance hub after {failures} attempts. {e}");
                        return Err(SyncError::ConnectionExhausted { attempts: failures, last_error: e });
                    }
                    let delay = self.policy.delay_for(failures);
                    warn!("🔌️ Connection attempt {failures} failed. Retrying in {}ms. {e}", delay.as_millis());
                    if !self.sleep_unless_cancelled(delay, epoch).await {
                        info!("🔌️ Connect cancelled during backoff");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn install(&self, connection: T::Connection, events: mpsc::Receiver<HubEvent>, epoch: u64) {
        let handle = Arc::new(connection);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            // The pump is started while the slot is held, so it can never see its own connection missing from it
            let mut slot = self.slot.lock().await;
            // disconnect() bumps the epoch before it takes the slot
            if self.is_cancelled(epoch) {
                drop(slot);
                info!("🔌️ Connect cancelled just before the connection was installed. Closing it.");
                handle.stop().await;
                return;
            }
            self.state.set_status(ConnectionStatus::Connected);
            let pump = EventPump {
                id,
                handle: Arc::clone(&handle),
                credentials: Arc::clone(&self.credentials),
                state: Arc::clone(&self.state),
                slot: Arc::clone(&self.slot),
                producers: self.producers.clone(),
            };
            let pump = tokio::spawn(pump.run(events));
            *slot = Some(LiveConnection { id, handle: Arc::clone(&handle), pump });
        }
        info!("🔌️ Connected to the balance hub (connection #{id})");
        let group = match self.credentials.entity_id() {
            Some(entity_id) => groups::join(handle.as_ref(), &entity_id).await,
            None => {
                warn!("👥️ No entity id is known for this session. Balance updates will not be delivered.");
                None
            },
        };
        // The join is a round trip, so a disconnect may have replaced or removed this connection in the meantime.
        // Holding the slot until Connected is published keeps a racing disconnect's event after this one.
        let slot = self.slot.lock().await;
        if !slot.as_ref().is_some_and(|live| live.id == id) {
            debug!("🔌️ Connection #{id} was torn down while joining its group");
            return;
        }
        if group.is_some() {
            self.state.set_group(group.clone());
        }
        let event = ConnectionChangedEvent::new(ConnectionStatus::Connected).with_group(group);
        self.producers.publish_connection_changed(event).await;
    }

    /// Tears down the live connection and resets the published state. Without a connection this only clears what a
    /// server-closed connection left behind, which is nothing on a fresh manager.
    ///
    /// Also cancels a `connect()` that is still retrying.
    pub async fn disconnect(&self) {
        self.cancel_epoch.fetch_add(1, Ordering::SeqCst);
        self.cancelled.notify_waiters();
        let live = self.slot.lock().await.take();
        let Some(live) = live else {
            if self.state.reset() {
                debug!("💰️ Cleared the balance left by a closed connection");
            } else {
                debug!("🔌️ Disconnect requested, but there is no live connection");
            }
            return;
        };
        live.pump.abort();
        if let Some(group) = self.state.connection().group_id {
            groups::leave_group(live.handle.as_ref(), &group).await;
        }
        live.handle.stop().await;
        self.state.reset();
        info!("🔌️ Disconnected from the balance hub (connection #{})", live.id);
        self.producers.publish_connection_changed(ConnectionChangedEvent::new(ConnectionStatus::Disconnected)).await;
    }

    pub(crate) fn current_epoch(&self) -> u64 {
        self.cancel_epoch.load(Ordering::SeqCst)
    }

    fn is_cancelled(&self, epoch: u64) -> bool {
        self.current_epoch() != epoch
    }

    /// Returns false if a disconnect happened before `delay` elapsed.
    async fn sleep_unless_cancelled(&self, delay: Duration, epoch: u64) -> bool {
        let notified = self.cancelled.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled(epoch) {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.is_cancelled(epoch),
            _ = notified => false,
        }
    }

    async fn set_status(&self, status: ConnectionStatus, reason: Option<String>) {
        if self.state.set_status(status) {
            let mut event = ConnectionChangedEvent::new(status);
            event.reason = reason;
            self.producers.publish_connection_changed(event).await;
        }
    }

    fn ensure_lifecycle_observer(self: &Arc<Self>) {
        let signals = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(signals) = signals {
            let handle = start_lifecycle_observer(Arc::downgrade(self), signals);
            *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }
    }
}

impl<T, C, R> Drop for ConnectionManager<T, C, R>
where
    T: HubTransport,
    C: CredentialStore,
    R: TokenRefresher,
{
    fn drop(&mut self) {
        if let Some(observer) = self.observer.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            observer.abort();
        }
        if let Some(live) = self.slot.try_lock().ok().and_then(|mut slot| slot.take()) {
            live.pump.abort();
        }
    }
}

/// Applies the events of one connection to the shared state, one at a time, in delivery order.
struct EventPump<H, C> {
    id: u64,
    handle: Arc<H>,
    credentials: Arc<C>,
    state: Arc<SyncState>,
    slot: ConnectionSlot<H>,
    producers: EventProducers,
}

impl<H, C> EventPump<H, C>
where
    H: HubConnection,
    C: CredentialStore,
{
    async fn run(self, mut events: mpsc::Receiver<HubEvent>) {
        trace!("🔌️ Event pump for connection #{} started", self.id);
        while let Some(event) = events.recv().await {
            match event {
                HubEvent::Invocation { target, payload } => self.on_invocation(target, payload).await,
                HubEvent::Reconnecting { reason } => {
                    warn!("🔌️ Lost the balance hub. Reconnecting. {reason}");
                    self.set_status(ConnectionStatus::Reconnecting, Some(reason)).await;
                },
                HubEvent::Reconnected => self.on_reconnected().await,
                HubEvent::Closed { reason } => {
                    let why = reason.as_deref().unwrap_or("No reason given");
                    warn!("🔌️ The balance hub connection closed. {why}");
                    self.release().await;
                    self.set_status(ConnectionStatus::Disconnected, reason).await;
                    break;
                },
            }
        }
        trace!("🔌️ Event pump for connection #{} stopped", self.id);
    }

    async fn on_invocation(&self, target: String, payload: serde_json::Value) {
        if !is_balance_event(&target) {
            debug!("🔌️ Ignoring hub event {target}");
            return;
        }
        let balance = self.state.apply_balance(payload.clone());
        debug!("💰️ {target}: balance is now {balance}");
        self.producers.publish_balance_updated(BalanceUpdatedEvent::new(&target, balance, payload)).await;
    }

    async fn on_reconnected(&self) {
        info!("🔌️ Reconnected to the balance hub");
        // Server-side membership does not survive the reconnect
        self.state.set_group(None);
        self.set_status(ConnectionStatus::Connected, None).await;
        match self.credentials.entity_id() {
            Some(entity_id) => {
                if let Some(group) = groups::join(self.handle.as_ref(), &entity_id).await {
                    self.state.set_group(Some(group));
                }
            },
            None => warn!("👥️ No entity id is known after reconnecting. Not rejoining the balance group."),
        }
    }

    async fn set_status(&self, status: ConnectionStatus, reason: Option<String>) {
        if self.state.set_status(status) {
            let mut event = ConnectionChangedEvent::new(status).with_group(self.state.connection().group_id);
            event.reason = reason;
            self.producers.publish_connection_changed(event).await;
        }
    }

    /// Frees the slot if it still holds this pump's connection.
    async fn release(&self) {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|live| live.id == self.id) {
            // Dropping the JoinHandle detaches this task rather than aborting it
            let _ = slot.take();
        }
    }
}
