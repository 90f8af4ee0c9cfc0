//! Published sync state.
//!
//! [`SyncState`] holds two observable values: the [`ConnectionState`] owned by the connection manager, and the
//! [`BalanceSnapshot`] that screens render. Both live in `tokio::sync::watch` channels so any number of readers can
//! subscribe. Every mutation goes through `send_modify`/`send_if_modified`, so the check and the write happen together.
use std::fmt::Display;

use log::*;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::normalizer::normalize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionStatus {
    /// True while a group membership can be valid.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connected | Self::Reconnecting)
    }
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// The balance group this connection has joined. Only set after a successful join while the connection is live.
    pub group_id: Option<String>,
}

/// What the UI shows. `connected == false` means "stale balance", never a blocking error.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BalanceSnapshot {
    pub balance: Option<f64>,
    /// The last payload received, kept for diagnostics.
    pub raw_payload: Option<Value>,
    pub connected: bool,
}

impl BalanceSnapshot {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug)]
pub struct SyncState {
    connection: watch::Sender<ConnectionState>,
    balance: watch::Sender<BalanceSnapshot>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncState {
    pub fn new() -> Self {
        let (connection, _) = watch::channel(ConnectionState::default());
        let (balance, _) = watch::channel(BalanceSnapshot::default());
        Self { connection, balance }
    }

    pub fn snapshot(&self) -> BalanceSnapshot {
        self.balance.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BalanceSnapshot> {
        self.balance.subscribe()
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.borrow().status
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// Moves to `status` and mirrors it into the snapshot's `connected` flag. Leaving the live states drops the group.
    /// Returns false if the status was already `status`.
    pub fn set_status(&self, status: ConnectionStatus) -> bool {
        let changed = self.connection.send_if_modified(|state| {
            if state.status == status {
                return false;
            }
            trace!("🔌️ Connection status {} -> {status}", state.status);
            state.status = status;
            if !status.is_live() {
                state.group_id = None;
            }
            true
        });
        let connected = status == ConnectionStatus::Connected;
        self.balance.send_if_modified(|snapshot| {
            let modified = snapshot.connected != connected;
            snapshot.connected = connected;
            modified
        });
        changed
    }

    /// Records the joined group. Ignored (returns false) unless the connection is live.
    pub fn set_group(&self, group_id: Option<String>) -> bool {
        self.connection.send_if_modified(|state| {
            if group_id.is_some() && !state.status.is_live() {
                debug!("👥️ Not recording group membership while {}", state.status);
                return false;
            }
            if state.group_id == group_id {
                return false;
            }
            state.group_id = group_id;
            true
        })
    }

    /// Normalizes `payload` and publishes it as the current balance. Returns the normalized value.
    pub fn apply_balance(&self, payload: Value) -> f64 {
        let balance = normalize(&payload);
        self.balance.send_modify(|snapshot| {
            snapshot.balance = Some(balance);
            snapshot.raw_payload = Some(payload);
        });
        balance
    }

    /// Back to the initial state: disconnected, no group, no balance. Returns false (and notifies nobody) if the state
    /// was already initial.
    pub fn reset(&self) -> bool {
        let connection = self.connection.send_if_modified(|state| {
            let modified = *state != ConnectionState::default();
            *state = ConnectionState::default();
            modified
        });
        let balance = self.balance.send_if_modified(|snapshot| {
            let modified = !snapshot.is_empty();
            *snapshot = BalanceSnapshot::default();
            modified
        });
        connection || balance
    }
}
