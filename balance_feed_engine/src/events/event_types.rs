use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::state::ConnectionStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceUpdatedEvent {
    /// The time the event was received from the hub
    pub received_at: DateTime<Utc>,
    /// The hub event that carried the balance, e.g. `ReceiveBalance`
    pub event_name: String,
    /// The normalized balance
    pub balance: f64,
    pub raw_payload: Value,
}

impl BalanceUpdatedEvent {
    pub fn new(event_name: &str, balance: f64, raw_payload: Value) -> Self {
        Self { received_at: Utc::now(), event_name: event_name.to_string(), balance, raw_payload }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionChangedEvent {
    pub status: ConnectionStatus,
    pub group_id: Option<String>,
    pub reason: Option<String>,
}

impl ConnectionChangedEvent {
    pub fn new(status: ConnectionStatus) -> Self {
        Self { status, group_id: None, reason: None }
    }

    pub fn with_group(mut self, group_id: Option<String>) -> Self {
        self.group_id = group_id;
        self
    }
}
