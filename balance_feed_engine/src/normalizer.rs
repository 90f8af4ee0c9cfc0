//! Converts balance event payloads into a single number.
//!
//! The server has sent balances in a few shapes over time: a bare number, `{"balance": n}`, and `{"amount": n}`. All
//! of them are accepted. Anything else is logged and read as zero, so a malformed event can never stop the feed.
use log::*;
use serde_json::Value;

/// Hub events that carry a balance. They are all handled identically.
pub const BALANCE_EVENTS: [&str; 3] = ["ReceiveBalance", "BalanceUpdated", "balanceReceived"];

pub fn is_balance_event(name: &str) -> bool {
    BALANCE_EVENTS.contains(&name)
}

/// Extracts the balance from `payload`. Total: every input yields a finite number.
///
/// When a record has both `balance` and `amount`, `balance` wins.
pub fn normalize(payload: &Value) -> f64 {
    if let Some(n) = finite(payload) {
        return n;
    }
    if let Some(record) = payload.as_object() {
        for field in ["balance", "amount"] {
            if let Some(n) = record.get(field).and_then(finite) {
                return n;
            }
        }
    }
    warn!("💰️ Unrecognised balance payload, using 0 instead: {}", truncated(payload));
    0.0
}

fn finite(value: &Value) -> Option<f64> {
    value.as_f64().filter(|n| n.is_finite())
}

fn truncated(payload: &Value) -> String {
    const MAX_LEN: usize = 200;
    let s = payload.to_string();
    if s.chars().count() > MAX_LEN {
        format!("{}...", s.chars().take(MAX_LEN).collect::<String>())
    } else {
        s
    }
}
