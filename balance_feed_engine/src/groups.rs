//! Balance group membership.
//!
//! The server only pushes a merchant's balance to the group named after their entity id. Membership is best-effort:
//! a failed join only delays updates until the next (re)connect, so failures are logged here and never returned.
use log::*;
use serde_json::Value;

use crate::{errors::SyncError, transport::HubConnection};

pub const GROUP_PREFIX: &str = "balance-group-";
pub const JOIN_GROUP: &str = "JoinGroup";
pub const LEAVE_GROUP: &str = "LeaveGroup";

pub fn group_name(entity_id: &str) -> String {
    format!("{GROUP_PREFIX}{entity_id}")
}

/// Joins the balance group for `entity_id`. Returns the group name if the hub accepted the join.
pub async fn join<H: HubConnection>(connection: &H, entity_id: &str) -> Option<String> {
    let group = group_name(entity_id);
    match invoke(connection, JOIN_GROUP, "join", &group).await {
        Ok(()) => {
            info!("👥️ Joined {group}");
            Some(group)
        },
        Err(e) => {
            warn!("👥️ {e}");
            None
        },
    }
}

pub async fn leave<H: HubConnection>(connection: &H, entity_id: &str) -> bool {
    leave_group(connection, &group_name(entity_id)).await
}

/// Leaves a group by its full name, e.g. the one recorded in the connection state.
pub async fn leave_group<H: HubConnection>(connection: &H, group: &str) -> bool {
    match invoke(connection, LEAVE_GROUP, "leave", group).await {
        Ok(()) => {
            info!("👥️ Left {group}");
            true
        },
        Err(e) => {
            warn!("👥️ {e}");
            false
        },
    }
}

async fn invoke<H: HubConnection>(
    connection: &H,
    method: &str,
    action: &'static str,
    group: &str,
) -> Result<(), SyncError> {
    connection.invoke(method, vec![Value::String(group.to_string())]).await.map_err(|e| {
        SyncError::GroupOperationError { action, group: group.to_string(), reason: e.to_string() }
    })
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::{errors::TransportError, test_utils::FakeConnection};

    #[tokio::test]
    async fn join_and_leave_use_group_name() {
        let conn = FakeConnection::default();
        assert_eq!(join(&conn, "acct-42").await.as_deref(), Some("balance-group-acct-42"));
        assert!(leave(&conn, "acct-42").await);
        assert_eq!(
            conn.invocations(),
            vec![
                ("JoinGroup".to_string(), vec![json!("balance-group-acct-42")]),
                ("LeaveGroup".to_string(), vec![json!("balance-group-acct-42")]),
            ]
        );
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let conn = FakeConnection::default();
        conn.fail_invocations(TransportError::Invocation("hub error".into()));
        assert_eq!(join(&conn, "acct-42").await, None);
        assert!(!leave_group(&conn, "balance-group-acct-42").await);
        assert_eq!(conn.invocations().len(), 2);
    }
}
