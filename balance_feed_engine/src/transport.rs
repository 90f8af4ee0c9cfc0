//! The seam between the engine and a concrete push transport.
//!
//! A transport establishes a duplex connection to the hub, delivers server-pushed events on the channel it is given,
//! reconnects by itself after transient drops (reporting that through [`HubEvent`]s), and lets the engine invoke hub
//! methods such as `JoinGroup`.
use std::{future::Future, pin::Pin, sync::Arc};

use bf_common::Secret;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::TransportError;

pub type TokenFuture = Pin<Box<dyn Future<Output = Result<Secret<String>, TransportError>> + Send>>;

/// Lazily supplies the bearer token for each (re)connect attempt. Pass the token the hub just rejected, if any, to
/// force a refresh. See [`crate::token_factory`].
pub type AccessTokenFactory = Arc<dyn Fn(Option<Secret<String>>) -> TokenFuture + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// The server invoked `target` on the client. `payload` is the first argument, or `Null` if there was none.
    Invocation { target: String, payload: Value },
    /// The connection dropped and the transport is trying to restore it.
    Reconnecting { reason: String },
    Reconnected,
    /// The transport gave up, or the server closed the connection for good.
    Closed { reason: Option<String> },
}

pub trait HubConnection: Send + Sync + 'static {
    /// Invokes a hub method and waits for the server to acknowledge it.
    fn invoke(&self, method: &str, args: Vec<Value>) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Stops the connection. No further events are delivered, and no `Closed` event is emitted for an explicit stop.
    fn stop(&self) -> impl Future<Output = ()> + Send;
}

pub trait HubTransport: Send + Sync + 'static {
    type Connection: HubConnection;

    /// Opens a connection. Events for its whole lifetime, including automatic reconnects, go to `events`.
    ///
    /// Errors with 401/403 semantics must be reported as [`TransportError::Unauthorized`].
    fn start(
        &self,
        tokens: AccessTokenFactory,
        events: mpsc::Sender<HubEvent>,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}
