//! A SignalR client that implements the engine's [`balance_feed_engine::HubTransport`].
//!
//! Only the WebSocket transport and the JSON hub protocol are supported.
mod connection;
pub mod negotiate;
pub mod protocol;

pub use connection::{
    default_reconnect_delays,
    HubOptions,
    SignalRConnection,
    SignalRTransport,
    DEFAULT_INVOKE_TIMEOUT,
    DEFAULT_KEEP_ALIVE,
};
