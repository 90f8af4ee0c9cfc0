//! # Balance feed client
//!
//! The concrete pieces that plug into the [`balance_feed_engine`]:
//! * [`hub::SignalRTransport`], a SignalR (JSON protocol over WebSockets) implementation of the engine's transport.
//! * [`refresh_client::HttpTokenRefresher`], which exchanges refresh tokens with the auth service.
//! * [`config::ClientConfig`], the environment-driven configuration, and the `balance_feed` command line.
//!
//! ## Configuration
//! The client is configured via `BFEED_*` environment variables. See [config](config/index.html) for more
//! information, or run `balance_feed env`.
pub mod cli;
pub mod config;
pub mod errors;
pub mod hub;
pub mod refresh_client;

pub use config::ClientConfig;
pub use errors::ConfigError;
pub use hub::{HubOptions, SignalRConnection, SignalRTransport};
pub use refresh_client::HttpTokenRefresher;
