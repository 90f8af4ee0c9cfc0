//! Balance Feed Engine
//!
//! The engine keeps a merchant's balance in sync with the server over a persistent push connection (a hub). It is
//! transport-agnostic: anything that implements [`HubTransport`] can carry the events, and the concrete SignalR
//! transport lives in the `balance_feed_client` crate.
//!
//! The library is divided into a few small pieces:
//! 1. Credentials and token refresh ([`mod@credentials`], [`mod@refresh`]). The engine never owns the user's session;
//!    it reads tokens from a [`CredentialStore`] and asks a [`TokenRefresher`] for a new pair when the hub rejects the
//!    current one. Concurrent refreshes are collapsed into one by the [`RefreshCoordinator`].
//! 2. The [`ConnectionManager`], which owns the single live connection, retries with backoff, joins the balance group
//!    and pumps hub events into the published [`SyncState`].
//! 3. Published state ([`mod@state`]) and the [`normalize`] function that turns any balance payload into a number.
//!
//! Consumers either read the [`SyncState`] directly (it is backed by `tokio::sync::watch` channels) or register
//! async hooks through [`events::EventHooks`] to react to balance and connection changes.
pub mod credentials;
pub mod errors;
pub mod events;
pub mod groups;
pub mod lifecycle;
pub mod manager;
pub mod normalizer;
pub mod refresh;
pub mod state;
pub mod transport;

#[cfg(any(feature = "test_utils", test))]
pub mod test_utils;

pub use credentials::{CredentialStore, Credentials, MemoryCredentialStore, TokenPair};
pub use errors::{RefreshError, SyncError, TransportError};
pub use lifecycle::AppLifecycle;
pub use manager::{ConnectionManager, ReconnectPolicy};
pub use normalizer::{is_balance_event, normalize, BALANCE_EVENTS};
pub use refresh::{token_factory, RefreshCoordinator, TokenRefresher};
pub use state::{BalanceSnapshot, ConnectionState, ConnectionStatus, SyncState};
pub use transport::{AccessTokenFactory, HubConnection, HubEvent, HubTransport};
