//! In-memory stand-ins for the auth service and the hub, for driving the engine in tests.
mod fake_refresher;
mod fake_transport;
mod prepare_env;

pub use fake_refresher::{FakeRefresher, RefreshCalls};
pub use fake_transport::{FakeConnection, FakeTransport};
pub use prepare_env::prepare_test_env;
