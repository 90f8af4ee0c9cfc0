use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    errors::TransportError,
    transport::{AccessTokenFactory, HubConnection, HubEvent, HubTransport},
};

/// A hub connection that records every invocation.
#[derive(Clone, Default)]
pub struct FakeConnection {
    inner: Arc<ConnectionInner>,
}

#[derive(Default)]
struct ConnectionInner {
    invocations: Mutex<Vec<(String, Vec<Value>)>>,
    failure: Mutex<Option<TransportError>>,
    delay: Mutex<Option<Duration>>,
    stopped: AtomicBool,
}

impl FakeConnection {
    pub fn invocations(&self) -> Vec<(String, Vec<Value>)> {
        self.inner.invocations.lock().unwrap().clone()
    }

    /// Every invocation from now on is recorded, then fails with `error`.
    pub fn fail_invocations(&self, error: TransportError) {
        *self.inner.failure.lock().unwrap() = Some(error);
    }

    /// Every invocation from now on takes `delay` to complete.
    pub fn delay_invocations(&self, delay: Duration) {
        *self.inner.delay.lock().unwrap() = Some(delay);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl HubConnection for FakeConnection {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<(), TransportError> {
        self.inner.invocations.lock().unwrap().push((method.to_string(), args));
        let delay = *self.inner.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.inner.failure.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }
}

/// A scripted [`HubTransport`].
///
/// Each `start` asks the token factory for a token, then consumes the next scripted failure, if any. Without a script
/// it connects, unless [`FakeTransport::always_fail`] was set. Tests push hub events into the latest connection with
/// [`FakeTransport::emit`].
#[derive(Clone, Default)]
pub struct FakeTransport {
    inner: Arc<TransportInner>,
}

#[derive(Default)]
struct TransportInner {
    script: Mutex<VecDeque<TransportError>>,
    always_fail: Mutex<Option<TransportError>>,
    invocation_failure: Mutex<Option<TransportError>>,
    invocation_delay: Mutex<Option<Duration>>,
    start_delay: Mutex<Option<Duration>>,
    starts: AtomicUsize,
    tokens: Mutex<Vec<String>>,
    events: Mutex<Option<mpsc::Sender<HubEvent>>>,
    connections: Mutex<Vec<FakeConnection>>,
}

impl FakeTransport {
    pub fn always_fail(self, error: TransportError) -> Self {
        *self.inner.always_fail.lock().unwrap() = Some(error);
        self
    }

    pub fn with_failing_invocations(self, error: TransportError) -> Self {
        *self.inner.invocation_failure.lock().unwrap() = Some(error);
        self
    }

    pub fn with_invocation_delay(self, delay: Duration) -> Self {
        *self.inner.invocation_delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn with_start_delay(self, delay: Duration) -> Self {
        *self.inner.start_delay.lock().unwrap() = Some(delay);
        self
    }

    /// Makes the next unscripted `start` fail with `error`.
    pub fn push_failure(&self, error: TransportError) {
        self.inner.script.lock().unwrap().push_back(error);
    }

    pub fn start_count(&self) -> usize {
        self.inner.starts.load(Ordering::SeqCst)
    }

    /// The token the factory handed out on the most recent `start`.
    pub fn last_token(&self) -> Option<String> {
        self.inner.tokens.lock().unwrap().last().cloned()
    }

    pub fn last_connection(&self) -> Option<FakeConnection> {
        self.inner.connections.lock().unwrap().last().cloned()
    }

    /// Delivers `event` as if the hub had sent it on the most recent connection.
    pub async fn emit(&self, event: HubEvent) {
        let sender = self.inner.events.lock().unwrap().clone();
        match sender {
            Some(sender) => sender.send(event).await.expect("event pump has gone away"),
            None => panic!("No connection has been started"),
        }
    }
}

impl HubTransport for FakeTransport {
    type Connection = FakeConnection;

    async fn start(
        &self,
        tokens: AccessTokenFactory,
        events: mpsc::Sender<HubEvent>,
    ) -> Result<FakeConnection, TransportError> {
        self.inner.starts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.inner.start_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let token = tokens(None).await?;
        self.inner.tokens.lock().unwrap().push(token.reveal().to_string());
        let scripted = self.inner.script.lock().unwrap().pop_front();
        let failure = scripted.or_else(|| self.inner.always_fail.lock().unwrap().clone());
        if let Some(e) = failure {
            return Err(e);
        }
        let connection = FakeConnection::default();
        if let Some(e) = self.inner.invocation_failure.lock().unwrap().clone() {
            connection.fail_invocations(e);
        }
        if let Some(delay) = *self.inner.invocation_delay.lock().unwrap() {
            connection.delay_invocations(delay);
        }
        *self.inner.events.lock().unwrap() = Some(events);
        self.inner.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}
