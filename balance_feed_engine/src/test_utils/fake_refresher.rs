use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    credentials::TokenPair,
    errors::RefreshError,
    refresh::TokenRefresher,
};

/// A [`TokenRefresher`] that always gives the same answer, optionally after a delay.
#[derive(Clone)]
pub struct FakeRefresher {
    outcome: Result<TokenPair, RefreshError>,
    delay: Option<Duration>,
    calls: RefreshCalls,
}

impl FakeRefresher {
    pub fn succeeding(access_token: &str, refresh_token: &str) -> Self {
        Self { outcome: Ok(TokenPair::new(access_token, refresh_token)), delay: None, calls: RefreshCalls::default() }
    }

    pub fn failing(error: RefreshError) -> Self {
        Self { outcome: Err(error), delay: None, calls: RefreshCalls::default() }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// A handle on the calls made so far. Stays valid after the refresher is moved into a coordinator.
    pub fn calls(&self) -> RefreshCalls {
        self.calls.clone()
    }
}

impl TokenRefresher for FakeRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, RefreshError> {
        self.calls.record(refresh_token);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.outcome.clone()
    }
}

#[derive(Clone, Default)]
pub struct RefreshCalls {
    tokens: Arc<Mutex<Vec<String>>>,
}

impl RefreshCalls {
    fn record(&self, refresh_token: &str) {
        self.tokens.lock().unwrap().push(refresh_token.to_string());
    }

    pub fn count(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    /// The refresh token sent with the most recent call.
    pub fn last_refresh_token(&self) -> Option<String> {
        self.tokens.lock().unwrap().last().cloned()
    }
}
