//! Token refresh coordination.
//!
//! Many call sites can discover at the same time that the access token is stale: the initial connect, the transport's
//! own reconnect loop, and so on. The [`RefreshCoordinator`] makes sure only one refresh request is in flight. Late
//! callers attach to the pending request and receive the same token pair. Once the request completes, successfully or
//! not, the slot is cleared so the next caller starts a fresh refresh.
use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use bf_common::Secret;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use log::*;

use crate::{
    credentials::{CredentialStore, TokenPair},
    errors::{RefreshError, TransportError},
    transport::{AccessTokenFactory, TokenFuture},
};

/// Exchanges a refresh token for a new access/refresh pair. Usually a request to the auth service.
pub trait TokenRefresher: Send + Sync + 'static {
    fn refresh(&self, refresh_token: &str) -> impl Future<Output = Result<TokenPair, RefreshError>> + Send;
}

type PendingRefresh = Shared<BoxFuture<'static, Result<TokenPair, RefreshError>>>;

pub struct RefreshCoordinator<C, R> {
    store: Arc<C>,
    refresher: Arc<R>,
    pending: Mutex<Option<(u64, PendingRefresh)>>,
    generation: Mutex<u64>,
}

impl<C, R> RefreshCoordinator<C, R>
where
    C: CredentialStore,
    R: TokenRefresher,
{
    pub fn new(store: Arc<C>, refresher: R) -> Self {
        Self { store, refresher: Arc::new(refresher), pending: Mutex::new(None), generation: Mutex::new(0) }
    }

    pub fn store(&self) -> &Arc<C> {
        &self.store
    }

    pub fn is_refreshing(&self) -> bool {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Refreshes the token pair, joining a refresh that is already in flight if there is one.
    ///
    /// On success the store holds the new pair before this returns. On failure the store is left untouched; deciding
    /// whether to log out is up to the caller.
    pub async fn refresh(&self) -> Result<TokenPair, RefreshError> {
        let (id, pending) = {
            let mut slot = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some((id, pending)) => {
                    debug!("🔑️ Joining token refresh #{id} already in flight");
                    (*id, pending.clone())
                },
                None => {
                    let id = self.next_generation();
                    debug!("🔑️ Starting token refresh #{id}");
                    let pending = self.start_refresh().boxed().shared();
                    *slot = Some((id, pending.clone()));
                    (id, pending)
                },
            }
        };
        let result = pending.await;
        {
            let mut slot = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(slot.as_ref(), Some((current, _)) if *current == id) {
                *slot = None;
            }
        }
        result
    }

    fn next_generation(&self) -> u64 {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation += 1;
        *generation
    }

    fn start_refresh(&self) -> impl Future<Output = Result<TokenPair, RefreshError>> + Send + 'static {
        let store = Arc::clone(&self.store);
        let refresher = Arc::clone(&self.refresher);
        async move {
            let refresh_token =
                store.refresh_token().filter(|t| !t.is_empty()).ok_or(RefreshError::MissingRefreshToken)?;
            match refresher.refresh(refresh_token.reveal()).await {
                Ok(pair) => {
                    store.set_tokens(&pair);
                    info!("🔑️ Access token refreshed");
                    Ok(pair)
                },
                Err(e) => {
                    warn!("🔑️ Token refresh failed. {e}");
                    Err(e)
                },
            }
        }
    }
}

/// Builds the lazy token callback handed to a transport when a connection is created.
///
/// Called with `None`, the callback returns the cached access token. Called with the token the hub just rejected, it
/// refreshes once through the coordinator, unless the store already holds a different (newer) token, in which case that
/// one is returned.
pub fn token_factory<C, R>(coordinator: Arc<RefreshCoordinator<C, R>>) -> AccessTokenFactory
where
    C: CredentialStore,
    R: TokenRefresher,
{
    Arc::new(move |rejected: Option<Secret<String>>| {
        let coordinator = Arc::clone(&coordinator);
        Box::pin(async move {
            let cached = coordinator.store().access_token().filter(|t| !t.is_empty());
            match (cached, rejected) {
                (Some(token), None) => return Ok(token),
                (Some(token), Some(bad)) if token != bad => return Ok(token),
                _ => {},
            }
            coordinator
                .refresh()
                .await
                .map(|pair| pair.access_token)
                .map_err(|e| TransportError::Token(e.to_string()))
        }) as TokenFuture
    })
}
