//! Session credentials as seen by the balance feed.
//!
//! The feed does not own the user's session. It only reads tokens and identity through [`CredentialStore`], writes a
//! refreshed token pair back, and logs the session out when a refresh is rejected.
use std::sync::{PoisonError, RwLock};

use bf_common::Secret;
use log::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: Option<Secret<String>>,
    pub refresh_token: Option<Secret<String>>,
    /// The authenticated account's identifier. Preferred for the entity id.
    pub account_id: Option<String>,
    /// The raw user identifier, used when no account id is known.
    pub user_id: Option<String>,
}

impl Credentials {
    pub fn new<S: Into<String>>(access_token: S, refresh_token: S) -> Self {
        Self {
            access_token: Some(Secret::new(access_token.into())),
            refresh_token: Some(Secret::new(refresh_token.into())),
            ..Default::default()
        }
    }

    pub fn with_account_id<S: Into<String>>(mut self, account_id: S) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_user_id<S: Into<String>>(mut self, user_id: S) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// The identity that scopes the balance group: the account id, falling back to the user id.
    pub fn entity_id(&self) -> Option<String> {
        let non_empty = |s: &String| !s.trim().is_empty();
        self.account_id.clone().filter(non_empty).or_else(|| self.user_id.clone().filter(non_empty))
    }

    pub fn is_logged_in(&self) -> bool {
        self.access_token.as_ref().is_some_and(|t| !t.is_empty())
    }
}

/// An access/refresh token pair, as issued by the token service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    #[serde(alias = "access_token")]
    pub access_token: Secret<String>,
    #[serde(alias = "refresh_token")]
    pub refresh_token: Secret<String>,
}

impl TokenPair {
    pub fn new<S: Into<String>>(access_token: S, refresh_token: S) -> Self {
        Self { access_token: Secret::new(access_token.into()), refresh_token: Secret::new(refresh_token.into()) }
    }
}

pub trait CredentialStore: Send + Sync + 'static {
    fn access_token(&self) -> Option<Secret<String>>;
    fn refresh_token(&self) -> Option<Secret<String>>;
    fn entity_id(&self) -> Option<String>;
    /// Replaces both tokens in one step. Implementations must never leave one token updated without the other.
    fn set_tokens(&self, tokens: &TokenPair);
    /// Clears every field.
    fn logout(&self);
}

/// A process-lifetime credential store. Nothing is persisted.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: RwLock<Credentials>,
}

impl MemoryCredentialStore {
    pub fn new(credentials: Credentials) -> Self {
        Self { inner: RwLock::new(credentials) }
    }

    /// Replaces the whole session, e.g. after a login.
    pub fn login(&self, credentials: Credentials) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = credentials;
    }

    pub fn credentials(&self) -> Credentials {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn access_token(&self) -> Option<Secret<String>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).access_token.clone()
    }

    fn refresh_token(&self) -> Option<Secret<String>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).refresh_token.clone()
    }

    fn entity_id(&self) -> Option<String> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).entity_id()
    }

    fn set_tokens(&self, tokens: &TokenPair) {
        let mut creds = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        creds.access_token = Some(tokens.access_token.clone());
        creds.refresh_token = Some(tokens.refresh_token.clone());
        debug!("🔑️ Stored new token pair. Access token: {}", tokens.access_token.hint(8));
    }

    fn logout(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Credentials::default();
        info!("🔑️ Session credentials cleared");
    }
}
