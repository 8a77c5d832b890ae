//! Token storage with coalesced refresh

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AccessScope, AccessToken, TokenProvider};
use crate::error::SessionError;

/// Holds the session's bearer token and serializes refreshes
///
/// Only one refresh runs at a time. A caller that arrives while a refresh
/// is in flight waits for it and reuses its outcome instead of calling the
/// provider again. A refresh that gets cancelled records nothing, so the
/// next waiter performs its own.
pub struct TokenStore {
    scope: AccessScope,
    provider: Arc<dyn TokenProvider>,
    token: RwLock<Option<AccessToken>>,
    refresh: Mutex<RefreshSlot>,
    /// Number of refreshes that ran to completion
    completed: AtomicU64,
}

#[derive(Default)]
struct RefreshSlot {
    last: Option<Result<AccessToken, SessionError>>,
}

impl TokenStore {
    pub fn new(scope: AccessScope, provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            scope,
            provider,
            token: RwLock::new(None),
            refresh: Mutex::new(RefreshSlot::default()),
            completed: AtomicU64::new(0),
        }
    }

    pub fn scope(&self) -> &AccessScope {
        &self.scope
    }

    /// Current token value if present and not known to be expired
    ///
    /// Local check only; never calls the provider.
    pub fn validate(&self) -> Option<String> {
        let token = self.token.read().unwrap_or_else(PoisonError::into_inner);
        token
            .as_ref()
            .filter(|t| !t.is_expired())
            .map(|t| t.value().to_string())
    }

    /// Current token value without an expiry check
    pub fn current(&self) -> Option<String> {
        let token = self.token.read().unwrap_or_else(PoisonError::into_inner);
        token.as_ref().map(|t| t.value().to_string())
    }

    /// Replace the stored token
    pub fn set_token(&self, token: AccessToken) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    /// Store `token` only if no token is held yet
    ///
    /// Returns true if the token was stored.
    pub fn seed_if_empty(&self, token: AccessToken) -> bool {
        let mut slot = self.token.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(token);
        true
    }

    /// Number of refreshes that have completed (successfully or not)
    pub fn refresh_count(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Refresh the token, coalescing with any refresh already in flight
    pub async fn refresh_token(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, SessionError> {
        let observed = self.completed.load(Ordering::Acquire);

        let mut slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            slot = self.refresh.lock() => slot,
        };

        // Someone finished a refresh while we waited for the lock
        if self.completed.load(Ordering::Acquire) > observed {
            if let Some(last) = &slot.last {
                debug!(scope = %self.scope, "Reusing result of concurrent token refresh");
                return last.clone();
            }
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = self.provider.refresh(&self.scope, cancel) => result,
        };

        if result == Err(SessionError::Cancelled) {
            return result;
        }

        match &result {
            Ok(token) => {
                debug!(scope = %self.scope, "Access token refreshed");
                self.set_token(token.clone());
            }
            Err(e) => warn!(scope = %self.scope, error = %e, "Access token refresh failed"),
        }

        slot.last = Some(result.clone());
        self.completed.fetch_add(1, Ordering::AcqRel);
        result
    }

    /// Refresh the token
    ///
    /// Returns `Ok(false)` when the provider rejects re-authorization and
    /// `Ok(true)` once the stored token has been replaced.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<bool, SessionError> {
        match self.refresh_token(cancel).await {
            Ok(_) => Ok(true),
            Err(SessionError::Unauthorized(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("scope", &self.scope)
            .field("has_token", &self.current().is_some())
            .field("completed", &self.refresh_count())
            .finish()
    }
}
