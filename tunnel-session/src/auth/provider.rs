//! Token providers perform the network re-authorization behind a refresh

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{AccessScope, AccessToken};
use crate::error::SessionError;

/// Issues fresh access tokens for a scope
///
/// Implementations report a rejected re-authorization as
/// [`SessionError::Unauthorized`] and network failures as
/// [`SessionError::Transient`].
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn refresh(
        &self,
        scope: &AccessScope,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, SessionError>;
}

/// Provider holding a fixed token
///
/// Refresh hands the same token back until it expires; an empty provider
/// always rejects.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    token: Option<AccessToken>,
}

impl StaticTokenProvider {
    pub fn new(token: AccessToken) -> Self {
        Self { token: Some(token) }
    }

    /// Provider with no token to offer
    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn refresh(
        &self,
        scope: &AccessScope,
        _cancel: &CancellationToken,
    ) -> Result<AccessToken, SessionError> {
        match &self.token {
            Some(token) if !token.is_expired() => Ok(token.clone()),
            Some(_) => Err(SessionError::Unauthorized(format!(
                "static token for scope '{scope}' has expired"
            ))),
            None => Err(SessionError::Unauthorized(format!(
                "no token available for scope '{scope}'"
            ))),
        }
    }
}

/// Provider backed by an async closure
pub struct CallbackTokenProvider<F> {
    callback: F,
}

impl<F, Fut> CallbackTokenProvider<F>
where
    F: Fn(AccessScope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<AccessToken, SessionError>> + Send,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F, Fut> TokenProvider for CallbackTokenProvider<F>
where
    F: Fn(AccessScope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<AccessToken, SessionError>> + Send,
{
    async fn refresh(
        &self,
        scope: &AccessScope,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, SessionError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = (self.callback)(scope.clone()) => result,
        }
    }
}
