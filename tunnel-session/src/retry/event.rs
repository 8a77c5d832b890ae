//! Retry notification hook

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SessionError;

/// Per-retry record handed to a [`RetryHandler`] before each reconnection
///
/// The handler may set `cancel` to abort reconnection, or change `delay`
/// to override the backoff the controller waits for afterwards.
#[derive(Debug, Clone)]
pub struct RetryingEvent {
    /// Failure that triggered the retry
    pub error: SessionError,
    /// 1-based attempt number within the current cycle
    pub attempt: u32,
    /// Delay the controller will wait before reconnecting
    pub delay: Duration,
    /// Time since the retry cycle began
    pub elapsed: Duration,
    /// Set to abort reconnection and close the session
    pub cancel: bool,
}

impl RetryingEvent {
    pub fn new(error: SessionError, attempt: u32, delay: Duration, elapsed: Duration) -> Self {
        Self {
            error,
            attempt,
            delay,
            elapsed,
            cancel: false,
        }
    }
}

/// Observes, delays or cancels reconnection attempts
#[async_trait]
pub trait RetryHandler: Send + Sync {
    async fn on_retrying(&self, event: &mut RetryingEvent);
}

/// Adapts a closure into a [`RetryHandler`]
///
/// The closure runs synchronously; handlers that need to wait should
/// implement the trait directly.
pub struct FnRetryHandler<F>(F);

impl<F> FnRetryHandler<F>
where
    F: Fn(&mut RetryingEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> RetryHandler for FnRetryHandler<F>
where
    F: Fn(&mut RetryingEvent) + Send + Sync,
{
    async fn on_retrying(&self, event: &mut RetryingEvent) {
        (self.0)(event)
    }
}

/// Handler that waits on an async closure before each retry
pub struct AsyncRetryHandler<F>(F);

impl<F, Fut> AsyncRetryHandler<F>
where
    F: Fn(RetryingEvent) -> Fut + Send + Sync,
    Fut: Future<Output = RetryingEvent> + Send,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> RetryHandler for AsyncRetryHandler<F>
where
    F: Fn(RetryingEvent) -> Fut + Send + Sync,
    Fut: Future<Output = RetryingEvent> + Send,
{
    async fn on_retrying(&self, event: &mut RetryingEvent) {
        *event = (self.0)(event.clone()).await;
    }
}
