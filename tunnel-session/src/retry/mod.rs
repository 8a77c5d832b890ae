//! Reconnection backoff and the retry notification hook

mod event;
mod policy;

pub use event::{AsyncRetryHandler, FnRetryHandler, RetryHandler, RetryingEvent};
pub use policy::RetryPolicy;
