//! Binding negotiated streams into the session

mod client;
mod context;
mod message;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;
use crate::stream::SessionStream;

pub use client::ClientSessionConfigurer;
pub use context::SessionContext;
pub use message::ControlMessage;

/// Binds a negotiated stream into the live session
///
/// On reconnect, session-level state is preserved and first-connect
/// initialization is skipped. A host that no longer recognises the session
/// is reported as [`SessionError::ResumeRejected`].
#[async_trait]
pub trait SessionConfigurer: Send + Sync {
    async fn configure(
        &self,
        stream: &mut SessionStream,
        is_reconnect: bool,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError>;

    /// Discard session-level state so the next configure is a fresh connect
    fn reset(&self);

    /// Snapshot of the session-level state
    fn context(&self) -> SessionContext;

    /// Record a multiplexed channel opened over the session
    fn open_channel(&self, _id: u32) -> bool {
        false
    }

    fn close_channel(&self, _id: u32) -> bool {
        false
    }
}
