//! Structured session lifecycle events

use serde::{Deserialize, Serialize};

use crate::session::SessionState;

/// Lifecycle event recorded by a [`super::TraceSink`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    TokenRefreshed,
    TokenRefreshFailed {
        error: String,
    },
    StreamOpened {
        protocol: String,
        endpoint: String,
        is_reconnect: bool,
    },
    StreamDropped {
        error: String,
    },
    Retrying {
        attempt: u32,
        delay_ms: u64,
        error: String,
        cancelled: bool,
    },
    Closed {
        error: Option<String>,
    },
}

impl SessionEvent {
    /// Short name for log output
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state_changed",
            Self::TokenRefreshed => "token_refreshed",
            Self::TokenRefreshFailed { .. } => "token_refresh_failed",
            Self::StreamOpened { .. } => "stream_opened",
            Self::StreamDropped { .. } => "stream_dropped",
            Self::Retrying { .. } => "retrying",
            Self::Closed { .. } => "closed",
        }
    }
}
