//! Session lifecycle states

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Not connected; a connect may start
    #[default]
    Idle,
    /// Checking or refreshing the access token
    Validating,
    /// Negotiating a stream with the host
    Connecting,
    /// Binding the stream into the session
    Configuring,
    /// Stream is live
    Connected,
    /// Waiting to reconnect after a failure
    Retrying,
    /// Releasing the stream
    Closing,
    /// Terminal
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }

    /// Closing or closed; no new work may start
    pub fn is_shutting_down(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }

    /// Whether `self -> next` is a legal edge
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, next),
            (Idle, Validating | Closed)
                | (Validating, Connecting | Retrying | Closing | Closed | Idle)
                | (Connecting, Configuring | Retrying | Validating | Closing | Idle)
                | (Configuring, Connected | Retrying | Closing | Idle)
                | (Connected, Retrying | Closing)
                | (Retrying, Validating | Closing | Idle)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::Connecting => "connecting",
            Self::Configuring => "configuring",
            Self::Connected => "connected",
            Self::Retrying => "retrying",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}
