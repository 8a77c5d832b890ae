//! Error types for tunnel-session

use thiserror::Error;

/// How the session controller reacts to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Eligible for the retry policy
    Retry,
    /// Refresh the access token, then try the same attempt again
    Refresh,
    /// Close the session and report the error
    Terminal,
    /// Hand the error back to the caller; the session is left connect-eligible
    Unwind,
}

/// Errors surfaced by the tunnel session and its collaborators
///
/// Cloneable so a single close error can be observed by every caller
/// waiting on the session to close.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Access token expired")]
    Expired,

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("No mutually supported protocol (offered: {offered:?})")]
    ProtocolMismatch { offered: Vec<String> },

    #[error("No connection data; a tunnel descriptor is required")]
    NoConnectionData,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Session resumption rejected: {0}")]
    ResumeRejected(String),

    #[error("Session configuration rejected: {0}")]
    ConfigurationRejected(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Session is closed")]
    Closed,
}

impl SessionError {
    /// Classify this error for the session state machine
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Transient(_) | Self::ResumeRejected(_) => Disposition::Retry,
            Self::Expired => Disposition::Refresh,
            Self::Cancelled
            | Self::NoConnectionData
            | Self::InvalidStateTransition { .. }
            | Self::Closed => Disposition::Unwind,
            Self::Unauthorized(_)
            | Self::ProtocolMismatch { .. }
            | Self::ConfigurationRejected(_) => Disposition::Terminal,
        }
    }

    /// Returns true if the retry policy may be consulted for this error
    pub fn is_retryable(&self) -> bool {
        self.disposition() == Disposition::Retry
    }

    /// Build a transient error from anything displayable
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        Self::Transient(err.to_string())
    }
}
