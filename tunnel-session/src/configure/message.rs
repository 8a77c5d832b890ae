//! Control messages exchanged while configuring a session

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JSON control frame, tagged by `type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Client opens a fresh session
    Hello {
        session_id: Uuid,
        capabilities: Vec<String>,
    },
    /// Host accepts a fresh session with the capabilities it supports
    Welcome { capabilities: Vec<String> },
    /// Host refuses a fresh session
    Rejected { reason: String },
    /// Client asks to continue an existing session
    Resume { session_id: Uuid, channels: Vec<u32> },
    /// Host restored the session
    Resumed,
    /// Host no longer knows the session
    ResumeRejected { reason: String },
}

impl ControlMessage {
    pub fn to_bytes(&self) -> Result<bytes::Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(bytes::Bytes::from)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
