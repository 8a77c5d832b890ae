//! Session-level state that survives reconnects

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State bound to the logical session rather than one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Stable id presented when resuming
    pub session_id: Uuid,
    /// Capabilities agreed with the host on first connect
    pub capabilities: Vec<String>,
    /// Multiplexed channels opened over the session
    pub channels: BTreeSet<u32>,
    /// First-connect initialization has completed
    pub initialized: bool,
    /// Streams successfully configured over the session's lifetime
    pub connect_count: u32,
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            capabilities: Vec::new(),
            channels: BTreeSet::new(),
            initialized: false,
            connect_count: 0,
        }
    }

    /// Record a channel; returns false if it was already open
    pub fn open_channel(&mut self, id: u32) -> bool {
        self.channels.insert(id)
    }

    pub fn close_channel(&mut self, id: u32) -> bool {
        self.channels.remove(&id)
    }

    /// Forget the session so the next connect starts fresh
    pub fn reset(&mut self) {
        *self = Self {
            connect_count: self.connect_count,
            ..Self::new()
        };
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}
