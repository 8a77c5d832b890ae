//! Trace sinks

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use super::SessionEvent;
use crate::session::SessionState;

/// Write-only receiver of session events
pub trait TraceSink: Send + Sync {
    fn record(&self, event: &SessionEvent);
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn record(&self, event: &SessionEvent) {
        match event {
            SessionEvent::StateChanged { from, to } => trace!(%from, %to, "Session transition"),
            SessionEvent::TokenRefreshed => debug!("Session access token refreshed"),
            SessionEvent::TokenRefreshFailed { error } => {
                warn!(%error, "Session access token refresh failed");
            }
            SessionEvent::StreamOpened {
                protocol,
                endpoint,
                is_reconnect,
            } => info!(%protocol, %endpoint, is_reconnect, "Session stream connected"),
            SessionEvent::StreamDropped { error } => warn!(%error, "Session stream dropped"),
            SessionEvent::Retrying {
                attempt,
                delay_ms,
                error,
                cancelled,
            } => info!(attempt, delay_ms, %error, cancelled, "Session reconnecting"),
            SessionEvent::Closed { error: Some(error) } => warn!(%error, "Session closed"),
            SessionEvent::Closed { error: None } => info!("Session closed"),
        }
    }
}

/// Sequence number assigned by [`MemoryTraceSink`]
pub type TraceSeq = u64;

/// Keeps every event for inspection and rebroadcasts it
///
/// Used by tests and embedders that want to replay a session's history.
pub struct MemoryTraceSink {
    events: Mutex<Vec<(TraceSeq, SessionEvent)>>,
    next_seq: AtomicU64,
    tx: broadcast::Sender<(TraceSeq, SessionEvent)>,
}

impl MemoryTraceSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            events: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(TraceSeq, SessionEvent)> {
        self.tx.subscribe()
    }

    /// All recorded events in order
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Target states of every recorded transition, in order
    pub fn states(&self) -> Vec<SessionState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryTraceSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl TraceSink for MemoryTraceSink {
    fn record(&self, event: &SessionEvent) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((seq, event.clone()));
        let _ = self.tx.send((seq, event.clone()));
    }
}
