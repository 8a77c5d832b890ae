//! Session streams and the negotiators that open them
//!
//! A [`StreamNegotiator`] turns [`ConnectionData`] plus an access token into
//! a [`SessionStream`]: a message-oriented [`Transport`] paired with the
//! sub-protocol the host agreed to.

mod direct;
mod memory;
mod relay;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Disposition, SessionError};
use crate::tunnel::ConnectionData;

pub use direct::{DirectOffer, DirectReply, DirectStreamNegotiator, FramedTransport};
pub use memory::{MemoryTransport, memory_pair};
pub use relay::{RelayStreamNegotiator, WebSocketTransport};

/// Message-oriented byte transport underneath a session
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, data: Bytes) -> Result<(), SessionError>;

    /// Next message, or `None` once the peer has closed
    async fn recv(&mut self) -> Result<Option<Bytes>, SessionError>;

    /// Close the transport; errors are ignored
    async fn close(&mut self);
}

/// A live transport paired with its negotiated sub-protocol
pub struct SessionStream {
    transport: Box<dyn Transport>,
    protocol: String,
    endpoint: String,
}

impl SessionStream {
    pub fn new(
        transport: Box<dyn Transport>,
        protocol: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            protocol: protocol.into(),
            endpoint: endpoint.into(),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Address the stream was opened to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn send(&mut self, data: Bytes) -> Result<(), SessionError> {
        self.transport.send(data).await
    }

    pub async fn recv(&mut self) -> Result<Option<Bytes>, SessionError> {
        self.transport.recv().await
    }

    pub async fn close(&mut self) {
        self.transport.close().await
    }
}

impl fmt::Debug for SessionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStream")
            .field("protocol", &self.protocol)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Opens a stream to the tunnel host
///
/// Implementations return [`SessionError::NoConnectionData`] when no
/// endpoint of their kind is known, observe `cancel` at every blocking
/// point and release partial resources on failure.
#[async_trait]
pub trait StreamNegotiator: Send + Sync {
    async fn connect(
        &self,
        connection: &ConnectionData,
        access_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<SessionStream, SessionError>;
}

/// Tries negotiators in order until one connects
///
/// Moves on when a negotiator has no endpoints or fails transiently; any
/// other failure is returned immediately.
pub struct FallbackNegotiator {
    negotiators: Vec<Arc<dyn StreamNegotiator>>,
}

impl FallbackNegotiator {
    pub fn new(negotiators: Vec<Arc<dyn StreamNegotiator>>) -> Self {
        Self { negotiators }
    }
}

#[async_trait]
impl StreamNegotiator for FallbackNegotiator {
    async fn connect(
        &self,
        connection: &ConnectionData,
        access_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<SessionStream, SessionError> {
        let mut last_error = SessionError::NoConnectionData;
        for negotiator in &self.negotiators {
            match negotiator.connect(connection, access_token, cancel).await {
                Ok(stream) => return Ok(stream),
                Err(SessionError::NoConnectionData) => continue,
                Err(e) if e.disposition() == Disposition::Retry => {
                    debug!(error = %e, "Negotiator failed, trying next");
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }
}
