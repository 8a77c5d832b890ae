//! Client side of the session configuration handshake

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ControlMessage, SessionConfigurer, SessionContext};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::stream::SessionStream;

/// Configures sessions with JSON control messages
///
/// First connect sends `hello` and waits for `welcome`. Reconnects of an
/// initialized session send `resume` with the session id and open
/// channels, skipping the capability handshake.
pub struct ClientSessionConfigurer {
    capabilities: Vec<String>,
    handshake_timeout: Duration,
    context: Mutex<SessionContext>,
}

impl ClientSessionConfigurer {
    pub fn new(capabilities: Vec<String>, handshake_timeout: Duration) -> Self {
        Self {
            capabilities,
            handshake_timeout,
            context: Mutex::new(SessionContext::new()),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.capabilities.clone(), config.handshake_timeout)
    }

    fn with_context<R>(&self, f: impl FnOnce(&mut SessionContext) -> R) -> R {
        let mut ctx = self.context.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut ctx)
    }

    /// Send one control message and wait for the reply
    async fn exchange(
        &self,
        stream: &mut SessionStream,
        request: ControlMessage,
        cancel: &CancellationToken,
    ) -> Result<ControlMessage, SessionError> {
        let exchange = async {
            let frame = request.to_bytes().map_err(SessionError::transient)?;
            stream.send(frame).await?;
            let reply = stream.recv().await?.ok_or_else(|| {
                SessionError::Transient("stream closed during session configuration".into())
            })?;
            ControlMessage::from_bytes(&reply).map_err(SessionError::transient)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = tokio::time::timeout(self.handshake_timeout, exchange) => {
                result.unwrap_or_else(|_| {
                    Err(SessionError::Transient("session configuration timed out".into()))
                })
            }
        }
    }
}

#[async_trait]
impl SessionConfigurer for ClientSessionConfigurer {
    async fn configure(
        &self,
        stream: &mut SessionStream,
        is_reconnect: bool,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let snapshot = self.context();
        let resume = is_reconnect && snapshot.initialized;

        let request = if resume {
            ControlMessage::Resume {
                session_id: snapshot.session_id,
                channels: snapshot.channels.iter().copied().collect(),
            }
        } else {
            ControlMessage::Hello {
                session_id: snapshot.session_id,
                capabilities: self.capabilities.clone(),
            }
        };

        let reply = self.exchange(stream, request, cancel).await?;
        match (resume, reply) {
            (true, ControlMessage::Resumed) => {
                info!(session_id = %snapshot.session_id, protocol = stream.protocol(), "Session resumed");
                self.with_context(|ctx| ctx.connect_count += 1);
                Ok(())
            }
            (true, ControlMessage::ResumeRejected { reason }) => {
                Err(SessionError::ResumeRejected(reason))
            }
            (false, ControlMessage::Welcome { capabilities }) => {
                info!(
                    session_id = %snapshot.session_id,
                    protocol = stream.protocol(),
                    ?capabilities,
                    "Session configured"
                );
                self.with_context(|ctx| {
                    ctx.capabilities = capabilities;
                    ctx.initialized = true;
                    ctx.connect_count += 1;
                });
                Ok(())
            }
            (false, ControlMessage::Rejected { reason }) => {
                Err(SessionError::ConfigurationRejected(reason))
            }
            (_, other) => {
                debug!("Unexpected control message: {:?}", other);
                Err(SessionError::Transient(format!(
                    "unexpected control message during configuration: {other:?}"
                )))
            }
        }
    }

    fn reset(&self) {
        self.with_context(SessionContext::reset);
    }

    fn context(&self) -> SessionContext {
        self.with_context(|ctx| ctx.clone())
    }

    fn open_channel(&self, id: u32) -> bool {
        self.with_context(|ctx| ctx.open_channel(id))
    }

    fn close_channel(&self, id: u32) -> bool {
        self.with_context(|ctx| ctx.close_channel(id))
    }
}
