//! Direct TCP connections to the tunnel host

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{SessionStream, StreamNegotiator, Transport};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::tunnel::{ConnectionData, select_protocol};

/// First frame sent by the client on a direct connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectOffer {
    pub protocols: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Host's answer to a [`DirectOffer`]; `protocol` is null when nothing matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectReply {
    pub protocol: Option<String>,
}

/// Length-delimited frames over any byte stream
pub struct FramedTransport<T> {
    framed: Framed<T, LengthDelimitedCodec>,
}

impl<T> FramedTransport<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    pub fn new(io: T) -> Self {
        Self {
            framed: Framed::new(io, LengthDelimitedCodec::new()),
        }
    }

    /// Send a JSON-encoded frame
    pub async fn send_json<M: Serialize>(&mut self, message: &M) -> Result<(), SessionError> {
        let json = serde_json::to_vec(message).map_err(SessionError::transient)?;
        self.send(Bytes::from(json)).await
    }

    /// Receive and decode a JSON frame; `None` if the peer closed
    pub async fn recv_json<M: for<'de> Deserialize<'de>>(
        &mut self,
    ) -> Result<Option<M>, SessionError> {
        match self.recv().await? {
            Some(frame) => serde_json::from_slice(&frame)
                .map(Some)
                .map_err(SessionError::transient),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<T> Transport for FramedTransport<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn send(&mut self, data: Bytes) -> Result<(), SessionError> {
        self.framed.send(data).await.map_err(SessionError::from)
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, SessionError> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = SinkExt::<Bytes>::close(&mut self.framed).await {
            debug!("Error closing framed transport: {}", e);
        }
    }
}

/// Connects straight to the host's advertised `host:port` endpoints
#[derive(Debug, Clone)]
pub struct DirectStreamNegotiator {
    connect_timeout: Duration,
}

impl DirectStreamNegotiator {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.connect_timeout)
    }

    /// Offer `protocols` over `io` and wait for the host's choice
    pub async fn handshake<T>(
        io: T,
        protocols: &[String],
        access_token: Option<&str>,
    ) -> Result<(FramedTransport<T>, String), SessionError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut transport = FramedTransport::new(io);
        transport
            .send_json(&DirectOffer {
                protocols: protocols.to_vec(),
                token: access_token.map(str::to_string),
            })
            .await?;

        let reply: DirectReply = transport.recv_json().await?.ok_or_else(|| {
            SessionError::Transient("host closed during protocol negotiation".into())
        })?;

        let protocol = select_protocol(protocols, reply.protocol.as_deref())?;
        Ok((transport, protocol))
    }

    async fn connect_endpoint(
        &self,
        endpoint: &str,
        protocols: &[String],
        access_token: Option<&str>,
    ) -> Result<SessionStream, SessionError> {
        let tcp = TcpStream::connect(endpoint).await?;
        tcp.set_nodelay(true)?;
        let (transport, protocol) = Self::handshake(tcp, protocols, access_token).await?;
        Ok(SessionStream::new(Box::new(transport), protocol, endpoint))
    }
}

#[async_trait]
impl StreamNegotiator for DirectStreamNegotiator {
    async fn connect(
        &self,
        connection: &ConnectionData,
        access_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<SessionStream, SessionError> {
        if connection.host_endpoints.is_empty() {
            return Err(SessionError::NoConnectionData);
        }

        let mut last_error = SessionError::NoConnectionData;
        for endpoint in &connection.host_endpoints {
            debug!(%endpoint, "Connecting directly to host");
            let attempt = tokio::time::timeout(
                self.connect_timeout,
                self.connect_endpoint(endpoint, &connection.protocols, access_token),
            );

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                result = attempt => result,
            };

            match result {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) if e.is_retryable() => {
                    warn!(%endpoint, error = %e, "Direct connection failed");
                    last_error = e;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(%endpoint, "Direct connection timed out");
                    last_error = SessionError::Transient(format!("connect to {endpoint} timed out"));
                }
            }
        }
        Err(last_error)
    }
}
