//! WebSocket connections through the tunnel relay

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::{SessionStream, StreamNegotiator, Transport};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::tunnel::{ConnectionData, select_protocol};

/// Authorization scheme for tunnel access tokens
pub const AUTHORIZATION_SCHEME: &str = "tunnel";

/// Transport over an established WebSocket
pub struct WebSocketTransport<S> {
    ws: WebSocketStream<S>,
}

impl<S> WebSocketTransport<S> {
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self { ws }
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn send(&mut self, data: Bytes) -> Result<(), SessionError> {
        self.ws
            .send(Message::binary(data))
            .await
            .map_err(SessionError::transient)
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, SessionError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Bytes::copy_from_slice(text.as_bytes())));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Relay closed stream: {:?}", frame);
                    return Ok(None);
                }
                // Pong is sent automatically by tungstenite
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed)) | None => return Ok(None),
                Some(Err(e)) => return Err(SessionError::transient(e)),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!("Error closing WebSocket: {}", e);
        }
    }
}

/// Connects to the tunnel through its relay URIs
#[derive(Debug, Clone)]
pub struct RelayStreamNegotiator {
    connect_timeout: Duration,
}

impl RelayStreamNegotiator {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.connect_timeout)
    }

    async fn connect_relay(
        &self,
        uri: &Url,
        protocols: &[String],
        access_token: Option<&str>,
    ) -> Result<SessionStream, SessionError> {
        let request = build_request(uri, protocols, access_token)?;
        let (ws, response) = connect_async(request).await.map_err(|e| map_ws_error(e, protocols))?;

        let chosen = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        let protocol = select_protocol(protocols, chosen)?;

        Ok(SessionStream::new(
            Box::new(WebSocketTransport::new(ws)),
            protocol,
            uri.as_str(),
        ))
    }
}

/// Build the upgrade request carrying the protocol offer and token
fn build_request(
    uri: &Url,
    protocols: &[String],
    access_token: Option<&str>,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, SessionError> {
    let mut request = uri
        .as_str()
        .into_client_request()
        .map_err(SessionError::transient)?;

    let headers = request.headers_mut();
    let offer = HeaderValue::from_str(&protocols.join(", ")).map_err(|_| {
        SessionError::ProtocolMismatch {
            offered: protocols.to_vec(),
        }
    })?;
    headers.insert(SEC_WEBSOCKET_PROTOCOL, offer);

    if let Some(token) = access_token {
        let value = HeaderValue::from_str(&format!("{AUTHORIZATION_SCHEME} {token}"))
            .map_err(|_| SessionError::Unauthorized("access token is not a valid header".into()))?;
        headers.insert(AUTHORIZATION, value);
    }

    Ok(request)
}

fn map_ws_error(err: WsError, protocols: &[String]) -> SessionError {
    match err {
        WsError::Http(response) => match response.status() {
            StatusCode::UNAUTHORIZED => SessionError::Expired,
            StatusCode::FORBIDDEN => {
                SessionError::Unauthorized("relay refused the access token".into())
            }
            status => SessionError::Transient(format!("relay responded with {status}")),
        },
        WsError::Protocol(ProtocolError::SecWebSocketSubProtocolError(_)) => {
            SessionError::ProtocolMismatch {
                offered: protocols.to_vec(),
            }
        }
        other => SessionError::transient(other),
    }
}

#[async_trait]
impl StreamNegotiator for RelayStreamNegotiator {
    async fn connect(
        &self,
        connection: &ConnectionData,
        access_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<SessionStream, SessionError> {
        if connection.relay_uris.is_empty() {
            return Err(SessionError::NoConnectionData);
        }

        let mut last_error = SessionError::NoConnectionData;
        for uri in &connection.relay_uris {
            debug!(%uri, "Connecting through relay");
            let attempt = tokio::time::timeout(
                self.connect_timeout,
                self.connect_relay(uri, &connection.protocols, access_token),
            );

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                result = attempt => result,
            };

            match result {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) if e.is_retryable() => {
                    warn!(%uri, error = %e, "Relay connection failed");
                    last_error = e;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(%uri, "Relay connection timed out");
                    last_error = SessionError::Transient(format!("connect to {uri} timed out"));
                }
            }
        }
        Err(last_error)
    }
}
