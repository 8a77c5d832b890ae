//! tunnel-session: Client-side session manager for relayed tunnels
//!
//! This crate keeps one client session to a tunnel host alive:
//!
//! - **Access tokens** - [`TokenStore`] validates the session's bearer token and
//!   coalesces refreshes through a [`TokenProvider`]
//! - **Stream negotiation** - [`StreamNegotiator`] opens a [`SessionStream`] through the
//!   relay ([`RelayStreamNegotiator`]) or directly ([`DirectStreamNegotiator`])
//! - **Configuration** - [`SessionConfigurer`] binds a stream into the session, resuming
//!   it on reconnect
//! - **Retry** - [`RetryPolicy`] backoff with a [`RetryHandler`] hook that may delay or
//!   cancel reconnection
//! - **Lifecycle** - [`TunnelSessionController`] drives all of the above as one state
//!   machine
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tokio_util::sync::CancellationToken;
//! use tunnel_session::{
//!     AccessToken, SessionConfig, StaticTokenProvider, TunnelDescriptor,
//!     TunnelSessionController,
//! };
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = Arc::new(StaticTokenProvider::new(AccessToken::new("token")));
//!     let session = TunnelSessionController::new(SessionConfig::default(), provider)?;
//!
//!     let descriptor = TunnelDescriptor::new("my-tunnel")
//!         .with_relay("wss://relay.example.com/tunnel/my-tunnel".parse()?);
//!     session
//!         .connect_tunnel_session(Some(&descriptor), &CancellationToken::new())
//!         .await?;
//!
//!     session.send("hello".into()).await?;
//!     session.close_session(None).await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 TunnelSessionController                   │
//! │                                                           │
//! │  Idle → Validating → Connecting → Configuring → Connected │
//! │             ▲                                      │      │
//! │             └──────────── Retrying ◀───────────────┘      │
//! │                                                           │
//! │  ┌────────────┐  ┌──────────────────┐  ┌───────────────┐  │
//! │  │ TokenStore │  │ StreamNegotiator │  │  Configurer   │  │
//! │  └────────────┘  └──────────────────┘  └───────────────┘  │
//! │        │                  │                                │
//! │  TokenProvider      Relay / Direct        supervisor task  │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod config;
pub mod configure;
pub mod error;
pub mod retry;
pub mod session;
pub mod stream;
pub mod trace;
pub mod tunnel;

// Re-export key types for convenience
pub use auth::{
    AccessScope, AccessToken, CallbackTokenProvider, StaticTokenProvider, TokenProvider,
    TokenStore,
};
pub use config::{ConfigError, RetryConfig, SessionConfig};
pub use configure::{ClientSessionConfigurer, ControlMessage, SessionConfigurer, SessionContext};
pub use error::{Disposition, SessionError};
pub use retry::{AsyncRetryHandler, FnRetryHandler, RetryHandler, RetryPolicy, RetryingEvent};
pub use session::{
    ConnectAttempt, SessionState, TunnelSessionController, TunnelSessionControllerBuilder,
};
pub use stream::{
    DirectStreamNegotiator, FallbackNegotiator, MemoryTransport, RelayStreamNegotiator,
    SessionStream, StreamNegotiator, Transport, memory_pair,
};
pub use trace::{MemoryTraceSink, SessionEvent, TraceSink, TracingSink};
pub use tunnel::{
    ConnectionData, StaticTunnelDirectory, TunnelDescriptor, TunnelDirectory, TunnelEndpoint,
};
