//! Tunnel session controller
//!
//! Drives one session through validate -> connect -> configure -> run,
//! reconnecting on drops until the session is closed.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SessionState;
use crate::auth::{AccessToken, StaticTokenProvider, TokenProvider, TokenStore};
use crate::config::{ConfigError, SessionConfig};
use crate::configure::{ClientSessionConfigurer, SessionConfigurer, SessionContext};
use crate::error::{Disposition, SessionError};
use crate::retry::{RetryHandler, RetryPolicy, RetryingEvent};
use crate::stream::{
    DirectStreamNegotiator, FallbackNegotiator, RelayStreamNegotiator, SessionStream,
    StreamNegotiator,
};
use crate::trace::{SessionEvent, TraceSink, TracingSink};
use crate::tunnel::{ConnectionData, TunnelDescriptor, TunnelDirectory};

const EVENT_CAPACITY: usize = 256;
const INCOMING_CAPACITY: usize = 256;

/// Context handed to a connect action for one attempt
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    /// True when re-establishing a dropped stream of an existing session
    pub is_reconnect: bool,
    /// Cancelled when the caller gives up or the session closes
    pub cancel: CancellationToken,
}

/// Client-side tunnel session
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct TunnelSessionController {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionConfig,
    tokens: TokenStore,
    negotiator: Arc<dyn StreamNegotiator>,
    configurer: Arc<dyn SessionConfigurer>,
    directory: Option<Arc<dyn TunnelDirectory>>,
    retry_handler: RwLock<Option<Arc<dyn RetryHandler>>>,
    trace: Arc<dyn TraceSink>,
    events_tx: broadcast::Sender<SessionEvent>,

    /// All state transitions happen under this lock
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<SessionState>,
    /// Serializes connects, including supervisor reconnects
    connect_lock: Mutex<()>,
    connection: RwLock<Option<ConnectionData>>,

    shutdown: CancellationToken,
    closed_tx: watch::Sender<bool>,
    close_error: RwLock<Option<SessionError>>,

    outbound_tx: mpsc::Sender<Bytes>,
    outbound: Mutex<Outbound>,
    incoming_tx: broadcast::Sender<Bytes>,
}

/// Receiving side of `send`, owned by whichever supervisor is pumping
struct Outbound {
    rx: mpsc::Receiver<Bytes>,
    /// Message whose write failed; sent first on the next stream
    unsent: Option<Bytes>,
}

struct Lifecycle {
    state: SessionState,
    retry: RetryPolicy,
    supervisor: Option<JoinHandle<()>>,
    /// Task id of the most recent supervisor, kept after its handle is taken
    supervisor_id: Option<tokio::task::Id>,
}

/// Builder for [`TunnelSessionController`]
pub struct TunnelSessionControllerBuilder {
    config: SessionConfig,
    token_provider: Option<Arc<dyn TokenProvider>>,
    negotiator: Option<Arc<dyn StreamNegotiator>>,
    configurer: Option<Arc<dyn SessionConfigurer>>,
    directory: Option<Arc<dyn TunnelDirectory>>,
    retry_handler: Option<Arc<dyn RetryHandler>>,
    trace_sink: Option<Arc<dyn TraceSink>>,
}

impl TunnelSessionControllerBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            token_provider: None,
            negotiator: None,
            configurer: None,
            directory: None,
            retry_handler: None,
            trace_sink: None,
        }
    }

    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Stream negotiator; defaults to relay first, then direct
    #[must_use]
    pub fn negotiator(mut self, negotiator: Arc<dyn StreamNegotiator>) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    #[must_use]
    pub fn configurer(mut self, configurer: Arc<dyn SessionConfigurer>) -> Self {
        self.configurer = Some(configurer);
        self
    }

    #[must_use]
    pub fn directory(mut self, directory: Arc<dyn TunnelDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    #[must_use]
    pub fn retry_handler(mut self, handler: Arc<dyn RetryHandler>) -> Self {
        self.retry_handler = Some(handler);
        self
    }

    /// Trace sink; defaults to [`TracingSink`]
    #[must_use]
    pub fn trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<TunnelSessionController, ConfigError> {
        self.config.validate()?;
        let config = self.config;

        let provider = self
            .token_provider
            .unwrap_or_else(|| Arc::new(StaticTokenProvider::empty()));
        let negotiator = self.negotiator.unwrap_or_else(|| {
            let relay: Arc<dyn StreamNegotiator> =
                Arc::new(RelayStreamNegotiator::from_config(&config));
            let direct: Arc<dyn StreamNegotiator> =
                Arc::new(DirectStreamNegotiator::from_config(&config));
            Arc::new(FallbackNegotiator::new(vec![relay, direct]))
        });
        let configurer = self
            .configurer
            .unwrap_or_else(|| Arc::new(ClientSessionConfigurer::from_config(&config)));
        let trace = self.trace_sink.unwrap_or_else(|| Arc::new(TracingSink));

        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (incoming_tx, _) = broadcast::channel(INCOMING_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_buffer);
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (closed_tx, _) = watch::channel(false);

        let inner = Inner {
            tokens: TokenStore::new(config.scope(), provider),
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Idle,
                retry: RetryPolicy::from_config(&config.retry),
                supervisor: None,
                supervisor_id: None,
            }),
            config,
            negotiator,
            configurer,
            directory: self.directory,
            retry_handler: RwLock::new(self.retry_handler),
            trace,
            events_tx,
            state_tx,
            connect_lock: Mutex::new(()),
            connection: RwLock::new(None),
            shutdown: CancellationToken::new(),
            closed_tx,
            close_error: RwLock::new(None),
            outbound_tx,
            outbound: Mutex::new(Outbound {
                rx: outbound_rx,
                unsent: None,
            }),
            incoming_tx,
        };

        Ok(TunnelSessionController {
            inner: Arc::new(inner),
        })
    }
}

impl Default for TunnelSessionControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelSessionController {
    pub fn builder() -> TunnelSessionControllerBuilder {
        TunnelSessionControllerBuilder::new()
    }

    /// Controller with default collaborators
    pub fn new(
        config: SessionConfig,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Result<Self, ConfigError> {
        Self::builder()
            .config(config)
            .token_provider(token_provider)
            .build()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch lifecycle state changes
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to lifecycle trace events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Session-level state held by the configurer
    pub fn session_context(&self) -> SessionContext {
        self.inner.configurer.context()
    }

    /// Track a multiplexed channel so it is carried across resumes
    pub fn open_channel(&self, id: u32) -> bool {
        self.inner.configurer.open_channel(id)
    }

    pub fn close_channel(&self, id: u32) -> bool {
        self.inner.configurer.close_channel(id)
    }

    /// Connection data cached from the last descriptor
    pub fn connection_data(&self) -> Option<ConnectionData> {
        self.inner.connection_data()
    }

    /// Current token if present and not known to be expired
    pub fn validate_access_token(&self) -> Option<String> {
        self.inner.tokens.validate()
    }

    /// Refresh the access token
    ///
    /// Returns `Ok(false)` when re-authorization is rejected. Concurrent
    /// calls share one provider request. A closing session fails with
    /// [`SessionError::Closed`] without contacting the provider.
    pub async fn refresh_tunnel_access_token(
        &self,
        cancel: &CancellationToken,
    ) -> Result<bool, SessionError> {
        if self.state().is_shutting_down() {
            return Err(SessionError::Closed);
        }
        self.inner.refresh_access_token(cancel).await
    }

    /// Replace the retry handler
    pub fn set_retry_handler(&self, handler: Option<Arc<dyn RetryHandler>>) {
        *self
            .inner
            .retry_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = handler;
    }

    /// Run the retry handler, if any, over `event`
    pub async fn on_retrying(&self, event: &mut RetryingEvent) {
        self.inner.on_retrying(event).await
    }

    /// Derive and cache connection data from `descriptor`
    ///
    /// Without a descriptor the cached data is reused; if nothing is cached
    /// this fails with [`SessionError::NoConnectionData`].
    pub fn on_connecting_to_tunnel(
        &self,
        descriptor: Option<&TunnelDescriptor>,
    ) -> Result<(), SessionError> {
        self.inner.on_connecting_to_tunnel(descriptor)
    }

    /// Run `action` under the session lifecycle
    ///
    /// Connects are serialized. The token is validated (refreshing if
    /// needed) before each attempt, and retryable failures go through the
    /// retry policy. Terminal failures close the session; cancellation
    /// returns it to [`SessionState::Idle`]. A session that is already
    /// connected returns immediately.
    pub async fn connect_session<F, Fut>(
        &self,
        mut action: F,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError>
    where
        F: FnMut(ConnectAttempt) -> Fut + Send,
        Fut: Future<Output = Result<(), SessionError>> + Send,
    {
        let _guard = self.inner.lock_connect(cancel).await?;
        if self.inner.ensure_can_connect()? {
            return Ok(());
        }
        self.inner.connect_locked(&mut action, cancel).await
    }

    /// Connect to the tunnel described by `descriptor`, or the cached one
    pub async fn connect_tunnel_session(
        &self,
        descriptor: Option<&TunnelDescriptor>,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let _guard = self.inner.lock_connect(cancel).await?;
        if self.inner.ensure_can_connect()? {
            return Ok(());
        }
        if let Err(e) = self.inner.on_connecting_to_tunnel(descriptor) {
            return Err(self.inner.settle(e).await);
        }
        let mut action = Inner::default_action(Arc::clone(&self.inner));
        self.inner.connect_locked(&mut action, cancel).await
    }

    /// Look up `tunnel_id` in the directory and connect to it
    pub async fn connect_to_tunnel(
        &self,
        tunnel_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let directory = self
            .inner
            .directory
            .clone()
            .ok_or(SessionError::NoConnectionData)?;
        let descriptor = directory
            .get_tunnel(tunnel_id, self.inner.tokens.scope(), cancel)
            .await?;
        self.connect_tunnel_session(Some(&descriptor), cancel).await
    }

    /// Open a stream for the current attempt
    ///
    /// Only valid inside a connect action; elsewhere the state machine
    /// rejects the transition.
    pub async fn create_session_stream(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SessionStream, SessionError> {
        self.inner.create_session_stream(cancel).await
    }

    /// Configure `stream` and make it the session's live stream
    pub async fn configure_session(
        &self,
        stream: SessionStream,
        is_reconnect: bool,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        self.inner.configure_session(stream, is_reconnect, cancel).await
    }

    /// Queue `data` for the host
    ///
    /// Buffered while the stream is down; fails once the session closes.
    pub async fn send(&self, data: Bytes) -> Result<(), SessionError> {
        if self.state().is_shutting_down() {
            return Err(SessionError::Closed);
        }
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(SessionError::Closed),
            result = self.inner.outbound_tx.send(data) => result.map_err(|_| SessionError::Closed),
        }
    }

    /// Subscribe to messages from the host
    pub fn incoming(&self) -> broadcast::Receiver<Bytes> {
        self.inner.incoming_tx.subscribe()
    }

    /// Close the session and wait for teardown
    ///
    /// Idempotent: concurrent callers all return once the session is
    /// closed. The first error reported is the one kept.
    pub async fn close_session(&self, error: Option<SessionError>) {
        self.inner.close(error, true).await
    }

    /// Wait until the session has closed
    pub async fn wait_closed(&self) {
        self.inner.wait_closed().await
    }

    /// Error the session closed with, if any
    pub fn close_error(&self) -> Option<SessionError> {
        self.inner
            .close_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for TunnelSessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSessionController")
            .field("state", &self.state())
            .field("tokens", &self.inner.tokens)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        self.trace.record(&event);
        let _ = self.events_tx.send(event);
    }

    fn current_state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn connection_data(&self) -> Option<ConnectionData> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply a transition; the caller holds the lifecycle lock
    fn apply(&self, lc: &mut Lifecycle, next: SessionState) -> Result<(), SessionError> {
        let from = lc.state;
        if from == next {
            return Ok(());
        }
        if from.is_terminal() || (from == SessionState::Closing && next != SessionState::Closed) {
            return Err(SessionError::Closed);
        }
        if !from.can_transition_to(next) {
            return Err(SessionError::InvalidStateTransition {
                from: from.to_string(),
                to: next.to_string(),
            });
        }

        debug!("Session state: {:?} -> {:?}", from, next);
        lc.state = next;
        self.state_tx.send_replace(next);
        self.emit(SessionEvent::StateChanged { from, to: next });
        Ok(())
    }

    async fn transition(&self, next: SessionState) -> Result<(), SessionError> {
        let mut lc = self.lifecycle.lock().await;
        self.apply(&mut lc, next)
    }

    async fn lock_connect(
        &self,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::MutexGuard<'_, ()>, SessionError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            _ = self.shutdown.cancelled() => Err(SessionError::Closed),
            guard = self.connect_lock.lock() => Ok(guard),
        }
    }

    /// Returns `Ok(true)` if already connected
    fn ensure_can_connect(&self) -> Result<bool, SessionError> {
        match self.current_state() {
            SessionState::Closing | SessionState::Closed => Err(SessionError::Closed),
            SessionState::Connected => Ok(true),
            _ => Ok(false),
        }
    }

    fn on_connecting_to_tunnel(
        &self,
        descriptor: Option<&TunnelDescriptor>,
    ) -> Result<(), SessionError> {
        let Some(descriptor) = descriptor else {
            return match self.connection_data() {
                Some(_) => Ok(()),
                None => Err(SessionError::NoConnectionData),
            };
        };

        let data = ConnectionData::from_descriptor(descriptor, &self.config.protocols)?;
        if let Some(token) = descriptor.access_token(self.tokens.scope().as_str()) {
            if self.tokens.seed_if_empty(AccessToken::new(token)) {
                debug!(tunnel_id = %descriptor.tunnel_id, "Seeded access token from descriptor");
            }
        }
        debug!(
            tunnel_id = %data.tunnel_id,
            relays = data.relay_uris.len(),
            hosts = data.host_endpoints.len(),
            "Cached tunnel connection data"
        );
        *self.connection.write().unwrap_or_else(PoisonError::into_inner) = Some(data);
        Ok(())
    }

    /// Run a connect while holding the connect lock
    async fn connect_locked<F, Fut>(
        self: &Arc<Self>,
        action: &mut F,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError>
    where
        F: FnMut(ConnectAttempt) -> Fut + Send,
        Fut: Future<Output = Result<(), SessionError>> + Send,
    {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            _ = self.shutdown.cancelled() => Err(SessionError::Closed),
            result = self.run_lifecycle(action, false, None, cancel) => result,
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.settle(e).await),
        }
    }

    /// Route a failed connect: unwind to idle or close
    async fn settle(self: &Arc<Self>, error: SessionError) -> SessionError {
        match error.disposition() {
            Disposition::Unwind => {
                debug!(error = %error, "Connect unwound");
                self.unwind_to_idle().await;
            }
            _ => self.close(Some(error.clone()), true).await,
        }
        error
    }

    async fn unwind_to_idle(&self) {
        let mut lc = self.lifecycle.lock().await;
        if matches!(
            lc.state,
            SessionState::Validating
                | SessionState::Connecting
                | SessionState::Configuring
                | SessionState::Retrying
        ) {
            let _ = self.apply(&mut lc, SessionState::Idle);
            lc.retry.reset();
        }
    }

    /// Connect action used by tunnel connects and reconnects
    fn default_action(
        inner: Arc<Self>,
    ) -> impl FnMut(ConnectAttempt) -> BoxFuture<'static, Result<(), SessionError>> + Send {
        move |attempt: ConnectAttempt| -> BoxFuture<'static, Result<(), SessionError>> {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                let stream = inner.create_session_stream(&attempt.cancel).await?;
                inner
                    .configure_session(stream, attempt.is_reconnect, &attempt.cancel)
                    .await
            })
        }
    }

    /// Validate, run the action, and retry until it succeeds or gives up
    async fn run_lifecycle<F, Fut>(
        self: &Arc<Self>,
        action: &mut F,
        mut is_reconnect: bool,
        mut pending: Option<SessionError>,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError>
    where
        F: FnMut(ConnectAttempt) -> Fut + Send,
        Fut: Future<Output = Result<(), SessionError>> + Send,
    {
        let cycle_start = Instant::now();
        loop {
            if let Some(error) = pending.take() {
                self.transition(SessionState::Retrying).await?;
                self.await_retry(error, cycle_start, cancel).await?;
            }

            match self.attempt(action, is_reconnect, cancel).await {
                Ok(()) => {
                    if self.current_state() != SessionState::Connected {
                        debug!("Connect action finished without a live stream");
                        self.unwind_to_idle().await;
                    }
                    return Ok(());
                }
                Err(SessionError::ResumeRejected(reason)) => {
                    info!(%reason, "Session resume rejected, reconnecting as a fresh session");
                    self.configurer.reset();
                    is_reconnect = false;
                    pending = Some(SessionError::ResumeRejected(reason));
                }
                Err(e) if e.is_retryable() => pending = Some(e),
                Err(e) => return Err(e),
            }
        }
    }

    /// One validate + connect attempt, with a single refresh on `Expired`
    async fn attempt<F, Fut>(
        &self,
        action: &mut F,
        is_reconnect: bool,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError>
    where
        F: FnMut(ConnectAttempt) -> Fut + Send,
        Fut: Future<Output = Result<(), SessionError>> + Send,
    {
        self.transition(SessionState::Validating).await?;

        let mut refreshed = false;
        if self.tokens.validate().is_none() {
            self.refresh_for_attempt(cancel).await?;
            refreshed = true;
        }

        loop {
            let result = action(ConnectAttempt {
                is_reconnect,
                cancel: cancel.clone(),
            })
            .await;

            match result {
                Err(SessionError::Expired) if !refreshed => {
                    debug!("Access token rejected as expired, refreshing");
                    self.transition(SessionState::Validating).await?;
                    self.refresh_for_attempt(cancel).await?;
                    refreshed = true;
                }
                Err(SessionError::Expired) => {
                    return Err(SessionError::Unauthorized(
                        "access token rejected after refresh".into(),
                    ));
                }
                other => return other,
            }
        }
    }

    async fn refresh_for_attempt(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        if self.refresh_access_token(cancel).await? {
            Ok(())
        } else {
            Err(SessionError::Unauthorized(
                "access token refresh was rejected".into(),
            ))
        }
    }

    async fn refresh_access_token(&self, cancel: &CancellationToken) -> Result<bool, SessionError> {
        let result = self.tokens.refresh(cancel).await;
        match &result {
            Ok(true) => self.emit(SessionEvent::TokenRefreshed),
            Ok(false) => self.emit(SessionEvent::TokenRefreshFailed {
                error: "re-authorization rejected".into(),
            }),
            Err(SessionError::Cancelled) => {}
            Err(e) => self.emit(SessionEvent::TokenRefreshFailed {
                error: e.to_string(),
            }),
        }
        result
    }

    async fn on_retrying(&self, event: &mut RetryingEvent) {
        let handler = self
            .retry_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler.on_retrying(event).await;
        }
    }

    /// Consult the policy and handler, then wait out the delay
    ///
    /// Returns the triggering error when the retry is denied.
    async fn await_retry(
        &self,
        error: SessionError,
        cycle_start: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let next = self.lifecycle.lock().await.retry.next_attempt();
        let Some((attempt, delay)) = next else {
            warn!(error = %error, "Retry attempts exhausted");
            return Err(error);
        };

        let mut event = RetryingEvent::new(error.clone(), attempt, delay, cycle_start.elapsed());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            _ = self.on_retrying(&mut event) => {}
        }

        self.emit(SessionEvent::Retrying {
            attempt,
            delay_ms: u64::try_from(event.delay.as_millis()).unwrap_or(u64::MAX),
            error: error.to_string(),
            cancelled: event.cancel,
        });

        if event.cancel {
            info!(attempt, "Reconnection cancelled by retry handler");
            return Err(error);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            _ = tokio::time::sleep(event.delay) => Ok(()),
        }
    }

    async fn create_session_stream(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SessionStream, SessionError> {
        let connection = self
            .connection_data()
            .ok_or(SessionError::NoConnectionData)?;
        self.transition(SessionState::Connecting).await?;

        // Token was validated at the start of this attempt
        let token = self.tokens.current();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = self.negotiator.connect(&connection, token.as_deref(), cancel) => result,
        }
    }

    async fn configure_session(
        self: &Arc<Self>,
        mut stream: SessionStream,
        is_reconnect: bool,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        if let Err(e) = self.transition(SessionState::Configuring).await {
            stream.close().await;
            return Err(e);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = self.configurer.configure(&mut stream, is_reconnect, cancel) => result,
        };
        if let Err(e) = result {
            stream.close().await;
            return Err(e);
        }

        self.register(stream, is_reconnect).await
    }

    /// Make `stream` the live stream and start its supervisor
    async fn register(
        self: &Arc<Self>,
        mut stream: SessionStream,
        is_reconnect: bool,
    ) -> Result<(), SessionError> {
        let mut lc = self.lifecycle.lock().await;
        if let Err(e) = self.apply(&mut lc, SessionState::Connected) {
            drop(lc);
            stream.close().await;
            return Err(e);
        }

        lc.retry.reset();
        self.emit(SessionEvent::StreamOpened {
            protocol: stream.protocol().to_string(),
            endpoint: stream.endpoint().to_string(),
            is_reconnect,
        });
        let handle = tokio::spawn(Inner::supervise(Arc::clone(self), stream));
        lc.supervisor_id = Some(handle.id());
        lc.supervisor = Some(handle);
        Ok(())
    }

    /// Own the live stream until it drops, then drive the reconnect cycle
    fn supervise(self: Arc<Self>, mut stream: SessionStream) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let dropped = self.pump(&mut stream).await;
            stream.close().await;

            let Some(error) = dropped else {
                return;
            };
            warn!(error = %error, "Session stream dropped");
            self.emit(SessionEvent::StreamDropped {
                error: error.to_string(),
            });

            let cancel = self.shutdown.child_token();
            let Ok(_guard) = self.lock_connect(&cancel).await else {
                return;
            };
            let mut action = Inner::default_action(Arc::clone(&self));
            match self.run_lifecycle(&mut action, true, Some(error), &cancel).await {
                Ok(()) => {}
                Err(_) if self.shutdown.is_cancelled() => {}
                Err(e) => self.close(Some(e), false).await,
            }
        })
    }

    /// Shuttle messages until shutdown (`None`) or a drop (`Some`)
    async fn pump(&self, stream: &mut SessionStream) -> Option<SessionError> {
        let mut outbound = self.outbound.lock().await;
        if let Some(data) = outbound.unsent.take() {
            debug!(len = data.len(), "Resending message from dropped stream");
            if let Err(e) = stream.send(data.clone()).await {
                outbound.unsent = Some(data);
                return Some(e);
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return None,
                inbound = stream.recv() => match inbound {
                    Ok(Some(data)) => {
                        let _ = self.incoming_tx.send(data);
                    }
                    Ok(None) => {
                        return Some(SessionError::Transient("stream closed by host".into()));
                    }
                    Err(e) => return Some(e),
                },
                Some(data) = outbound.rx.recv() => {
                    if let Err(e) = stream.send(data.clone()).await {
                        outbound.unsent = Some(data);
                        return Some(e);
                    }
                }
            }
        }
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed_tx.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    fn record_close_error(&self, error: Option<SessionError>) {
        let Some(error) = error else { return };
        let mut slot = self
            .close_error
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() && !*self.closed_tx.borrow() {
            *slot = Some(error);
        }
    }

    fn finish_close(&self) {
        let error = self
            .close_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match &error {
            Some(e) => warn!(error = %e, "Session closed"),
            None => info!("Session closed"),
        }
        self.emit(SessionEvent::Closed {
            error: error.map(|e| e.to_string()),
        });
        self.closed_tx.send_replace(true);
    }

    /// Close path shared by callers and terminal failures
    ///
    /// Teardown runs on its own task so an abandoned caller cannot strand
    /// the session in `Closing`. With `wait`, returns once it has finished.
    async fn close(self: &Arc<Self>, error: Option<SessionError>, wait: bool) {
        let in_supervisor = {
            let mut lc = self.lifecycle.lock().await;
            let in_supervisor =
                lc.supervisor_id.is_some() && tokio::task::try_id() == lc.supervisor_id;
            match lc.state {
                SessionState::Closed => return,
                SessionState::Closing => {}
                SessionState::Idle | SessionState::Validating => {
                    self.record_close_error(error);
                    let _ = self.apply(&mut lc, SessionState::Closed);
                    self.shutdown.cancel();
                    drop(lc);
                    self.finish_close();
                    return;
                }
                _ => {
                    self.record_close_error(error);
                    let _ = self.apply(&mut lc, SessionState::Closing);
                    self.shutdown.cancel();
                    let supervisor = lc.supervisor.take();
                    tokio::spawn(Inner::teardown(Arc::clone(self), supervisor));
                }
            }
            in_supervisor
        };

        // A retry handler closing from inside the supervisor must not wait on itself
        if wait && !in_supervisor {
            self.wait_closed().await;
        }
    }

    /// Wait for the supervisor to release the stream, then finish closing
    async fn teardown(self: Arc<Self>, supervisor: Option<JoinHandle<()>>) {
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                warn!("Session supervisor failed: {}", e);
            }
        }

        {
            let mut lc = self.lifecycle.lock().await;
            let _ = self.apply(&mut lc, SessionState::Closed);
        }
        self.finish_close();
    }
}
