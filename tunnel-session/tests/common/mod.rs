//! Shared fixtures for session tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{Notify, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tunnel_session::{
    AccessScope, AccessToken, ConnectionData, ControlMessage, MemoryTraceSink, MemoryTransport,
    RetryHandler, RetryingEvent, SessionConfig, SessionError, SessionEvent, SessionStream,
    StreamNegotiator, TokenProvider, Transport, TunnelDescriptor, TunnelSessionController,
    memory_pair,
};

pub const RELAY_URI: &str = "wss://relay.test/tunnel/t-1";

/// Descriptor with one relay endpoint and no token
pub fn descriptor() -> TunnelDescriptor {
    TunnelDescriptor::new("t-1")
        .with_relay(RELAY_URI.parse().unwrap())
        .with_protocols(["tunnel-relay-client-v2", "tunnel-relay-client"])
}

/// Descriptor carrying a `connect` token
pub fn descriptor_with_token(token: &str) -> TunnelDescriptor {
    descriptor().with_access_token(AccessScope::CONNECT, token)
}

/// Host end of a memory stream
///
/// Answers `hello` and `resume`, echoes everything else.
pub struct FakeHost {
    pub hellos: AtomicUsize,
    pub resumes: AtomicUsize,
    reject_resume: AtomicBool,
    drops: watch::Sender<u64>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            hellos: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            reject_resume: AtomicBool::new(false),
            drops: watch::channel(0).0,
        })
    }

    pub fn reject_resume(&self, reject: bool) {
        self.reject_resume.store(reject, Ordering::SeqCst);
    }

    /// Drop every live connection
    pub fn drop_connections(&self) {
        self.drops.send_modify(|generation| *generation += 1);
    }

    fn spawn(self: &Arc<Self>, transport: MemoryTransport) {
        let host = Arc::clone(self);
        let mut drops = self.drops.subscribe();
        drops.borrow_and_update();
        tokio::spawn(async move { host.serve(transport, drops).await });
    }

    async fn serve(&self, mut transport: MemoryTransport, mut drops: watch::Receiver<u64>) {
        loop {
            tokio::select! {
                _ = drops.changed() => return,
                frame = transport.recv() => {
                    let Ok(Some(frame)) = frame else { return };
                    let reply = match ControlMessage::from_bytes(&frame) {
                        Ok(ControlMessage::Hello { .. }) => {
                            self.hellos.fetch_add(1, Ordering::SeqCst);
                            ControlMessage::Welcome {
                                capabilities: vec!["multiplexing".into()],
                            }
                            .to_bytes()
                            .unwrap()
                        }
                        Ok(ControlMessage::Resume { .. }) => {
                            self.resumes.fetch_add(1, Ordering::SeqCst);
                            let reply = if self.reject_resume.load(Ordering::SeqCst) {
                                ControlMessage::ResumeRejected {
                                    reason: "unknown session".into(),
                                }
                            } else {
                                ControlMessage::Resumed
                            };
                            reply.to_bytes().unwrap()
                        }
                        _ => frame,
                    };
                    if transport.send(reply).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// What the scripted negotiator does on its next call
#[derive(Debug)]
pub enum Step {
    Connect,
    Fail(SessionError),
    /// Block until cancelled
    Hang,
    /// Connect, but fail every write after the configuration handshake
    BreakOnSend,
}

/// Negotiator that plays back a script, then connects
pub struct ScriptedNegotiator {
    steps: Mutex<VecDeque<Step>>,
    pub host: Arc<FakeHost>,
    pub calls: AtomicUsize,
    pub tokens: Mutex<Vec<Option<String>>>,
    pub hang_entered: Notify,
}

impl ScriptedNegotiator {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            host: FakeHost::new(),
            calls: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
            hang_entered: Notify::new(),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> Vec<Option<String>> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamNegotiator for ScriptedNegotiator {
    async fn connect(
        &self,
        connection: &ConnectionData,
        access_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<SessionStream, SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens
            .lock()
            .unwrap()
            .push(access_token.map(str::to_string));

        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Connect);
        match step {
            Step::Connect => {
                let (client, host) = memory_pair();
                self.host.spawn(host);
                Ok(SessionStream::new(
                    Box::new(client),
                    connection.protocols[0].clone(),
                    "memory",
                ))
            }
            Step::BreakOnSend => {
                let (client, host) = memory_pair();
                self.host.spawn(host);
                Ok(SessionStream::new(
                    Box::new(BrokenWrites {
                        inner: client,
                        handshake_sends: 1,
                    }),
                    connection.protocols[0].clone(),
                    "memory",
                ))
            }
            Step::Fail(e) => Err(e),
            Step::Hang => {
                self.hang_entered.notify_one();
                cancel.cancelled().await;
                Err(SessionError::Cancelled)
            }
        }
    }
}

/// Transport whose writes fail once the handshake is done
struct BrokenWrites {
    inner: MemoryTransport,
    handshake_sends: usize,
}

#[async_trait]
impl Transport for BrokenWrites {
    async fn send(&mut self, data: Bytes) -> Result<(), SessionError> {
        if self.handshake_sends == 0 {
            return Err(SessionError::Transient("broken pipe".into()));
        }
        self.handshake_sends -= 1;
        self.inner.send(data).await
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, SessionError> {
        self.inner.recv().await
    }

    async fn close(&mut self) {
        self.inner.close().await
    }
}

/// Provider issuing `token-N` on the N-th call
#[derive(Default)]
pub struct CountingProvider {
    calls: AtomicUsize,
    delay: Duration,
    reject: bool,
    /// Calls that fail transiently before tokens are issued
    transient_failures: usize,
    /// Lifetime of issued tokens
    ttl: Option<Duration>,
}

impl CountingProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            reject: true,
            ..Self::default()
        })
    }

    /// Fail the first `n` calls with a network error
    pub fn failing_first(n: usize) -> Arc<Self> {
        Arc::new(Self {
            transient_failures: n,
            ..Self::default()
        })
    }

    /// Issue tokens that expire `ttl` after they are handed out
    pub fn expiring(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ttl: Some(ttl),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for CountingProvider {
    async fn refresh(
        &self,
        _scope: &AccessScope,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, SessionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        if self.reject {
            return Err(SessionError::Unauthorized("revoked".into()));
        }
        if n <= self.transient_failures {
            return Err(SessionError::Transient("token service unreachable".into()));
        }
        let token = AccessToken::new(format!("token-{n}"));
        Ok(match self.ttl {
            Some(ttl) => token.with_expiry(Utc::now() + chrono::Duration::from_std(ttl).unwrap()),
            None => token,
        })
    }
}

/// Retry handler that records events and can cancel or override delays
#[derive(Default)]
pub struct RecordingRetryHandler {
    events: Mutex<Vec<RetryingEvent>>,
    cancel_from_attempt: Option<u32>,
    delay: Option<Duration>,
}

impl RecordingRetryHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Cancel reconnection at `attempt` and later
    pub fn cancelling_from(attempt: u32) -> Arc<Self> {
        Arc::new(Self {
            cancel_from_attempt: Some(attempt),
            ..Self::default()
        })
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn events(&self) -> Vec<RetryingEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl RetryHandler for RecordingRetryHandler {
    async fn on_retrying(&self, event: &mut RetryingEvent) {
        if self.cancel_from_attempt.is_some_and(|n| event.attempt >= n) {
            event.cancel = true;
        }
        if let Some(delay) = self.delay {
            event.delay = delay;
        }
        self.events.lock().unwrap().push(event.clone());
    }
}

/// A controller wired to scripted collaborators
pub struct Harness {
    pub session: TunnelSessionController,
    pub negotiator: Arc<ScriptedNegotiator>,
    pub provider: Arc<CountingProvider>,
    pub retries: Arc<RecordingRetryHandler>,
    pub trace: Arc<MemoryTraceSink>,
}

impl Harness {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self::with(
            SessionConfig::default(),
            CountingProvider::new(),
            RecordingRetryHandler::new(),
            steps,
        )
    }

    pub fn with(
        config: SessionConfig,
        provider: Arc<CountingProvider>,
        retries: Arc<RecordingRetryHandler>,
        steps: impl IntoIterator<Item = Step>,
    ) -> Self {
        let negotiator = ScriptedNegotiator::new(steps);
        let trace = Arc::new(MemoryTraceSink::default());
        let session = TunnelSessionController::builder()
            .config(config)
            .token_provider(provider.clone())
            .negotiator(negotiator.clone())
            .retry_handler(retries.clone())
            .trace_sink(trace.clone())
            .build()
            .unwrap();
        Self {
            session,
            negotiator,
            provider,
            retries,
            trace,
        }
    }

    pub fn host(&self) -> &FakeHost {
        &self.negotiator.host
    }
}

/// Wait for the next event matching `pred`
pub async fn next_event(
    rx: &mut broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(3600), async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}
