//! Session lifecycle scenarios against scripted collaborators

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use common::{
    CountingProvider, Harness, RecordingRetryHandler, Step, descriptor, descriptor_with_token,
    next_event,
};
use tokio_util::sync::CancellationToken;
use tunnel_session::{
    ConnectAttempt, SessionConfig, SessionError, SessionEvent, SessionState,
    StaticTunnelDirectory, TunnelSessionController,
};

use SessionState::*;

#[tokio::test]
async fn absent_token_is_refreshed_before_connecting() {
    let h = Harness::new([]);

    h.session
        .connect_tunnel_session(Some(&descriptor()), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.session.state(), Connected);
    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.negotiator.tokens(), vec![Some("token-1".to_string())]);
    assert_eq!(
        h.trace.states(),
        vec![Validating, Connecting, Configuring, Connected]
    );
    assert_eq!(h.host().hellos.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn descriptor_token_is_used_without_refresh() {
    let h = Harness::new([]);

    h.session
        .connect_tunnel_session(
            Some(&descriptor_with_token("from-descriptor")),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(h.provider.calls(), 0);
    assert_eq!(
        h.session.validate_access_token().as_deref(),
        Some("from-descriptor")
    );
    assert_eq!(
        h.negotiator.tokens(),
        vec![Some("from-descriptor".to_string())]
    );
}

#[tokio::test]
async fn unauthorized_refresh_closes_session() {
    let h = Harness::with(
        SessionConfig::default(),
        CountingProvider::rejecting(),
        RecordingRetryHandler::new(),
        [],
    );

    let err = h
        .session
        .connect_tunnel_session(Some(&descriptor()), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::Unauthorized(_)));
    assert_eq!(h.session.state(), Closed);
    assert_eq!(h.trace.states(), vec![Validating, Closed]);
    assert!(matches!(
        h.session.close_error(),
        Some(SessionError::Unauthorized(_))
    ));
    assert_eq!(h.negotiator.calls(), 0);
    assert!(h.retries.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropped_stream_reconnects_and_resumes() {
    let h = Harness::new([]);
    let mut events = h.session.subscribe();

    h.session
        .connect_tunnel_session(Some(&descriptor()), &CancellationToken::new())
        .await
        .unwrap();
    let session_id = h.session.session_context().session_id;
    assert!(h.session.open_channel(5));

    h.host().drop_connections();

    let reopened = next_event(&mut events, |e| {
        matches!(e, SessionEvent::StreamOpened { is_reconnect: true, .. })
    })
    .await;
    assert!(matches!(reopened, SessionEvent::StreamOpened { .. }));

    assert_eq!(h.session.state(), Connected);
    // Reconnect resumed the session instead of repeating the hello handshake
    assert_eq!(h.host().hellos.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(h.host().resumes.load(std::sync::atomic::Ordering::SeqCst), 1);

    let ctx = h.session.session_context();
    assert_eq!(ctx.session_id, session_id);
    assert_eq!(ctx.connect_count, 2);
    assert!(ctx.channels.contains(&5));

    let retries = h.retries.events();
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].attempt, 1);
    assert_eq!(retries[0].delay, Duration::from_secs(1));
    assert!(retries[0].error.is_retryable());

    assert_eq!(
        h.trace.states(),
        vec![
            Validating,
            Connecting,
            Configuring,
            Connected,
            Retrying,
            Validating,
            Connecting,
            Configuring,
            Connected,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn denied_retry_closes_session() {
    let h = Harness::with(
        SessionConfig::default(),
        CountingProvider::new(),
        RecordingRetryHandler::cancelling_from(1),
        [],
    );

    h.session
        .connect_tunnel_session(Some(&descriptor()), &CancellationToken::new())
        .await
        .unwrap();
    h.host().drop_connections();
    h.session.wait_closed().await;

    assert_eq!(h.session.state(), Closed);
    let states = h.trace.states();
    assert_eq!(&states[states.len() - 3..], &[Retrying, Closing, Closed]);
    assert!(matches!(
        h.session.close_error(),
        Some(SessionError::Transient(_))
    ));
    assert_eq!(h.negotiator.calls(), 1);
    assert!(h.retries.events()[0].cancel);
}

#[tokio::test]
async fn cancellation_during_stream_creation_leaves_session_connectable() {
    let h = Harness::new([Step::Hang]);
    let cancel = CancellationToken::new();

    let connect = {
        let session = h.session.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            session
                .connect_tunnel_session(Some(&descriptor_with_token("t")), &cancel)
                .await
        })
    };

    h.negotiator.hang_entered.notified().await;
    cancel.cancel();

    assert_eq!(connect.await.unwrap(), Err(SessionError::Cancelled));
    assert_eq!(h.session.state(), Idle);
    assert!(
        !h.trace
            .events()
            .iter()
            .any(|e| matches!(e, SessionEvent::StreamOpened { .. }))
    );

    // Cached connection data lets the next connect omit the descriptor
    h.session
        .connect_tunnel_session(None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.session.state(), Connected);
    assert_eq!(h.negotiator.calls(), 2);
}

#[tokio::test]
async fn closed_session_rejects_further_transitions() {
    let h = Harness::new([]);
    h.session.on_connecting_to_tunnel(Some(&descriptor())).unwrap();

    h.session.close_session(None).await;
    assert_eq!(h.session.state(), Closed);

    let cancel = CancellationToken::new();
    assert_eq!(
        h.session.connect_tunnel_session(None, &cancel).await,
        Err(SessionError::Closed)
    );
    assert_eq!(
        h.session.create_session_stream(&cancel).await.unwrap_err(),
        SessionError::Closed
    );
    assert_eq!(
        h.session.send(Bytes::from_static(b"late")).await,
        Err(SessionError::Closed)
    );
    assert_eq!(h.trace.states(), vec![Closed]);
}

#[tokio::test]
async fn expired_rejection_refreshes_once_and_retries_the_attempt() {
    let h = Harness::new([Step::Fail(SessionError::Expired)]);

    h.session
        .connect_tunnel_session(Some(&descriptor_with_token("stale")), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.provider.calls(), 1);
    assert_eq!(
        h.negotiator.tokens(),
        vec![Some("stale".to_string()), Some("token-1".to_string())]
    );
    assert_eq!(
        h.trace.states(),
        vec![Validating, Connecting, Validating, Connecting, Configuring, Connected]
    );
    assert!(h.retries.events().is_empty());
}

#[tokio::test]
async fn expired_after_refresh_is_unauthorized() {
    let h = Harness::new([
        Step::Fail(SessionError::Expired),
        Step::Fail(SessionError::Expired),
    ]);

    let err = h
        .session
        .connect_tunnel_session(Some(&descriptor_with_token("stale")), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::Unauthorized(_)));
    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.session.state(), Closed);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_exponentially() {
    let h = Harness::new([
        Step::Fail(SessionError::Transient("refused".into())),
        Step::Fail(SessionError::Transient("refused".into())),
    ]);

    h.session
        .connect_tunnel_session(Some(&descriptor()), &CancellationToken::new())
        .await
        .unwrap();

    let delays: Vec<_> = h.retries.events().iter().map(|e| e.delay).collect();
    assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
    assert_eq!(h.negotiator.calls(), 3);
    // Token is refreshed once; later attempts revalidate the same token
    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.session.state(), Connected);
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_close_the_session() {
    let h = Harness::with(
        SessionConfig::default().with_max_attempts(1),
        CountingProvider::new(),
        RecordingRetryHandler::new(),
        [
            Step::Fail(SessionError::Transient("refused".into())),
            Step::Fail(SessionError::Transient("still refused".into())),
        ],
    );

    let err = h
        .session
        .connect_tunnel_session(Some(&descriptor()), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err, SessionError::Transient("still refused".into()));
    assert_eq!(h.session.state(), Closed);
    assert_eq!(h.retries.events().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_resume_falls_back_to_fresh_session() {
    let h = Harness::new([]);
    let mut events = h.session.subscribe();

    h.session
        .connect_tunnel_session(Some(&descriptor()), &CancellationToken::new())
        .await
        .unwrap();
    let first_id = h.session.session_context().session_id;
    next_event(&mut events, |e| matches!(e, SessionEvent::StreamOpened { .. })).await;

    h.host().reject_resume(true);
    h.host().drop_connections();

    let reopened = next_event(&mut events, |e| matches!(e, SessionEvent::StreamOpened { .. })).await;
    assert_eq!(
        reopened,
        SessionEvent::StreamOpened {
            protocol: "tunnel-relay-client-v2".into(),
            endpoint: "memory".into(),
            is_reconnect: false,
        }
    );

    assert_eq!(h.host().resumes.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(h.host().hellos.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert_ne!(h.session.session_context().session_id, first_id);

    let attempts: Vec<_> = h.retries.events().iter().map(|e| e.attempt).collect();
    assert_eq!(attempts, vec![1, 2]);
    assert!(matches!(
        h.retries.events()[1].error,
        SessionError::ResumeRejected(_)
    ));
}

#[tokio::test]
async fn messages_flow_through_the_live_stream() {
    let h = Harness::new([]);
    h.session
        .connect_tunnel_session(Some(&descriptor()), &CancellationToken::new())
        .await
        .unwrap();

    let mut incoming = h.session.incoming();
    h.session.send(Bytes::from_static(b"ping")).await.unwrap();

    let echoed = tokio::time::timeout(Duration::from_secs(5), incoming.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, Bytes::from_static(b"ping"));
}

#[tokio::test]
async fn connect_session_runs_custom_action() {
    let h = Harness::new([]);
    h.session.on_connecting_to_tunnel(Some(&descriptor())).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let action = {
        let session = h.session.clone();
        let seen = Arc::clone(&seen);
        move |attempt: ConnectAttempt| {
            let session = session.clone();
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(attempt.is_reconnect);
                let stream = session.create_session_stream(&attempt.cancel).await?;
                assert_eq!(stream.protocol(), "tunnel-relay-client-v2");
                session
                    .configure_session(stream, attempt.is_reconnect, &attempt.cancel)
                    .await
            }
        }
    };

    h.session
        .connect_session(action, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![false]);
    assert_eq!(h.session.state(), Connected);
}

#[tokio::test]
async fn stream_operations_outside_connect_are_rejected() {
    let h = Harness::new([]);
    h.session.on_connecting_to_tunnel(Some(&descriptor())).unwrap();

    let err = h
        .session
        .create_session_stream(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::InvalidStateTransition { .. }));
    assert_eq!(h.session.state(), Idle);
}

#[tokio::test]
async fn missing_connection_data_unwinds_to_idle() {
    let h = Harness::new([]);

    let err = h
        .session
        .connect_tunnel_session(None, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err, SessionError::NoConnectionData);
    assert_eq!(h.session.state(), Idle);
    assert_eq!(
        h.session.on_connecting_to_tunnel(None),
        Err(SessionError::NoConnectionData)
    );
}

#[tokio::test]
async fn protocol_mismatch_is_terminal() {
    let h = Harness::with(
        SessionConfig::default().with_protocols(["tunnel-relay-client-v2"]),
        CountingProvider::new(),
        RecordingRetryHandler::new(),
        [],
    );
    let desc = descriptor().with_protocols(["legacy-v0"]);

    let err = h
        .session
        .connect_tunnel_session(Some(&desc), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::ProtocolMismatch { .. }));
    assert_eq!(h.session.state(), Closed);
}

#[tokio::test]
async fn connect_to_tunnel_uses_directory() {
    let negotiator = common::ScriptedNegotiator::new([]);
    let directory: StaticTunnelDirectory = [descriptor_with_token("dir-token")].into_iter().collect();
    let session = TunnelSessionController::builder()
        .negotiator(negotiator.clone())
        .directory(Arc::new(directory))
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    assert_eq!(
        session.connect_to_tunnel("unknown", &cancel).await,
        Err(SessionError::NoConnectionData)
    );
    assert_eq!(session.state(), Idle);

    session.connect_to_tunnel("t-1", &cancel).await.unwrap();
    assert_eq!(session.state(), Connected);
    assert_eq!(negotiator.tokens(), vec![Some("dir-token".to_string())]);
    assert_eq!(
        session.connection_data().map(|d| d.tunnel_id),
        Some("t-1".to_string())
    );
}

#[tokio::test]
async fn close_session_releases_the_stream() {
    let h = Harness::new([]);
    h.session
        .connect_tunnel_session(Some(&descriptor()), &CancellationToken::new())
        .await
        .unwrap();

    h.session.close_session(None).await;

    assert_eq!(h.session.state(), Closed);
    assert!(h.session.close_error().is_none());
    let states = h.trace.states();
    assert_eq!(&states[states.len() - 2..], &[Closing, Closed]);
    assert_eq!(
        h.trace.events().last(),
        Some(&SessionEvent::Closed { error: None })
    );
}

#[tokio::test(start_paused = true)]
async fn message_from_failed_write_is_sent_after_reconnect() {
    let h = Harness::new([Step::BreakOnSend]);
    let mut events = h.session.subscribe();
    let mut incoming = h.session.incoming();
    h.session
        .connect_tunnel_session(Some(&descriptor()), &CancellationToken::new())
        .await
        .unwrap();

    h.session.send(Bytes::from_static(b"first")).await.unwrap();

    let dropped = next_event(&mut events, |e| matches!(e, SessionEvent::StreamDropped { .. })).await;
    assert!(matches!(dropped, SessionEvent::StreamDropped { error } if error.contains("broken pipe")));
    next_event(&mut events, |e| {
        matches!(e, SessionEvent::StreamOpened { is_reconnect: true, .. })
    })
    .await;

    let echoed = tokio::time::timeout(Duration::from_secs(5), incoming.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, Bytes::from_static(b"first"));
    assert_eq!(h.negotiator.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn transient_refresh_failure_goes_through_retry() {
    let h = Harness::with(
        SessionConfig::default(),
        CountingProvider::failing_first(1),
        RecordingRetryHandler::new(),
        [],
    );

    h.session
        .connect_tunnel_session(Some(&descriptor()), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.session.state(), Connected);
    assert_eq!(h.provider.calls(), 2);
    assert_eq!(h.negotiator.tokens(), vec![Some("token-2".to_string())]);

    let retries = h.retries.events();
    assert_eq!(retries.len(), 1);
    assert!(matches!(retries[0].error, SessionError::Transient(_)));
    assert_eq!(
        h.trace.states(),
        vec![Validating, Retrying, Validating, Connecting, Configuring, Connected]
    );
    assert!(
        h.trace
            .events()
            .iter()
            .any(|e| matches!(e, SessionEvent::TokenRefreshFailed { .. }))
    );
}

#[tokio::test]
async fn token_expired_during_downtime_is_refreshed_before_reconnect() {
    // Token expiry follows the wall clock, so this runs in real time
    let h = Harness::with(
        SessionConfig::default()
            .with_retry_delays(Duration::from_millis(10), Duration::from_millis(100)),
        CountingProvider::expiring(Duration::from_millis(100)),
        RecordingRetryHandler::new(),
        [],
    );
    let mut events = h.session.subscribe();
    h.session
        .connect_tunnel_session(Some(&descriptor()), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.provider.calls(), 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(h.session.validate_access_token().is_none());
    h.host().drop_connections();

    next_event(&mut events, |e| {
        matches!(e, SessionEvent::StreamOpened { is_reconnect: true, .. })
    })
    .await;

    assert_eq!(h.provider.calls(), 2);
    assert_eq!(
        h.negotiator.tokens(),
        vec![Some("token-1".to_string()), Some("token-2".to_string())]
    );

    // Revalidation refreshes before the reconnect reaches the negotiator
    let events = h.trace.events();
    let retrying = events
        .iter()
        .position(|e| matches!(e, SessionEvent::StateChanged { to: Retrying, .. }))
        .unwrap();
    let tail: Vec<_> = events[retrying..]
        .iter()
        .filter(|e| {
            matches!(
                e,
                SessionEvent::StateChanged { .. } | SessionEvent::TokenRefreshed
            )
        })
        .take(4)
        .cloned()
        .collect();
    assert_eq!(
        tail,
        vec![
            SessionEvent::StateChanged { from: Connected, to: Retrying },
            SessionEvent::StateChanged { from: Retrying, to: Validating },
            SessionEvent::TokenRefreshed,
            SessionEvent::StateChanged { from: Validating, to: Connecting },
        ]
    );
}

#[tokio::test]
async fn refresh_after_close_does_not_reach_provider() {
    let h = Harness::new([]);
    h.session.close_session(None).await;

    assert_eq!(
        h.session
            .refresh_tunnel_access_token(&CancellationToken::new())
            .await,
        Err(SessionError::Closed)
    );
    assert_eq!(h.provider.calls(), 0);
}
