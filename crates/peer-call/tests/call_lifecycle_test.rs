//! Call lifecycle integration tests
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p peer-call --test call_lifecycle_test
//! ```

mod harness;

use harness::{is_signal, TestCall};
use peer_call::media::MediaConstraints;
use peer_call::{CallEvent, CallId, CallState, ConnectionState, Error, ParticipantId};

// ============================================================================
// Initiate
// ============================================================================

#[tokio::test]
async fn test_initiate_call_creates_initiator_per_participant() {
    let mut call = TestCall::new();

    call.service
        .initiate_call("call-1", ["u1", "u2"], None)
        .await
        .unwrap();

    let peers = call.service.peers().await;
    let ids: Vec<&str> = peers.iter().map(|p| p.participant.as_str()).collect();
    assert_eq!(ids, vec!["u1", "u2"]);
    assert!(peers.iter().all(|p| p.is_initiator));
    assert_eq!(
        call.service.participants().await,
        vec![ParticipantId::from("u1"), ParticipantId::from("u2")]
    );

    let events = call.drain();
    assert!(events.iter().any(|e| is_signal(e, "u1", "offer")));
    assert!(events.iter().any(|e| is_signal(e, "u2", "offer")));
    assert!(events.iter().any(|e| matches!(
        e,
        CallEvent::CallInitiated { call_id, participants }
            if call_id.as_str() == "call-1" && participants.len() == 2
    )));

    assert_eq!(call.service.active_call().await, Some(CallId::from("call-1")));
    assert_eq!(call.service.call_state().await, CallState::Initiating);
}

#[tokio::test]
async fn test_initiator_adds_tracks_and_control_channel_before_offer() {
    let call = TestCall::new();
    call.service.initiate_call("call-1", ["u1"], None).await.unwrap();

    let mock = call.factory.connection(0);
    let audio = mock.op_index("add_track:audio").unwrap();
    let video = mock.op_index("add_track:video").unwrap();
    let channel = mock.op_index("create_data_channel:call-control").unwrap();
    let offer = mock.op_index("create_offer").unwrap();
    let local = mock.op_index("set_local:offer").unwrap();

    assert!(audio < offer && video < offer && channel < offer);
    assert!(offer < local);
}

#[tokio::test]
async fn test_local_media_shared_by_every_connection() {
    let call = TestCall::new();
    call.service
        .initiate_call("call-1", ["u1", "u2", "u3"], None)
        .await
        .unwrap();

    assert_eq!(call.devices.user_media_calls(), 1);
    for mock in call.factory.connections() {
        assert!(mock.has_op("add_track:audio"));
    }
}

#[tokio::test]
async fn test_second_call_rejected_while_active() {
    let call = TestCall::new();
    call.service.initiate_call("call-1", ["u1"], None).await.unwrap();

    let result = call.service.initiate_call("call-2", ["u2"], None).await;
    assert!(matches!(result, Err(Error::CallAlreadyActive(id)) if id == "call-1"));

    let result = call.service.join_call("call-3", "u3", None).await;
    assert!(matches!(result, Err(Error::CallAlreadyActive(_))));
    assert_eq!(call.factory.created_count(), 1);
}

#[tokio::test]
async fn test_duplicate_participant_rejected() {
    let call = TestCall::new();

    let result = call
        .service
        .initiate_call("call-1", ["u1", "u2", "u1"], None)
        .await;
    assert!(matches!(result, Err(Error::DuplicatePeer { participant, .. }) if participant == "u1"));
    assert_eq!(call.factory.created_count(), 0);
    assert_eq!(call.service.call_state().await, CallState::None);
}

#[tokio::test]
async fn test_too_many_participants_rejected() {
    let call = TestCall::new();
    let participants: Vec<String> = (0..11).map(|i| format!("u{}", i)).collect();

    let result = call.service.initiate_call("call-1", participants, None).await;
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[tokio::test]
async fn test_media_failure_creates_no_connections() {
    let mut call = TestCall::new();
    call.devices.set_fail_user_media(true);

    let result = call.service.initiate_call("call-1", ["u1"], None).await;
    assert!(matches!(result, Err(Error::MediaAcquisition(_))));
    assert_eq!(call.factory.created_count(), 0);
    assert_eq!(call.service.call_state().await, CallState::None);

    let events = call.drain();
    assert!(events
        .iter()
        .any(|e| matches!(e, CallEvent::MediaError { error: Error::MediaAcquisition(_) })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, CallEvent::CallInitiated { .. })));

    // The service is usable again once capture works
    call.devices.set_fail_user_media(false);
    call.service.initiate_call("call-1", ["u1"], None).await.unwrap();
    assert_eq!(call.factory.created_count(), 1);
}

#[tokio::test]
async fn test_empty_constraints_fail_as_media_error() {
    let call = TestCall::new();
    let constraints = MediaConstraints {
        audio: false.into(),
        video: false.into(),
        screen: false,
    };

    let result = call
        .service
        .initiate_call("call-1", ["u1"], Some(constraints))
        .await;
    assert!(matches!(result, Err(Error::MediaAcquisition(_))));
}

#[tokio::test]
async fn test_connection_failure_reported_per_peer() {
    let mut call = TestCall::new();
    call.factory.set_fail_create(true);

    call.service.initiate_call("call-1", ["u1", "u2"], None).await.unwrap();

    let errors: Vec<String> = call
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            CallEvent::CallError {
                participant: Some(p),
                error: Error::ConnectionFailure(_),
                ..
            } => Some(p.to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec!["u1", "u2"]);
    assert!(call.service.peers().await.is_empty());
}

#[tokio::test]
async fn test_failed_offer_leaves_no_participant() {
    let mut call = TestCall::new();
    call.factory.set_fail_offers(true);

    call.service.initiate_call("call-1", ["u1"], None).await.unwrap();

    assert!(call.drain().iter().any(|e| matches!(
        e,
        CallEvent::CallError {
            participant: Some(p),
            error: Error::Signaling(_),
            ..
        } if p.as_str() == "u1"
    )));
    assert!(call.service.peers().await.is_empty());
    assert!(call.service.participants().await.is_empty());
    assert!(call.factory.connection(0).is_closed());
}

#[tokio::test]
async fn test_connected_peer_activates_call() {
    let mut call = TestCall::new();
    call.service.initiate_call("call-1", ["u1"], None).await.unwrap();

    call.factory.connection(0).set_state(ConnectionState::Connected);
    call.wait_for(|e| {
        matches!(
            e,
            CallEvent::ConnectionStateChanged {
                state: ConnectionState::Connected,
                ..
            }
        )
    })
    .await
    .unwrap();
    call.settle().await;

    assert_eq!(call.service.call_state().await, CallState::Active);
    assert_eq!(
        call.service.connection_state("u1").await,
        Some(ConnectionState::Connected)
    );
}

// ============================================================================
// Join
// ============================================================================

#[tokio::test]
async fn test_join_call_waits_for_offer() {
    let mut call = TestCall::new();

    call.service.join_call("call-2", "host", None).await.unwrap();

    let peers = call.service.peers().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].participant.as_str(), "host");
    assert!(!peers[0].is_initiator);
    assert_eq!(call.service.call_state().await, CallState::Joining);

    let mock = call.factory.connection(0);
    assert!(mock.has_op("add_track:audio"));
    assert!(!mock.has_op("create_offer"));
    assert!(!mock.has_op("create_data_channel:call-control"));

    let events = call.drain();
    assert!(events
        .iter()
        .any(|e| matches!(e, CallEvent::CallJoined { participant, .. } if participant.as_str() == "host")));
    assert!(!events.iter().any(|e| is_signal(e, "host", "offer")));
}

// ============================================================================
// End
// ============================================================================

#[tokio::test]
async fn test_end_call_clears_registry_and_stops_tracks() {
    let mut call = TestCall::new();
    call.service.initiate_call("call-1", ["u1", "u2"], None).await.unwrap();
    let stream = call.service.local_stream().await.unwrap();
    let _ = call.drain();

    call.service.end_call(None).await;

    assert!(call.service.peers().await.is_empty());
    assert!(call.service.participants().await.is_empty());
    assert!(call.service.local_stream().await.is_none());
    assert!(stream.tracks().iter().all(|t| t.is_ended()));
    assert!(call.factory.connections().iter().all(|m| m.is_closed()));
    assert_eq!(call.service.call_state().await, CallState::Ended);
    assert_eq!(call.service.active_call().await, None);

    let events = call.drain();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, CallEvent::CallEnded { .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_end_call_is_idempotent() {
    let mut call = TestCall::new();

    // Nothing to end
    call.service.end_call(None).await;
    assert!(call.drain().is_empty());

    call.service.initiate_call("call-1", ["u1"], None).await.unwrap();
    call.service.end_call(None).await;
    let _ = call.drain();

    call.service.end_call(None).await;
    call.service.end_call(Some(&CallId::from("call-1"))).await;
    assert!(call.drain().is_empty());
}

#[tokio::test]
async fn test_end_call_ignores_other_call_id() {
    let call = TestCall::new();
    call.service.initiate_call("call-1", ["u1"], None).await.unwrap();

    call.service.end_call(Some(&CallId::from("other"))).await;

    assert_eq!(call.service.peers().await.len(), 1);
    assert!(!call.factory.connection(0).is_closed());
}

#[tokio::test]
async fn test_new_call_after_end() {
    let call = TestCall::new();
    call.service.initiate_call("call-1", ["u1"], None).await.unwrap();
    call.service.end_call(None).await;

    call.service.initiate_call("call-2", ["u1"], None).await.unwrap();
    assert_eq!(call.service.active_call().await, Some(CallId::from("call-2")));
    assert_eq!(call.devices.user_media_calls(), 2);
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_ends_call_and_closes_stream() {
    let mut call = TestCall::new();
    call.service.initiate_call("call-1", ["u1"], None).await.unwrap();

    call.service.shutdown().await;

    assert!(call.factory.connection(0).is_closed());
    assert!(matches!(
        call.service.initiate_call("call-2", ["u2"], None).await,
        Err(Error::ShutDown)
    ));

    let mut saw_end = false;
    while let Some(event) = call.events.recv().await {
        saw_end |= matches!(event, CallEvent::CallEnded { .. });
    }
    assert!(saw_end);
}
