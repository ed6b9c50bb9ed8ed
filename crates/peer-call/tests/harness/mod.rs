//! Call service test harness
//!
//! Provides infrastructure for integration testing of the call service with:
//! - In-memory native connections that record every operation
//! - A capture backend with fixed track ids
//! - Event stream helpers that wait with a timeout
//!
//! Basic usage pattern:
//!
//! 1. Create a `TestCall` (optionally with a custom config)
//! 2. Drive the service through `call.service`
//! 3. Inject native events through `call.factory.connection(i)`
//! 4. Assert on events with `call.wait_for(..)`

#![allow(dead_code)]

pub mod mock_media;
pub mod mock_peer;

use peer_call::{
    CallEvent, CallEventReceiver, CallService, CallServiceConfig, RecoveryPolicy,
    SignalingMessage,
};
use std::sync::Arc;
use std::time::Duration;

pub use mock_media::MockMediaDevices;
pub use mock_peer::{MockDataChannel, MockPeerConnection, MockPeerFactory};

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Event stream closed")]
    StreamClosed,
}

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize test logging (safe to call from every test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,peer_call=debug")
        .with_test_writer()
        .try_init();
}

/// Default config for tests: deterministic backoff
pub fn test_config() -> CallServiceConfig {
    CallServiceConfig::default().with_recovery(RecoveryPolicy {
        jitter_enabled: false,
        ..Default::default()
    })
}

/// A call service on mock backends plus its event stream
pub struct TestCall {
    pub service: CallService,
    pub events: CallEventReceiver,
    pub factory: Arc<MockPeerFactory>,
    pub devices: Arc<MockMediaDevices>,
}

impl TestCall {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: CallServiceConfig) -> Self {
        init_logging();
        let factory = MockPeerFactory::new();
        let devices = MockMediaDevices::new();
        let (service, events) = CallService::new(config, factory.clone(), devices.clone())
            .expect("valid test config");
        Self {
            service,
            events,
            factory,
            devices,
        }
    }

    /// Next event, whatever it is
    pub async fn next_event(&mut self) -> HarnessResult<CallEvent> {
        match tokio::time::timeout(EVENT_TIMEOUT, self.events.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(HarnessError::StreamClosed),
            Err(_) => Err(HarnessError::Timeout("no event".to_string())),
        }
    }

    /// Skip events until one matches
    pub async fn wait_for<F>(&mut self, mut matches: F) -> HarnessResult<CallEvent>
    where
        F: FnMut(&CallEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        loop {
            let event = match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return Err(HarnessError::StreamClosed),
                Err(_) => return Err(HarnessError::Timeout("matching event".to_string())),
            };
            if matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Wait for `count` matching events
    pub async fn collect<F>(&mut self, count: usize, mut matches: F) -> HarnessResult<Vec<CallEvent>>
    where
        F: FnMut(&CallEvent) -> bool,
    {
        let mut found = Vec::with_capacity(count);
        while found.len() < count {
            found.push(self.wait_for(&mut matches).await?);
        }
        Ok(found)
    }

    /// Everything already queued
    pub fn drain(&mut self) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Let spawned tasks process what is queued
    pub async fn settle(&self) {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }
}

/// Whether `event` is an outbound signal of the given kind for `remote`
pub fn is_signal(event: &CallEvent, remote: &str, kind: &str) -> bool {
    match event {
        CallEvent::Signal {
            remote_id, message, ..
        } => {
            remote_id.as_str() == remote
                && matches!(
                    (kind, message),
                    ("offer", SignalingMessage::Offer { .. })
                        | ("answer", SignalingMessage::Answer { .. })
                        | ("ice-candidate", SignalingMessage::IceCandidate { .. })
                )
        }
        _ => false,
    }
}

/// A stats report with one succeeded, nominated candidate pair
pub fn connected_stats(audio_bytes: u64) -> serde_json::Value {
    serde_json::json!({
        "pair": {
            "id": "pair",
            "type": "candidate-pair",
            "state": "succeeded",
            "nominated": true,
            "localCandidateId": "local",
            "remoteCandidateId": "remote",
            "currentRoundTripTime": 0.04
        },
        "local": {
            "id": "local",
            "type": "local-candidate",
            "candidateType": "host",
            "protocol": "udp",
            "ip": "10.0.0.2",
            "port": 50000
        },
        "remote": {
            "id": "remote",
            "type": "remote-candidate",
            "candidateType": "host",
            "protocol": "udp",
            "ip": "10.0.0.3",
            "port": 50001
        },
        "audio": {
            "id": "audio",
            "type": "inbound-rtp",
            "kind": "audio",
            "bytesReceived": audio_bytes,
            "packetsReceived": 100,
            "packetsLost": 0,
            "jitter": 0.005
        }
    })
}

/// A stats report where ICE is still checking
pub fn checking_stats() -> serde_json::Value {
    serde_json::json!({
        "pair": {
            "id": "pair",
            "type": "candidate-pair",
            "state": "in-progress",
            "localCandidateId": "local",
            "remoteCandidateId": "remote"
        }
    })
}
