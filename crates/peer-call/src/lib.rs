//! Multi-party WebRTC calls
//!
//! This crate runs the peer side of audio/video calls with one or more
//! remote participants: call lifecycle, SDP offer/answer and ICE trickle,
//! local media shared by every connection, a JSON control channel per peer,
//! periodic quality sampling and bounded ICE-restart recovery.
//!
//! The signaling transport is not part of the crate. Outbound messages are
//! emitted as [`CallEvent::Signal`]; inbound ones are fed back through
//! [`CallService::handle_offer`], [`CallService::handle_answer`] and
//! [`CallService::handle_ice_candidate`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Host (UI, signaling transport)                          │
//! │  ↓ calls                      ↑ CallEvent stream          │
//! │  CallService                                             │
//! │  ├─ MediaPipeline (local stream, screen share)           │
//! │  ├─ PeerRegistry (arena of PeerConnections)              │
//! │  │   └─ per peer: pump task, QualityMonitor, timers      │
//! │  ├─ NegotiationEngine (offer/answer, candidate queue)    │
//! │  ├─ DataChannelBus ("call-control" channels)             │
//! │  └─ RecoveryController (backoff, ICE restart)            │
//! │     ↓                                                     │
//! │  PeerConnectionFactory (webrtc-rs by default)            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use peer_call::CallServiceConfig;
//!
//! let config = CallServiceConfig::default();
//! assert!(config.validate().is_ok());
//! assert_eq!(config.max_participants, 10);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use peer_call::{CallEvent, CallService, CallServiceConfig, SampleTrackDevices};
//! use std::sync::Arc;
//!
//! # async fn example() -> peer_call::Result<()> {
//! let devices = Arc::new(SampleTrackDevices::new());
//! let (service, mut events) = CallService::with_webrtc(CallServiceConfig::default(), devices)?;
//!
//! service.initiate_call("call-1", ["alice"], None).await?;
//! while let Some(event) = events.recv().await {
//!     if let CallEvent::Signal { remote_id, message, .. } = event {
//!         // relay `message` to `remote_id`
//!         let _ = (remote_id, message);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod channels;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod quality;
pub mod recovery;
pub mod service;
pub mod session;

pub use channels::{BroadcastStats, MediaState, CONTROL_CHANNEL_LABEL};
pub use config::{BundlePolicy, CallServiceConfig, IceServerConfig};
pub use error::{Error, Result};
pub use events::{CallEvent, CallEventReceiver};
pub use media::{
    MediaConstraints, MediaDevices, MediaStream, RemoteStream, SampleTrackDevices,
    ScreenShareOptions, TrackConstraint,
};
pub use negotiation::SignalingMessage;
pub use peer::{
    ConnectionState, IceCandidate, IceConnectionState, PeerConnectionFactory, PeerInfo,
    RtcPeerFactory,
};
pub use quality::CallQuality;
pub use recovery::RecoveryPolicy;
pub use service::CallService;
pub use session::{CallId, CallState, ParticipantId};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let v = version();
        assert!(!v.is_empty());
    }
}
