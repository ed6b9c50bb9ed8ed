//! Native connection boundary
//!
//! The call logic talks to WebRTC only through these traits. The default
//! backend is webrtc-rs ([`super::rtc`]); tests plug in an in-memory one.
//!
//! Native callbacks never call back into the service. They are forwarded as
//! [`NativeEvent`]s into the per-connection channel returned by
//! [`PeerConnectionFactory::create`], and a pump task drains that channel.

use super::connection::{ConnectionState, IceConnectionState};
use crate::config::CallServiceConfig;
use crate::media::{LocalTrack, RemoteTrack};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// SDP direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP blob with its type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate, in the browser's JSON shape
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }
}

/// Offer/answer state of a native connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Something the native connection reported
pub enum NativeEvent {
    ConnectionState(ConnectionState),
    IceConnectionState(IceConnectionState),
    /// A local candidate was gathered and must be trickled to the peer
    IceCandidate(IceCandidate),
    /// The remote side added a track
    Track(RemoteTrack),
    /// The remote side opened a data channel
    DataChannel(Arc<dyn NativeDataChannel>),
    DataChannelOpen {
        label: String,
    },
    DataChannelMessage {
        label: String,
        text: String,
    },
    DataChannelClosed {
        label: String,
    },
    DataChannelError {
        label: String,
        error: String,
    },
    NegotiationNeeded,
}

/// Outbound channel of one `NativeEvent` stream
pub type NativeEventSender = mpsc::UnboundedSender<NativeEvent>;
pub type NativeEventReceiver = mpsc::UnboundedReceiver<NativeEvent>;

/// One native peer connection
#[async_trait]
pub trait NativePeerConnection: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Add an outbound track and return its sender
    async fn add_track(&self, track: &LocalTrack) -> Result<Arc<dyn NativeSender>>;

    /// Create a reliable, ordered data channel
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn NativeDataChannel>>;

    fn signaling_state(&self) -> SignalingState;

    /// Stats report as a map of W3C stats objects (camelCase keys)
    async fn get_stats(&self) -> Result<serde_json::Value>;

    async fn close(&self) -> Result<()>;
}

/// Sender side of one outbound track
#[async_trait]
pub trait NativeSender: Send + Sync {
    /// Swap the sent track without renegotiation; `None` sends nothing
    async fn replace_track(&self, track: Option<&LocalTrack>) -> Result<()>;

    /// Id of the track currently sent
    async fn track_id(&self) -> Option<String>;
}

/// One native data channel
#[async_trait]
pub trait NativeDataChannel: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates native connections
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: &CallServiceConfig,
    ) -> Result<(Arc<dyn NativePeerConnection>, NativeEventReceiver)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_candidate_browser_json() {
        let c: IceCandidate = serde_json::from_str(
            r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host","sdpMid":"0","sdpMLineIndex":0}"#,
        )
        .unwrap();
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_mline_index, Some(0));
        assert_eq!(c.username_fragment, None);

        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_session_description_json() {
        let desc = SessionDescription::answer("v=0");
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["type"], "answer");
        assert_eq!(json["sdp"], "v=0");
    }
}
