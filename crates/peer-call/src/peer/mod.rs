//! Peer connections: native boundary, webrtc-rs backend and registry

pub mod connection;
pub mod native;
pub mod registry;
pub mod rtc;

pub use connection::{ConnectionState, IceConnectionState, PeerConnection};
pub use native::{
    IceCandidate, NativeDataChannel, NativeEvent, NativeEventReceiver, NativeEventSender,
    NativePeerConnection, NativeSender, PeerConnectionFactory, SdpType, SessionDescription,
    SignalingState,
};
pub use registry::{ConnectionHandle, PeerInfo, PeerRegistry};
pub use rtc::RtcPeerFactory;
