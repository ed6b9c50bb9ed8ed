//! webrtc-rs backend

use super::connection::{ConnectionState, IceConnectionState};
use super::native::{
    IceCandidate, NativeDataChannel, NativeEvent, NativeEventReceiver, NativeEventSender,
    NativePeerConnection, NativeSender, PeerConnectionFactory, SdpType, SessionDescription,
    SignalingState,
};
use crate::config::{BundlePolicy, CallServiceConfig};
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Builds webrtc-rs connections from one shared API instance
pub struct RtcPeerFactory {
    api: Arc<API>,
}

impl RtcPeerFactory {
    /// Default codecs (Opus, VP8/VP9/H.264) and interceptors
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtc(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        Ok(Self { api: Arc::new(api) })
    }
}

fn rtc_configuration(config: &CallServiceConfig) -> RTCConfiguration {
    let ice_servers = config
        .ice_servers
        .iter()
        .map(|server| {
            #[allow(clippy::needless_update)]
            RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            }
        })
        .collect();

    let bundle_policy = match config.bundle_policy {
        BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
        BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
        BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
    };

    RTCConfiguration {
        ice_servers,
        bundle_policy,
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        ..Default::default()
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(
        &self,
        config: &CallServiceConfig,
    ) -> Result<(Arc<dyn NativePeerConnection>, NativeEventReceiver)> {
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(rtc_configuration(config))
                .await
                .map_err(|e| {
                    Error::ConnectionFailure(format!("Failed to create peer connection: {}", e))
                })?,
        );

        let (tx, rx) = mpsc::unbounded_channel();
        install_handlers(&peer_connection, &tx);

        let connection: Arc<dyn NativePeerConnection> = Arc::new(RtcPeerConnection {
            inner: peer_connection,
            events: tx,
        });
        Ok((connection, rx))
    }
}

fn map_connection_state(s: RTCPeerConnectionState) -> Option<ConnectionState> {
    match s {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

fn map_ice_state(s: RTCIceConnectionState) -> Option<IceConnectionState> {
    match s {
        RTCIceConnectionState::New => Some(IceConnectionState::New),
        RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
        RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
        RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
        RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
        RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
        _ => None,
    }
}

fn map_signaling_state(s: RTCSignalingState) -> SignalingState {
    match s {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, tx: &NativeEventSender) {
    let events = tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        if let Some(state) = map_connection_state(s) {
            let _ = events.send(NativeEvent::ConnectionState(state));
        }
        Box::pin(async {})
    }));

    let events = tx.clone();
    pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
        if let Some(state) = map_ice_state(s) {
            let _ = events.send(NativeEvent::IceConnectionState(state));
        }
        Box::pin(async {})
    }));

    let events = tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = events.clone();
        Box::pin(async move {
            // `None` marks the end of gathering.
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = events.send(NativeEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => warn!("Failed to serialize local candidate: {}", e),
            }
        })
    }));

    let events = tx.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                _ => None,
            };
            if let Some(kind) = kind {
                let _ = events.send(NativeEvent::Track(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                    rtc: Some(Arc::clone(&track)),
                }));
            }
            Box::pin(async {})
        },
    ));

    let events = tx.clone();
    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let events = events.clone();
        Box::pin(async move {
            debug!("Remote data channel '{}' announced", channel.label());
            install_channel_handlers(&channel, &events);
            let _ = events.send(NativeEvent::DataChannel(Arc::new(RtcDataChannel {
                inner: channel,
            })));
        })
    }));

    let events = tx.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let _ = events.send(NativeEvent::NegotiationNeeded);
        Box::pin(async {})
    }));
}

fn install_channel_handlers(channel: &Arc<RTCDataChannel>, tx: &NativeEventSender) {
    let label = channel.label().to_string();

    let events = tx.clone();
    let open_label = label.clone();
    channel.on_open(Box::new(move || {
        let _ = events.send(NativeEvent::DataChannelOpen { label: open_label });
        Box::pin(async {})
    }));

    let events = tx.clone();
    let close_label = label.clone();
    channel.on_close(Box::new(move || {
        let _ = events.send(NativeEvent::DataChannelClosed {
            label: close_label.clone(),
        });
        Box::pin(async {})
    }));

    let events = tx.clone();
    let error_label = label.clone();
    channel.on_error(Box::new(move |err: webrtc::Error| {
        let _ = events.send(NativeEvent::DataChannelError {
            label: error_label.clone(),
            error: err.to_string(),
        });
        Box::pin(async {})
    }));

    let events = tx.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let event = match String::from_utf8(msg.data.to_vec()) {
            Ok(text) => NativeEvent::DataChannelMessage {
                label: label.clone(),
                text,
            },
            Err(_) => NativeEvent::DataChannelError {
                label: label.clone(),
                error: "binary frame on a text channel".to_string(),
            },
        };
        let _ = events.send(event);
        Box::pin(async {})
    }));
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| Error::Signaling(format!("Failed to parse SDP: {}", e)))
}

fn rtc_track(track: &LocalTrack) -> Result<Arc<dyn TrackLocal + Send + Sync>> {
    track
        .rtc_track()
        .map(|t| t as Arc<dyn TrackLocal + Send + Sync>)
        .ok_or_else(|| {
            Error::MediaAcquisition(format!("Track {} has no webrtc-rs backing", track.id()))
        })
}

struct RtcPeerConnection {
    inner: Arc<RTCPeerConnection>,
    events: NativeEventSender,
}

#[async_trait]
impl NativePeerConnection for RtcPeerConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self
            .inner
            .create_offer(options)
            .await
            .map_err(|e| Error::Signaling(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .inner
            .create_answer(None)
            .await
            .map_err(|e| Error::Signaling(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        self.inner
            .set_local_description(desc)
            .await
            .map_err(|e| Error::Signaling(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        self.inner
            .set_remote_description(desc)
            .await
            .map_err(|e| Error::Signaling(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.inner
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidate(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<Arc<dyn NativeSender>> {
        let sender = self
            .inner
            .add_track(rtc_track(track)?)
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to add {} track: {}", track.kind(), e)))?;
        Ok(Arc::new(RtcSender { inner: sender }))
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn NativeDataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = self
            .inner
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| Error::DataChannel(format!("Failed to create data channel: {}", e)))?;

        install_channel_handlers(&channel, &self.events);
        Ok(Arc::new(RtcDataChannel { inner: channel }))
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.inner.signaling_state())
    }

    async fn get_stats(&self) -> Result<serde_json::Value> {
        let report = self.inner.get_stats().await;
        Ok(serde_json::to_value(&report.reports)?)
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close()
            .await
            .map_err(|e| Error::ConnectionFailure(format!("Failed to close connection: {}", e)))
    }
}

struct RtcSender {
    inner: Arc<RTCRtpSender>,
}

#[async_trait]
impl NativeSender for RtcSender {
    async fn replace_track(&self, track: Option<&LocalTrack>) -> Result<()> {
        let track = track.map(rtc_track).transpose()?;
        self.inner
            .replace_track(track)
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to replace track: {}", e)))
    }

    async fn track_id(&self) -> Option<String> {
        self.inner.track().await.map(|t| t.id().to_string())
    }
}

struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl NativeDataChannel for RtcDataChannel {
    fn label(&self) -> String {
        self.inner.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.inner
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| Error::DataChannel(format!("Failed to send message: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close()
            .await
            .map_err(|e| Error::DataChannel(format!("Failed to close data channel: {}", e)))
    }
}
