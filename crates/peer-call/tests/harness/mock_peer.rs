//! In-memory native connections
//!
//! Every mock records the operations applied to it, in order, so tests can
//! assert on negotiation sequencing. Native events are injected by hand.

use async_trait::async_trait;
use parking_lot::Mutex;
use peer_call::config::CallServiceConfig;
use peer_call::media::{LocalTrack, TrackKind};
use peer_call::peer::{
    ConnectionState, IceCandidate, NativeDataChannel, NativeEvent, NativeEventReceiver,
    NativeEventSender, NativePeerConnection, NativeSender, PeerConnectionFactory, SdpType,
    SessionDescription, SignalingState,
};
use peer_call::{Error, Result, CONTROL_CHANNEL_LABEL};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Creates [`MockPeerConnection`]s and keeps them for inspection
#[derive(Default)]
pub struct MockPeerFactory {
    created: Mutex<Vec<Arc<MockPeerConnection>>>,
    fail_create: AtomicBool,
    fail_offers: AtomicBool,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connections in creation order
    pub fn connections(&self) -> Vec<Arc<MockPeerConnection>> {
        self.created.lock().clone()
    }

    pub fn connection(&self, index: usize) -> Arc<MockPeerConnection> {
        self.created.lock()[index].clone()
    }

    pub fn last(&self) -> Arc<MockPeerConnection> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("no connection created")
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// New connections fail `create_offer`
    pub fn set_fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(
        &self,
        _config: &CallServiceConfig,
    ) -> Result<(Arc<dyn NativePeerConnection>, NativeEventReceiver)> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailure("mock factory failure".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut created = self.created.lock();
        let connection = Arc::new(MockPeerConnection::new(created.len(), tx));
        connection.set_fail_offer(self.fail_offers.load(Ordering::SeqCst));
        created.push(connection.clone());
        Ok((connection, rx))
    }
}

pub struct MockPeerConnection {
    pub id: usize,
    events: NativeEventSender,
    ops: Mutex<Vec<String>>,
    signaling: Mutex<SignalingState>,
    senders: Mutex<Vec<Arc<MockSender>>>,
    channels: Mutex<Vec<Arc<MockDataChannel>>>,
    stats: Mutex<Value>,
    offers: AtomicUsize,
    fail_offer: AtomicBool,
    fail_remote: AtomicBool,
    fail_stats: AtomicBool,
    closed: AtomicBool,
}

impl MockPeerConnection {
    fn new(id: usize, events: NativeEventSender) -> Self {
        Self {
            id,
            events,
            ops: Mutex::new(Vec::new()),
            signaling: Mutex::new(SignalingState::Stable),
            senders: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            stats: Mutex::new(serde_json::json!({})),
            offers: AtomicUsize::new(0),
            fail_offer: AtomicBool::new(false),
            fail_remote: AtomicBool::new(false),
            fail_stats: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Inject a native event
    pub fn emit(&self, event: NativeEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.emit(NativeEvent::ConnectionState(state));
    }

    /// Open the locally created control channel
    pub fn open_channel(&self) -> Arc<MockDataChannel> {
        let channel = self.channel().expect("no data channel created");
        channel.open.store(true, Ordering::SeqCst);
        self.emit(NativeEvent::DataChannelOpen {
            label: channel.label.clone(),
        });
        channel
    }

    /// Announce an already open remote channel
    pub fn announce_channel(&self, label: &str) -> Arc<MockDataChannel> {
        let channel = Arc::new(MockDataChannel::new(label, true));
        self.channels.lock().push(channel.clone());
        self.emit(NativeEvent::DataChannel(channel.clone()));
        channel
    }

    /// Deliver a text message on the control channel
    pub fn receive_text(&self, text: &str) {
        self.emit(NativeEvent::DataChannelMessage {
            label: CONTROL_CHANNEL_LABEL.to_string(),
            text: text.to_string(),
        });
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    pub fn op_index(&self, op: &str) -> Option<usize> {
        self.ops.lock().iter().position(|o| o == op)
    }

    pub fn has_op(&self, op: &str) -> bool {
        self.op_index(op).is_some()
    }

    pub fn channel(&self) -> Option<Arc<MockDataChannel>> {
        self.channels.lock().first().cloned()
    }

    pub fn sender(&self, kind: TrackKind) -> Option<Arc<MockSender>> {
        self.senders.lock().iter().find(|s| s.kind == kind).cloned()
    }

    pub fn offers_created(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn set_stats(&self, stats: Value) {
        *self.stats.lock() = stats;
    }

    pub fn set_fail_offer(&self, fail: bool) {
        self.fail_offer.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_remote(&self, fail: bool) {
        self.fail_remote.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_stats(&self, fail: bool) {
        self.fail_stats.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, op: impl Into<String>) {
        self.ops.lock().push(op.into());
    }
}

fn sdp_kind(desc: &SessionDescription) -> &'static str {
    match desc.sdp_type {
        SdpType::Offer => "offer",
        SdpType::Answer => "answer",
    }
}

#[async_trait]
impl NativePeerConnection for MockPeerConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        if self.fail_offer.load(Ordering::SeqCst) {
            self.record("create_offer:failed");
            return Err(Error::WebRtc("mock offer failure".to_string()));
        }
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        if ice_restart {
            self.record("create_offer:restart");
            Ok(SessionDescription::offer(format!("mock-offer-{}-{}-restart", self.id, n)))
        } else {
            self.record("create_offer");
            Ok(SessionDescription::offer(format!("mock-offer-{}-{}", self.id, n)))
        }
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record("create_answer");
        Ok(SessionDescription::answer(format!("mock-answer-{}", self.id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(format!("set_local:{}", sdp_kind(&desc)));
        *self.signaling.lock() = match desc.sdp_type {
            SdpType::Offer => SignalingState::HaveLocalOffer,
            SdpType::Answer => SignalingState::Stable,
        };
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if self.fail_remote.load(Ordering::SeqCst) {
            self.record(format!("set_remote:{}:failed", sdp_kind(&desc)));
            return Err(Error::WebRtc("mock remote description failure".to_string()));
        }
        self.record(format!("set_remote:{}", sdp_kind(&desc)));
        *self.signaling.lock() = match desc.sdp_type {
            SdpType::Offer => SignalingState::HaveRemoteOffer,
            SdpType::Answer => SignalingState::Stable,
        };
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(format!("add_candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<Arc<dyn NativeSender>> {
        self.record(format!("add_track:{}", track.kind()));
        let sender = Arc::new(MockSender {
            kind: track.kind(),
            track: Mutex::new(Some(track.id().to_string())),
        });
        self.senders.lock().push(sender.clone());
        Ok(sender)
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn NativeDataChannel>> {
        self.record(format!("create_data_channel:{}", label));
        let channel = Arc::new(MockDataChannel::new(label, false));
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    fn signaling_state(&self) -> SignalingState {
        *self.signaling.lock()
    }

    async fn get_stats(&self) -> Result<Value> {
        if self.fail_stats.load(Ordering::SeqCst) {
            return Err(Error::WebRtc("mock stats failure".to_string()));
        }
        Ok(self.stats.lock().clone())
    }

    async fn close(&self) -> Result<()> {
        self.record("close");
        self.closed.store(true, Ordering::SeqCst);
        *self.signaling.lock() = SignalingState::Closed;
        Ok(())
    }
}

pub struct MockSender {
    pub kind: TrackKind,
    track: Mutex<Option<String>>,
}

impl MockSender {
    pub fn track(&self) -> Option<String> {
        self.track.lock().clone()
    }
}

#[async_trait]
impl NativeSender for MockSender {
    async fn replace_track(&self, track: Option<&LocalTrack>) -> Result<()> {
        *self.track.lock() = track.map(|t| t.id().to_string());
        Ok(())
    }

    async fn track_id(&self) -> Option<String> {
        self.track()
    }
}

pub struct MockDataChannel {
    pub label: String,
    pub open: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl MockDataChannel {
    fn new(label: &str, open: bool) -> Self {
        Self {
            label: label.to_string(),
            open: AtomicBool::new(open),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Sent messages parsed as JSON
    pub fn sent_json(&self) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect()
    }

    /// Sent messages other than media-state updates
    pub fn sent_data(&self) -> Vec<Value> {
        self.sent_json()
            .into_iter()
            .filter(|v| v["type"] != "media-state")
            .collect()
    }
}

#[async_trait]
impl NativeDataChannel for MockDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::DataChannel("mock channel closed".to_string()));
        }
        self.sent.lock().push(text);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}
