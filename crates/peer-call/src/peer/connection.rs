//! Per-participant connection state

use super::native::{NativeDataChannel, NativePeerConnection, NativeSender};
use super::registry::ConnectionHandle;
use crate::media::{LocalTrack, MediaStream, RemoteStream, RemoteTrack};
use crate::negotiation::Negotiation;
use crate::quality::CallQuality;
use crate::session::{CallId, ParticipantId, PeerKey};
use crate::Result;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// ICE transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Default)]
struct PeerState {
    connection_state: ConnectionState,
    ice_connection_state: IceConnectionState,
    local_stream: Option<MediaStream>,
    remote_stream: Option<RemoteStream>,
    data_channel: Option<Arc<dyn NativeDataChannel>>,
    quality: Option<CallQuality>,
    audio_sender: Option<Arc<dyn NativeSender>>,
    video_sender: Option<Arc<dyn NativeSender>>,
}

/// A connection to one remote participant
///
/// Owned by the registry. Everything mutable sits behind interior locks so
/// the registry can hand out `Arc<PeerConnection>` to tasks.
pub struct PeerConnection {
    handle: ConnectionHandle,
    key: PeerKey,
    native: Arc<dyn NativePeerConnection>,
    is_initiator: bool,
    state: RwLock<PeerState>,
    negotiation: tokio::sync::Mutex<Negotiation>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    channel_open: AtomicBool,
    closed: AtomicBool,
}

impl PeerConnection {
    pub(crate) fn new(
        handle: ConnectionHandle,
        key: PeerKey,
        native: Arc<dyn NativePeerConnection>,
        is_initiator: bool,
    ) -> Self {
        Self {
            handle,
            key,
            native,
            is_initiator,
            state: RwLock::new(PeerState::default()),
            negotiation: tokio::sync::Mutex::new(Negotiation::default()),
            tasks: Mutex::new(Vec::new()),
            channel_open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn key(&self) -> &PeerKey {
        &self.key
    }

    pub fn call_id(&self) -> &CallId {
        &self.key.call_id
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.key.participant
    }

    pub fn native(&self) -> &Arc<dyn NativePeerConnection> {
        &self.native
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().connection_state
    }

    /// Returns the previous state if it changed
    pub fn set_connection_state(&self, new_state: ConnectionState) -> Option<ConnectionState> {
        let mut state = self.state.write();
        let old_state = state.connection_state;
        if old_state == new_state {
            return None;
        }
        debug!(
            participant = %self.key.participant,
            "Peer state transition: {} -> {}", old_state, new_state
        );
        state.connection_state = new_state;
        Some(old_state)
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.state.read().ice_connection_state
    }

    pub fn set_ice_connection_state(
        &self,
        new_state: IceConnectionState,
    ) -> Option<IceConnectionState> {
        let mut state = self.state.write();
        let old_state = state.ice_connection_state;
        if old_state == new_state {
            return None;
        }
        state.ice_connection_state = new_state;
        Some(old_state)
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.state.read().local_stream.clone()
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.state.read().remote_stream.clone()
    }

    /// Record an inbound track; returns the stream when this track created it
    pub fn add_remote_track(&self, track: RemoteTrack) -> Option<RemoteStream> {
        let mut state = self.state.write();
        match &state.remote_stream {
            Some(stream) => {
                stream.add_track(track);
                None
            }
            None => {
                let stream = RemoteStream::new(track);
                state.remote_stream = Some(stream.clone());
                Some(stream)
            }
        }
    }

    pub fn data_channel(&self) -> Option<Arc<dyn NativeDataChannel>> {
        self.state.read().data_channel.clone()
    }

    pub fn set_data_channel(&self, channel: Arc<dyn NativeDataChannel>) {
        self.state.write().data_channel = Some(channel);
    }

    /// Record that the control channel opened; `true` only the first time
    pub(crate) fn mark_channel_open(&self) -> bool {
        !self.channel_open.swap(true, Ordering::SeqCst)
    }

    pub fn quality(&self) -> Option<CallQuality> {
        self.state.read().quality.clone()
    }

    pub fn set_quality(&self, quality: CallQuality) {
        self.state.write().quality = Some(quality);
    }

    pub(crate) fn negotiation(&self) -> &tokio::sync::Mutex<Negotiation> {
        &self.negotiation
    }

    /// Add the outbound tracks of the call
    ///
    /// `video` is passed separately so a running screen share is sent instead
    /// of the camera.
    pub async fn add_local_tracks(
        &self,
        stream: &MediaStream,
        video: Option<LocalTrack>,
    ) -> Result<()> {
        if let Some(audio) = stream.audio_track() {
            let sender = self.native.add_track(&audio).await?;
            self.state.write().audio_sender = Some(sender);
        }

        if let Some(video) = video {
            let sender = self.native.add_track(&video).await?;
            self.state.write().video_sender = Some(sender);
        }

        self.state.write().local_stream = Some(stream.clone());
        debug!(participant = %self.key.participant, "Local tracks added");
        Ok(())
    }

    pub fn video_sender(&self) -> Option<Arc<dyn NativeSender>> {
        self.state.read().video_sender.clone()
    }

    pub fn audio_sender(&self) -> Option<Arc<dyn NativeSender>> {
        self.state.read().audio_sender.clone()
    }

    /// Substitute the outbound video track; `false` when nothing is sent
    pub async fn replace_video(&self, track: Option<&LocalTrack>) -> Result<bool> {
        let Some(sender) = self.video_sender() else {
            return Ok(false);
        };
        sender.replace_track(track).await?;
        Ok(true)
    }

    /// Tie a task to this connection; it is aborted on `close()`
    pub fn attach_task(&self, task: JoinHandle<()>) {
        if self.is_closed() {
            task.abort();
            return;
        }
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Abort attached tasks and close the native connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let channel = self.state.write().data_channel.take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!(participant = %self.key.participant, "Failed to close data channel: {}", e);
            }
        }

        if let Err(e) = self.native.close().await {
            warn!(participant = %self.key.participant, "Failed to close connection: {}", e);
        }

        {
            let mut state = self.state.write();
            state.connection_state = ConnectionState::Closed;
            state.ice_connection_state = IceConnectionState::Closed;
            state.audio_sender = None;
            state.video_sender = None;
        }

        info!(
            call_id = %self.key.call_id,
            participant = %self.key.participant,
            "Closed peer connection"
        );
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("handle", &self.handle)
            .field("key", &self.key)
            .field("is_initiator", &self.is_initiator)
            .field("connection_state", &self.connection_state())
            .finish()
    }
}
