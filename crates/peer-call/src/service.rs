//! Call lifecycle
//!
//! [`CallService`] owns one call at a time. It drives the registry, runs the
//! negotiation engine against the host's signaling transport, keeps the
//! local media shared by every connection, and reacts to native connection
//! events through one pump task per connection.

use crate::channels::{
    self, BroadcastStats, DataChannelBus, InboundMessage, CONTROL_CHANNEL_LABEL,
};
use crate::config::CallServiceConfig;
use crate::events::{CallEvent, CallEventReceiver, EventSink};
use crate::media::{
    LocalTrack, MediaConstraints, MediaDevices, MediaPipeline, MediaStream, RemoteStream,
    ScreenShareOptions, TrackKind,
};
use crate::negotiation::{NegotiationEngine, TimeoutHook};
use crate::peer::{
    ConnectionState, IceCandidate, IceConnectionState, NativeEvent, NativeEventReceiver,
    PeerConnection, PeerConnectionFactory, PeerInfo, PeerRegistry, RtcPeerFactory,
};
use crate::quality::{CallQuality, QualityMonitor};
use crate::recovery::{RecoveryController, RecoveryDecision};
use crate::session::{CallId, CallSession, CallState, ParticipantId, PeerKey};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Candidates kept per participant while no connection exists
const MAX_ORPHAN_CANDIDATES: usize = 64;

/// Multi-party call service
///
/// Cheap to clone; clones share the same call.
///
/// ```
/// # tokio_test::block_on(async {
/// use peer_call::{CallService, CallServiceConfig, SampleTrackDevices};
/// use std::sync::Arc;
///
/// let devices = Arc::new(SampleTrackDevices::new());
/// let (service, _events) = CallService::with_webrtc(CallServiceConfig::default(), devices).unwrap();
///
/// assert!(service.active_call().await.is_none());
/// assert!(!service.toggle_audio().await);
/// # });
/// ```
#[derive(Clone)]
pub struct CallService {
    inner: Arc<Inner>,
}

struct Inner {
    config: CallServiceConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    registry: Arc<PeerRegistry>,
    media: Mutex<MediaPipeline>,
    session: RwLock<Option<CallSession>>,
    events: Arc<EventSink>,
    negotiation: NegotiationEngine,
    recovery: RecoveryController,
    bus: DataChannelBus,
    orphans: parking_lot::Mutex<HashMap<ParticipantId, Vec<IceCandidate>>>,
    screen_watcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl CallService {
    /// Create a service and its event stream
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration does not validate.
    pub fn new(
        config: CallServiceConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> Result<(Self, CallEventReceiver)> {
        config.validate()?;

        let registry = Arc::new(PeerRegistry::new(config.max_participants)?);
        let (sink, events_rx) = EventSink::new();
        let events = Arc::new(sink);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let on_timeout: TimeoutHook = Arc::new(move |connection: Arc<PeerConnection>| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_negotiation_failed(&connection);
                }
            });

            Inner {
                negotiation: NegotiationEngine::new(
                    events.clone(),
                    config.negotiation_timeout(),
                    config.debug,
                )
                .with_timeout_hook(on_timeout),
                recovery: RecoveryController::new(config.recovery.clone()),
                bus: DataChannelBus::new(registry.clone()),
                media: Mutex::new(MediaPipeline::new(devices)),
                session: RwLock::new(None),
                orphans: parking_lot::Mutex::new(HashMap::new()),
                screen_watcher: parking_lot::Mutex::new(None),
                shut_down: AtomicBool::new(false),
                factory,
                registry,
                events,
                config,
            }
        });

        info!(
            max_participants = inner.config.max_participants,
            ice_servers = inner.config.ice_servers.len(),
            "Created call service"
        );

        Ok((Self { inner }, events_rx))
    }

    /// Create a service on the webrtc-rs backend
    pub fn with_webrtc(
        config: CallServiceConfig,
        devices: Arc<dyn MediaDevices>,
    ) -> Result<(Self, CallEventReceiver)> {
        let factory = Arc::new(RtcPeerFactory::new()?);
        Self::new(config, factory, devices)
    }

    pub fn config(&self) -> &CallServiceConfig {
        &self.inner.config
    }

    /// Start a call to `participants`, offering to each of them
    ///
    /// Per-peer connection failures are reported as `CallError` events and
    /// do not fail the call.
    ///
    /// # Errors
    ///
    /// `CallAlreadyActive` while another call runs, `DuplicatePeer` or
    /// `InvalidConfig` for a bad participant list, `MediaAcquisition` when
    /// local media cannot be acquired (no connection is created then).
    pub async fn initiate_call<P>(
        &self,
        call_id: impl Into<CallId>,
        participants: impl IntoIterator<Item = P>,
        constraints: Option<MediaConstraints>,
    ) -> Result<()>
    where
        P: Into<ParticipantId>,
    {
        self.ensure_running()?;
        let call_id = call_id.into();
        let participants: Vec<ParticipantId> = participants.into_iter().map(Into::into).collect();

        if participants.len() > self.inner.config.max_participants {
            return Err(Error::InvalidConfig(format!(
                "{} participants exceed the maximum of {}",
                participants.len(),
                self.inner.config.max_participants
            )));
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = participants.iter().find(|p| !seen.insert(*p)) {
            return Err(Error::DuplicatePeer {
                call_id: call_id.to_string(),
                participant: duplicate.to_string(),
            });
        }

        self.inner.begin_session(&call_id, true).await?;
        info!(call_id = %call_id, participants = participants.len(), "Initiating call");

        let stream = match self.inner.acquire_media(constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                self.inner.reset_session(&call_id).await;
                return Err(e);
            }
        };
        let video = self.inner.media.lock().await.outbound_video();

        for participant in &participants {
            if let Err(e) = self
                .inner
                .connect_initiator(&call_id, participant, &stream, video.clone())
                .await
            {
                warn!(
                    call_id = %call_id,
                    participant = %participant,
                    "Failed to connect to participant: {}", e
                );
                self.inner.events.emit(CallEvent::CallError {
                    call_id: call_id.clone(),
                    participant: Some(participant.clone()),
                    error: e,
                });
            }
        }

        self.inner.events.emit(CallEvent::CallInitiated {
            call_id,
            participants,
        });
        Ok(())
    }

    /// Join a call started by `participant` and wait for its offer
    ///
    /// # Errors
    ///
    /// `CallAlreadyActive`, `MediaAcquisition`, or the native error when the
    /// connection cannot be created.
    pub async fn join_call(
        &self,
        call_id: impl Into<CallId>,
        participant: impl Into<ParticipantId>,
        constraints: Option<MediaConstraints>,
    ) -> Result<()> {
        self.ensure_running()?;
        let call_id = call_id.into();
        let participant = participant.into();

        self.inner.begin_session(&call_id, false).await?;
        info!(call_id = %call_id, participant = %participant, "Joining call");

        if let Err(e) = self.inner.acquire_media(constraints).await {
            self.inner.reset_session(&call_id).await;
            return Err(e);
        }

        let connection = match self.inner.create_responder(&call_id, &participant).await {
            Ok(connection) => connection,
            Err(e) => {
                self.inner.teardown(&call_id).await;
                self.inner.reset_session(&call_id).await;
                return Err(e);
            }
        };
        self.inner.negotiation.arm_offer_wait(&connection).await;

        self.inner.events.emit(CallEvent::CallJoined {
            call_id,
            participant,
        });
        Ok(())
    }

    /// End the active call
    ///
    /// With `Some(id)` only a call with that id is ended. A no-op when no
    /// call is active. On return every connection, track and timer of the
    /// call is gone.
    pub async fn end_call(&self, call_id: Option<&CallId>) {
        let call_id = {
            let mut session = self.inner.session.write().await;
            let Some(active) = session.as_mut().filter(|s| !s.state.is_idle()) else {
                debug!("No active call to end");
                return;
            };
            if call_id.is_some_and(|id| id != &active.call_id) {
                debug!(call_id = %active.call_id, "End requested for a different call");
                return;
            }
            active.state = CallState::Ended;
            active.call_id.clone()
        };

        self.inner.teardown(&call_id).await;
        info!(call_id = %call_id, "Call ended");
        self.inner.events.emit(CallEvent::CallEnded { call_id });
    }

    /// Apply a remote offer, creating a responder connection if needed
    ///
    /// Failures are emitted as `SignalError`.
    pub async fn handle_offer(&self, remote: impl Into<ParticipantId>, sdp: impl Into<String>) {
        let remote = remote.into();
        let Some(call_id) = self.active_call_or_report(&remote).await else {
            return;
        };

        let key = PeerKey::new(call_id.clone(), remote.clone());
        let connection = match self.inner.registry.get(&key).await {
            Some(connection) => {
                if !connection.is_initiator()
                    && connection.connection_state() == ConnectionState::Failed
                {
                    debug!(participant = %remote, "Restart offer for failed connection");
                    self.inner.recovery.on_remote_offer(&key);
                }
                connection
            }
            None => {
                debug!(call_id = %call_id, participant = %remote, "Offer from new participant");
                match self.inner.create_responder(&call_id, &remote).await {
                    Ok(connection) => connection,
                    Err(e) => {
                        self.inner.signal_error(Some(call_id), remote, e);
                        return;
                    }
                }
            }
        };

        if let Err(e) = self.inner.negotiation.apply_offer(&connection, sdp.into()).await {
            warn!(participant = %remote, "Failed to handle offer: {}", e);
            self.inner.signal_error(Some(call_id), remote, e);
        }
    }

    /// Apply a remote answer to the outstanding offer
    pub async fn handle_answer(&self, remote: impl Into<ParticipantId>, sdp: impl Into<String>) {
        let remote = remote.into();
        let Some(call_id) = self.active_call_or_report(&remote).await else {
            return;
        };

        let key = PeerKey::new(call_id.clone(), remote.clone());
        let Some(connection) = self.inner.registry.get(&key).await else {
            self.inner
                .signal_error(Some(call_id), remote.clone(), Error::PeerNotFound(remote.to_string()));
            return;
        };

        if let Err(e) = self.inner.negotiation.apply_answer(&connection, sdp.into()).await {
            warn!(participant = %remote, "Failed to handle answer: {}", e);
            self.inner.signal_error(Some(call_id), remote, e);
            self.inner.on_negotiation_failed(&connection);
        }
    }

    /// Apply a remote candidate, or buffer it until it can be applied
    pub async fn handle_ice_candidate(&self, remote: impl Into<ParticipantId>, candidate: IceCandidate) {
        let remote = remote.into();
        let Some(call_id) = self.active_call_or_report(&remote).await else {
            return;
        };

        let key = PeerKey::new(call_id.clone(), remote.clone());
        let Some(connection) = self.inner.registry.get(&key).await else {
            {
                let mut orphans = self.inner.orphans.lock();
                let queue = orphans.entry(remote.clone()).or_default();
                if queue.len() >= MAX_ORPHAN_CANDIDATES {
                    warn!(participant = %remote, "Dropping candidate for unknown participant");
                    self.inner.signal_error(
                        Some(call_id),
                        remote.clone(),
                        Error::IceCandidate(format!(
                            "more than {} candidates buffered for {}",
                            MAX_ORPHAN_CANDIDATES, remote
                        )),
                    );
                    return;
                }
                queue.push(candidate);
                debug!(participant = %remote, queued = queue.len(), "Buffered candidate before connection");
            }

            // The connection may have been registered and drained since the lookup
            if let Some(connection) = self.inner.registry.get(&key).await {
                self.inner.adopt_orphans(&connection).await;
            }
            return;
        };

        if let Err(e) = self.inner.negotiation.add_candidate(&connection, candidate).await {
            warn!(participant = %remote, "Failed to apply candidate: {}", e);
            self.inner.signal_error(Some(call_id), remote, e);
        }
    }

    /// Mute or unmute the microphone; returns the new state
    ///
    /// `false` when there is no microphone track.
    pub async fn toggle_audio(&self) -> bool {
        let (enabled, state) = {
            let media = self.inner.media.lock().await;
            if !media.has_track(TrackKind::Audio) {
                return false;
            }
            (media.toggle_audio(), media.media_state())
        };
        self.inner.broadcast_media_state(state).await;
        enabled
    }

    /// Turn the camera on or off; returns the new state
    pub async fn toggle_video(&self) -> bool {
        let (enabled, state) = {
            let media = self.inner.media.lock().await;
            if !media.has_track(TrackKind::Video) {
                return false;
            }
            (media.toggle_video(), media.media_state())
        };
        self.inner.broadcast_media_state(state).await;
        enabled
    }

    /// Share the screen in place of the camera on every connection
    ///
    /// The share ends with [`stop_screen_share`](Self::stop_screen_share) or
    /// when the captured track ends.
    ///
    /// # Errors
    ///
    /// `ScreenShareActive` while sharing, `MediaAcquisition` when display
    /// capture fails (also emitted as `ScreenShareError`).
    pub async fn start_screen_share(&self, options: Option<ScreenShareOptions>) -> Result<MediaStream> {
        self.ensure_running()?;
        let options = options.unwrap_or_default();

        let (stream, screen_track, state) = {
            let mut media = self.inner.media.lock().await;
            match media.start_screen_share(&options).await {
                Ok((stream, track)) => (stream, track, media.media_state()),
                Err(Error::ScreenShareActive) => return Err(Error::ScreenShareActive),
                Err(e) => {
                    warn!("Failed to start screen share: {}", e);
                    self.inner.events.emit(CallEvent::ScreenShareError {
                        error: duplicate_media_error(&e),
                    });
                    return Err(e);
                }
            }
        };

        let replaced = self.inner.replace_outbound_video(Some(&screen_track)).await;
        debug!(replaced, "Screen track sent in place of camera");

        let weak = Arc::downgrade(&self.inner);
        let watched = screen_track.clone();
        let watcher = tokio::spawn(async move {
            watched.ended().await;
            if let Some(inner) = weak.upgrade() {
                debug!(track_id = %watched.id(), "Screen track ended");
                // Dropped, not aborted: this task is the one running
                inner.screen_watcher.lock().take();
                inner.finish_screen_share().await;
            }
        });
        if let Some(previous) = self.inner.screen_watcher.lock().replace(watcher) {
            previous.abort();
        }

        self.inner.broadcast_media_state(state).await;
        self.inner.events.emit(CallEvent::ScreenShareStarted {
            stream: stream.clone(),
        });
        Ok(stream)
    }

    /// Stop the screen share and restore the camera
    ///
    /// Returns `false` when no share was running.
    pub async fn stop_screen_share(&self) -> bool {
        if let Some(watcher) = self.inner.screen_watcher.lock().take() {
            watcher.abort();
        }
        self.inner.finish_screen_share().await
    }

    /// Send JSON to one participant over the control channel
    ///
    /// Best effort; `false` when it could not be handed to an open channel.
    pub async fn send_data_channel_message<T: Serialize + ?Sized>(
        &self,
        participant: impl Into<ParticipantId>,
        data: &T,
    ) -> bool {
        let Some(call_id) = self.active_call().await else {
            return false;
        };
        self.inner
            .bus
            .send(&PeerKey::new(call_id, participant.into()), data)
            .await
    }

    /// Send JSON to every participant with an open control channel
    pub async fn broadcast_data_channel_message<T: Serialize + ?Sized>(&self, data: &T) -> BroadcastStats {
        let Some(call_id) = self.active_call().await else {
            return BroadcastStats::default();
        };
        self.inner.bus.broadcast(&call_id, data).await
    }

    pub async fn local_stream(&self) -> Option<MediaStream> {
        self.inner.media.lock().await.local_stream()
    }

    pub async fn screen_stream(&self) -> Option<MediaStream> {
        self.inner.media.lock().await.screen_stream()
    }

    pub async fn remote_stream(&self, participant: impl Into<ParticipantId>) -> Option<RemoteStream> {
        self.connection(participant.into()).await?.remote_stream()
    }

    /// Last quality snapshot of a participant
    pub async fn quality(&self, participant: impl Into<ParticipantId>) -> Option<CallQuality> {
        self.connection(participant.into()).await?.quality()
    }

    pub async fn connection_state(&self, participant: impl Into<ParticipantId>) -> Option<ConnectionState> {
        Some(self.connection(participant.into()).await?.connection_state())
    }

    pub async fn ice_connection_state(
        &self,
        participant: impl Into<ParticipantId>,
    ) -> Option<IceConnectionState> {
        Some(self.connection(participant.into()).await?.ice_connection_state())
    }

    /// Remote participants of the active call, in the order they were added
    pub async fn participants(&self) -> Vec<ParticipantId> {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .filter(|s| !s.state.is_idle())
            .map(|s| s.participants.clone())
            .unwrap_or_default()
    }

    /// Connections of the active call
    pub async fn peers(&self) -> Vec<PeerInfo> {
        match self.active_call().await {
            Some(call_id) => self.inner.registry.list(&call_id).await,
            None => Vec::new(),
        }
    }

    pub async fn active_call(&self) -> Option<CallId> {
        self.inner.active_call_id().await
    }

    pub async fn call_state(&self) -> CallState {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.state)
            .unwrap_or_default()
    }

    /// End any call, release all media and close the event stream
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down call service");

        self.end_call(None).await;
        if let Some(watcher) = self.inner.screen_watcher.lock().take() {
            watcher.abort();
        }
        self.inner.media.lock().await.stop_all();
        self.inner.events.close();

        info!("Call service shutdown complete");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(Error::ShutDown);
        }
        Ok(())
    }

    async fn connection(&self, participant: ParticipantId) -> Option<Arc<PeerConnection>> {
        let call_id = self.active_call().await?;
        self.inner
            .registry
            .get(&PeerKey::new(call_id, participant))
            .await
    }

    async fn active_call_or_report(&self, remote: &ParticipantId) -> Option<CallId> {
        let call_id = self.active_call().await;
        if call_id.is_none() {
            debug!(participant = %remote, "Signaling message without an active call");
            self.inner
                .signal_error(None, remote.clone(), Error::NoActiveCall);
        }
        call_id
    }
}

impl Inner {
    async fn active_call_id(&self) -> Option<CallId> {
        self.session
            .read()
            .await
            .as_ref()
            .filter(|s| !s.state.is_idle())
            .map(|s| s.call_id.clone())
    }

    async fn begin_session(&self, call_id: &CallId, is_initiator: bool) -> Result<()> {
        let mut session = self.session.write().await;
        if let Some(active) = session.as_ref().filter(|s| !s.state.is_idle()) {
            return Err(Error::CallAlreadyActive(active.call_id.to_string()));
        }
        *session = Some(CallSession::new(call_id.clone(), is_initiator));
        Ok(())
    }

    async fn reset_session(&self, call_id: &CallId) {
        let mut session = self.session.write().await;
        if session.as_ref().is_some_and(|s| &s.call_id == call_id) {
            *session = None;
        }
    }

    async fn acquire_media(&self, constraints: Option<MediaConstraints>) -> Result<MediaStream> {
        let constraints = constraints.unwrap_or_default();
        let result = self.media.lock().await.get_local_media(&constraints).await;
        if let Err(e) = &result {
            warn!("Failed to acquire local media: {}", e);
            self.events.emit(CallEvent::MediaError {
                error: duplicate_media_error(e),
            });
        }
        result
    }

    /// Create and register a native connection, then start its tasks
    async fn create_connection(
        self: &Arc<Self>,
        call_id: &CallId,
        participant: &ParticipantId,
        is_initiator: bool,
    ) -> Result<Arc<PeerConnection>> {
        let (native, native_events) = self.factory.create(&self.config).await?;
        let key = PeerKey::new(call_id.clone(), participant.clone());

        let connection = match self.registry.insert(key, native.clone(), is_initiator).await {
            Ok(connection) => connection,
            Err(e) => {
                if let Err(close_err) = native.close().await {
                    warn!("Failed to close rejected connection: {}", close_err);
                }
                return Err(e);
            }
        };

        self.adopt_orphans(&connection).await;

        connection.attach_task(tokio::spawn(pump_events(
            Arc::downgrade(self),
            Arc::downgrade(&connection),
            native_events,
        )));
        connection.attach_task(QualityMonitor::spawn(
            Arc::downgrade(&connection),
            self.config.quality_interval(),
            self.events.clone(),
        ));

        if let Some(session) = self.session.write().await.as_mut() {
            if &session.call_id == call_id {
                session.add_participant(participant.clone());
            }
        }

        Ok(connection)
    }

    /// Hand candidates buffered before the connection existed to it
    async fn adopt_orphans(&self, connection: &Arc<PeerConnection>) {
        let orphans = self
            .orphans
            .lock()
            .remove(connection.participant())
            .unwrap_or_default();
        for candidate in orphans {
            if let Err(e) = self.negotiation.add_candidate(connection, candidate).await {
                warn!(participant = %connection.participant(), "Failed to queue early candidate: {}", e);
            }
        }
    }

    async fn connect_initiator(
        self: &Arc<Self>,
        call_id: &CallId,
        participant: &ParticipantId,
        stream: &MediaStream,
        video: Option<LocalTrack>,
    ) -> Result<()> {
        let connection = self.create_connection(call_id, participant, true).await?;

        if let Err(e) = self
            .negotiation
            .start_initiator(&connection, stream, video)
            .await
        {
            self.discard(&connection).await;
            return Err(e);
        }
        Ok(())
    }

    /// A non-initiator connection carrying the local tracks
    async fn create_responder(
        self: &Arc<Self>,
        call_id: &CallId,
        participant: &ParticipantId,
    ) -> Result<Arc<PeerConnection>> {
        let connection = self.create_connection(call_id, participant, false).await?;

        let (stream, video) = {
            let media = self.media.lock().await;
            (media.local_stream(), media.outbound_video())
        };
        if let Some(stream) = stream {
            if let Err(e) = connection.add_local_tracks(&stream, video).await {
                self.discard(&connection).await;
                return Err(e);
            }
        }
        Ok(connection)
    }

    /// Undo a connection that failed to start
    async fn discard(&self, connection: &PeerConnection) {
        self.registry.remove(connection.key()).await;
        self.recovery.forget(connection.key());
        if let Some(session) = self.session.write().await.as_mut() {
            if &session.call_id == connection.call_id() {
                session.remove_participant(connection.participant());
            }
        }
        connection.close().await;
    }

    /// Close everything that belongs to `call_id`
    async fn teardown(&self, call_id: &CallId) {
        if let Some(watcher) = self.screen_watcher.lock().take() {
            watcher.abort();
        }

        let connections = self.registry.drain_call(call_id).await;
        futures::future::join_all(connections.iter().map(|c| c.close())).await;

        self.recovery.clear();
        self.orphans.lock().clear();
        self.media.lock().await.stop_all();

        debug!(call_id = %call_id, closed = connections.len(), "Call torn down");
    }

    fn signal_error(&self, call_id: Option<CallId>, participant: ParticipantId, error: Error) {
        self.events.emit(CallEvent::SignalError {
            call_id,
            participant,
            error,
        });
    }

    async fn broadcast_media_state(&self, state: channels::MediaState) {
        if let Some(call_id) = self.active_call_id().await {
            self.bus.broadcast_media_state(&call_id, state).await;
        }
    }

    /// Swap the outbound video of every connection; returns how many changed
    async fn replace_outbound_video(&self, track: Option<&LocalTrack>) -> usize {
        let Some(call_id) = self.active_call_id().await else {
            return 0;
        };

        let mut replaced = 0;
        for connection in self.registry.connections(&call_id).await {
            match connection.replace_video(track).await {
                Ok(true) => replaced += 1,
                Ok(false) => {
                    debug!(participant = %connection.participant(), "No video sender to replace")
                }
                Err(e) => {
                    warn!(participant = %connection.participant(), "Failed to replace video track: {}", e)
                }
            }
        }
        replaced
    }

    /// Shared end of a screen share, explicit or from the track ending
    async fn finish_screen_share(&self) -> bool {
        let (stopped, camera, state) = {
            let mut media = self.media.lock().await;
            let stopped = media.take_screen_share();
            (stopped, media.camera_track(), media.media_state())
        };
        if stopped.is_none() {
            return false;
        }

        let restored = self.replace_outbound_video(camera.as_ref()).await;
        debug!(restored, "Camera restored after screen share");

        self.broadcast_media_state(state).await;
        self.events.emit(CallEvent::ScreenShareStopped);
        true
    }

    async fn handle_native_event(self: &Arc<Self>, connection: &Arc<PeerConnection>, event: NativeEvent) {
        match event {
            NativeEvent::ConnectionState(state) => self.on_connection_state(connection, state).await,
            NativeEvent::IceConnectionState(state) => {
                if connection.set_ice_connection_state(state).is_some() {
                    debug!(participant = %connection.participant(), state = %state, "ICE state changed");
                    self.events.emit(CallEvent::IceConnectionStateChanged {
                        call_id: connection.call_id().clone(),
                        participant: connection.participant().clone(),
                        state,
                    });
                }
            }
            NativeEvent::IceCandidate(candidate) => {
                self.negotiation.emit_local_candidate(connection, candidate);
            }
            NativeEvent::Track(track) => {
                debug!(
                    participant = %connection.participant(),
                    track_id = %track.id,
                    kind = %track.kind,
                    "Remote track"
                );
                if let Some(stream) = connection.add_remote_track(track) {
                    info!(participant = %connection.participant(), "Remote stream added");
                    self.events.emit(CallEvent::RemoteStreamAdded {
                        call_id: connection.call_id().clone(),
                        participant: connection.participant().clone(),
                        stream,
                    });
                }
            }
            NativeEvent::DataChannel(channel) => {
                let label = channel.label();
                if label != CONTROL_CHANNEL_LABEL {
                    debug!(participant = %connection.participant(), label = %label, "Ignoring unknown data channel");
                    return;
                }
                let open = channel.is_open();
                connection.set_data_channel(channel);
                debug!(participant = %connection.participant(), open, "Adopted remote control channel");
                if open {
                    self.on_channel_open(connection).await;
                }
            }
            NativeEvent::DataChannelOpen { label } => {
                if label == CONTROL_CHANNEL_LABEL && connection.data_channel().is_some() {
                    self.on_channel_open(connection).await;
                }
            }
            NativeEvent::DataChannelMessage { label, text } => {
                if label == CONTROL_CHANNEL_LABEL {
                    self.on_channel_message(connection, &text);
                }
            }
            NativeEvent::DataChannelClosed { label } => {
                if label == CONTROL_CHANNEL_LABEL {
                    debug!(participant = %connection.participant(), "Control channel closed");
                    self.events.emit(CallEvent::DataChannelClosed {
                        call_id: connection.call_id().clone(),
                        participant: connection.participant().clone(),
                    });
                }
            }
            NativeEvent::DataChannelError { label, error } => {
                warn!(participant = %connection.participant(), label = %label, "Data channel error: {}", error);
                self.events.emit(CallEvent::DataChannelError {
                    call_id: connection.call_id().clone(),
                    participant: connection.participant().clone(),
                    error: Error::DataChannel(error),
                });
            }
            NativeEvent::NegotiationNeeded => {
                if let Err(e) = self.negotiation.on_negotiation_needed(connection).await {
                    warn!(participant = %connection.participant(), "Renegotiation failed: {}", e);
                    self.signal_error(
                        Some(connection.call_id().clone()),
                        connection.participant().clone(),
                        e,
                    );
                }
            }
        }
    }

    async fn on_connection_state(self: &Arc<Self>, connection: &Arc<PeerConnection>, state: ConnectionState) {
        let Some(old_state) = connection.set_connection_state(state) else {
            return;
        };
        info!(
            call_id = %connection.call_id(),
            participant = %connection.participant(),
            "Connection state: {} -> {}", old_state, state
        );
        self.events.emit(CallEvent::ConnectionStateChanged {
            call_id: connection.call_id().clone(),
            participant: connection.participant().clone(),
            state,
        });

        match state {
            ConnectionState::Connected => {
                self.recovery.on_connected(connection.key());
                let mut session = self.session.write().await;
                if let Some(session) = session.as_mut() {
                    if &session.call_id == connection.call_id() && session.mark_active() {
                        info!(call_id = %session.call_id, "Call active");
                    }
                }
            }
            ConnectionState::Failed if connection.is_initiator() => {
                self.schedule_recovery(connection);
            }
            ConnectionState::Failed => self.await_remote_restart(connection),
            _ => {}
        }
    }

    /// An offer/answer round failed; keep recovering while the connection is down
    fn on_negotiation_failed(self: &Arc<Self>, connection: &Arc<PeerConnection>) {
        if connection.is_closed()
            || !connection.is_initiator()
            || connection.connection_state() != ConnectionState::Failed
        {
            return;
        }
        debug!(participant = %connection.participant(), "Restart negotiation failed");
        self.schedule_recovery(connection);
    }

    fn schedule_recovery(self: &Arc<Self>, connection: &Arc<PeerConnection>) {
        match self.recovery.on_failed(connection.key()) {
            RecoveryDecision::Schedule { attempt, delay } => {
                warn!(
                    participant = %connection.participant(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling connection recovery"
                );
                let inner = Arc::downgrade(self);
                let weak = Arc::downgrade(connection);
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let (Some(inner), Some(connection)) = (inner.upgrade(), weak.upgrade()) else {
                        return;
                    };
                    inner.run_recovery(&connection, attempt).await;
                });
                connection.attach_task(task);
            }
            RecoveryDecision::AlreadyPending | RecoveryDecision::GaveUp => {}
            RecoveryDecision::Exhausted { attempts } => self.report_exhausted(connection, attempts),
        }
    }

    /// Bound the wait of a failed responder for the initiator's ICE restart
    fn await_remote_restart(self: &Arc<Self>, connection: &Arc<PeerConnection>) {
        let Some((streak, window)) = self
            .recovery
            .on_remote_failed(connection.key(), self.config.negotiation_timeout())
        else {
            return;
        };
        warn!(
            participant = %connection.participant(),
            window_ms = window.as_millis() as u64,
            "Connection failed; waiting for the initiator to restart ICE"
        );

        let inner = Arc::downgrade(self);
        let weak = Arc::downgrade(connection);
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let (Some(inner), Some(connection)) = (inner.upgrade(), weak.upgrade()) else {
                return;
            };
            if connection.is_closed() || connection.connection_state() != ConnectionState::Failed {
                return;
            }
            if let Some(attempts) = inner.recovery.remote_wait_expired(connection.key(), streak) {
                inner.report_exhausted(&connection, attempts);
            }
        });
        connection.attach_task(task);
    }

    fn report_exhausted(&self, connection: &PeerConnection, attempts: u32) {
        warn!(participant = %connection.participant(), attempts, "Giving up on connection");
        self.events.emit(CallEvent::CallError {
            call_id: connection.call_id().clone(),
            participant: Some(connection.participant().clone()),
            error: Error::RecoveryExhausted {
                participant: connection.participant().to_string(),
                attempts,
            },
        });
    }

    async fn run_recovery(self: &Arc<Self>, connection: &Arc<PeerConnection>, attempt: u32) {
        self.recovery.attempt_started(connection.key());
        if connection.is_closed() || connection.connection_state() == ConnectionState::Connected {
            debug!(participant = %connection.participant(), "Recovery no longer needed");
            return;
        }

        match self.negotiation.send_offer(connection, true).await {
            Ok(offer) => {
                info!(participant = %connection.participant(), attempt, "Sent ICE restart offer");
                self.events.emit(CallEvent::ConnectionRecoveryAttempt {
                    call_id: connection.call_id().clone(),
                    participant: connection.participant().clone(),
                    offer,
                    attempt,
                });
            }
            Err(e) => {
                warn!(participant = %connection.participant(), attempt, "Recovery attempt failed: {}", e);
                self.events.emit(CallEvent::ConnectionRecoveryFailed {
                    call_id: connection.call_id().clone(),
                    participant: connection.participant().clone(),
                    attempt,
                    error: e,
                });
                self.schedule_recovery(connection);
            }
        }
    }

    async fn on_channel_open(&self, connection: &PeerConnection) {
        if !connection.mark_channel_open() {
            return;
        }
        info!(participant = %connection.participant(), "Control channel open");
        self.events.emit(CallEvent::DataChannelOpen {
            call_id: connection.call_id().clone(),
            participant: connection.participant().clone(),
        });

        let state = self.media.lock().await.media_state();
        self.bus.send_media_state(connection.key(), state).await;
    }

    fn on_channel_message(&self, connection: &PeerConnection, text: &str) {
        let call_id = connection.call_id().clone();
        let participant = connection.participant().clone();
        let event = match channels::messages::decode(text) {
            Ok(InboundMessage::MediaState(state)) => CallEvent::RemoteMediaState {
                call_id,
                participant,
                state,
            },
            Ok(InboundMessage::Data(data)) => CallEvent::DataChannelMessage {
                call_id,
                participant,
                data,
            },
            Err(error) => {
                debug!(participant = %participant, "Undecodable data channel message: {}", error);
                CallEvent::DataChannelError {
                    call_id,
                    participant,
                    error,
                }
            }
        };
        self.events.emit(event);
    }
}

/// Drain one connection's native events in order
async fn pump_events(
    inner: Weak<Inner>,
    connection: Weak<PeerConnection>,
    mut events: NativeEventReceiver,
) {
    while let Some(event) = events.recv().await {
        let (Some(inner), Some(connection)) = (inner.upgrade(), connection.upgrade()) else {
            break;
        };
        if connection.is_closed() {
            break;
        }
        inner.handle_native_event(&connection, event).await;
    }
}

fn duplicate_media_error(error: &Error) -> Error {
    match error {
        Error::MediaAcquisition(message) => Error::MediaAcquisition(message.clone()),
        other => Error::MediaAcquisition(other.to_string()),
    }
}
