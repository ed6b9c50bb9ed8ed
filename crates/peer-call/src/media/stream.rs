//! Local and remote media streams
//!
//! [`MediaStream`] and [`LocalTrack`] are shared handles: cloning one gives
//! another reference to the same stream, so every connection of a call sees
//! the same `enabled` flags and the same `stop()`.

use crate::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    rtc: Option<Arc<TrackLocalStaticSample>>,
}

/// An outbound track
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    /// A track with no webrtc-rs backing, for capture backends that feed
    /// media some other way
    pub fn new(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        Self::build(id.into(), kind, label.into(), None)
    }

    /// A track backed by a sample-fed webrtc-rs track
    pub fn with_rtc(
        kind: TrackKind,
        label: impl Into<String>,
        rtc: Arc<TrackLocalStaticSample>,
    ) -> Self {
        use webrtc::track::track_local::TrackLocal;
        let id = rtc.id().to_string();
        Self::build(id, kind, label.into(), Some(rtc))
    }

    fn build(
        id: String,
        kind: TrackKind,
        label: String,
        rtc: Option<Arc<TrackLocalStaticSample>>,
    ) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                label,
                enabled: AtomicBool::new(true),
                ended,
                rtc,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mute or unmute; the track keeps running either way
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// End the track. Idempotent.
    pub fn stop(&self) {
        let was_ended = self.inner.ended.send_replace(true);
        if !was_ended {
            debug!(track_id = %self.inner.id, kind = %self.inner.kind, "Track stopped");
        }
    }

    /// Resolves once the track has ended, by `stop()` or by the capture source
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        // Sender lives in `inner`, which `self` keeps alive.
        let _ = rx.wait_for(|ended| *ended).await;
    }

    pub fn rtc_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.inner.rtc.clone()
    }

    /// Push one encoded sample
    ///
    /// Returns `Ok(false)` when the sample was dropped because the track is
    /// muted, ended or has no webrtc-rs backing.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool> {
        if !self.is_enabled() || self.is_ended() {
            return Ok(false);
        }

        match &self.inner.rtc {
            Some(rtc) => {
                rtc.write_sample(sample).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether both handles point at the same track
    pub fn ptr_eq(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

struct StreamInner {
    id: String,
    tracks: RwLock<Vec<LocalTrack>>,
}

/// A set of local tracks captured together
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: id.into(),
                tracks: RwLock::new(tracks),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.inner.tracks.read().clone()
    }

    pub fn add_track(&self, track: LocalTrack) {
        self.inner.tracks.write().push(track);
    }

    pub fn audio_track(&self) -> Option<LocalTrack> {
        self.first_of(TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<LocalTrack> {
        self.first_of(TrackKind::Video)
    }

    fn first_of(&self, kind: TrackKind) -> Option<LocalTrack> {
        self.inner
            .tracks
            .read()
            .iter()
            .find(|t| t.kind() == kind)
            .cloned()
    }

    /// Whether any track is still live
    pub fn is_active(&self) -> bool {
        self.inner.tracks.read().iter().any(|t| !t.is_ended())
    }

    /// Stop every track
    pub fn stop(&self) {
        for track in self.inner.tracks.read().iter() {
            track.stop();
        }
    }

    pub fn ptr_eq(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("tracks", &*self.inner.tracks.read())
            .finish()
    }
}

/// An inbound track announced by the remote side
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    /// webrtc-rs handle for reading RTP, when the backend has one
    pub rtc: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            rtc: None,
        }
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

struct RemoteInner {
    id: String,
    tracks: RwLock<Vec<RemoteTrack>>,
}

/// Inbound media from one participant
///
/// Created on the first inbound track; later tracks are appended to the same
/// stream so holders of the handle see them.
#[derive(Clone)]
pub struct RemoteStream {
    inner: Arc<RemoteInner>,
}

impl RemoteStream {
    pub fn new(first: RemoteTrack) -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                id: first.stream_id.clone(),
                tracks: RwLock::new(vec![first]),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn add_track(&self, track: RemoteTrack) {
        let mut tracks = self.inner.tracks.write();
        if !tracks.iter().any(|t| t.id == track.id) {
            tracks.push(track);
        }
    }

    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.inner.tracks.read().clone()
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.inner.tracks.read().iter().any(|t| t.kind == kind)
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.inner.id)
            .field("tracks", &*self.inner.tracks.read())
            .finish()
    }
}
