//! Local media ownership: camera/microphone stream and screen share

use super::constraints::{MediaConstraints, ScreenShareOptions};
use super::devices::MediaDevices;
use super::stream::{LocalTrack, MediaStream, TrackKind};
use crate::channels::MediaState;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Holds the local stream shared by every connection of the call
pub struct MediaPipeline {
    devices: Arc<dyn MediaDevices>,
    local: Option<MediaStream>,
    screen: Option<MediaStream>,
}

impl MediaPipeline {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            local: None,
            screen: None,
        }
    }

    /// Acquire camera and microphone once
    ///
    /// Later calls return the held stream and ignore `constraints`.
    pub async fn get_local_media(&mut self, constraints: &MediaConstraints) -> Result<MediaStream> {
        if let Some(stream) = &self.local {
            debug!(stream_id = %stream.id(), "Reusing local stream");
            return Ok(stream.clone());
        }

        let stream = self
            .devices
            .get_user_media(constraints)
            .await
            .map_err(|e| match e {
                Error::MediaAcquisition(_) => e,
                other => Error::MediaAcquisition(other.to_string()),
            })?;

        info!(
            stream_id = %stream.id(),
            audio = stream.audio_track().is_some(),
            video = stream.video_track().is_some(),
            "Acquired local media"
        );
        self.local = Some(stream.clone());
        Ok(stream)
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.local.clone()
    }

    pub fn screen_stream(&self) -> Option<MediaStream> {
        self.screen.clone()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    /// Flip the microphone; `false` when there is none
    pub fn toggle_audio(&self) -> bool {
        self.toggle(TrackKind::Audio)
    }

    /// Flip the camera; `false` when there is none
    pub fn toggle_video(&self) -> bool {
        self.toggle(TrackKind::Video)
    }

    fn toggle(&self, kind: TrackKind) -> bool {
        let track = self.local.as_ref().and_then(|s| match kind {
            TrackKind::Audio => s.audio_track(),
            TrackKind::Video => s.video_track(),
        });

        match track {
            Some(track) => {
                let enabled = !track.is_enabled();
                track.set_enabled(enabled);
                info!(kind = %kind, enabled, "Toggled local track");
                enabled
            }
            None => false,
        }
    }

    /// Whether a toggle would find a track of this kind
    pub fn has_track(&self, kind: TrackKind) -> bool {
        self.local.as_ref().is_some_and(|s| match kind {
            TrackKind::Audio => s.audio_track().is_some(),
            TrackKind::Video => s.video_track().is_some(),
        })
    }

    pub fn camera_track(&self) -> Option<LocalTrack> {
        self.local.as_ref().and_then(|s| s.video_track())
    }

    /// The video track connections should send: screen while sharing,
    /// camera otherwise
    pub fn outbound_video(&self) -> Option<LocalTrack> {
        self.screen
            .as_ref()
            .and_then(|s| s.video_track())
            .or_else(|| self.camera_track())
    }

    /// Acquire display capture
    ///
    /// Returns the screen stream and its video track.
    pub async fn start_screen_share(
        &mut self,
        options: &ScreenShareOptions,
    ) -> Result<(MediaStream, LocalTrack)> {
        if self.screen.is_some() {
            return Err(Error::ScreenShareActive);
        }

        let stream = self
            .devices
            .get_display_media(options)
            .await
            .map_err(|e| match e {
                Error::MediaAcquisition(_) => e,
                other => Error::MediaAcquisition(other.to_string()),
            })?;

        let Some(track) = stream.video_track() else {
            stream.stop();
            return Err(Error::MediaAcquisition(
                "display capture returned no video track".to_string(),
            ));
        };

        info!(stream_id = %stream.id(), "Screen share started");
        self.screen = Some(stream.clone());
        Ok((stream, track))
    }

    /// Take and stop the screen stream
    ///
    /// Only the first caller gets `Some`, so concurrent stop paths run the
    /// cleanup once.
    pub fn take_screen_share(&mut self) -> Option<MediaStream> {
        let stream = self.screen.take()?;
        stream.stop();
        info!(stream_id = %stream.id(), "Screen share stopped");
        Some(stream)
    }

    pub fn media_state(&self) -> MediaState {
        let audio = self.local.as_ref().and_then(|s| s.audio_track());
        let video = self.local.as_ref().and_then(|s| s.video_track());
        MediaState {
            audio_enabled: audio.is_some_and(|t| t.is_enabled() && !t.is_ended()),
            video_enabled: video.is_some_and(|t| t.is_enabled() && !t.is_ended()),
            screen_sharing: self.screen.is_some(),
        }
    }

    /// Stop and release every held track
    pub fn stop_all(&mut self) {
        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
        if let Some(local) = self.local.take() {
            local.stop();
            debug!(stream_id = %local.id(), "Released local stream");
        }
    }
}
