//! Capture backends
//!
//! Platform camera, microphone and display capture happen outside this
//! crate. A host plugs its capture stack in through [`MediaDevices`].

use super::constraints::{MediaConstraints, ScreenShareOptions};
use super::stream::{LocalTrack, MediaStream, TrackKind};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Source of local media
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire camera and/or microphone
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream>;

    /// Acquire display capture
    async fn get_display_media(&self, options: &ScreenShareOptions) -> Result<MediaStream>;
}

/// Tracks fed with pre-encoded samples by the host
///
/// Audio is Opus at 48 kHz stereo, video is VP8 at 90 kHz. Write samples
/// through [`LocalTrack::write_sample`].
#[derive(Debug, Default, Clone)]
pub struct SampleTrackDevices {
    stream_prefix: Option<String>,
}

impl SampleTrackDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `prefix` for generated stream ids instead of a uuid
    pub fn with_stream_prefix(prefix: impl Into<String>) -> Self {
        Self {
            stream_prefix: Some(prefix.into()),
        }
    }

    fn stream_id(&self, suffix: &str) -> String {
        match &self.stream_prefix {
            Some(prefix) => format!("{}-{}", prefix, suffix),
            None => format!("{}-{}", suffix, uuid::Uuid::new_v4()),
        }
    }

    fn audio_track(stream_id: &str, label: &str) -> LocalTrack {
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            format!("{}-audio", stream_id),
            stream_id.to_owned(),
        ));
        LocalTrack::with_rtc(TrackKind::Audio, label, rtc)
    }

    fn video_track(stream_id: &str, label: &str) -> LocalTrack {
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            format!("{}-video", stream_id),
            stream_id.to_owned(),
        ));
        LocalTrack::with_rtc(TrackKind::Video, label, rtc)
    }
}

#[async_trait]
impl MediaDevices for SampleTrackDevices {
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        if constraints.is_empty() {
            return Err(Error::MediaAcquisition(
                "constraints request neither audio nor video".to_string(),
            ));
        }

        let stream_id = self.stream_id("local");
        let mut tracks = Vec::new();
        if constraints.wants_audio() {
            tracks.push(Self::audio_track(&stream_id, "Microphone"));
        }
        if constraints.wants_video() {
            tracks.push(Self::video_track(&stream_id, "Camera"));
        }

        info!(stream_id = %stream_id, tracks = tracks.len(), "Created sample-fed local stream");
        Ok(MediaStream::new(stream_id, tracks))
    }

    async fn get_display_media(&self, options: &ScreenShareOptions) -> Result<MediaStream> {
        let stream_id = self.stream_id("screen");
        let mut tracks = vec![Self::video_track(&stream_id, "Screen")];
        if options.audio {
            tracks.push(Self::audio_track(&stream_id, "System audio"));
        }

        info!(stream_id = %stream_id, "Created sample-fed screen stream");
        Ok(MediaStream::new(stream_id, tracks))
    }
}
