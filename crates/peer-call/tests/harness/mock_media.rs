//! Capture backend with fixed track ids
//!
//! Camera is `cam`, microphone `mic`, screen captures `screen-<n>`.

use async_trait::async_trait;
use parking_lot::Mutex;
use peer_call::media::{LocalTrack, MediaConstraints, MediaDevices, MediaStream, ScreenShareOptions, TrackKind};
use peer_call::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct MockMediaDevices {
    fail_user_media: AtomicBool,
    fail_display_media: AtomicBool,
    user_media_calls: AtomicUsize,
    display_media_calls: AtomicUsize,
    last_screen: Mutex<Option<MediaStream>>,
}

impl MockMediaDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_user_media(&self, fail: bool) {
        self.fail_user_media.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_display_media(&self, fail: bool) {
        self.fail_display_media.store(fail, Ordering::SeqCst);
    }

    pub fn user_media_calls(&self) -> usize {
        self.user_media_calls.load(Ordering::SeqCst)
    }

    pub fn last_screen(&self) -> Option<MediaStream> {
        self.last_screen.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for MockMediaDevices {
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        self.user_media_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_user_media.load(Ordering::SeqCst) {
            return Err(Error::MediaAcquisition("permission denied".to_string()));
        }
        if constraints.is_empty() {
            return Err(Error::MediaAcquisition("nothing requested".to_string()));
        }

        let mut tracks = Vec::new();
        if constraints.wants_audio() {
            tracks.push(LocalTrack::new("mic", TrackKind::Audio, "Microphone"));
        }
        if constraints.wants_video() {
            tracks.push(LocalTrack::new("cam", TrackKind::Video, "Camera"));
        }
        Ok(MediaStream::new("local", tracks))
    }

    async fn get_display_media(&self, _options: &ScreenShareOptions) -> Result<MediaStream> {
        let n = self.display_media_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_display_media.load(Ordering::SeqCst) {
            return Err(Error::MediaAcquisition("display capture denied".to_string()));
        }

        let stream = MediaStream::new(
            format!("screen-stream-{}", n),
            vec![LocalTrack::new(format!("screen-{}", n), TrackKind::Video, "Screen")],
        );
        *self.last_screen.lock() = Some(stream.clone());
        Ok(stream)
    }
}
