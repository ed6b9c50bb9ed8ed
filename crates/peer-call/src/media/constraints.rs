//! Capture constraints

use serde::{Deserialize, Serialize};

/// Per-kind capture request: on/off, or detailed device settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrackConstraint {
    Enabled(bool),
    Detailed(DetailedConstraint),
}

impl TrackConstraint {
    pub fn is_requested(&self) -> bool {
        match self {
            TrackConstraint::Enabled(enabled) => *enabled,
            TrackConstraint::Detailed(_) => true,
        }
    }

    pub fn detail(&self) -> Option<&DetailedConstraint> {
        match self {
            TrackConstraint::Detailed(detail) => Some(detail),
            TrackConstraint::Enabled(_) => None,
        }
    }
}

impl Default for TrackConstraint {
    fn default() -> Self {
        TrackConstraint::Enabled(true)
    }
}

impl From<bool> for TrackConstraint {
    fn from(enabled: bool) -> Self {
        TrackConstraint::Enabled(enabled)
    }
}

/// Device settings for one track kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetailedConstraint {
    pub device_id: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
    pub echo_cancellation: Option<bool>,
    pub noise_suppression: Option<bool>,
}

/// What to capture for a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: TrackConstraint,
    pub video: TrackConstraint,
    pub screen: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: TrackConstraint::Enabled(true),
            video: TrackConstraint::Enabled(true),
            screen: false,
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            video: TrackConstraint::Enabled(false),
            ..Default::default()
        }
    }

    pub fn wants_audio(&self) -> bool {
        self.audio.is_requested()
    }

    pub fn wants_video(&self) -> bool {
        self.video.is_requested()
    }

    pub fn is_empty(&self) -> bool {
        !self.wants_audio() && !self.wants_video()
    }
}

/// Display capture options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScreenShareOptions {
    /// Capture system audio alongside the display
    pub audio: bool,
    pub max_width: u32,
    pub max_height: u32,
    pub max_frame_rate: u32,
    pub show_cursor: bool,
}

impl Default for ScreenShareOptions {
    fn default() -> Self {
        Self {
            audio: false,
            max_width: 1920,
            max_height: 1080,
            max_frame_rate: 30,
            show_cursor: true,
        }
    }
}
