//! Data channel message format
//!
//! Every message is a JSON text frame. Messages whose `type` is
//! `"media-state"` carry the sender's mute/screen-share state; anything else
//! is application data and is passed through untouched.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Maximum encoded message size (64 KiB, the SCTP message size every
/// browser accepts)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// `type` tag of media-state messages
pub const MEDIA_STATE_TYPE: &str = "media-state";

/// Sender's outbound media state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

/// Messages the call itself sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    MediaState(MediaState),
}

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    MediaState(MediaState),
    Data(serde_json::Value),
}

/// Serialize `data` into a text frame, enforcing [`MAX_MESSAGE_SIZE`]
pub fn encode<T: Serialize + ?Sized>(data: &T) -> Result<String> {
    let text = serde_json::to_string(data)?;
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(Error::DataChannel(format!(
            "Message size {} exceeds maximum {} bytes",
            text.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    Ok(text)
}

/// Decode an inbound text frame
pub fn decode(text: &str) -> Result<InboundMessage> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| Error::DataChannel(format!("Undecodable message: {}", e)))?;

    let is_media_state = value
        .get("type")
        .and_then(|t| t.as_str())
        .is_some_and(|t| t == MEDIA_STATE_TYPE);

    if is_media_state {
        return match serde_json::from_value::<ControlMessage>(value) {
            Ok(ControlMessage::MediaState(state)) => Ok(InboundMessage::MediaState(state)),
            Err(e) => Err(Error::DataChannel(format!(
                "Malformed media-state message: {}",
                e
            ))),
        };
    }

    Ok(InboundMessage::Data(value))
}
