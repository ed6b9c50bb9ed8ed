//! Data channel bus
//!
//! One reliable, ordered channel per connection. The initiating side creates
//! it with the offer; the answering side adopts it when the remote
//! announcement arrives.

pub mod bus;
pub mod messages;

pub use bus::{BroadcastStats, DataChannelBus};
pub use messages::{ControlMessage, InboundMessage, MediaState, MAX_MESSAGE_SIZE};

/// Label of the control channel
pub const CONTROL_CHANNEL_LABEL: &str = "call-control";
