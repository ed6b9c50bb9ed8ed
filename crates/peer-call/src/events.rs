//! Events emitted by the call service

use crate::channels::MediaState;
use crate::media::{MediaStream, RemoteStream};
use crate::negotiation::SignalingMessage;
use crate::peer::{ConnectionState, IceConnectionState};
use crate::quality::CallQuality;
use crate::session::{CallId, ParticipantId};
use crate::Error;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

/// Receiving end of the service's event stream
pub type CallEventReceiver = mpsc::UnboundedReceiver<CallEvent>;

/// Everything the service reports to its host
///
/// `Signal` is the only event the host must act on: relay `message` to
/// `remote_id` over its signaling transport.
#[derive(Debug)]
pub enum CallEvent {
    CallInitiated {
        call_id: CallId,
        participants: Vec<ParticipantId>,
    },
    CallJoined {
        call_id: CallId,
        participant: ParticipantId,
    },
    CallEnded {
        call_id: CallId,
    },
    /// Outbound signaling for the host transport
    Signal {
        call_id: CallId,
        remote_id: ParticipantId,
        message: SignalingMessage,
    },
    ConnectionStateChanged {
        call_id: CallId,
        participant: ParticipantId,
        state: ConnectionState,
    },
    IceConnectionStateChanged {
        call_id: CallId,
        participant: ParticipantId,
        state: IceConnectionState,
    },
    /// First inbound track of a participant; later tracks join this stream
    RemoteStreamAdded {
        call_id: CallId,
        participant: ParticipantId,
        stream: RemoteStream,
    },
    DataChannelOpen {
        call_id: CallId,
        participant: ParticipantId,
    },
    DataChannelMessage {
        call_id: CallId,
        participant: ParticipantId,
        data: serde_json::Value,
    },
    DataChannelClosed {
        call_id: CallId,
        participant: ParticipantId,
    },
    RemoteMediaState {
        call_id: CallId,
        participant: ParticipantId,
        state: MediaState,
    },
    QualityUpdate {
        call_id: CallId,
        participant: ParticipantId,
        quality: CallQuality,
    },
    /// An ICE-restart offer was sent as `Signal` as well
    ConnectionRecoveryAttempt {
        call_id: CallId,
        participant: ParticipantId,
        offer: String,
        attempt: u32,
    },
    ConnectionRecoveryFailed {
        call_id: CallId,
        participant: ParticipantId,
        attempt: u32,
        error: Error,
    },
    ScreenShareStarted {
        stream: MediaStream,
    },
    ScreenShareStopped,
    MediaError {
        error: Error,
    },
    SignalError {
        call_id: Option<CallId>,
        participant: ParticipantId,
        error: Error,
    },
    /// Terminal failure of one participant or of the call
    CallError {
        call_id: CallId,
        participant: Option<ParticipantId>,
        error: Error,
    },
    DataChannelError {
        call_id: CallId,
        participant: ParticipantId,
        error: Error,
    },
    ScreenShareError {
        error: Error,
    },
}

impl CallEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::CallInitiated { .. } => "call-initiated",
            CallEvent::CallJoined { .. } => "call-joined",
            CallEvent::CallEnded { .. } => "call-ended",
            CallEvent::Signal { .. } => "signal",
            CallEvent::ConnectionStateChanged { .. } => "connection-state-changed",
            CallEvent::IceConnectionStateChanged { .. } => "ice-connection-state-changed",
            CallEvent::RemoteStreamAdded { .. } => "remote-stream-added",
            CallEvent::DataChannelOpen { .. } => "data-channel-open",
            CallEvent::DataChannelMessage { .. } => "data-channel-message",
            CallEvent::DataChannelClosed { .. } => "data-channel-closed",
            CallEvent::RemoteMediaState { .. } => "remote-media-state",
            CallEvent::QualityUpdate { .. } => "quality-update",
            CallEvent::ConnectionRecoveryAttempt { .. } => "connection-recovery-attempt",
            CallEvent::ConnectionRecoveryFailed { .. } => "connection-recovery-failed",
            CallEvent::ScreenShareStarted { .. } => "screen-share-started",
            CallEvent::ScreenShareStopped => "screen-share-stopped",
            CallEvent::MediaError { .. } => "media-error",
            CallEvent::SignalError { .. } => "signal-error",
            CallEvent::CallError { .. } => "call-error",
            CallEvent::DataChannelError { .. } => "data-channel-error",
            CallEvent::ScreenShareError { .. } => "screen-share-error",
        }
    }

    /// Whether this event reports a fault
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CallEvent::MediaError { .. }
                | CallEvent::SignalError { .. }
                | CallEvent::CallError { .. }
                | CallEvent::DataChannelError { .. }
                | CallEvent::ScreenShareError { .. }
                | CallEvent::ConnectionRecoveryFailed { .. }
        )
    }
}

/// Shared sending side of the event stream
pub(crate) struct EventSink {
    tx: Mutex<Option<mpsc::UnboundedSender<CallEvent>>>,
}

impl EventSink {
    pub(crate) fn new() -> (Self, CallEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    pub(crate) fn emit(&self, event: CallEvent) {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            trace!(event = event.name(), "Event dropped after shutdown");
            return;
        };
        if let Err(e) = tx.send(event) {
            trace!(event = e.0.name(), "Event receiver dropped");
        }
    }

    /// Drop the sender; the receiver sees the end of the stream
    pub(crate) fn close(&self) {
        self.tx.lock().take();
    }
}
