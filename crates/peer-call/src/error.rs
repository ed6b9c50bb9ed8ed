//! Error types for the call subsystem

/// Result type alias using the call Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a call
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Camera, microphone or display capture failed
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// Offer/answer generation or application failed
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// ICE/DTLS breakdown reported by the connection state machine
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    /// Data channel fault
    #[error("Data channel error: {0}")]
    DataChannel(String),

    /// ICE candidate could not be parsed or applied
    #[error("ICE candidate error: {0}")]
    IceCandidate(String),

    /// No connection exists for the given participant
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// A connection already exists for the (call, participant) pair
    #[error("Peer {participant} already has a connection in call {call_id}")]
    DuplicatePeer {
        /// Call the pair belongs to
        call_id: String,
        /// Remote participant
        participant: String,
    },

    /// A call is already running on this service
    #[error("Call {0} is already active")]
    CallAlreadyActive(String),

    /// The operation needs an active call
    #[error("No active call")]
    NoActiveCall,

    /// Screen share was requested while one is running
    #[error("Screen share already active")]
    ScreenShareActive,

    /// Offer/answer round trip did not complete in time
    #[error("Negotiation with {participant} timed out after {timeout_ms}ms")]
    NegotiationTimeout {
        /// Remote participant
        participant: String,
        /// Configured timeout
        timeout_ms: u64,
    },

    /// Recovery gave up after the configured number of attempts
    #[error("Recovery for {participant} exhausted after {attempts} attempts")]
    RecoveryExhausted {
        /// Remote participant
        participant: String,
        /// Attempts made
        attempts: u32,
    },

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The service was shut down
    #[error("Service is shut down")]
    ShutDown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if retrying the operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Signaling(_)
                | Error::ConnectionFailure(_)
                | Error::NegotiationTimeout { .. }
                | Error::Io(_)
        )
    }

    /// Check if this error came from media capture
    pub fn is_media_error(&self) -> bool {
        matches!(self, Error::MediaAcquisition(_) | Error::ScreenShareActive)
    }

    /// Check if this error is tied to a single peer
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_)
                | Error::DuplicatePeer { .. }
                | Error::ConnectionFailure(_)
                | Error::IceCandidate(_)
                | Error::NegotiationTimeout { .. }
                | Error::RecoveryExhausted { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Error::WebRtc(err.to_string())
    }
}
