//! Call identity and lifecycle state

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a call, chosen by the host
    CallId
);

string_id!(
    /// Identifier of a remote participant
    ParticipantId
);

impl CallId {
    /// A fresh random call id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Registry key: one connection per (call, participant)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub call_id: CallId,
    pub participant: ParticipantId,
}

impl PeerKey {
    pub fn new(call_id: impl Into<CallId>, participant: impl Into<ParticipantId>) -> Self {
        Self {
            call_id: call_id.into(),
            participant: participant.into(),
        }
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.call_id, self.participant)
    }
}

/// Lifecycle of the active call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// No call
    #[default]
    None,
    /// Outgoing call, offers sent
    Initiating,
    /// Incoming call, waiting for the remote offer
    Joining,
    /// At least one peer connected
    Active,
    /// Torn down
    Ended,
}

impl CallState {
    /// Whether a new call may start
    pub fn is_idle(self) -> bool {
        matches!(self, CallState::None | CallState::Ended)
    }
}

/// The call this service is part of
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: CallId,
    /// Remote participants in the order they were added
    pub participants: Vec<ParticipantId>,
    pub state: CallState,
    /// Whether the local side started the call
    pub is_initiator: bool,
    pub started_at: Instant,
}

impl CallSession {
    pub fn new(call_id: CallId, is_initiator: bool) -> Self {
        Self {
            call_id,
            participants: Vec::new(),
            state: if is_initiator {
                CallState::Initiating
            } else {
                CallState::Joining
            },
            is_initiator,
            started_at: Instant::now(),
        }
    }

    /// Append a participant; returns false if already present
    pub fn add_participant(&mut self, participant: ParticipantId) -> bool {
        if self.participants.contains(&participant) {
            return false;
        }
        self.participants.push(participant);
        true
    }

    /// Remove a participant; returns false if absent
    pub fn remove_participant(&mut self, participant: &ParticipantId) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p != participant);
        self.participants.len() != before
    }

    /// Moves Initiating/Joining to Active
    pub fn mark_active(&mut self) -> bool {
        if matches!(self.state, CallState::Initiating | CallState::Joining) {
            self.state = CallState::Active;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_display_and_serde() {
        let id = CallId::from("call-1");
        assert_eq!(id.to_string(), "call-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"call-1\"");

        let p: ParticipantId = serde_json::from_str("\"u1\"").unwrap();
        assert_eq!(p.as_str(), "u1");
    }

    #[test]
    fn test_generated_call_ids_differ() {
        assert_ne!(CallId::generate(), CallId::generate());
    }

    #[test]
    fn test_peer_key_display() {
        let key = PeerKey::new("c", "u1");
        assert_eq!(key.to_string(), "c/u1");
    }

    #[tokio::test]
    async fn test_session_state_machine() {
        let mut session = CallSession::new(CallId::from("c"), true);
        assert_eq!(session.state, CallState::Initiating);
        assert!(!session.state.is_idle());

        assert!(session.mark_active());
        assert_eq!(session.state, CallState::Active);
        assert!(!session.mark_active());

        let mut joining = CallSession::new(CallId::from("c"), false);
        assert_eq!(joining.state, CallState::Joining);
        assert!(joining.mark_active());
    }

    #[tokio::test]
    async fn test_participants_keep_order() {
        let mut session = CallSession::new(CallId::from("c"), true);
        assert!(session.add_participant("u2".into()));
        assert!(session.add_participant("u1".into()));
        assert!(!session.add_participant("u2".into()));
        assert_eq!(
            session.participants,
            vec![ParticipantId::from("u2"), ParticipantId::from("u1")]
        );

        assert!(session.remove_participant(&"u2".into()));
        assert!(!session.remove_participant(&"u2".into()));
        assert_eq!(session.participants, vec![ParticipantId::from("u1")]);
    }
}
