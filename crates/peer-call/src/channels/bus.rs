//! Best-effort messaging over the per-peer control channels

use super::messages::{self, ControlMessage, MediaState};
use crate::peer::{PeerConnection, PeerRegistry};
use crate::session::{CallId, ParticipantId, PeerKey};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Outcome of a broadcast
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    /// Connections in the call
    pub total_peers: usize,
    /// Messages handed to an open channel
    pub sent_count: usize,
    /// Connections without an open channel
    pub skipped_count: usize,
    /// Sends that failed on an open channel
    pub failed_count: usize,
    /// Participants that did not get the message, skipped or failed
    pub failed_peers: Vec<ParticipantId>,
    pub total_duration_ms: u64,
}

enum SendOutcome {
    Sent,
    Skipped,
    Failed,
}

/// Sends JSON messages over the `call-control` channel of each connection
pub struct DataChannelBus {
    registry: Arc<PeerRegistry>,
}

impl DataChannelBus {
    pub fn new(registry: Arc<PeerRegistry>) -> Self {
        Self { registry }
    }

    /// Send `data` to one participant
    ///
    /// `false` for an unknown peer, a missing or closed channel, a value
    /// that does not serialize, or an oversized message.
    pub async fn send<T: Serialize + ?Sized>(&self, key: &PeerKey, data: &T) -> bool {
        let Some(connection) = self.registry.get(key).await else {
            debug!(participant = %key.participant, "No connection for data channel send");
            return false;
        };

        let text = match messages::encode(data) {
            Ok(text) => text,
            Err(e) => {
                warn!(participant = %key.participant, "Dropping data channel message: {}", e);
                return false;
            }
        };

        matches!(send_text(&connection, text).await, SendOutcome::Sent)
    }

    /// Send `data` to every connection of a call
    ///
    /// Closed channels are skipped; one failure never stops the rest.
    pub async fn broadcast<T: Serialize + ?Sized>(
        &self,
        call_id: &CallId,
        data: &T,
    ) -> BroadcastStats {
        let start = Instant::now();
        let connections = self.registry.connections(call_id).await;
        let mut stats = BroadcastStats {
            total_peers: connections.len(),
            ..Default::default()
        };

        let text = match messages::encode(data) {
            Ok(text) => text,
            Err(e) => {
                warn!(call_id = %call_id, "Dropping broadcast: {}", e);
                stats.failed_count = connections.len();
                stats.failed_peers = connections
                    .iter()
                    .map(|c| c.participant().clone())
                    .collect();
                return stats;
            }
        };

        let sends = connections
            .iter()
            .map(|connection| send_text(connection, text.clone()));
        let outcomes = futures::future::join_all(sends).await;

        for (connection, outcome) in connections.iter().zip(outcomes) {
            match outcome {
                SendOutcome::Sent => stats.sent_count += 1,
                SendOutcome::Skipped => {
                    stats.skipped_count += 1;
                    stats.failed_peers.push(connection.participant().clone());
                }
                SendOutcome::Failed => {
                    stats.failed_count += 1;
                    stats.failed_peers.push(connection.participant().clone());
                }
            }
        }

        stats.total_duration_ms = start.elapsed().as_millis() as u64;
        debug!(
            call_id = %call_id,
            sent = stats.sent_count,
            skipped = stats.skipped_count,
            failed = stats.failed_count,
            "Broadcast complete"
        );
        stats
    }

    /// Broadcast the local media state
    pub async fn broadcast_media_state(&self, call_id: &CallId, state: MediaState) -> BroadcastStats {
        self.broadcast(call_id, &ControlMessage::MediaState(state))
            .await
    }

    /// Send the local media state to one connection
    pub async fn send_media_state(&self, key: &PeerKey, state: MediaState) -> bool {
        self.send(key, &ControlMessage::MediaState(state)).await
    }
}

async fn send_text(connection: &PeerConnection, text: String) -> SendOutcome {
    let Some(channel) = connection.data_channel() else {
        return SendOutcome::Skipped;
    };
    if !channel.is_open() {
        return SendOutcome::Skipped;
    }

    match channel.send_text(text).await {
        Ok(()) => SendOutcome::Sent,
        Err(e) => {
            warn!(participant = %connection.participant(), "Data channel send failed: {}", e);
            SendOutcome::Failed
        }
    }
}
