//! Peer connection registry
//!
//! An arena of connections with a `(call, participant)` index. The registry
//! is the only place connections are inserted or removed.

use super::connection::{ConnectionState, PeerConnection};
use super::native::NativePeerConnection;
use crate::session::{CallId, ParticipantId, PeerKey};
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Stable handle to a registry slot
///
/// The generation guards against a handle outliving its connection and
/// pointing at a later occupant of the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    index: u32,
    generation: u32,
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Arc<PeerConnection>>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    index: HashMap<PeerKey, ConnectionHandle>,
}

impl Arena {
    fn allocate(&mut self) -> ConnectionHandle {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                ConnectionHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot::default());
                ConnectionHandle {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    fn get(&self, handle: ConnectionHandle) -> Option<&Arc<PeerConnection>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn release(&mut self, handle: ConnectionHandle) -> Option<Arc<PeerConnection>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        self.free.push(handle.index);
        Some(entry)
    }
}

/// Summary of one registered connection
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub handle: ConnectionHandle,
    pub participant: ParticipantId,
    pub is_initiator: bool,
    pub state: ConnectionState,
}

/// All live connections of the service
pub struct PeerRegistry {
    arena: RwLock<Arena>,
    max_per_call: usize,
}

impl PeerRegistry {
    /// `max_per_call` bounds the connections of one call (1-32)
    pub fn new(max_per_call: usize) -> Result<Self> {
        if max_per_call == 0 || max_per_call > 32 {
            return Err(Error::InvalidConfig(format!(
                "max_participants must be in range 1-32, got {}",
                max_per_call
            )));
        }

        Ok(Self {
            arena: RwLock::new(Arena::default()),
            max_per_call,
        })
    }

    /// Register a new connection
    ///
    /// # Errors
    ///
    /// `DuplicatePeer` if the key is taken, `InvalidConfig` when the call is
    /// at `max_participants`.
    pub async fn insert(
        &self,
        key: PeerKey,
        native: Arc<dyn NativePeerConnection>,
        is_initiator: bool,
    ) -> Result<Arc<PeerConnection>> {
        let mut arena = self.arena.write().await;

        if arena.index.contains_key(&key) {
            return Err(Error::DuplicatePeer {
                call_id: key.call_id.to_string(),
                participant: key.participant.to_string(),
            });
        }

        let in_call = arena
            .index
            .keys()
            .filter(|k| k.call_id == key.call_id)
            .count();
        if in_call >= self.max_per_call {
            return Err(Error::InvalidConfig(format!(
                "Call {} already has the maximum of {} participants",
                key.call_id, self.max_per_call
            )));
        }

        let handle = arena.allocate();
        let connection = Arc::new(PeerConnection::new(
            handle,
            key.clone(),
            native,
            is_initiator,
        ));
        arena.slots[handle.index as usize].entry = Some(Arc::clone(&connection));
        arena.index.insert(key.clone(), handle);

        info!(
            call_id = %key.call_id,
            participant = %key.participant,
            handle = %handle,
            is_initiator,
            "Registered peer connection"
        );
        Ok(connection)
    }

    pub async fn get(&self, key: &PeerKey) -> Option<Arc<PeerConnection>> {
        let arena = self.arena.read().await;
        let handle = arena.index.get(key)?;
        arena.get(*handle).cloned()
    }

    pub async fn get_by_handle(&self, handle: ConnectionHandle) -> Option<Arc<PeerConnection>> {
        self.arena.read().await.get(handle).cloned()
    }

    pub async fn contains(&self, key: &PeerKey) -> bool {
        self.arena.read().await.index.contains_key(key)
    }

    /// Unregister a connection; the caller closes it
    pub async fn remove(&self, key: &PeerKey) -> Option<Arc<PeerConnection>> {
        let mut arena = self.arena.write().await;
        let handle = arena.index.remove(key)?;
        let removed = arena.release(handle);
        if removed.is_some() {
            debug!(participant = %key.participant, handle = %handle, "Removed peer connection");
        }
        removed
    }

    /// Unregister every connection of a call, in insertion order of handles
    pub async fn drain_call(&self, call_id: &CallId) -> Vec<Arc<PeerConnection>> {
        let mut arena = self.arena.write().await;
        let mut handles: Vec<(PeerKey, ConnectionHandle)> = arena
            .index
            .iter()
            .filter(|(k, _)| &k.call_id == call_id)
            .map(|(k, h)| (k.clone(), *h))
            .collect();
        handles.sort_by_key(|(_, h)| h.index);

        let mut drained = Vec::with_capacity(handles.len());
        for (key, handle) in handles {
            arena.index.remove(&key);
            if let Some(connection) = arena.release(handle) {
                drained.push(connection);
            }
        }
        drained
    }

    /// Connections of a call
    pub async fn connections(&self, call_id: &CallId) -> Vec<Arc<PeerConnection>> {
        let arena = self.arena.read().await;
        let mut connections: Vec<Arc<PeerConnection>> = arena
            .index
            .iter()
            .filter(|(k, _)| &k.call_id == call_id)
            .filter_map(|(_, h)| arena.get(*h).cloned())
            .collect();
        connections.sort_by_key(|c| c.handle().index);
        connections
    }

    pub async fn list(&self, call_id: &CallId) -> Vec<PeerInfo> {
        self.connections(call_id)
            .await
            .into_iter()
            .map(|c| PeerInfo {
                handle: c.handle(),
                participant: c.participant().clone(),
                is_initiator: c.is_initiator(),
                state: c.connection_state(),
            })
            .collect()
    }

    pub async fn participants(&self, call_id: &CallId) -> Vec<ParticipantId> {
        self.connections(call_id)
            .await
            .into_iter()
            .map(|c| c.participant().clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.arena.read().await.index.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.arena.read().await.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::testing::NullConnection;

    fn native() -> Arc<dyn NativePeerConnection> {
        Arc::new(NullConnection::default())
    }

    #[test]
    fn test_registry_creation() {
        assert!(PeerRegistry::new(10).is_ok());
        assert!(PeerRegistry::new(0).is_err());
        assert!(PeerRegistry::new(33).is_err());
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let registry = PeerRegistry::new(10).unwrap();
        let key = PeerKey::new("c", "u1");

        let connection = registry.insert(key.clone(), native(), true).await.unwrap();
        assert!(connection.is_initiator());

        let found = registry.get(&key).await.unwrap();
        assert_eq!(found.handle(), connection.handle());
        assert!(registry
            .get_by_handle(connection.handle())
            .await
            .is_some());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_peer_rejected() {
        let registry = PeerRegistry::new(10).unwrap();
        let key = PeerKey::new("c", "u1");

        registry.insert(key.clone(), native(), true).await.unwrap();
        let result = registry.insert(key, native(), false).await;
        assert!(matches!(result, Err(Error::DuplicatePeer { .. })));
    }

    #[tokio::test]
    async fn test_same_participant_in_other_call_allowed() {
        let registry = PeerRegistry::new(10).unwrap();
        registry
            .insert(PeerKey::new("c1", "u1"), native(), true)
            .await
            .unwrap();
        assert!(registry
            .insert(PeerKey::new("c2", "u1"), native(), true)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_max_per_call_enforced() {
        let registry = PeerRegistry::new(2).unwrap();
        registry
            .insert(PeerKey::new("c", "u1"), native(), true)
            .await
            .unwrap();
        registry
            .insert(PeerKey::new("c", "u2"), native(), true)
            .await
            .unwrap();

        let result = registry.insert(PeerKey::new("c", "u3"), native(), true).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_stale_handle_after_remove() {
        let registry = PeerRegistry::new(10).unwrap();
        let first = registry
            .insert(PeerKey::new("c", "u1"), native(), true)
            .await
            .unwrap();
        let stale = first.handle();

        assert!(registry.remove(&PeerKey::new("c", "u1")).await.is_some());
        assert!(registry.remove(&PeerKey::new("c", "u1")).await.is_none());

        // Slot is reused with a new generation.
        let second = registry
            .insert(PeerKey::new("c", "u2"), native(), true)
            .await
            .unwrap();
        assert_ne!(second.handle(), stale);
        assert!(registry.get_by_handle(stale).await.is_none());
    }

    #[tokio::test]
    async fn test_drain_call_only_touches_that_call() {
        let registry = PeerRegistry::new(10).unwrap();
        for p in ["u1", "u2", "u3"] {
            registry
                .insert(PeerKey::new("c1", p), native(), true)
                .await
                .unwrap();
        }
        registry
            .insert(PeerKey::new("c2", "u9"), native(), true)
            .await
            .unwrap();

        assert_eq!(
            registry.participants(&CallId::from("c1")).await,
            vec![
                ParticipantId::from("u1"),
                ParticipantId::from("u2"),
                ParticipantId::from("u3")
            ]
        );

        let drained = registry.drain_call(&CallId::from("c1")).await;
        assert_eq!(drained.len(), 3);
        assert_eq!(registry.len().await, 1);
        assert!(registry.list(&CallId::from("c1")).await.is_empty());
    }
}
