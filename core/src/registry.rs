use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Identifier handed out for each live connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug)]
struct ConnectionEntry {
    avatar_id: String,
    // outbound queue drained by the connection's writer task
    sender: mpsc::Sender<Value>,
}

/// Live connections and the avatar each one displays.
///
/// Many connections may share an avatar (several browser sources showing
/// the same persona); the avatar pool is whatever distinct IDs are present.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, avatar_id: &str, sender: mpsc::Sender<Value>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.insert(
            id,
            ConnectionEntry {
                avatar_id: avatar_id.to_string(),
                sender,
            },
        );
        info!(
            target: "registry",
            connection = %id,
            avatar_id = %avatar_id,
            total_avatars = self.list_distinct_avatars().len(),
            "Avatar client connected"
        );
        id
    }

    /// Forget a connection. Returns the avatar it served, if it was known.
    pub fn unregister(&self, id: ConnectionId) -> Option<String> {
        let (_, entry) = self.connections.remove(&id)?;
        let remaining = self.connections_for(&entry.avatar_id);
        if remaining == 0 {
            info!(target: "registry", avatar_id = %entry.avatar_id, "Avatar left the pool; no more connections");
        }
        info!(
            target: "registry",
            connection = %id,
            avatar_id = %entry.avatar_id,
            remaining_avatars = self.list_distinct_avatars().len(),
            "Avatar client disconnected"
        );
        Some(entry.avatar_id)
    }

    /// Distinct avatar IDs with at least one live connection
    pub fn list_distinct_avatars(&self) -> BTreeSet<String> {
        self.connections
            .iter()
            .map(|e| e.value().avatar_id.clone())
            .collect()
    }

    pub fn connections_for(&self, avatar_id: &str) -> usize {
        self.connections
            .iter()
            .filter(|e| e.value().avatar_id == avatar_id)
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Fan a message out to every connection of `avatar_id` without
    /// waiting on any of them. Returns how many accepted it; zero means the
    /// avatar is effectively absent.
    pub fn send_to(&self, avatar_id: &str, message: &Value) -> usize {
        let mut delivered = 0;
        for entry in self.connections.iter() {
            if entry.value().avatar_id != avatar_id {
                continue;
            }
            match entry.value().sender.try_send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    debug!(target: "registry", connection = %entry.key(), avatar_id = %avatar_id, "Sent message to client");
                }
                Err(TrySendError::Full(_)) => {
                    warn!(target: "registry", connection = %entry.key(), avatar_id = %avatar_id, "Client outbound queue full");
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(target: "registry", connection = %entry.key(), avatar_id = %avatar_id, "Client writer closed");
                }
            }
        }
        delivered
    }
}
