use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::signaling::SignalMessage;

pub type ConnectionTx = mpsc::UnboundedSender<SignalMessage>;

pub type SharedRegistry = Arc<SessionRegistry>;

#[derive(Debug, Clone)]
struct StoredOffer {
    payload: String,
    stored_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub offers: usize,
    pub rooms: usize,
    pub connections: usize,
}

/// Process-wide rendezvous state, keyed by session id.
///
/// Holds the latest offer per session (last writer wins) so late joiners can
/// fetch it, plus the outbound senders of every live connection in each room.
/// `dashmap` gives each entry its own exclusive lock, so a reader never sees a
/// half-written offer.
pub struct SessionRegistry {
    offers: DashMap<String, StoredOffer>,
    /// session_id -> (connection_id -> outbound sender)
    rooms: DashMap<String, DashMap<String, ConnectionTx>>,
    offer_ttl: Option<Duration>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(offer_ttl: Option<Duration>, max_sessions: usize) -> Self {
        Self {
            offers: DashMap::new(),
            rooms: DashMap::new(),
            offer_ttl,
            max_sessions: max_sessions.max(1),
        }
    }

    /// Store the latest offer for a session, replacing any previous one.
    pub fn put_offer(&self, session_id: &str, payload: &str) {
        if !self.offers.contains_key(session_id) && self.offers.len() >= self.max_sessions {
            self.evict_oldest();
        }
        self.offers.insert(
            session_id.to_string(),
            StoredOffer {
                payload: payload.to_string(),
                stored_at: Instant::now(),
            },
        );
        debug!("stored offer for session {} ({} bytes)", session_id, payload.len());
    }

    /// Latest offer for a session, or `None` if nothing (live) is stored.
    pub fn get_offer(&self, session_id: &str) -> Option<String> {
        {
            let entry = self.offers.get(session_id)?;
            if !self.is_expired(&entry) {
                return Some(entry.payload.clone());
            }
        }
        // The read guard must be gone before removing from the same shard.
        self.offers
            .remove_if(session_id, |_, offer| self.is_expired(offer));
        None
    }

    pub fn remove_offer(&self, session_id: &str) -> bool {
        self.offers.remove(session_id).is_some()
    }

    /// Drop every expired offer. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        if self.offer_ttl.is_none() {
            return 0;
        }
        let before = self.offers.len();
        self.offers.retain(|_, offer| !self.is_expired(offer));
        before.saturating_sub(self.offers.len())
    }

    /// Periodically purge expired offers for the lifetime of the process.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let purged = registry.purge_expired();
                if purged > 0 {
                    info!("Purged {} expired offers", purged);
                }
            }
        })
    }

    fn is_expired(&self, offer: &StoredOffer) -> bool {
        match self.offer_ttl {
            Some(ttl) => offer.stored_at.elapsed() >= ttl,
            None => false,
        }
    }

    fn evict_oldest(&self) {
        let oldest = self
            .offers
            .iter()
            .min_by_key(|entry| entry.stored_at)
            .map(|entry| entry.key().clone());

        if let Some(session_id) = oldest {
            self.offers.remove(&session_id);
            warn!(
                "Offer capacity ({}) reached, evicted session {}",
                self.max_sessions, session_id
            );
        }
    }

    /// Register a live connection in a room
    pub fn join_room(&self, session_id: &str, connection_id: &str, tx: ConnectionTx) {
        let room = self
            .rooms
            .entry(session_id.to_string())
            .or_insert_with(DashMap::new);
        room.insert(connection_id.to_string(), tx);
    }

    /// Remove a connection from its room, dropping the room once empty
    pub fn leave_room(&self, session_id: &str, connection_id: &str) {
        if let Some(room) = self.rooms.get(session_id) {
            room.remove(connection_id);
        }
        self.rooms.remove_if(session_id, |_, room| room.is_empty());
    }

    /// Relay a message to every other connection in the room. Returns how many
    /// connections accepted it.
    pub fn relay_except(&self, session_id: &str, sender_id: &str, message: &SignalMessage) -> usize {
        let Some(room) = self.rooms.get(session_id) else {
            return 0;
        };
        let mut delivered = 0;
        for peer in room.iter() {
            if peer.key() == sender_id {
                continue;
            }
            if peer.value().send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn room_size(&self, session_id: &str) -> usize {
        self.rooms
            .get(session_id)
            .map(|room| room.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            offers: self.offers.len(),
            rooms: self.rooms.len(),
            connections: self.rooms.iter().map(|room| room.len()).sum(),
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(None, usize::MAX)
    }
}
