//! Per-document fan-out with backpressure.
//!
//! Every connection subscribed to a document holds a receiver on that
//! document's tokio broadcast channel. A frame is encoded once and shared
//! as `Arc<Outbound>`; each connection task drops frames it originated.
//!
//! ```text
//!  conn A ──edit──► BroadcastGroup("48213") ──► conn A (skips own)
//!                                          ├──► conn B
//!                                          └──► conn C
//! ```
//!
//! A receiver that falls more than `capacity` frames behind skips ahead
//! and the miss is counted in [`BroadcastStats::messages_dropped`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerFrame};

/// One pre-encoded frame on a document channel.
#[derive(Debug)]
pub struct Outbound {
    /// Connection that caused the frame; `None` for server-originated ones.
    pub origin: Option<Uuid>,
    pub frame: String,
}

impl Outbound {
    /// Whether `conn_id` should forward this frame to its socket.
    pub fn is_for(&self, conn_id: Uuid) -> bool {
        self.origin != Some(conn_id)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Subscribed connection and the name it joined under, if any.
#[derive(Debug, Clone, Default)]
struct Peer {
    username: Option<String>,
}

/// The broadcast group of a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Outbound>>,
    peers: RwLock<HashMap<Uuid, Peer>>,
    capacity: usize,
    max_peers: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver; at most `max_peers`
    /// connections may subscribe.
    pub fn new(capacity: usize, max_peers: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            max_peers,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Subscribe a connection. `None` if the room is full.
    ///
    /// Subscribing an already present connection hands out a fresh
    /// receiver and keeps its username.
    pub async fn add_peer(&self, conn_id: Uuid) -> Option<broadcast::Receiver<Arc<Outbound>>> {
        let mut peers = self.peers.write().await;
        if !peers.contains_key(&conn_id) && peers.len() >= self.max_peers {
            log::warn!("Room full ({} peers), refusing {conn_id}", peers.len());
            return None;
        }
        peers.entry(conn_id).or_default();
        Some(self.sender.subscribe())
    }

    /// Unsubscribe a connection. Returns `true` if its username was on the
    /// roster (so the roster changed).
    pub async fn remove_peer(&self, conn_id: &Uuid) -> bool {
        let mut peers = self.peers.write().await;
        matches!(peers.remove(conn_id), Some(Peer { username: Some(_) }))
    }

    /// Set or clear the username of a subscribed connection.
    ///
    /// Returns `true` if the roster changed.
    pub async fn set_username(&self, conn_id: &Uuid, username: Option<String>) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(conn_id) {
            Some(peer) if peer.username != username => {
                peer.username = username;
                true
            }
            _ => false,
        }
    }

    /// Usernames of joined connections, sorted.
    pub async fn roster(&self) -> Vec<String> {
        let peers = self.peers.read().await;
        let mut names: Vec<String> = peers.values().filter_map(|p| p.username.clone()).collect();
        names.sort();
        names
    }

    /// Encode `frame` once and send it to every subscriber.
    ///
    /// Returns the number of receivers (including the origin's own).
    pub fn broadcast(&self, origin: Option<Uuid>, frame: &ServerFrame) -> Result<usize, ProtocolError> {
        let frame = frame.encode()?;
        Ok(self.broadcast_raw(Arc::new(Outbound { origin, frame })))
    }

    /// Send a pre-encoded frame.
    pub fn broadcast_raw(&self, outbound: Arc<Outbound>) -> usize {
        let count = self.sender.send(outbound).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Subscribed connections, named or not.
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Whether `conn_id` is subscribed here.
    pub async fn has_peer(&self, conn_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(conn_id)
    }

    /// Snapshot of the send, drop and peer counters.
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    /// Frames a receiver may fall behind before it lags.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Document id → broadcast group.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    capacity: usize,
    max_peers: usize,
}

impl RoomManager {
    /// Rooms are created with this channel capacity and peer limit.
    pub fn new(capacity: usize, max_peers: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            max_peers,
        }
    }

    /// Subscribe `conn_id` to the room for `doc_id`, creating the room if
    /// needed. `None` if the room is full.
    ///
    /// Lookup and subscribe happen under the map's write lock, so a room
    /// can never be dropped as empty between the two.
    pub async fn join(
        &self,
        doc_id: &str,
        conn_id: Uuid,
    ) -> Option<(Arc<BroadcastGroup>, broadcast::Receiver<Arc<Outbound>>)> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(doc_id.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.capacity, self.max_peers)))
            .clone();

        match room.add_peer(conn_id).await {
            Some(rx) => Some((room, rx)),
            None => {
                if room.peer_count().await == 0 {
                    rooms.remove(doc_id);
                }
                None
            }
        }
    }

    /// Unsubscribe `conn_id` from `room` and drop the room once empty.
    ///
    /// Returns `true` if the roster changed.
    pub async fn leave(&self, doc_id: &str, room: &Arc<BroadcastGroup>, conn_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let changed = room.remove_peer(conn_id).await;
        let current = rooms.get(doc_id).is_some_and(|r| Arc::ptr_eq(r, room));
        if current && room.peer_count().await == 0 {
            rooms.remove(doc_id);
            log::debug!("Room {doc_id} removed (empty)");
        }
        changed
    }

    /// Room for `doc_id`, if anyone is subscribed.
    pub async fn get(&self, doc_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    /// Documents with at least one subscriber.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Ids of documents with a live room.
    pub async fn active_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
