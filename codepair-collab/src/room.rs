//! A room: one document replica, one awareness table, the peers attached
//! to them, and the broadcast channel that fans frames out to those peers.
//!
//! ```text
//! Peer A ──┐                    ┌── doc (single writer) ──┐
//!          ├── Room "interview" ┤                         ├── broadcast ──► A, B, C
//! Peer B ──┘                    └── awareness ────────────┘   (origin skipped
//!                                                              by receivers)
//! ```
//!
//! Updates are applied and published while the document lock is held, so
//! every receiver sees frames in the order the room accepted them. Sending
//! never waits on a slow peer: each receiver buffers up to `capacity` frames
//! and a peer that falls further behind is resynced by its handler.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, Mutex};
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::awareness::{AwarenessChange, AwarenessState, AwarenessSubscription, AwarenessTable, ClientId};
use crate::backend::CrdtBackend;
use crate::error::{BackendError, CollabError, Result};
use crate::protocol::{self, AwarenessUpdate};

/// Unique per connection.
pub type PeerId = Uuid;

/// Opaque room identifier taken from the request path.
pub type RoomName = String;

/// A pre-encoded frame on the room's broadcast channel.
#[derive(Debug, Clone)]
pub struct RoomFrame {
    /// Peer whose input produced this frame; it is not sent back there
    pub origin: Option<PeerId>,
    pub bytes: Arc<Vec<u8>>,
}

impl RoomFrame {
    pub fn is_from(&self, peer_id: PeerId) -> bool {
        self.origin == Some(peer_id)
    }
}

/// Bookkeeping for a connected peer.
#[derive(Debug, Clone)]
pub struct PeerMeta {
    pub addr: Option<SocketAddr>,
    pub joined_at: Instant,
}

impl PeerMeta {
    pub fn new(addr: Option<SocketAddr>) -> Self {
        Self { addr, joined_at: Instant::now() }
    }
}

/// How a peer left the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// Close frame, end of stream, transport or protocol error: the peer's
    /// awareness entries are cleared with an explicit leave broadcast.
    Graceful,
    /// Heartbeat expired: entries are removed silently and remote clients
    /// reclaim them through their own timeout.
    Lost,
}

/// Statistics for monitoring room health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub frames_published: u64,
    pub frames_lagged: u64,
    pub updates_applied: u64,
    pub updates_rejected: u64,
    pub active_peers: usize,
}

/// Lock-free counters; read via [`Room::stats`].
#[derive(Default)]
struct AtomicRoomStats {
    frames_published: AtomicU64,
    frames_lagged: AtomicU64,
    updates_applied: AtomicU64,
    updates_rejected: AtomicU64,
}

struct Members {
    peers: HashMap<PeerId, PeerMeta>,
    /// Set once by eviction; a closed room accepts no joins.
    closed: bool,
}

pub struct Room {
    name: RoomName,
    doc: Mutex<Box<dyn CrdtBackend>>,
    awareness: Mutex<AwarenessTable>,
    members: Mutex<Members>,
    sender: broadcast::Sender<RoomFrame>,
    max_peers: usize,
    eviction: Mutex<Option<AbortHandle>>,
    stats: AtomicRoomStats,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("max_peers", &self.max_peers)
            .finish_non_exhaustive()
    }
}

impl Room {
    pub fn new(
        name: impl Into<RoomName>,
        backend: Box<dyn CrdtBackend>,
        capacity: usize,
        max_peers: usize,
    ) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name: name.into(),
            doc: Mutex::new(backend),
            awareness: Mutex::new(AwarenessTable::new()),
            members: Mutex::new(Members { peers: HashMap::new(), closed: false }),
            sender,
            max_peers,
            eviction: Mutex::new(None),
            stats: AtomicRoomStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a peer and subscribe it to the room's frames.
    ///
    /// Returns `Ok(None)` if the room was closed by eviction in the
    /// meantime; the caller should resolve the name again.
    pub async fn join(
        &self,
        peer_id: PeerId,
        meta: PeerMeta,
    ) -> Result<Option<broadcast::Receiver<RoomFrame>>> {
        let rx = {
            let mut members = self.members.lock().await;
            if members.closed {
                return Ok(None);
            }
            if members.peers.len() >= self.max_peers && !members.peers.contains_key(&peer_id) {
                return Err(CollabError::ResourceExhausted {
                    resource: "peers per room",
                    limit: self.max_peers,
                });
            }
            members.peers.insert(peer_id, meta);
            self.sender.subscribe()
        };
        self.cancel_eviction().await;
        Ok(Some(rx))
    }

    /// Detach a peer and clear the awareness clients it announced.
    ///
    /// Returns the number of peers still in the room.
    pub async fn leave(
        &self,
        peer_id: PeerId,
        client_ids: &[ClientId],
        departure: Departure,
    ) -> usize {
        let remaining = {
            let mut members = self.members.lock().await;
            if let Some(meta) = members.peers.remove(&peer_id) {
                log::debug!(
                    "Peer {peer_id} ({}) left room {:?} after {:?}",
                    meta.addr.map_or_else(|| "local".to_string(), |addr| addr.to_string()),
                    self.name,
                    meta.joined_at.elapsed()
                );
            }
            members.peers.len()
        };

        if !client_ids.is_empty() {
            let mut awareness = self.awareness.lock().await;
            match departure {
                Departure::Graceful => {
                    let change = awareness.leave(client_ids, Some(peer_id));
                    if !change.is_empty() {
                        let update = awareness.encode_update(&change.removed);
                        self.publish(Some(peer_id), protocol::awareness(update));
                    }
                }
                Departure::Lost => {
                    awareness.remove(client_ids, Some(peer_id));
                }
            }
        }

        remaining
    }

    /// Apply a peer's document update and relay it to everyone else.
    ///
    /// Returns whether the document changed. Rejected payloads leave the
    /// document untouched and are not relayed.
    pub async fn apply_update(
        &self,
        origin: Option<PeerId>,
        update: &[u8],
    ) -> std::result::Result<bool, BackendError> {
        let mut doc = self.doc.lock().await;
        match doc.apply_update(update) {
            Ok(true) => {
                self.stats.updates_applied.fetch_add(1, Ordering::Relaxed);
                self.publish(origin, protocol::update(update.to_vec()));
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                self.stats.updates_rejected.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Apply a peer's awareness update and relay the accepted entries.
    ///
    /// Stale entries are dropped; a batch with nothing accepted produces no
    /// frame at all.
    pub async fn apply_awareness(
        &self,
        origin: Option<PeerId>,
        update: &AwarenessUpdate,
    ) -> AwarenessChange {
        let mut awareness = self.awareness.lock().await;
        let change = awareness.apply_update(update, origin);
        if !change.is_empty() {
            let relay = awareness.encode_update(&change.changed_ids());
            self.publish(origin, protocol::awareness(relay));
        }
        change
    }

    pub async fn state_vector(&self) -> Vec<u8> {
        self.doc.lock().await.encode_state_vector()
    }

    /// Everything a replica with state vector `sv` is missing.
    pub async fn diff_since(&self, sv: &[u8]) -> std::result::Result<Vec<u8>, BackendError> {
        self.doc.lock().await.encode_state_as_update(Some(sv))
    }

    pub async fn full_state(&self) -> std::result::Result<Vec<u8>, BackendError> {
        self.doc.lock().await.encode_state_as_update(None)
    }

    /// Encoded awareness frame with every live entry, if there are any.
    pub async fn awareness_frame(&self) -> Option<Vec<u8>> {
        let awareness = self.awareness.lock().await;
        if awareness.is_empty() {
            return None;
        }
        Some(protocol::awareness(awareness.encode_full()))
    }

    pub async fn awareness_snapshot(&self) -> BTreeMap<ClientId, AwarenessState> {
        self.awareness.lock().await.snapshot()
    }

    /// Number of live awareness clients ("participants").
    pub async fn participant_count(&self) -> usize {
        self.awareness.lock().await.len()
    }

    pub async fn subscribe_awareness(&self) -> AwarenessSubscription {
        self.awareness.lock().await.subscribe()
    }

    pub async fn peer_count(&self) -> usize {
        self.members.lock().await.peers.len()
    }

    pub async fn has_peer(&self, peer_id: &PeerId) -> bool {
        self.members.lock().await.peers.contains_key(peer_id)
    }

    /// Close the room if it has no peers. Returns `true` if the room is now
    /// closed. Used by the registry under its write lock.
    pub async fn try_close(&self) -> bool {
        let mut members = self.members.lock().await;
        if members.peers.is_empty() {
            members.closed = true;
        }
        members.closed
    }

    pub async fn is_closed(&self) -> bool {
        self.members.lock().await.closed
    }

    /// Install a pending eviction, aborting any earlier one.
    pub async fn set_eviction(&self, handle: AbortHandle) {
        if let Some(previous) = self.eviction.lock().await.replace(handle) {
            previous.abort();
        }
    }

    pub async fn cancel_eviction(&self) {
        if let Some(pending) = self.eviction.lock().await.take() {
            pending.abort();
            log::debug!("Eviction of room {:?} cancelled", self.name);
        }
    }

    /// Note frames a receiver missed.
    pub fn record_lag(&self, missed: u64) {
        self.stats.frames_lagged.fetch_add(missed, Ordering::Relaxed);
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            frames_published: self.stats.frames_published.load(Ordering::Relaxed),
            frames_lagged: self.stats.frames_lagged.load(Ordering::Relaxed),
            updates_applied: self.stats.updates_applied.load(Ordering::Relaxed),
            updates_rejected: self.stats.updates_rejected.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    fn publish(&self, origin: Option<PeerId>, bytes: Vec<u8>) {
        // Err only means nobody is subscribed right now.
        let _ = self.sender.send(RoomFrame { origin, bytes: Arc::new(bytes) });
        self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
    }
}
