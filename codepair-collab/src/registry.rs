//! Room registry: maps room names to live rooms.
//!
//! Rooms are created lazily on first join and evicted after they have been
//! empty for the configured grace period. Eviction and join race on the
//! room's `closed` flag: eviction closes the room only if it is still empty,
//! and a join that finds the room closed resolves the name again and gets a
//! fresh room.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};

use crate::backend::BackendFactory;
use crate::config::ServerConfig;
use crate::error::{CollabError, Result};
use crate::room::{PeerId, PeerMeta, Room, RoomFrame};

pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    factory: BackendFactory,
    max_rooms: usize,
    max_peers_per_room: usize,
    capacity: usize,
    eviction_grace: Duration,
}

impl RoomRegistry {
    pub fn new(config: &ServerConfig, factory: BackendFactory) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            factory,
            max_rooms: config.max_rooms,
            max_peers_per_room: config.max_peers_per_room,
            capacity: config.broadcast_capacity,
            eviction_grace: config.eviction_grace(),
        }
    }

    /// Get or create the room for `name`.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<Room>> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return Ok(room.clone());
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(name) {
            return Ok(room.clone());
        }
        if rooms.len() >= self.max_rooms {
            return Err(CollabError::ResourceExhausted {
                resource: "rooms",
                limit: self.max_rooms,
            });
        }

        let room = Arc::new(Room::new(
            name,
            (self.factory)(),
            self.capacity,
            self.max_peers_per_room,
        ));
        rooms.insert(name.to_string(), room.clone());
        log::info!("Room {name:?} created ({} live)", rooms.len());
        Ok(room)
    }

    /// Resolve `name` and attach a peer, retrying if the room it found was
    /// evicted before the join landed.
    pub async fn join(
        &self,
        name: &str,
        peer_id: PeerId,
        meta: PeerMeta,
    ) -> Result<(Arc<Room>, broadcast::Receiver<RoomFrame>)> {
        loop {
            let room = self.get_or_create(name).await?;
            if let Some(rx) = room.join(peer_id, meta.clone()).await? {
                return Ok((room, rx));
            }
            log::debug!("Room {name:?} closed during join, retrying");
        }
    }

    /// Existing room, without creating one.
    pub async fn room(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Schedule eviction of `name` if it has no peers left.
    pub async fn release_if_empty(self: &Arc<Self>, name: &str) {
        let Some(room) = self.room(name).await else {
            return;
        };
        if room.peer_count().await > 0 {
            return;
        }

        if self.eviction_grace.is_zero() {
            self.evict(name, &room).await;
            return;
        }

        let registry = Arc::clone(self);
        let target = Arc::clone(&room);
        let owned = name.to_string();
        let grace = self.eviction_grace;
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.evict(&owned, &target).await;
        });
        room.set_eviction(task.abort_handle()).await;
        log::debug!("Room {name:?} empty, evicting in {grace:?}");
    }

    /// Remove `room` if it is still the one registered under `name` and is
    /// still empty.
    async fn evict(&self, name: &str, room: &Arc<Room>) -> bool {
        let mut rooms = self.rooms.write().await;
        match rooms.get(name) {
            Some(current) if Arc::ptr_eq(current, room) => {}
            _ => return false,
        }
        if !room.try_close().await {
            return false;
        }
        rooms.remove(name);
        log::info!("Room {name:?} evicted ({} live)", rooms.len());
        true
    }

    /// Get the number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Get all live room names.
    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Drop every room and cancel pending evictions.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Room>> = self.rooms.write().await.drain().map(|(_, r)| r).collect();
        for room in drained {
            room.cancel_eviction().await;
            room.try_close().await;
        }
    }
}
