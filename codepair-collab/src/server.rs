//! WebSocket sync server with path-based room routing.
//!
//! Architecture:
//! ```text
//! TCP accept ──► gateway (peek request line, route) ──► registry.join
//!                    │ no match: drop, no response          │
//!                    ▼                                      ▼
//!                  closed                          WebSocket upgrade
//!                                                           │
//!                                                           ▼
//!                                   PeerConnection (one task per peer)
//!                                                           │
//!                                                           ▼
//!                                    room.leave ──► registry.release_if_empty
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::backend::{yrs_factory, BackendFactory};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::gateway;
use crate::handler::PeerConnection;
use crate::registry::RoomRegistry;
use crate::room::PeerMeta;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// Lock-free counters shared with connection tasks.
#[derive(Debug, Default)]
pub struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

impl AtomicServerStats {
    pub fn record_message(&self, bytes: usize) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Shared by every connection task.
struct Context {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<AtomicServerStats>,
}

/// The sync server.
pub struct SyncServer {
    listener: TcpListener,
    ctx: Arc<Context>,
}

impl SyncServer {
    /// Validate `config` and bind its address, with Yrs documents.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        Self::bind_with_backend(config, yrs_factory()).await
    }

    /// Like [`bind`](Self::bind) with a custom document engine.
    pub async fn bind_with_backend(config: ServerConfig, factory: BackendFactory) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let registry = Arc::new(RoomRegistry::new(&config, factory));
        Ok(Self {
            listener,
            ctx: Arc::new(Context {
                config,
                registry,
                stats: Arc::new(AtomicServerStats::default()),
            }),
        })
    }

    /// The bound address (resolves port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    /// Get the room registry.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.ctx.registry
    }

    /// Accept connections forever.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` completes, then close every
    /// connection and drop every room.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        log::info!(
            "Sync server listening on {} (prefix {:?})",
            self.local_addr()?,
            self.ctx.config.normalized_prefix()
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            log::debug!("New TCP connection from {addr}");
                            let ctx = self.ctx.clone();
                            connections.spawn(handle_connection(stream, addr, ctx));
                        }
                        // Per-connection failures (e.g. EMFILE) must not stop the server.
                        Err(e) => log::error!("Accept failed: {e}"),
                    }
                }

                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        log::info!("Shutting down, closing {} connections", connections.len());
        connections.shutdown().await;
        self.ctx.registry.shutdown().await;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let s = &self.ctx.stats;
        ServerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            rejected_connections: s.rejected_connections.load(Ordering::Relaxed),
            total_messages: s.total_messages.load(Ordering::Relaxed),
            total_bytes: s.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.ctx.registry.room_count().await,
        }
    }
}

/// Route, upgrade and serve one inbound connection.
async fn handle_connection(stream: TcpStream, addr: SocketAddr, ctx: Arc<Context>) {
    let config = &ctx.config;

    let routed = match gateway::read_request_target(&stream, config.request_head_timeout()).await {
        Ok(target) => gateway::route(&target, config.normalized_prefix(), config.max_room_name_len),
        Err(e) => Err(e),
    };
    let room_name = match routed {
        Ok(name) => name,
        Err(e) => {
            log::warn!("Rejecting connection from {addr}: {e}");
            ctx.stats.record_rejected();
            return;
        }
    };

    let peer_id = Uuid::new_v4();
    let (room, frames) = match ctx
        .registry
        .join(&room_name, peer_id, PeerMeta::new(Some(addr)))
        .await
    {
        Ok(joined) => joined,
        Err(e) => {
            log::warn!("Refusing {addr} for room {room_name:?}: {e}");
            ctx.stats.record_rejected();
            return;
        }
    };

    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("WebSocket upgrade from {addr} failed: {e}");
            ctx.stats.record_rejected();
            room.leave(peer_id, &[], crate::room::Departure::Graceful).await;
            ctx.registry.release_if_empty(&room_name).await;
            return;
        }
    };

    ctx.stats.connection_opened();
    log::info!("Peer {peer_id} from {addr} joined room {room_name:?}");

    let conn = PeerConnection::new(peer_id, room, frames, config, ctx.stats.clone());
    conn.run(ws).await;

    ctx.stats.connection_closed();
    ctx.registry.release_if_empty(&room_name).await;
}
