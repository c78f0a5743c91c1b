//! # codepair-collab — Real-time collaboration relay for pair-programming sessions
//!
//! A WebSocket relay that keeps a shared CRDT document and per-client presence
//! in sync between everyone connected to the same room.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌──────────────────────────────┐
//! │ Browser /   │ ◄─────────────────► │ SyncServer                   │
//! │ SyncClient  │  y-websocket frames │  gateway ─► registry ─► Room │
//! └─────────────┘                     └──────────────┬───────────────┘
//!                                                    │
//!                                     ┌──────────────┼──────────────┐
//!                                     ▼              ▼              ▼
//!                               CrdtBackend   AwarenessTable   broadcast
//!                               (Yrs doc)     (presence)       (fan-out)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — y-websocket frames on top of `yrs::sync`
//! - [`backend`] — CRDT engine seam and the Yrs implementation
//! - [`awareness`] — Presence table with monotonic clocks
//! - [`room`] — Document, presence and peers of one room
//! - [`registry`] — Room lookup, creation and eviction
//! - [`gateway`] — Path routing before the WebSocket upgrade
//! - [`handler`] — Per-connection sync state machine
//! - [`server`] — Accept loop and statistics
//! - [`client`] — Reference client with offline queue

pub mod awareness;
pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use awareness::{AwarenessChange, AwarenessState, AwarenessTable, ChangeCause, ClientId};
pub use backend::{yrs_factory, BackendFactory, CrdtBackend, YrsBackend};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use config::{ConfigError, ServerConfig};
pub use error::{BackendError, CollabError, ProtocolError, Result, RoutingError};
pub use protocol::{AwarenessUpdate, AwarenessUpdateEntry, Message, SyncMessage};
pub use registry::RoomRegistry;
pub use room::{Departure, PeerId, Room, RoomStats};
pub use server::{ServerStats, SyncServer};
