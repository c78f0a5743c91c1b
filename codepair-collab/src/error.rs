//! Error taxonomy for the collaboration relay.
//!
//! Each variant maps to a blast radius: routing errors drop a raw TCP
//! stream, protocol errors end one connection, backend errors drop one
//! update, exhaustion refuses an upgrade. Nothing here is fatal to the
//! process.

use thiserror::Error;

/// Inbound request could not be mapped to a room.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("path {path:?} does not start with prefix {prefix:?}")]
    PrefixMismatch { path: String, prefix: String },
    #[error("room name is {len} bytes, limit is {max}")]
    RoomNameTooLong { len: usize, max: usize },
    #[error("room name contains control characters")]
    InvalidRoomName,
    #[error("malformed request head: {0}")]
    MalformedRequest(String),
    #[error("timed out waiting for request head")]
    HeadTimeout,
}

/// A peer violated the sync protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("unexpected text frame")]
    UnexpectedText,
    #[error("handshake not completed within {0} ms")]
    HandshakeTimeout(u64),
    #[error("connection closed")]
    ConnectionClosed,
}

/// The CRDT backend rejected a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("failed to decode update: {0}")]
    DecodeUpdate(String),
    #[error("failed to decode state vector: {0}")]
    DecodeStateVector(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("resource exhausted: {resource} limit {limit} reached")]
    ResourceExhausted { resource: &'static str, limit: usize },
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("invalid awareness state: {0}")]
    Json(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<yrs::encoding::read::Error> for ProtocolError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

impl From<yrs::encoding::read::Error> for CollabError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        Self::Protocol(e.into())
    }
}

pub type Result<T> = std::result::Result<T, CollabError>;
