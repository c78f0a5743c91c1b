//! y-websocket framing, built on `yrs::sync`.
//!
//! Browser providers and the relay exchange [`Message`]s encoded with the
//! lib0 v1 encoding:
//! ```text
//! ┌──────────┬──────────────────────────────────────────────┐
//! │ msg_type │ body                                         │
//! ├──────────┼──────────────────────────────────────────────┤
//! │ 0 sync   │ step (0|1|2) ‖ var-bytes payload             │
//! │ 1 aware  │ var-bytes awareness update                   │
//! │ 2 auth   │ permission flag ‖ reason, ignored            │
//! │ 3 query  │ (empty), ask for the full awareness state    │
//! └──────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Document updates stay opaque byte blobs. Awareness states are carried as
//! JSON strings where the literal `null` marks a client that left.

use std::collections::HashMap;
use std::sync::Arc;

use yrs::encoding::write::Write;
use yrs::sync::protocol::{MSG_SYNC, MSG_SYNC_STEP_1};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;

pub use yrs::sync::awareness::{AwarenessUpdate, AwarenessUpdateEntry};
pub use yrs::sync::{Message, SyncMessage};

use crate::awareness::ClientId;
use crate::error::ProtocolError;

/// Awareness state of a client that left.
pub const NULL_STATE: &str = "null";

/// Decode one frame. Trailing bytes are ignored, as browser providers do.
///
/// Tags outside the y-websocket set are rejected rather than relayed.
pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    match Message::decode_v1(bytes)? {
        Message::Custom(tag, _) => Err(ProtocolError::UnknownMessageType(tag)),
        message => Ok(message),
    }
}

pub fn encode(message: &Message) -> Vec<u8> {
    message.encode_v1()
}

/// `Sync/Step1` around an already encoded state vector.
pub fn step1(state_vector: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(state_vector.len() + 6);
    buf.write_var(MSG_SYNC);
    buf.write_var(MSG_SYNC_STEP_1);
    buf.write_buf(state_vector);
    buf
}

pub fn step2(update: Vec<u8>) -> Vec<u8> {
    encode(&Message::Sync(SyncMessage::SyncStep2(update)))
}

pub fn update(update: Vec<u8>) -> Vec<u8> {
    encode(&Message::Sync(SyncMessage::Update(update)))
}

pub fn awareness(update: AwarenessUpdate) -> Vec<u8> {
    encode(&Message::Awareness(update))
}

/// Wire entry; `None` encodes an explicit leave.
pub fn entry(clock: u32, state: Option<&str>) -> AwarenessUpdateEntry {
    AwarenessUpdateEntry {
        clock,
        json: Arc::from(state.unwrap_or(NULL_STATE)),
    }
}

/// The entry's state, or `None` for a leave.
pub fn entry_state(entry: &AwarenessUpdateEntry) -> Option<&str> {
    let json: &str = &entry.json;
    (json != NULL_STATE).then_some(json)
}

/// An awareness update carrying a single client.
pub fn presence(client_id: ClientId, clock: u32, state: Option<&str>) -> AwarenessUpdate {
    AwarenessUpdate {
        clients: HashMap::from([(client_id, entry(clock, state))]),
    }
}

/// Client ids in an update, ascending.
pub fn client_ids(update: &AwarenessUpdate) -> Vec<ClientId> {
    let mut ids: Vec<ClientId> = update.clients.keys().copied().collect();
    ids.sort_unstable();
    ids
}
