//! WebSocket sync client for connecting to the collaboration relay.
//!
//! Provides:
//! - Connection lifecycle (connect, leave)
//! - Update send/receive with automatic Yrs integration
//! - Awareness (presence) updates with a local clock
//! - Offline queue for edits made while disconnected
//!
//! The client owns a Yrs document and speaks the same frames as browser
//! providers: it sends its state vector on connect, answers the server's
//! `Step1` with a diff, and integrates every update it receives.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, Transact, TransactionMut};

use crate::awareness::ClientId;
use crate::backend::{CrdtBackend, YrsBackend};
use crate::error::{CollabError, ProtocolError, Result};
use crate::protocol::{self, AwarenessUpdate, Message as YMessage, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Initial state received from the server
    Synced,
    /// A remote update was integrated into the local document
    RemoteUpdate(Vec<u8>),
    /// Presence entries from other clients (a `null` state means left)
    Awareness(AwarenessUpdate),
    /// Connection lost
    Disconnected,
}

/// Offline queue for edits made while disconnected.
///
/// Queued updates are replayed on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<QueuedUpdate>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    seq: u64,
    payload: Vec<u8>,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, seq: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedUpdate { seq, payload });
        true
    }

    /// Drain all queued updates in submission order.
    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|u| (u.seq, u.payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|u| u.payload.len()).sum()
    }
}

/// This client's own presence.
#[derive(Debug, Default)]
struct LocalPresence {
    clock: u32,
    state: Option<String>,
}

/// Random id below 2^53 so browser peers can represent it exactly.
fn new_client_id() -> ClientId {
    Uuid::new_v4().as_u64_pair().0 & ((1 << 53) - 1)
}

const EVENT_CAPACITY: usize = 256;
const OFFLINE_QUEUE_CAPACITY: usize = 10_000;

/// The sync client.
pub struct SyncClient {
    doc: Doc,
    client_id: ClientId,
    room: String,
    /// Server endpoint including the path prefix, e.g. `ws://host:3001/collab`
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    presence: Arc<Mutex<LocalPresence>>,
    /// Local updates submitted so far
    seq: Arc<Mutex<u64>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>, room: impl Into<String>) -> Self {
        Self::with_doc(server_url, room, Doc::new())
    }

    /// Client around an existing document.
    pub fn with_doc(server_url: impl Into<String>, room: impl Into<String>, doc: Doc) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            doc,
            client_id: new_client_id(),
            room: room.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            presence: Arc::new(Mutex::new(LocalPresence::default())),
            seq: Arc::new(Mutex::new(0)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(OFFLINE_QUEUE_CAPACITY))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Full room URL.
    pub fn url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.room)
    }

    /// Connect and start the sync handshake.
    ///
    /// Spawns background tasks for reading and writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<()> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws, _) = match tokio_tungstenite::connect_async(self.url()).await {
            Ok(ok) => ok,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let mut replica = YrsBackend::from_doc(self.doc.clone());
        send(&out_tx, protocol::step1(&replica.encode_state_vector())).await?;

        {
            let presence = self.presence.lock().await;
            if let Some(state) = &presence.state {
                let update = protocol::presence(self.client_id(), presence.clock, Some(state.as_str()));
                send(&out_tx, protocol::awareness(update)).await?;
            }
        }

        // Replay offline queue
        {
            let queued = self.offline_queue.lock().await.drain();
            if !queued.is_empty() {
                log::info!("Replaying {} queued updates", queued.len());
                for (_, payload) in queued {
                    send(&out_tx, protocol::update(payload)).await?;
                }
            }
        }

        self.outgoing_tx = Some(out_tx.clone());
        *self.state.write().await = ConnectionState::Connected;
        emit(&self.event_tx, SyncEvent::Connected);

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut synced = false;
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match protocol::decode(&data) {
                        Ok(frame) => {
                            let event = handle_frame(&mut replica, frame, &out_tx, &mut synced).await;
                            if let Some(event) = event {
                                emit(&event_tx, event);
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            emit(&event_tx, SyncEvent::Disconnected);
        });

        Ok(())
    }

    /// Send an update produced by a local edit.
    ///
    /// If disconnected, queues the update for later replay.
    pub async fn send_update(&self, update: Vec<u8>) -> Result<()> {
        let seq = {
            let mut seq = self.seq.lock().await;
            *seq += 1;
            *seq
        };

        if *self.state.read().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(seq, update) {
                return Err(ProtocolError::ConnectionClosed.into());
            }
            return Ok(());
        }

        self.send_frame(protocol::update(update)).await
    }

    /// Run `f` in a local transaction and send the resulting update.
    pub async fn edit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut TransactionMut<'_>),
    {
        let update = {
            let before = self.doc.transact().state_vector();
            {
                let mut txn = self.doc.transact_mut();
                f(&mut txn);
            }
            self.doc.transact().encode_diff_v1(&before)
        };
        self.send_update(update).await
    }

    /// Publish this client's presence. Sent on the next connect when offline.
    pub async fn set_awareness<T: Serialize>(&self, state: &T) -> Result<()> {
        let json = serde_json::to_string(state)?;
        let update = {
            let mut presence = self.presence.lock().await;
            presence.clock += 1;
            let update = protocol::presence(self.client_id(), presence.clock, Some(json.as_str()));
            presence.state = Some(json);
            update
        };

        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send_frame(protocol::awareness(update)).await
    }

    /// Announce departure with an explicit null presence, then close.
    pub async fn leave(&mut self) -> Result<()> {
        let update = {
            let mut presence = self.presence.lock().await;
            presence.clock += 1;
            presence.state = None;
            protocol::presence(self.client_id(), presence.clock, None)
        };

        if let Some(tx) = self.outgoing_tx.take() {
            if *self.state.read().await == ConnectionState::Connected {
                send(&tx, protocol::awareness(update)).await?;
            }
            // Writer may already be gone.
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// The local replica.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Awareness client id.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Current contents of the root text `name`.
    pub fn text(&self, name: &str) -> String {
        let txn = self.doc.transact();
        txn.get_text(name)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Current awareness clock.
    pub async fn awareness_clock(&self) -> u32 {
        self.presence.lock().await.clock
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    async fn send_frame(&self, bytes: Vec<u8>) -> Result<()> {
        match &self.outgoing_tx {
            Some(tx) => send(tx, bytes).await,
            None => Err(ProtocolError::ConnectionClosed.into()),
        }
    }
}

async fn handle_frame(
    replica: &mut YrsBackend,
    frame: YMessage,
    out_tx: &mpsc::Sender<Message>,
    synced: &mut bool,
) -> Option<SyncEvent> {
    match frame {
        YMessage::Sync(SyncMessage::SyncStep1(sv)) => {
            match replica.encode_state_as_update(Some(&sv.encode_v1())) {
                Ok(diff) => {
                    if let Err(e) = send(out_tx, protocol::step2(diff)).await {
                        log::warn!("Failed to answer server state vector: {e}");
                    }
                }
                Err(e) => log::warn!("Unusable state vector from server: {e}"),
            }
            None
        }
        YMessage::Sync(SyncMessage::SyncStep2(update)) => {
            let changed = apply_remote(replica, &update);
            if !*synced {
                *synced = true;
                return Some(SyncEvent::Synced);
            }
            changed.then_some(SyncEvent::RemoteUpdate(update))
        }
        YMessage::Sync(SyncMessage::Update(update)) => {
            apply_remote(replica, &update).then_some(SyncEvent::RemoteUpdate(update))
        }
        YMessage::Awareness(update) => Some(SyncEvent::Awareness(update)),
        YMessage::Auth(_) | YMessage::AwarenessQuery | YMessage::Custom(..) => None,
    }
}

fn apply_remote(replica: &mut YrsBackend, update: &[u8]) -> bool {
    replica.apply_update(update).unwrap_or_else(|e| {
        log::warn!("Dropping update from server: {e}");
        false
    })
}

async fn send(tx: &mpsc::Sender<Message>, bytes: Vec<u8>) -> Result<()> {
    tx.send(Message::Binary(bytes.into()))
        .await
        .map_err(|_| CollabError::from(ProtocolError::ConnectionClosed))
}

fn emit(tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if let Err(e) = tx.try_send(event) {
        log::debug!("Sync event dropped: {e}");
    }
}
