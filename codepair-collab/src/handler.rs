//! Per-connection sync protocol handler.
//!
//! ```text
//!   connect ──► Handshake ──(peer Step1)──► Synced ──► Closed
//!                   │                                    ▲
//!                   └──(no Step1 before deadline)────────┘
//! ```
//!
//! On connect the server speaks first: `Step1` with its state vector, then
//! the current awareness state. Updates and awareness from the peer are
//! accepted in either phase; only the peer's `Step1` moves it to `Synced`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use yrs::updates::encoder::Encode;

use crate::awareness::ClientId;
use crate::config::ServerConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::{self, AwarenessUpdate, Message as YMessage, SyncMessage};
use crate::room::{Departure, PeerId, Room, RoomFrame};
use crate::server::AtomicServerStats;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    Synced,
    Closed,
}

/// State of one peer's connection task.
pub struct PeerConnection {
    id: PeerId,
    room: Arc<Room>,
    frames: broadcast::Receiver<RoomFrame>,
    phase: Phase,
    /// Awareness clients this peer announced
    client_ids: HashSet<ClientId>,
    last_activity: Instant,
    handshake_timeout: Duration,
    heartbeat_interval: Duration,
    stats: Arc<AtomicServerStats>,
}

impl PeerConnection {
    pub fn new(
        id: PeerId,
        room: Arc<Room>,
        frames: broadcast::Receiver<RoomFrame>,
        config: &ServerConfig,
        stats: Arc<AtomicServerStats>,
    ) -> Self {
        Self {
            id,
            room,
            frames,
            phase: Phase::Handshake,
            client_ids: HashSet::new(),
            last_activity: Instant::now(),
            handshake_timeout: config.handshake_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            stats,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Serve the connection until it closes, then detach from the room.
    pub async fn run<S>(mut self, ws: WebSocketStream<S>) -> Departure
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();

        let departure = match self.drive(&mut sink, &mut stream).await {
            Ok(departure) => departure,
            Err(e) => {
                log::warn!("Peer {} in room {:?}: {e}", self.id, self.room.name());
                Departure::Graceful
            }
        };
        self.phase = Phase::Closed;

        let ids: Vec<ClientId> = self.client_ids.iter().copied().collect();
        let remaining = self.room.leave(self.id, &ids, departure).await;
        log::info!(
            "Peer {} left room {:?} ({departure:?}, {remaining} remaining)",
            self.id,
            self.room.name()
        );

        if departure == Departure::Graceful {
            if let Err(e) = sink.send(Message::Close(None)).await {
                log::debug!("Close to peer {} not delivered: {e}", self.id);
            }
        }
        departure
    }

    async fn drive<Tx, Rx>(&mut self, sink: &mut Tx, stream: &mut Rx) -> Result<Departure>
    where
        Tx: Sink<Message, Error = WsError> + Unpin,
        Rx: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
    {
        self.greet(sink).await?;

        let handshake = tokio::time::sleep(self.handshake_timeout);
        tokio::pin!(handshake);

        let start = tokio::time::Instant::now() + self.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(start, self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut handshake, if self.phase == Phase::Handshake => {
                    let ms = self.handshake_timeout.as_millis() as u64;
                    return Err(ProtocolError::HandshakeTimeout(ms).into());
                }

                _ = heartbeat.tick() => {
                    if self.last_activity.elapsed() >= self.heartbeat_interval * 2 {
                        log::warn!("Peer {} silent for two heartbeats, dropping", self.id);
                        return Ok(Departure::Lost);
                    }
                    sink.send(Message::Ping(Vec::new().into())).await?;
                }

                msg = stream.next() => {
                    let Some(msg) = msg else {
                        return Ok(Departure::Graceful);
                    };
                    let msg = msg?;
                    self.last_activity = Instant::now();
                    match msg {
                        Message::Binary(data) => {
                            self.stats.record_message(data.len());
                            self.handle_frame(&data, sink).await?;
                        }
                        Message::Ping(data) => {
                            sink.send(Message::Pong(data)).await?;
                        }
                        Message::Text(_) => {
                            return Err(ProtocolError::UnexpectedText.into());
                        }
                        Message::Close(_) => {
                            return Ok(Departure::Graceful);
                        }
                        Message::Pong(_) | Message::Frame(_) => {}
                    }
                }

                frame = self.frames.recv() => {
                    match frame {
                        Ok(frame) => {
                            // Don't echo back to sender
                            if !frame.is_from(self.id) {
                                sink.send(Message::Binary(frame.bytes.to_vec().into())).await?;
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            log::warn!("Peer {} lagged by {missed} frames, resyncing", self.id);
                            self.room.record_lag(missed);
                            self.resync(sink).await?;
                        }
                        Err(RecvError::Closed) => return Ok(Departure::Graceful),
                    }
                }
            }
        }
    }

    /// Server speaks first: state vector, then who is here.
    async fn greet<Tx>(&mut self, sink: &mut Tx) -> Result<()>
    where
        Tx: Sink<Message, Error = WsError> + Unpin,
    {
        let sv = self.room.state_vector().await;
        send(sink, protocol::step1(&sv)).await?;
        if let Some(awareness) = self.room.awareness_frame().await {
            send(sink, awareness).await?;
        }
        Ok(())
    }

    /// Full document and awareness state, for a peer whose receiver lagged.
    async fn resync<Tx>(&mut self, sink: &mut Tx) -> Result<()>
    where
        Tx: Sink<Message, Error = WsError> + Unpin,
    {
        match self.room.full_state().await {
            Ok(state) => send(sink, protocol::update(state)).await?,
            Err(e) => log::error!("Room {:?} failed to encode state: {e}", self.room.name()),
        }
        if let Some(awareness) = self.room.awareness_frame().await {
            send(sink, awareness).await?;
        }
        Ok(())
    }

    async fn handle_frame<Tx>(&mut self, data: &[u8], sink: &mut Tx) -> Result<()>
    where
        Tx: Sink<Message, Error = WsError> + Unpin,
    {
        match protocol::decode(data)? {
            YMessage::Sync(SyncMessage::SyncStep1(sv)) => {
                let diff = match self.room.diff_since(&sv.encode_v1()).await {
                    Ok(diff) => diff,
                    Err(e) => {
                        log::warn!("Unusable state vector from peer {} ({e}), sending full state", self.id);
                        self.room.full_state().await?
                    }
                };
                send(sink, protocol::step2(diff)).await?;
                if self.phase == Phase::Handshake {
                    self.phase = Phase::Synced;
                    log::debug!("Peer {} synced in room {:?}", self.id, self.room.name());
                }
            }
            YMessage::Sync(SyncMessage::SyncStep2(update) | SyncMessage::Update(update)) => {
                match self.room.apply_update(Some(self.id), &update).await {
                    Ok(changed) => log::debug!(
                        "Update from peer {} ({} bytes, changed: {changed})",
                        self.id,
                        update.len()
                    ),
                    Err(e) => log::warn!("Dropping update from peer {}: {e}", self.id),
                }
            }
            YMessage::Awareness(update) => {
                let change = self.room.apply_awareness(Some(self.id), &update).await;
                self.client_ids.extend(change.added.iter().chain(&change.updated));
                for id in &change.removed {
                    self.client_ids.remove(id);
                }
            }
            YMessage::AwarenessQuery => {
                let reply = match self.room.awareness_frame().await {
                    Some(frame) => frame,
                    None => protocol::awareness(AwarenessUpdate { clients: HashMap::new() }),
                };
                send(sink, reply).await?;
            }
            YMessage::Auth(_) => {
                log::trace!("Ignoring auth frame from peer {}", self.id);
            }
            YMessage::Custom(tag, _) => {
                return Err(ProtocolError::UnknownMessageType(tag).into());
            }
        }
        Ok(())
    }
}

async fn send<Tx>(sink: &mut Tx, bytes: Vec<u8>) -> Result<()>
where
    Tx: Sink<Message, Error = WsError> + Unpin,
{
    sink.send(Message::Binary(bytes.into())).await?;
    Ok(())
}
