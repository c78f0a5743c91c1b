//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server on an ephemeral port and drive it with
//! raw WebSocket peers and with `SyncClient`, verifying the full pipeline.

use std::net::SocketAddr;
use std::sync::Arc;

use codepair_collab::client::{ConnectionState, SyncClient, SyncEvent};
use codepair_collab::protocol::{self, AwarenessUpdate, Message as YMessage, SyncMessage};
use codepair_collab::server::SyncServer;
use codepair_collab::ServerConfig;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use yrs::{StateVector, Text, WriteTxn};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const QUIET: Duration = Duration::from_millis(300);

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..ServerConfig::default()
    }
}

/// Start a server, return its address and a handle for inspection.
async fn start_test_server(config: ServerConfig) -> (SocketAddr, Arc<SyncServer>) {
    let server = Arc::new(SyncServer::bind(config).await.unwrap());
    let addr = server.local_addr().unwrap();
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    (addr, server)
}

/// A peer speaking raw frames, for checking exactly what goes over the wire.
struct RawPeer {
    ws: Ws,
}

impl RawPeer {
    async fn connect(addr: SocketAddr, path: &str) -> Self {
        let url = format!("ws://{addr}{path}");
        let (ws, _) = timeout(Duration::from_secs(2), tokio_tungstenite::connect_async(url))
            .await
            .unwrap()
            .unwrap();
        Self { ws }
    }

    async fn send(&mut self, frame: YMessage) {
        let bytes = protocol::encode(&frame);
        self.ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    /// Next frame within `wait`; `None` on timeout or close.
    async fn recv(&mut self, wait: Duration) -> Option<YMessage> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()??;
            match msg {
                Ok(Message::Binary(data)) => return Some(protocol::decode(&data).unwrap()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Complete the sync handshake from an empty replica. Returns whatever
    /// awareness payloads arrived on the way.
    async fn handshake(&mut self) -> Vec<AwarenessUpdate> {
        let first = self.recv(Duration::from_secs(2)).await;
        assert!(matches!(first, Some(YMessage::Sync(SyncMessage::SyncStep1(_)))), "got {first:?}");

        self.send(YMessage::Sync(SyncMessage::SyncStep1(StateVector::default()))).await;

        let mut awareness = Vec::new();
        loop {
            match self.recv(Duration::from_secs(2)).await {
                Some(YMessage::Sync(SyncMessage::SyncStep2(_))) => return awareness,
                Some(YMessage::Awareness(update)) => awareness.push(update),
                Some(_) => continue,
                None => panic!("connection ended during handshake"),
            }
        }
    }

    async fn announce(&mut self, client_id: u64, clock: u32, state: &str) {
        let update = protocol::presence(client_id, clock, Some(state));
        self.send(YMessage::Awareness(update)).await;
    }

    async fn recv_awareness(&mut self, wait: Duration) -> Option<AwarenessUpdate> {
        loop {
            match self.recv(wait).await? {
                YMessage::Awareness(update) => return Some(update),
                _ => continue,
            }
        }
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
        // Drain until the server acknowledges.
        let _ = timeout(Duration::from_secs(1), async { while self.ws.next().await.is_some() {} }).await;
    }
}

fn update_frame(update: Vec<u8>) -> YMessage {
    YMessage::Sync(SyncMessage::Update(update))
}

fn seen_ids(updates: &[AwarenessUpdate]) -> Vec<u64> {
    updates.iter().flat_map(protocol::client_ids).collect()
}

fn insert_update(text: &str) -> Vec<u8> {
    let doc = yrs::Doc::new();
    {
        let mut txn = yrs::Transact::transact_mut(&doc);
        let t = txn.get_or_insert_text("content");
        t.insert(&mut txn, 0, text);
    }
    let txn = yrs::Transact::transact(&doc);
    yrs::ReadTxn::encode_state_as_update_v1(&txn, &yrs::StateVector::default())
}

/// Poll `cond` until it holds or two seconds pass.
macro_rules! eventually {
    ($cond:expr) => {{
        let mut held = false;
        for _ in 0..100 {
            if $cond {
                held = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        held
    }};
}

async fn connected_client(addr: SocketAddr, room: &str) -> (SyncClient, tokio::sync::mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(format!("ws://{addr}/collab"), room);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let synced = timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if matches!(event, SyncEvent::Synced) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(synced, "client should sync");
    (client, events)
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let (addr, _server) = start_test_server(test_config()).await;
    let (alice, _alice_events) = connected_client(addr, "pair").await;
    let (bob, _bob_events) = connected_client(addr, "pair").await;

    let insert = |s: &'static str| {
        move |txn: &mut yrs::TransactionMut<'_>| {
            let text = txn.get_or_insert_text("content");
            text.insert(txn, 0, s);
        }
    };
    let (a, b) = tokio::join!(alice.edit(insert("hello")), bob.edit(insert("world")));
    a.unwrap();
    b.unwrap();

    let converged = eventually!({
        let (x, y) = (alice.text("content"), bob.text("content"));
        x == y && x.len() == 10
    });
    assert!(converged, "alice={:?} bob={:?}", alice.text("content"), bob.text("content"));

    // A late joiner receives the merged document during the handshake.
    let (carol, _carol_events) = connected_client(addr, "pair").await;
    assert!(eventually!(carol.text("content") == alice.text("content")));
}

#[tokio::test]
async fn test_update_not_echoed_to_sender() {
    let (addr, _server) = start_test_server(test_config()).await;
    let mut alice = RawPeer::connect(addr, "/collab/echo").await;
    let mut bob = RawPeer::connect(addr, "/collab/echo").await;
    alice.handshake().await;
    bob.handshake().await;

    let update = insert_update("x");
    alice.send(update_frame(update.clone())).await;

    assert_eq!(bob.recv(Duration::from_secs(2)).await, Some(update_frame(update)));
    assert_eq!(alice.recv(QUIET).await, None);
}

#[tokio::test]
async fn test_presence_join_and_leave() {
    let (addr, server) = start_test_server(test_config()).await;

    let mut alice = RawPeer::connect(addr, "/collab/presence").await;
    assert!(alice.handshake().await.is_empty());
    alice.announce(1, 1, r#"{"user":"alice"}"#).await;
    let room = server.registry().room("presence").await.unwrap();
    assert!(eventually!(room.participant_count().await == 1));

    let mut bob = RawPeer::connect(addr, "/collab/presence").await;
    let seen = bob.handshake().await;
    assert_eq!(seen_ids(&seen), vec![1]);

    bob.announce(2, 1, r#"{"user":"bob"}"#).await;
    let update = alice.recv_awareness(Duration::from_secs(2)).await.unwrap();
    assert_eq!(protocol::client_ids(&update), vec![2]);

    assert_eq!(room.participant_count().await, 2);

    bob.close().await;
    let update = alice.recv_awareness(Duration::from_secs(2)).await.unwrap();
    assert_eq!(update, protocol::presence(2, 1, None));

    // No ghost entry for bob.
    let snapshot = room.awareness_snapshot().await;
    assert_eq!(snapshot.keys().copied().collect::<Vec<_>>(), vec![1]);

    // A newcomer sees only alice.
    let mut carol = RawPeer::connect(addr, "/collab/presence").await;
    let seen = carol.handshake().await;
    assert_eq!(seen_ids(&seen), vec![1]);
}

#[tokio::test]
async fn test_reconnecting_tab_reannounces_after_leave() {
    let (addr, _server) = start_test_server(test_config()).await;
    let mut alice = RawPeer::connect(addr, "/collab/tab").await;
    alice.handshake().await;

    let mut tab = RawPeer::connect(addr, "/collab/tab").await;
    tab.handshake().await;
    tab.announce(42, 5, r#"{"user":"tab"}"#).await;
    alice.recv_awareness(Duration::from_secs(2)).await.unwrap();

    tab.close().await;
    let update = alice.recv_awareness(Duration::from_secs(2)).await.unwrap();
    assert_eq!(update, protocol::presence(42, 5, None));

    // Same awareness id, next clock.
    let mut tab = RawPeer::connect(addr, "/collab/tab").await;
    tab.handshake().await;
    tab.announce(42, 6, r#"{"user":"tab"}"#).await;
    let update = alice.recv_awareness(Duration::from_secs(2)).await.unwrap();
    assert_eq!(update, protocol::presence(42, 6, Some(r#"{"user":"tab"}"#)));
}

#[tokio::test]
async fn test_stale_awareness_not_broadcast() {
    let (addr, _server) = start_test_server(test_config()).await;
    let mut alice = RawPeer::connect(addr, "/collab/stale").await;
    let mut bob = RawPeer::connect(addr, "/collab/stale").await;
    alice.handshake().await;
    bob.handshake().await;

    alice.announce(7, 5, r#"{"cursor":5}"#).await;
    let update = bob.recv_awareness(Duration::from_secs(2)).await.unwrap();
    assert_eq!(update.clients[&7].clock, 5);

    alice.announce(7, 5, r#"{"cursor":"dup"}"#).await;
    alice.announce(7, 3, r#"{"cursor":"old"}"#).await;
    assert_eq!(bob.recv(QUIET).await, None);

    alice.announce(7, 6, r#"{"cursor":6}"#).await;
    let update = bob.recv_awareness(Duration::from_secs(2)).await.unwrap();
    assert_eq!(update.clients[&7].clock, 6);
    assert_eq!(protocol::entry_state(&update.clients[&7]), Some(r#"{"cursor":6}"#));
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (addr, _server) = start_test_server(test_config()).await;
    let mut x1 = RawPeer::connect(addr, "/collab/x").await;
    let mut x2 = RawPeer::connect(addr, "/collab/x").await;
    let mut y1 = RawPeer::connect(addr, "/collab/y").await;
    x1.handshake().await;
    x2.handshake().await;
    y1.handshake().await;

    x1.send(update_frame(insert_update("only x"))).await;
    x1.announce(9, 1, "{}").await;

    assert!(x2.recv(Duration::from_secs(2)).await.is_some());
    assert_eq!(y1.recv(QUIET).await, None);
}

#[tokio::test]
async fn test_malformed_frame_closes_only_that_connection() {
    let (addr, server) = start_test_server(test_config()).await;
    let mut good = RawPeer::connect(addr, "/collab/m").await;
    let mut other = RawPeer::connect(addr, "/collab/m").await;
    let mut bad = RawPeer::connect(addr, "/collab/m").await;
    good.handshake().await;
    other.handshake().await;
    bad.handshake().await;

    bad.ws.send(Message::Binary(vec![0x00, 0x07, 0xFF].into())).await.unwrap();
    assert_eq!(bad.recv(Duration::from_secs(2)).await, None);

    let room = server.registry().room("m").await.unwrap();
    assert!(eventually!(room.peer_count().await == 2));

    let update = insert_update("still alive");
    good.send(update_frame(update.clone())).await;
    assert_eq!(other.recv(Duration::from_secs(2)).await, Some(update_frame(update)));
}

#[tokio::test]
async fn test_undecodable_update_is_dropped_but_connection_survives() {
    let (addr, _server) = start_test_server(test_config()).await;
    let mut alice = RawPeer::connect(addr, "/collab/u").await;
    let mut bob = RawPeer::connect(addr, "/collab/u").await;
    alice.handshake().await;
    bob.handshake().await;

    // Well-formed frame, garbage CRDT payload.
    alice.send(update_frame(vec![0xFF, 0xFF, 0xFF])).await;
    assert_eq!(bob.recv(QUIET).await, None);

    let update = insert_update("ok");
    alice.send(update_frame(update.clone())).await;
    assert_eq!(bob.recv(Duration::from_secs(2)).await, Some(update_frame(update)));
}

#[tokio::test]
async fn test_empty_room_evicted_and_recreated_fresh() {
    let config = ServerConfig { eviction_grace_ms: 100, ..test_config() };
    let (addr, server) = start_test_server(config).await;

    let (mut alice, _events) = connected_client(addr, "evict").await;
    alice
        .edit(|txn| {
            let text = txn.get_or_insert_text("content");
            text.insert(txn, 0, "before");
        })
        .await
        .unwrap();
    let room = server.registry().room("evict").await.unwrap();
    assert!(eventually!(room.stats().await.updates_applied == 1));

    alice.leave().await.unwrap();
    assert!(eventually!(server.registry().room_count().await == 0));

    let (bob, _events) = connected_client(addr, "evict").await;
    assert_eq!(bob.text("content"), "");
}

#[tokio::test]
async fn test_rejoin_within_grace_keeps_document() {
    let config = ServerConfig { eviction_grace_ms: 5_000, ..test_config() };
    let (addr, server) = start_test_server(config).await;

    let (mut alice, _events) = connected_client(addr, "keep").await;
    alice
        .edit(|txn| {
            let text = txn.get_or_insert_text("content");
            text.insert(txn, 0, "kept");
        })
        .await
        .unwrap();
    let room = server.registry().room("keep").await.unwrap();
    assert!(eventually!(room.stats().await.updates_applied == 1));
    alice.leave().await.unwrap();
    assert!(eventually!(room.peer_count().await == 0));

    let (bob, _events) = connected_client(addr, "keep").await;
    assert!(eventually!(bob.text("content") == "kept"));
    assert_eq!(server.registry().room_count().await, 1);
}

#[tokio::test]
async fn test_unmatched_path_rejected_without_room() {
    let (addr, server) = start_test_server(test_config()).await;

    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/elsewhere/room")).await;
    assert!(result.is_err());

    assert_eq!(server.registry().room_count().await, 0);
    assert!(eventually!(server.stats().await.rejected_connections == 1));
}

#[tokio::test]
async fn test_full_room_refused_before_upgrade() {
    let config = ServerConfig { max_peers_per_room: 1, ..test_config() };
    let (addr, server) = start_test_server(config).await;

    let mut first = RawPeer::connect(addr, "/collab/solo").await;
    first.handshake().await;

    let second = tokio_tungstenite::connect_async(format!("ws://{addr}/collab/solo")).await;
    assert!(second.is_err());
    assert!(eventually!(server.stats().await.rejected_connections == 1));

    let room = server.registry().room("solo").await.unwrap();
    assert_eq!(room.peer_count().await, 1);
}

#[tokio::test]
async fn test_bare_prefix_uses_default_room() {
    let (addr, server) = start_test_server(test_config()).await;
    let mut peer = RawPeer::connect(addr, "/collab").await;
    peer.handshake().await;

    assert_eq!(server.registry().active_rooms().await, vec!["default".to_string()]);
}

#[tokio::test]
async fn test_handshake_timeout_closes_connection() {
    let config = ServerConfig { handshake_timeout_ms: 200, ..test_config() };
    let (addr, server) = start_test_server(config).await;

    let mut peer = RawPeer::connect(addr, "/collab/slow").await;
    assert!(matches!(
        peer.recv(Duration::from_secs(1)).await,
        Some(YMessage::Sync(SyncMessage::SyncStep1(_)))
    ));
    // Never send Step1.
    assert_eq!(peer.recv(Duration::from_secs(2)).await, None);

    let room = server.registry().room("slow").await;
    if let Some(room) = room {
        assert!(eventually!(room.peer_count().await == 0));
    }
}

#[tokio::test]
async fn test_query_awareness_returns_full_state() {
    let (addr, _server) = start_test_server(test_config()).await;
    let mut alice = RawPeer::connect(addr, "/collab/q").await;
    let mut bob = RawPeer::connect(addr, "/collab/q").await;
    alice.handshake().await;
    bob.handshake().await;

    alice.announce(4, 1, r#"{"user":"a"}"#).await;
    bob.recv_awareness(Duration::from_secs(2)).await.unwrap();

    bob.send(YMessage::AwarenessQuery).await;
    let update = bob.recv_awareness(Duration::from_secs(2)).await.unwrap();
    assert_eq!(update, protocol::presence(4, 1, Some(r#"{"user":"a"}"#)));
}

#[tokio::test]
async fn test_client_awareness_events() {
    let (addr, _server) = start_test_server(test_config()).await;
    let (alice, _alice_events) = connected_client(addr, "aw").await;
    let (mut bob, mut bob_events) = connected_client(addr, "aw").await;

    alice
        .set_awareness(&serde_json::json!({ "user": { "name": "alice" } }))
        .await
        .unwrap();

    let update = timeout(Duration::from_secs(2), async {
        loop {
            match bob_events.recv().await {
                Some(SyncEvent::Awareness(update)) => return update,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(protocol::client_ids(&update), vec![alice.client_id()]);

    bob.leave().await.unwrap();
    assert_eq!(bob.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_offline_updates_replayed_on_connect() {
    let (addr, server) = start_test_server(test_config()).await;

    let mut client = SyncClient::new(format!("ws://{addr}/collab"), "offline");
    client
        .edit(|txn| {
            let text = txn.get_or_insert_text("content");
            text.insert(txn, 0, "queued");
        })
        .await
        .unwrap();
    assert_eq!(client.offline_queue_len().await, 1);

    client.connect().await.unwrap();
    assert_eq!(client.offline_queue_len().await, 0);

    assert!(eventually!(match server.registry().room("offline").await {
        Some(room) => room.stats().await.updates_applied >= 1,
        None => false,
    }));
}

#[tokio::test]
async fn test_server_stats_track_connections() {
    let (addr, server) = start_test_server(test_config()).await;
    let mut peer = RawPeer::connect(addr, "/collab/stats").await;
    peer.handshake().await;

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.active_rooms, 1);
    assert!(stats.total_messages >= 1);

    peer.close().await;
    assert!(eventually!(server.stats().await.active_connections == 0));
}
