//! WebSocket relay with scope-based room routing.
//!
//! Architecture:
//! ```text
//! Replica A ──┐
//!              ├── Room (scope name) ── authority Doc ── broadcast
//! Replica B ──┘                              │
//!                                 ┌──────────┴──────────┐
//!                                 ▼                     ▼
//!                             Replica A             Replica B
//! ```
//!
//! The relay is a rendezvous point, not a database: each room keeps an
//! in-memory authority document so late joiners can be caught up with
//! a single diff, plus the current presence roster so they see who is
//! already in the room. Durability lives client-side; an empty room is
//! simply dropped.
//!
//! Frames are routed by the scope name carried in every envelope, so
//! one relay serves any number of scopes on one port.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{MessageType, WireMessage};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4444".to_string(),
            broadcast_capacity: 256,
        }
    }
}

/// One scope's room: authority document, fan-out channel, roster.
struct Room {
    doc: yrs::Doc,
    broadcast: broadcast::Sender<Arc<Vec<u8>>>,
    /// participant → last presence JSON
    roster: HashMap<Uuid, Vec<u8>>,
}

impl Room {
    fn new(broadcast_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(broadcast_capacity);
        Self {
            doc: yrs::Doc::new(),
            broadcast: tx,
            roster: HashMap::new(),
        }
    }

    fn apply_update(&self, payload: &[u8]) {
        use yrs::updates::decoder::Decode;
        if let Ok(update) = yrs::Update::decode_v1(payload) {
            let mut txn = yrs::Transact::transact_mut(&self.doc);
            if let Err(e) = txn.apply_update(update) {
                log::warn!("relay rejected update: {e}");
            }
        } else {
            log::warn!("relay dropped undecodable update");
        }
    }

    fn state_vector(&self) -> Vec<u8> {
        use yrs::updates::encoder::Encode;
        use yrs::ReadTxn;
        let txn = yrs::Transact::transact(&self.doc);
        txn.state_vector().encode_v1()
    }

    fn diff_for(&self, remote_sv: &[u8]) -> Option<Vec<u8>> {
        use yrs::updates::decoder::Decode;
        use yrs::ReadTxn;
        let sv = yrs::StateVector::decode_v1(remote_sv).ok()?;
        let txn = yrs::Transact::transact(&self.doc);
        Some(txn.encode_state_as_update_v1(&sv))
    }

    fn send(&self, frame: &WireMessage) {
        if let Ok(encoded) = frame.encode() {
            // No receivers is fine: the room may be down to one peer.
            let _ = self.broadcast.send(Arc::new(encoded));
        }
    }
}

/// The sync relay.
pub struct Relay {
    config: RelayConfig,
    rooms: Arc<RwLock<HashMap<String, Room>>>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Bind and serve connections until the task is dropped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new connection from {addr}");

            let rooms = self.rooms.clone();
            let capacity = self.config.broadcast_capacity;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, rooms, capacity).await {
                    log::warn!("connection from {addr} ended with error: {e}");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: Arc<RwLock<HashMap<String, Room>>>,
    broadcast_capacity: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let mut participant: Option<Uuid> = None;
    let mut scope: Option<String> = None;
    let mut broadcast_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        let frame = match WireMessage::decode(&bytes) {
                            Ok(f) => f,
                            Err(e) => {
                                log::warn!("undecodable frame from {addr}: {e}");
                                continue;
                            }
                        };

                        match frame.msg_type {
                            MessageType::Join => {
                                participant = Some(frame.participant);
                                scope = Some(frame.scope.clone());

                                let mut rooms_w = rooms.write().await;
                                let room = rooms_w
                                    .entry(frame.scope.clone())
                                    .or_insert_with(|| Room::new(broadcast_capacity));

                                broadcast_rx = Some(room.broadcast.subscribe());

                                // Catch the newcomer up: who is here, and
                                // what the room already knows.
                                for (id, presence) in &room.roster {
                                    let replay = WireMessage::presence(
                                        *id,
                                        frame.scope.clone(),
                                        presence.clone(),
                                    );
                                    ws_sender.send(Message::Binary(replay.encode()?.into())).await?;
                                }
                                let step1 = WireMessage::sync_step1(
                                    Uuid::nil(),
                                    frame.scope.clone(),
                                    room.state_vector(),
                                );
                                ws_sender.send(Message::Binary(step1.encode()?.into())).await?;

                                room.roster.insert(frame.participant, frame.payload.clone());
                                room.send(&frame);

                                log::info!(
                                    "participant {} joined scope '{}' ({} in room)",
                                    frame.participant,
                                    frame.scope,
                                    room.roster.len()
                                );
                            }

                            MessageType::SyncStep1 => {
                                let rooms_r = rooms.read().await;
                                if let Some(room) = scope.as_ref().and_then(|s| rooms_r.get(s)) {
                                    if let Some(diff) = room.diff_for(&frame.payload) {
                                        let step2 = WireMessage::sync_step2(
                                            Uuid::nil(),
                                            frame.scope.clone(),
                                            diff,
                                        );
                                        drop(rooms_r);
                                        ws_sender.send(Message::Binary(step2.encode()?.into())).await?;
                                    }
                                }
                            }

                            MessageType::SyncStep2 | MessageType::Delta => {
                                let rooms_r = rooms.read().await;
                                if let Some(room) = scope.as_ref().and_then(|s| rooms_r.get(s)) {
                                    room.apply_update(&frame.payload);
                                    room.send(&frame);
                                }
                            }

                            MessageType::Presence => {
                                let mut rooms_w = rooms.write().await;
                                if let Some(room) = scope.as_ref().and_then(|s| rooms_w.get_mut(s)) {
                                    room.roster.insert(frame.participant, frame.payload.clone());
                                    room.send(&frame);
                                }
                            }

                            MessageType::Leave => break,
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => break,

                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }

                    Some(Err(e)) => {
                        log::warn!("socket error from {addr}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            msg = async {
                match broadcast_rx {
                    Some(ref mut rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match msg {
                    Ok(data) => {
                        // Senders filter their own frames client-side
                        // too, but not echoing saves the bandwidth.
                        if let Ok(frame) = WireMessage::decode(&data) {
                            if Some(frame.participant) == participant {
                                continue;
                            }
                        }
                        ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("participant {participant:?} lagged by {n} frames");
                    }
                    Err(_) => break,
                }
            }
        }
    }

    // Cleanup: drop from roster, tell the others, reap empty rooms.
    if let (Some(pid), Some(sc)) = (participant, scope) {
        let mut rooms_w = rooms.write().await;
        if let Some(room) = rooms_w.get_mut(&sc) {
            room.roster.remove(&pid);
            room.send(&WireMessage::leave(pid, sc.clone()));

            if room.roster.is_empty() {
                rooms_w.remove(&sc);
                log::info!("scope '{sc}' room removed (empty)");
            } else {
                log::info!("participant {pid} left scope '{sc}'");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:4444");
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[tokio::test]
    async fn relay_starts_with_no_rooms() {
        let relay = Relay::with_defaults();
        assert_eq!(relay.room_count().await, 0);
        assert_eq!(relay.bind_addr(), "127.0.0.1:4444");
    }

    #[test]
    fn room_tracks_roster() {
        let mut room = Room::new(16);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        room.roster.insert(a, b"{}".to_vec());
        room.roster.insert(b, br#"{"name":"b"}"#.to_vec());
        assert_eq!(room.roster.len(), 2);
        room.roster.remove(&a);
        assert_eq!(room.roster.len(), 1);
    }

    #[test]
    fn room_authority_doc_accumulates_updates() {
        use yrs::updates::encoder::Encode;
        use yrs::{GetString, ReadTxn, Text, Transact};

        let source = yrs::Doc::new();
        let text = source.get_or_insert_text("t");
        {
            let mut txn = source.transact_mut();
            text.insert(&mut txn, 0, "hello");
        }
        let update = {
            let txn = source.transact();
            txn.encode_state_as_update_v1(&yrs::StateVector::default())
        };

        let room = Room::new(16);
        room.apply_update(&update);

        let txn = yrs::Transact::transact(&room.doc);
        let text = txn.get_text("t").unwrap();
        assert_eq!(text.get_string(&txn), "hello");

        // The diff for an empty peer carries the full room state.
        let empty_sv = yrs::StateVector::default().encode_v1();
        let diff = room.diff_for(&empty_sv).unwrap();
        assert!(!diff.is_empty());
    }
}
