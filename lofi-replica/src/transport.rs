//! WebSocket transport binding for networked scopes.
//!
//! One [`TransportBinding`] per acquired networked scope. It owns the
//! connection lifecycle:
//!
//! ```text
//!   local edit ──observe_update_v1──▶ frame ──▶ writer task ──▶ relay
//!   relay ──▶ reader task ──▶ Inbound ──▶ ScopeManager::poll
//! ```
//!
//! Endpoints are tried in configuration order; the first that accepts
//! the socket wins. After connecting the binding announces itself with
//! a Join frame carrying local presence, then runs the symmetric sync
//! handshake: each side sends its state vector (SyncStep1) and answers
//! the other's with a diff (SyncStep2). Edits made before the
//! connection came up wait in an offline queue and replay right after
//! the handshake.
//!
//! Incoming document frames are never applied here; they are forwarded
//! as [`Inbound`] events and integrated on the thread that calls
//! `poll`, so observation callbacks always run on the caller's thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::container::Replica;
use crate::presence::{AwarenessChannel, Payload};
use crate::protocol::{MessageType, WireMessage};
use crate::scope::{Inbound, ORIGIN_REMOTE};

/// Edits queued while the connection is down.
///
/// Bounded; once full, further edits are dropped from the queue (the
/// document still has them, and the next full-state handshake will
/// carry them anyway).
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
    dropped: u64,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
            dropped: 0,
        }
    }

    pub fn enqueue(&mut self, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            self.dropped += 1;
            return false;
        }
        self.queue.push_back(payload);
        true
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Updates rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Live transport state for one networked scope.
pub struct TransportBinding {
    participant: Uuid,
    scope: String,
    connected: Arc<AtomicBool>,
    frames_tx: mpsc::UnboundedSender<Vec<u8>>,
    _doc_sub: yrs::Subscription,
}

impl TransportBinding {
    /// Wire a replica to the relay endpoints and spawn the connection
    /// task. Returns immediately; connection outcome arrives as an
    /// [`Inbound::Connected`] or [`Inbound::ConnectFailed`] event.
    pub(crate) fn attach(
        replica: &Replica,
        awareness: Arc<AwarenessChannel>,
        presence_rx: mpsc::UnboundedReceiver<Payload>,
        endpoints: Vec<String>,
        connected: Arc<AtomicBool>,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Result<Self, crate::error::ReplicaError> {
        let participant = awareness.local_id();
        let scope = replica.scope().to_string();
        let clock = Arc::new(AtomicU64::new(0));
        let offline = Arc::new(Mutex::new(OfflineQueue::new(10_000)));

        // Encoded frames headed for the socket, from any source.
        let (frames_tx, frames_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        // Local edits and hydrated state: frame them while online,
        // queue them while not. Only remote integration is excluded or
        // every frame would echo back to its author. State restored
        // from the store must travel: the handshake diff is computed
        // before the first poll applies hydration, so without these
        // frames a restarted participant's edits would stay local.
        let doc_sub = {
            let connected = connected.clone();
            let clock = clock.clone();
            let offline = offline.clone();
            let frames_tx = frames_tx.clone();
            let scope = scope.clone();
            replica
                .doc()
                .observe_update_v1(move |txn, event| {
                    if txn.origin() == Some(&yrs::Origin::from(ORIGIN_REMOTE)) {
                        return;
                    }
                    if connected.load(Ordering::Acquire) {
                        let tick = clock.fetch_add(1, Ordering::AcqRel) + 1;
                        let msg =
                            WireMessage::delta(participant, scope.clone(), tick, event.update.clone());
                        if let Ok(encoded) = msg.encode() {
                            let _ = frames_tx.send(encoded);
                        }
                    } else {
                        let mut queue = offline.lock().unwrap_or_else(|e| e.into_inner());
                        if !queue.enqueue(event.update.clone()) {
                            log::warn!("offline queue full, update deferred to handshake");
                        }
                    }
                })
                .map_err(|e| crate::error::ReplicaError::InvalidUpdate(e.to_string()))?
        };

        // The task holds the channel weakly: a strong reference would
        // keep the presence sender alive and its own shutdown signal
        // (the presence receiver closing) from ever firing. Presence is
        // read at Join time so state set before the socket came up
        // still gets announced.
        let awareness = Arc::downgrade(&awareness);

        tokio::spawn(run_connection(
            ConnectionTask {
                replica: replica.clone(),
                awareness,
                endpoints,
                inbound,
                participant,
                scope: scope.clone(),
                connected: connected.clone(),
                clock,
                offline,
                frames_tx: frames_tx.clone(),
            },
            presence_rx,
            frames_rx,
        ));

        Ok(Self {
            participant,
            scope,
            connected,
            frames_tx,
            _doc_sub: doc_sub,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl Drop for TransportBinding {
    fn drop(&mut self) {
        // Best-effort clean leave; the relay also reaps dead sockets.
        if self.is_connected() {
            if let Ok(encoded) = WireMessage::leave(self.participant, self.scope.clone()).encode() {
                let _ = self.frames_tx.send(encoded);
            }
        }
    }
}

struct ConnectionTask {
    replica: Replica,
    awareness: Weak<AwarenessChannel>,
    endpoints: Vec<String>,
    inbound: mpsc::UnboundedSender<Inbound>,
    participant: Uuid,
    scope: String,
    connected: Arc<AtomicBool>,
    clock: Arc<AtomicU64>,
    offline: Arc<Mutex<OfflineQueue>>,
    frames_tx: mpsc::UnboundedSender<Vec<u8>>,
}

async fn run_connection(
    task: ConnectionTask,
    mut presence_rx: mpsc::UnboundedReceiver<Payload>,
    mut frames_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let mut ws_stream = None;
    let mut last_err = String::from("no endpoints configured");
    for endpoint in &task.endpoints {
        match tokio_tungstenite::connect_async(endpoint).await {
            Ok((stream, _)) => {
                log::info!("scope '{}' connected to {endpoint}", task.scope);
                ws_stream = Some(stream);
                break;
            }
            Err(e) => {
                log::warn!("scope '{}' endpoint {endpoint} refused: {e}", task.scope);
                last_err = e.to_string();
            }
        }
    }

    let Some(ws_stream) = ws_stream else {
        let _ = task.inbound.send(Inbound::ConnectFailed(last_err));
        return;
    };

    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    // Writer task: forward encoded frames to the socket.
    let writer = tokio::spawn(async move {
        while let Some(data) = frames_rx.recv().await {
            if ws_writer
                .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = ws_writer.close().await;
    });

    // Announce ourselves and open the handshake. The Join frame
    // carries whatever presence the caller set so far, even if it was
    // set while the connection was still dialing.
    let local_presence = task
        .awareness
        .upgrade()
        .map(|a| serde_json::to_vec(&a.local_state()).unwrap_or_default())
        .unwrap_or_default();
    send_frame(
        &task.frames_tx,
        WireMessage::join(task.participant, task.scope.clone(), local_presence),
    );
    send_frame(
        &task.frames_tx,
        WireMessage::sync_step1(task.participant, task.scope.clone(), task.replica.state_vector()),
    );

    task.connected.store(true, Ordering::Release);
    let _ = task.inbound.send(Inbound::Connected);

    // Replay anything edited before the connection came up.
    let queued = {
        let mut queue = task.offline.lock().unwrap_or_else(|e| e.into_inner());
        queue.drain()
    };
    if !queued.is_empty() {
        log::info!("scope '{}' replaying {} queued updates", task.scope, queued.len());
        for payload in queued {
            let tick = task.clock.fetch_add(1, Ordering::AcqRel) + 1;
            send_frame(
                &task.frames_tx,
                WireMessage::delta(task.participant, task.scope.clone(), tick, payload),
            );
        }
    }

    // Reader loop, interleaved with outgoing presence broadcasts.
    loop {
        tokio::select! {
            payload = presence_rx.recv() => {
                match payload {
                    Some(p) => {
                        let json = serde_json::to_vec(&p).unwrap_or_default();
                        send_frame(
                            &task.frames_tx,
                            WireMessage::presence(task.participant, task.scope.clone(), json),
                        );
                    }
                    // Awareness channel dropped: scope released.
                    None => break,
                }
            }
            msg = ws_reader.next() => {
                match msg {
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        let Ok(frame) = WireMessage::decode(&bytes) else {
                            log::warn!("scope '{}' dropped undecodable frame", task.scope);
                            continue;
                        };
                        if frame.participant == task.participant {
                            continue;
                        }
                        handle_frame(&task, frame);
                    }
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("scope '{}' socket error: {e}", task.scope);
                        break;
                    }
                }
            }
        }
    }

    task.connected.store(false, Ordering::Release);
    let _ = task.inbound.send(Inbound::Closed);
    writer.abort();
}

fn handle_frame(task: &ConnectionTask, frame: WireMessage) {
    match frame.msg_type {
        MessageType::SyncStep1 => {
            // The peer told us what it has; answer with what it lacks.
            match task.replica.encode_diff(&frame.payload) {
                Ok(diff) => send_frame(
                    &task.frames_tx,
                    WireMessage::sync_step2(task.participant, task.scope.clone(), diff),
                ),
                Err(e) => log::warn!("scope '{}' bad state vector: {e}", task.scope),
            }
        }
        MessageType::SyncStep2 | MessageType::Delta => {
            let _ = task.inbound.send(Inbound::RemoteUpdate(frame.payload));
        }
        MessageType::Join | MessageType::Presence => {
            let payload = decode_presence(&frame.payload);
            let _ = task.inbound.send(Inbound::Presence {
                from: frame.participant,
                payload: Some(payload),
            });
        }
        MessageType::Leave => {
            let _ = task.inbound.send(Inbound::Presence {
                from: frame.participant,
                payload: None,
            });
        }
    }
}

fn decode_presence(json: &[u8]) -> Payload {
    if json.is_empty() {
        return Payload::new();
    }
    serde_json::from_slice(json).unwrap_or_default()
}

fn send_frame(frames_tx: &mpsc::UnboundedSender<Vec<u8>>, msg: WireMessage) {
    match msg.encode() {
        Ok(encoded) => {
            let _ = frames_tx.send(encoded);
        }
        Err(e) => log::warn!("frame encode failed: {e}"),
    }
}
