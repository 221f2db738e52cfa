//! Ephemeral presence over a scope's awareness channel.
//!
//! Presence is per-participant, wholesale-replace state that lives
//! outside the merge-engine document: it is never persisted and
//! evaporates when a participant disconnects. Each scope carries one
//! [`AwarenessChannel`]; views onto it are obtained through
//! [`Presence::observe`].
//!
//! A participant with an empty payload is indistinguishable from an
//! absent one. Snapshots therefore filter empty payloads, and setting
//! local presence to `{}` reads as withdrawing it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use uuid::Uuid;

/// A participant's presence payload. Schema-free JSON object.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Shared per-scope presence state.
///
/// Remote states arrive via [`AwarenessChannel::apply_remote`] (driven
/// by the scope manager's poll loop); local state leaves through the
/// outgoing sender wired to the transport binding.
pub struct AwarenessChannel {
    local_id: Uuid,
    states: Mutex<HashMap<Uuid, Payload>>,
    local: Mutex<Payload>,
    /// Bumped on every change; views compare against it to detect churn.
    generation: AtomicU64,
    outgoing: mpsc::UnboundedSender<Payload>,
    connected: Arc<AtomicBool>,
}

impl AwarenessChannel {
    pub(crate) fn new(
        local_id: Uuid,
        outgoing: mpsc::UnboundedSender<Payload>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            local_id,
            states: Mutex::new(HashMap::new()),
            local: Mutex::new(Payload::new()),
            generation: AtomicU64::new(0),
            outgoing,
            connected,
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Current local payload.
    pub fn local_state(&self) -> Payload {
        self.local.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the local payload wholesale and broadcast it. While the
    /// scope is offline the broadcast is skipped; the stored payload
    /// rides along with the Join frame once a connection comes up.
    pub fn set_local(&self, payload: Payload) {
        {
            let mut local = self.local.lock().unwrap_or_else(|e| e.into_inner());
            *local = payload.clone();
        }
        self.bump();
        if self.connected.load(Ordering::Acquire) {
            // Receiver dropped means the transport is tearing down.
            let _ = self.outgoing.send(payload);
        } else {
            log::debug!("presence update held until connect");
        }
    }

    /// Integrate a remote participant's payload. `None` removes the
    /// participant (clean leave or timeout).
    pub(crate) fn apply_remote(&self, from: Uuid, payload: Option<Payload>) {
        if from == self.local_id {
            return;
        }
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        match payload {
            Some(p) => {
                states.insert(from, p);
            }
            None => {
                states.remove(&from);
            }
        }
        drop(states);
        self.bump();
    }

    /// Drop all remote state, as on disconnect.
    pub(crate) fn clear_remote(&self) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if states.is_empty() {
            return;
        }
        states.clear();
        drop(states);
        self.bump();
    }

    fn snapshot(&self, include_self: bool) -> Vec<(Uuid, Payload)> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<(Uuid, Payload)> = states
            .iter()
            .filter(|(_, p)| !p.is_empty())
            .map(|(id, p)| (*id, p.clone()))
            .collect();
        drop(states);
        if include_self {
            let local = self.local.lock().unwrap_or_else(|e| e.into_inner());
            if !local.is_empty() {
                out.push((self.local_id, local.clone()));
            }
        }
        out.sort_by_key(|(id, _)| *id);
        out
    }
}

/// Presence surface of one networked scope.
#[derive(Clone)]
pub struct Presence {
    channel: Arc<AwarenessChannel>,
}

/// Options for [`Presence::observe`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PresenceOptions {
    /// Include the local participant in snapshots. Off by default: most
    /// UIs render "who else is here".
    pub include_self: bool,
}

impl Presence {
    pub(crate) fn new(channel: Arc<AwarenessChannel>) -> Self {
        Self { channel }
    }

    /// Local participant identity on this channel.
    pub fn local_id(&self) -> Uuid {
        self.channel.local_id
    }

    /// Replace the local payload wholesale.
    pub fn set_local(&self, payload: Payload) {
        self.channel.set_local(payload);
    }

    /// Open a view that tracks roster churn.
    pub fn observe(&self, options: PresenceOptions) -> PresenceView {
        PresenceView {
            channel: self.channel.clone(),
            include_self: options.include_self,
            seen: AtomicU64::new(u64::MAX),
        }
    }
}

/// A roster view with change detection.
///
/// [`PresenceView::changed`] is level-triggered against the channel's
/// generation counter: intermediate states between two calls collapse,
/// like document observations do.
pub struct PresenceView {
    channel: Arc<AwarenessChannel>,
    include_self: bool,
    seen: AtomicU64,
}

impl PresenceView {
    /// Current roster, sorted by participant id, empty payloads
    /// filtered out.
    pub fn snapshot(&self) -> Vec<(Uuid, Payload)> {
        self.seen
            .store(self.channel.generation.load(Ordering::Acquire), Ordering::Release);
        self.channel.snapshot(self.include_self)
    }

    /// Whether the roster changed since the last [`snapshot`](Self::snapshot).
    /// A fresh view reports changed so callers render the initial state.
    pub fn changed(&self) -> bool {
        self.channel.generation.load(Ordering::Acquire) != self.seen.load(Ordering::Acquire)
    }
}
