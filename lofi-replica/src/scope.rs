//! Scope lifecycle: acquisition, polling, teardown.
//!
//! A *scope* is a named collaboration boundary with its own document,
//! its own persistence, and (when networked) its own relay room and
//! presence roster. The [`ScopeManager`] guarantees one live replica
//! per scope per process: every [`ScopeManager::acquire`] of the same
//! name returns a handle onto the same replica, and the replica is torn
//! down when the last handle drops.
//!
//! ```text
//!            acquire("shared-network")
//!                      │
//!        ┌─────────────┼─────────────────┐
//!        ▼             ▼                 ▼
//!   ScopeHandle   ScopeHandle       ScopeHandle     (refs = 3)
//!        └─────────────┴─────────────────┘
//!                      │ Deref
//!                      ▼
//!                   Replica ── PersistenceBinding ── UpdateStore
//!                      │
//!                TransportBinding ── relay
//! ```
//!
//! I/O never touches the document directly. Hydration results, remote
//! updates, and presence frames arrive on a per-scope inbound channel
//! and are integrated by [`ScopeManager::poll`] on the calling thread,
//! which is what keeps observation callbacks on the thread that owns
//! the UI. Each integration is tagged with a transaction origin so the
//! persistence and transport observers can tell replayed bytes from
//! fresh local edits and break the echo loop.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::container::Replica;
use crate::error::ReplicaError;
use crate::persistence::{PersistenceBinding, StoreError, UpdateStore};
use crate::presence::{AwarenessChannel, Payload, Presence};
use crate::transport::TransportBinding;

/// Private always-available scope.
pub const DEFAULT_SCOPE: &str = "internal-private";
/// Networked scope shared through the relay.
pub const SHARED_SCOPE: &str = "shared-network";

/// Origin tag for updates replayed from the store.
pub const ORIGIN_HYDRATE: &str = "lofi:hydrate";
/// Origin tag for updates received from the relay.
pub const ORIGIN_REMOTE: &str = "lofi:remote";

/// Per-scope behavior switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeOptions {
    /// Survive process restarts via the update store.
    pub persistent: bool,
    /// Sync through the relay and carry a presence roster.
    pub networked: bool,
}

impl ScopeOptions {
    pub const PRIVATE: Self = Self {
        persistent: true,
        networked: false,
    };
    pub const NETWORKED: Self = Self {
        persistent: true,
        networked: true,
    };
    pub const EPHEMERAL: Self = Self {
        persistent: false,
        networked: false,
    };
}

/// Manager configuration.
#[derive(Clone)]
pub struct ManagerConfig {
    /// Shared update store. `None` makes every scope ephemeral.
    pub store: Option<Arc<UpdateStore>>,
    /// Relay endpoints, tried in order.
    pub endpoints: Vec<String>,
    /// Identity announced on presence rosters.
    pub participant: Uuid,
    /// Known scopes. Names not listed here come up ephemeral and
    /// private.
    pub scopes: HashMap<String, ScopeOptions>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let mut scopes = HashMap::new();
        scopes.insert(DEFAULT_SCOPE.to_string(), ScopeOptions::PRIVATE);
        scopes.insert(SHARED_SCOPE.to_string(), ScopeOptions::NETWORKED);
        Self {
            store: None,
            endpoints: Vec::new(),
            participant: Uuid::new_v4(),
            scopes,
        }
    }
}

/// Events surfaced by [`ScopeManager::poll`].
#[derive(Debug)]
pub enum ScopeEvent {
    /// Persisted state was replayed into the replica.
    Hydrated { updates: usize },
    /// Remote updates were integrated.
    RemoteApplied { updates: usize },
    /// The presence roster changed.
    PresenceChanged,
    /// The relay connection came up.
    Connected,
    /// No endpoint accepted the connection.
    ConnectFailed(String),
    /// The relay connection went down.
    Disconnected,
    /// A persistence write failed; editing continues.
    StoreFailed(StoreError),
}

/// I/O results waiting to be integrated by `poll`.
pub(crate) enum Inbound {
    Hydration(Vec<Vec<u8>>),
    RemoteUpdate(Vec<u8>),
    Presence { from: Uuid, payload: Option<Payload> },
    Connected,
    ConnectFailed(String),
    Closed,
    StoreFailed(StoreError),
}

struct ScopeEntry {
    replica: Replica,
    refs: usize,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    awareness: Option<Arc<AwarenessChannel>>,
    _persistence: Option<PersistenceBinding>,
    _transport: Option<TransportBinding>,
}

struct Inner {
    store: Option<Arc<UpdateStore>>,
    endpoints: Vec<String>,
    participant: Uuid,
    scope_options: HashMap<String, ScopeOptions>,
    scopes: Mutex<HashMap<String, ScopeEntry>>,
}

/// The replica registry. Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct ScopeManager {
    inner: Arc<Inner>,
}

impl ScopeManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: config.store,
                endpoints: config.endpoints,
                participant: config.participant,
                scope_options: config.scopes,
                scopes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Identity this process announces on presence rosters.
    pub fn participant(&self) -> Uuid {
        self.inner.participant
    }

    /// Acquire the default private scope.
    pub fn acquire_default(&self) -> ScopeHandle {
        self.acquire(DEFAULT_SCOPE)
    }

    /// Acquire a scope, creating its replica on first acquisition and
    /// returning a handle onto the existing one otherwise. The handle
    /// releases the scope when dropped.
    ///
    /// Never fails: a broken store or transport attachment degrades the
    /// scope to an in-memory replica and surfaces as a [`StoreFailed`]
    /// or [`ConnectFailed`] event on the next poll.
    ///
    /// [`StoreFailed`]: ScopeEvent::StoreFailed
    /// [`ConnectFailed`]: ScopeEvent::ConnectFailed
    pub fn acquire(&self, scope: &str) -> ScopeHandle {
        let mut scopes = self.inner.scopes.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = scopes.get_mut(scope) {
            entry.refs += 1;
            return ScopeHandle {
                manager: self.clone(),
                scope: scope.to_string(),
                replica: entry.replica.clone(),
            };
        }

        let options = self
            .inner
            .scope_options
            .get(scope)
            .copied()
            .unwrap_or(ScopeOptions::EPHEMERAL);

        let replica = Replica::new(scope);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let persistence = match (&self.inner.store, options.persistent) {
            (Some(store), true) => {
                let binding =
                    match PersistenceBinding::attach(&replica, store.clone(), inbound_tx.clone()) {
                        Ok(binding) => Some(binding),
                        Err(e) => {
                            log::warn!("scope '{scope}' continues in memory only: {e}");
                            let _ = inbound_tx.send(Inbound::StoreFailed(e));
                            None
                        }
                    };

                // Hydration runs off-thread; the replay arrives through
                // the inbound channel like any other I/O result.
                let store = store.clone();
                let scope_name = scope.to_string();
                let tx = inbound_tx.clone();
                tokio::spawn(async move {
                    let loaded = tokio::task::spawn_blocking(move || store.load_scope(&scope_name))
                        .await;
                    match loaded {
                        Ok(Ok(parts)) => {
                            let _ = tx.send(Inbound::Hydration(parts));
                        }
                        Ok(Err(e)) => {
                            let _ = tx.send(Inbound::StoreFailed(e));
                        }
                        Err(e) => log::warn!("hydration task panicked: {e}"),
                    }
                });

                binding
            }
            _ => None,
        };

        let (awareness, transport) = if options.networked {
            let (presence_tx, presence_rx) = mpsc::unbounded_channel();
            let connected = Arc::new(AtomicBool::new(false));
            let awareness = Arc::new(AwarenessChannel::new(
                self.inner.participant,
                presence_tx,
                connected.clone(),
            ));

            let transport = if self.inner.endpoints.is_empty() {
                log::info!("scope '{scope}' is networked but no endpoints configured");
                None
            } else {
                match TransportBinding::attach(
                    &replica,
                    awareness.clone(),
                    presence_rx,
                    self.inner.endpoints.clone(),
                    connected,
                    inbound_tx.clone(),
                ) {
                    Ok(binding) => Some(binding),
                    Err(e) => {
                        log::warn!("scope '{scope}' continues unconnected: {e}");
                        let _ = inbound_tx.send(Inbound::ConnectFailed(e.to_string()));
                        None
                    }
                }
            };

            (Some(awareness), transport)
        } else {
            (None, None)
        };

        log::debug!(
            "scope '{scope}' created (persistent: {}, networked: {})",
            options.persistent,
            options.networked
        );

        scopes.insert(
            scope.to_string(),
            ScopeEntry {
                replica: replica.clone(),
                refs: 1,
                inbound_rx,
                awareness,
                _persistence: persistence,
                _transport: transport,
            },
        );

        ScopeHandle {
            manager: self.clone(),
            scope: scope.to_string(),
            replica,
        }
    }

    /// Integrate pending I/O for a scope on the calling thread.
    ///
    /// Observation callbacks for any applied updates fire synchronously
    /// inside this call.
    pub fn poll(&self, scope: &str) -> Result<Vec<ScopeEvent>, ReplicaError> {
        let mut scopes = self.inner.scopes.lock().unwrap_or_else(|e| e.into_inner());
        let entry = scopes
            .get_mut(scope)
            .ok_or_else(|| ReplicaError::ScopeNotLive(scope.to_string()))?;

        let mut events = Vec::new();
        let mut remote_applied = 0usize;
        let mut presence_changed = false;

        while let Ok(inbound) = entry.inbound_rx.try_recv() {
            match inbound {
                Inbound::Hydration(parts) => {
                    let count = parts.len();
                    for part in parts {
                        if let Err(e) = entry.replica.apply_tagged(&part, ORIGIN_HYDRATE) {
                            log::warn!("scope '{scope}' skipped corrupt stored update: {e}");
                        }
                    }
                    events.push(ScopeEvent::Hydrated { updates: count });
                }
                Inbound::RemoteUpdate(update) => {
                    match entry.replica.apply_tagged(&update, ORIGIN_REMOTE) {
                        Ok(()) => remote_applied += 1,
                        Err(e) => log::warn!("scope '{scope}' dropped remote update: {e}"),
                    }
                }
                Inbound::Presence { from, payload } => {
                    if let Some(awareness) = &entry.awareness {
                        awareness.apply_remote(from, payload);
                        presence_changed = true;
                    }
                }
                Inbound::Connected => events.push(ScopeEvent::Connected),
                Inbound::ConnectFailed(reason) => events.push(ScopeEvent::ConnectFailed(reason)),
                Inbound::Closed => {
                    if let Some(awareness) = &entry.awareness {
                        awareness.clear_remote();
                        presence_changed = true;
                    }
                    events.push(ScopeEvent::Disconnected);
                }
                Inbound::StoreFailed(e) => events.push(ScopeEvent::StoreFailed(e)),
            }
        }

        if remote_applied > 0 {
            events.push(ScopeEvent::RemoteApplied {
                updates: remote_applied,
            });
        }
        if presence_changed {
            events.push(ScopeEvent::PresenceChanged);
        }

        Ok(events)
    }

    /// Presence surface of a networked scope.
    pub fn presence(&self, scope: &str) -> Result<Presence, ReplicaError> {
        let scopes = self.inner.scopes.lock().unwrap_or_else(|e| e.into_inner());
        let entry = scopes
            .get(scope)
            .ok_or_else(|| ReplicaError::ScopeNotLive(scope.to_string()))?;
        entry
            .awareness
            .clone()
            .map(Presence::new)
            .ok_or_else(|| ReplicaError::NotConnected(scope.to_string()))
    }

    /// Names of currently acquired scopes.
    pub fn live_scopes(&self) -> Vec<String> {
        let scopes = self.inner.scopes.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = scopes.keys().cloned().collect();
        names.sort();
        names
    }

    fn release(&self, scope: &str) {
        let mut scopes = self.inner.scopes.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = scopes.get_mut(scope) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            if let Some(entry) = scopes.remove(scope) {
                entry.replica.retire();
            }
            log::debug!("scope '{scope}' torn down");
        }
    }
}

/// A counted reference to one scope's replica.
///
/// Derefs to [`Replica`]; dropping it releases the scope, and the last
/// release tears the replica down.
pub struct ScopeHandle {
    manager: ScopeManager,
    scope: String,
    replica: Replica,
}

impl ScopeHandle {
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Shorthand for [`ScopeManager::poll`] on this scope.
    pub fn poll(&self) -> Result<Vec<ScopeEvent>, ReplicaError> {
        self.manager.poll(&self.scope)
    }

    /// Shorthand for [`ScopeManager::presence`] on this scope.
    pub fn presence(&self) -> Result<Presence, ReplicaError> {
        self.manager.presence(&self.scope)
    }
}

impl Deref for ScopeHandle {
    type Target = Replica;

    fn deref(&self) -> &Replica {
        &self.replica
    }
}

impl Drop for ScopeHandle {
    fn drop(&mut self) {
        self.manager.release(&self.scope);
    }
}
