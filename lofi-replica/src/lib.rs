//! # lofi-replica — Replica lifecycle and reactive bindings for local-first apps
//!
//! Wraps a CRDT merge engine behind named *scopes*: refcounted,
//! singleton-per-process replicas with optional persistence and relay
//! sync, plus coalescing change observation and an ephemeral presence
//! roster.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐ acquire/poll ┌──────────────┐    WebSocket    ┌──────────┐
//! │ Application  │ ◄───────────► │ ScopeManager │ ◄──────────────► │  Relay   │
//! │ (UI thread)  │               │  (registry)  │   Binary Proto  │ (rooms)  │
//! └──────┬───────┘               └──────┬───────┘                 └────┬─────┘
//!        │ Observation                  │                              │
//!        ▼                              ▼                              ▼
//! ┌──────────────┐               ┌──────────────┐                ┌──────────┐
//! │ Containers   │               │ UpdateStore  │                │ authority│
//! │ (map/list/   │               │ (RocksDB)    │                │ Doc +    │
//! │  text roots) │               └──────────────┘                │ roster   │
//! └──────────────┘                                               └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`scope`] — acquisition, refcounting, poll-driven integration
//! - [`container`] — replica handle and named root containers
//! - [`observe`] — coalescing change observation (shallow/deep)
//! - [`presence`] — wholesale-replace presence with roster views
//! - [`protocol`] — binary wire envelope (bincode-encoded)
//! - [`transport`] — WebSocket client binding with offline queue
//! - [`relay`] — scope-routed rendezvous server
//! - [`persistence`] — RocksDB update log with snapshot compaction
//!
//! ## Threading model
//!
//! All I/O runs on tokio tasks, but nothing they receive touches a
//! document directly: results queue on a per-scope channel and are
//! integrated when the application calls `poll`, so observation
//! callbacks always fire on the polling thread.

pub mod container;
pub mod error;
pub mod observe;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod scope;
pub mod transport;

// Re-exports for convenience
pub use container::{ContainerKind, Replica};
pub use error::ReplicaError;
pub use observe::{Observation, ObserveKind};
pub use persistence::{ScopeRecord, StoreConfig, StoreError, UpdateStore};
pub use presence::{Payload, Presence, PresenceOptions, PresenceView};
pub use protocol::{MessageType, ProtocolError, WireMessage};
pub use relay::{Relay, RelayConfig};
pub use scope::{
    ManagerConfig, ScopeEvent, ScopeHandle, ScopeManager, ScopeOptions, DEFAULT_SCOPE,
    SHARED_SCOPE,
};
pub use transport::{OfflineQueue, TransportBinding};
