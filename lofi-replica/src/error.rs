//! Error taxonomy for the replica layer.
//!
//! Three classes of failure, handled differently:
//!
//! - Configuration errors (`KindMismatch`, `NotConnected`, `ScopeNotLive`)
//!   are returned synchronously to the caller and are fatal to that call
//!   only.
//! - Attachment failures (persistence or transport failing to come up)
//!   never surface as `Err` from [`crate::scope::ScopeManager::acquire`];
//!   they arrive later as warning events from `poll` while the replica
//!   keeps working in memory.
//! - Transient I/O failures are owned by the respective collaborator;
//!   the core only tolerates delayed or dropped delivery.

use thiserror::Error;

use crate::container::ContainerKind;

/// Errors reported synchronously by the replica layer.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// A container name was re-requested under a different kind.
    ///
    /// Kinds are never silently coerced: the first accessor call for a
    /// name fixes its kind for the lifetime of the replica.
    #[error("container {name:?} was opened as {existing}, requested as {requested}")]
    KindMismatch {
        name: String,
        existing: ContainerKind,
        requested: ContainerKind,
    },

    /// The scope has been fully released; its replica is retired.
    #[error("scope {0:?} is not live")]
    ScopeNotLive(String),

    /// Presence was requested on a scope with no transport attached.
    ///
    /// Deliberately distinct from "no peers": an empty presence mapping
    /// means nobody is broadcasting, this error means nobody could be.
    #[error("scope {0:?} has no transport attached")]
    NotConnected(String),

    /// The merge engine rejected an update payload.
    #[error("invalid update payload: {0}")]
    InvalidUpdate(String),

    /// Wire envelope encode/decode failure.
    #[error(transparent)]
    Protocol(#[from] crate::protocol::ProtocolError),

    /// Durable store failure.
    #[error(transparent)]
    Store(#[from] crate::persistence::StoreError),
}
