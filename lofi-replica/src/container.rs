//! Replica handle and named root container access.
//!
//! A [`Replica`] wraps one merge-engine document. Root containers are
//! obtained by name and kind; the first access of a name fixes its kind
//! for the life of the replica, and any later request under a different
//! kind is rejected instead of silently aliasing the same root.
//!
//! Container handles returned here are cheap clones of the engine's own
//! refs; requesting the same name twice yields handles onto the same
//! underlying root, so mutations through one are visible through the
//! other.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ArrayRef, Doc, MapRef, ReadTxn, StateVector, TextRef, Transact, Update};

use crate::error::ReplicaError;

/// Kind of a named root container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Map,
    List,
    Text,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKind::Map => write!(f, "map"),
            ContainerKind::List => write!(f, "list"),
            ContainerKind::Text => write!(f, "text"),
        }
    }
}

/// A handle onto one scope's document.
///
/// Clones share the same underlying document and kind registry, so a
/// replica can be handed to collaborators (persistence, transport, UI)
/// without coordination.
#[derive(Clone)]
pub struct Replica {
    doc: Doc,
    scope: Arc<str>,
    kinds: Arc<Mutex<HashMap<String, ContainerKind>>>,
    live: Arc<AtomicBool>,
}

impl Replica {
    pub fn new(scope: &str) -> Self {
        Self {
            doc: Doc::new(),
            scope: Arc::from(scope),
            kinds: Arc::new(Mutex::new(HashMap::new())),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Scope this replica belongs to.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Whether the owning scope is still acquired. A retired replica's
    /// containers remain readable but no longer sync or persist.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn retire(&self) {
        self.live.store(false, Ordering::Release);
    }

    /// Underlying merge-engine document, for observation wiring and
    /// direct transactions.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Named root map. Creates it on first access.
    pub fn map(&self, name: &str) -> Result<MapRef, ReplicaError> {
        self.register(name, ContainerKind::Map)?;
        Ok(self.doc.get_or_insert_map(name))
    }

    /// Named root list. Creates it on first access.
    pub fn list(&self, name: &str) -> Result<ArrayRef, ReplicaError> {
        self.register(name, ContainerKind::List)?;
        Ok(self.doc.get_or_insert_array(name))
    }

    /// Named root text. Creates it on first access.
    pub fn text(&self, name: &str) -> Result<TextRef, ReplicaError> {
        self.register(name, ContainerKind::Text)?;
        Ok(self.doc.get_or_insert_text(name))
    }

    fn register(&self, name: &str, requested: ContainerKind) -> Result<(), ReplicaError> {
        let mut kinds = self.kinds.lock().unwrap_or_else(|e| e.into_inner());
        match kinds.get(name) {
            Some(&existing) if existing != requested => Err(ReplicaError::KindMismatch {
                name: name.to_string(),
                existing,
                requested,
            }),
            Some(_) => Ok(()),
            None => {
                kinds.insert(name.to_string(), requested);
                Ok(())
            }
        }
    }

    /// Full document state as a v1 update against the empty state.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Current state vector, for sync handshakes.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// State the remote is missing, given its encoded state vector.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| ReplicaError::InvalidUpdate(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply a v1 update produced by another replica of this scope.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), ReplicaError> {
        let update =
            Update::decode_v1(update).map_err(|e| ReplicaError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| ReplicaError::InvalidUpdate(e.to_string()))
    }

    /// Apply an update under a named transaction origin. Origins mark
    /// where an update entered the document so downstream observers can
    /// tell local edits from replayed or relayed ones.
    pub(crate) fn apply_tagged(&self, update: &[u8], origin: &'static str) -> Result<(), ReplicaError> {
        let update =
            Update::decode_v1(update).map_err(|e| ReplicaError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(origin);
        txn.apply_update(update)
            .map_err(|e| ReplicaError::InvalidUpdate(e.to_string()))
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("scope", &self.scope)
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Any, Array, Map};

    #[test]
    fn same_name_resolves_to_same_root() {
        let replica = Replica::new("test");
        let a = replica.map("settings").unwrap();
        let b = replica.map("settings").unwrap();

        {
            let mut txn = replica.doc().transact_mut();
            a.insert(&mut txn, "theme", "dark");
        }
        let txn = replica.doc().transact();
        assert_eq!(b.get(&txn, "theme"), Some(yrs::Out::Any(Any::from("dark"))));
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let replica = Replica::new("test");
        replica.map("items").unwrap();

        match replica.list("items") {
            Err(ReplicaError::KindMismatch {
                name,
                existing,
                requested,
            }) => {
                assert_eq!(name, "items");
                assert_eq!(existing, ContainerKind::Map);
                assert_eq!(requested, ContainerKind::List);
            }
            other => panic!("expected kind mismatch, got {other:?}"),
        }
        // The original kind is still accessible.
        assert!(replica.map("items").is_ok());
    }

    #[test]
    fn distinct_names_carry_distinct_kinds() {
        let replica = Replica::new("test");
        assert!(replica.map("a").is_ok());
        assert!(replica.list("b").is_ok());
        assert!(replica.text("c").is_ok());
    }

    #[test]
    fn state_roundtrip_between_replicas() {
        let src = Replica::new("test");
        let list = src.list("todolist").unwrap();
        {
            let mut txn = src.doc().transact_mut();
            list.push_back(&mut txn, "buy milk");
        }

        let dst = Replica::new("test");
        dst.apply_update(&src.encode_state()).unwrap();

        let list = dst.list("todolist").unwrap();
        let txn = dst.doc().transact();
        assert_eq!(list.len(&txn), 1);
    }

    #[test]
    fn diff_against_remote_state_vector() {
        let src = Replica::new("test");
        let dst = Replica::new("test");

        let map = src.map("m").unwrap();
        {
            let mut txn = src.doc().transact_mut();
            map.insert(&mut txn, "k", 1i64);
        }
        dst.apply_update(&src.encode_state()).unwrap();

        // Nothing new since the exchange: the diff applies cleanly and
        // leaves the destination unchanged.
        let diff = src.encode_diff(&dst.state_vector()).unwrap();
        dst.apply_update(&diff).unwrap();

        {
            let mut txn = src.doc().transact_mut();
            map.insert(&mut txn, "k2", 2i64);
        }
        let diff = src.encode_diff(&dst.state_vector()).unwrap();
        dst.apply_update(&diff).unwrap();

        let dmap = dst.map("m").unwrap();
        let txn = dst.doc().transact();
        assert!(dmap.get(&txn, "k2").is_some());
    }

    #[test]
    fn apply_rejects_garbage() {
        let replica = Replica::new("test");
        assert!(matches!(
            replica.apply_update(&[0xde, 0xad, 0xbe, 0xef]),
            Err(ReplicaError::InvalidUpdate(_))
        ));
    }

    #[test]
    fn retire_flips_liveness() {
        let replica = Replica::new("test");
        assert!(replica.is_live());
        replica.retire();
        assert!(!replica.is_live());
        // Clones observe the same flag.
        assert!(!replica.clone().is_live());
    }
}
