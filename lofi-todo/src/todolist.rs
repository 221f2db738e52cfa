//! Shared todo list over a scope replica.
//!
//! Items live in the root list `todolist` as plain value maps
//! (`{text, done}`), not nested containers: toggling an item replaces
//! the whole entry in one transaction, so a shallow observer on the
//! list sees every kind of change as a single signal.

use std::collections::HashMap;

use lofi_replica::container::Replica;
use lofi_replica::error::ReplicaError;
use lofi_replica::observe::{Observation, ObserveKind};
use yrs::{Any, Array, ArrayRef, Out, Transact};

const LIST_NAME: &str = "todolist";

/// A decoded todo entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoItem {
    pub text: String,
    pub done: bool,
}

/// Handle onto the shared list.
pub struct TodoList {
    replica: Replica,
    items: ArrayRef,
}

impl TodoList {
    pub fn new(replica: &Replica) -> Result<Self, ReplicaError> {
        let items = replica.list(LIST_NAME)?;
        Ok(Self {
            replica: replica.clone(),
            items,
        })
    }

    /// Watch the list for changes.
    pub fn observe(&self, kind: ObserveKind) -> Observation {
        Observation::list(&self.items, kind)
    }

    /// Append a new open item.
    pub fn add(&self, text: &str) {
        let mut txn = self.replica.doc().transact_mut();
        self.items.push_back(&mut txn, entry(text, false));
    }

    /// Mark an item done or open. Out-of-range indices are ignored;
    /// a concurrent removal may shrink the list under us.
    pub fn set_done(&self, index: u32, done: bool) {
        let mut txn = self.replica.doc().transact_mut();
        let Some(current) = self.items.get(&txn, index) else {
            return;
        };
        let text = decode(&current).map(|i| i.text).unwrap_or_default();
        // Replace inside one transaction: observers see one change.
        self.items.remove_range(&mut txn, index, 1);
        self.items.insert(&mut txn, index, entry(&text, done));
    }

    /// Rewrite an item's text, keeping its done flag.
    pub fn edit(&self, index: u32, text: &str) {
        let mut txn = self.replica.doc().transact_mut();
        let Some(current) = self.items.get(&txn, index) else {
            return;
        };
        let done = decode(&current).map(|i| i.done).unwrap_or(false);
        self.items.remove_range(&mut txn, index, 1);
        self.items.insert(&mut txn, index, entry(text, done));
    }

    /// Remove one item.
    pub fn remove(&self, index: u32) {
        let mut txn = self.replica.doc().transact_mut();
        if index < self.items.len(&txn) {
            self.items.remove_range(&mut txn, index, 1);
        }
    }

    /// Drop every completed item in one transaction. Walks with an
    /// offset because each removal shifts the indices that follow.
    pub fn clear_completed(&self) -> u32 {
        let mut txn = self.replica.doc().transact_mut();
        let snapshot: Vec<bool> = (0..self.items.len(&txn))
            .map(|i| {
                self.items
                    .get(&txn, i)
                    .and_then(|v| decode(&v))
                    .map(|item| item.done)
                    .unwrap_or(false)
            })
            .collect();

        let mut offset = 0u32;
        let mut removed = 0u32;
        for (i, done) in snapshot.into_iter().enumerate() {
            if done {
                self.items.remove_range(&mut txn, i as u32 - offset, 1);
                offset += 1;
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> u32 {
        let txn = self.replica.doc().transact();
        self.items.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode the whole list. Entries that are not well-formed item
    /// maps are skipped.
    pub fn items(&self) -> Vec<TodoItem> {
        let txn = self.replica.doc().transact();
        (0..self.items.len(&txn))
            .filter_map(|i| self.items.get(&txn, i).as_ref().and_then(decode))
            .collect()
    }
}

fn entry(text: &str, done: bool) -> Any {
    let mut map = HashMap::new();
    map.insert("text".to_string(), Any::from(text));
    map.insert("done".to_string(), Any::Bool(done));
    Any::from(map)
}

fn decode(value: &Out) -> Option<TodoItem> {
    let Out::Any(Any::Map(map)) = value else {
        return None;
    };
    let text = match map.get("text") {
        Some(Any::String(s)) => s.to_string(),
        _ => return None,
    };
    let done = matches!(map.get("done"), Some(Any::Bool(true)));
    Some(TodoItem { text, done })
}
