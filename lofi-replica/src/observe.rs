//! Change observation over root containers.
//!
//! An [`Observation`] is a coalescing dirty flag bound to one root
//! container. Engine callbacks run synchronously inside the committing
//! transaction, so the callback does nothing but set the flag; readers
//! consume it from their own loop via [`Observation::take`]. Any number
//! of writes between two `take` calls collapse into a single signal.
//!
//! Granularity:
//!   * [`ObserveKind::None`]    - no subscription at all.
//!   * [`ObserveKind::Shallow`] - direct children of the container only.
//!   * [`ObserveKind::Deep`]    - the container and everything nested
//!                                below it.
//!
//! Dropping an observation (or calling [`Observation::unsubscribe`])
//! severs the engine callback; a severed observation never dirties
//! again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use yrs::{ArrayRef, DeepObservable, MapRef, Observable, TextRef};

/// How much of a container's subtree an observation watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObserveKind {
    /// Do not observe.
    None,
    /// Direct mutations of the container itself.
    #[default]
    Shallow,
    /// Mutations anywhere in the container's subtree.
    Deep,
}

/// A live subscription with a consumable dirty flag.
///
/// The engine subscription is held internally; dropping the observation
/// unsubscribes.
pub struct Observation {
    dirty: Arc<AtomicBool>,
    sub: Option<yrs::Subscription>,
}

impl Observation {
    /// Observe a root map.
    pub fn map(target: &MapRef, kind: ObserveKind) -> Self {
        let dirty = Arc::new(AtomicBool::new(false));
        let sub = match kind {
            ObserveKind::None => None,
            ObserveKind::Shallow => {
                let flag = dirty.clone();
                Some(target.observe(move |_txn, _event| {
                    flag.store(true, Ordering::Release);
                }))
            }
            ObserveKind::Deep => {
                let flag = dirty.clone();
                Some(target.observe_deep(move |_txn, _events| {
                    flag.store(true, Ordering::Release);
                }))
            }
        };
        Self { dirty, sub }
    }

    /// Observe a root list.
    pub fn list(target: &ArrayRef, kind: ObserveKind) -> Self {
        let dirty = Arc::new(AtomicBool::new(false));
        let sub = match kind {
            ObserveKind::None => None,
            ObserveKind::Shallow => {
                let flag = dirty.clone();
                Some(target.observe(move |_txn, _event| {
                    flag.store(true, Ordering::Release);
                }))
            }
            ObserveKind::Deep => {
                let flag = dirty.clone();
                Some(target.observe_deep(move |_txn, _events| {
                    flag.store(true, Ordering::Release);
                }))
            }
        };
        Self { dirty, sub }
    }

    /// Observe a root text. Text has no nested containers, so shallow
    /// and deep behave identically.
    pub fn text(target: &TextRef, kind: ObserveKind) -> Self {
        let dirty = Arc::new(AtomicBool::new(false));
        let sub = match kind {
            ObserveKind::None => None,
            ObserveKind::Shallow | ObserveKind::Deep => {
                let flag = dirty.clone();
                Some(target.observe(move |_txn, _event| {
                    flag.store(true, Ordering::Release);
                }))
            }
        };
        Self { dirty, sub }
    }

    /// Consume the dirty flag. Returns `true` at most once per burst of
    /// writes; the caller re-reads the container when it does.
    pub fn take(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Peek at the dirty flag without consuming it.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Sever the engine subscription early. Idempotent.
    pub fn unsubscribe(&mut self) {
        self.sub = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Replica;
    use yrs::{Any, Array, Map, MapPrelim, Out, Transact};

    #[test]
    fn shallow_fires_on_direct_insert() {
        let replica = Replica::new("test");
        let map = replica.map("m").unwrap();
        let obs = Observation::map(&map, ObserveKind::Shallow);

        assert!(!obs.take());
        {
            let mut txn = replica.doc().transact_mut();
            map.insert(&mut txn, "k", 1i64);
        }
        assert!(obs.take());
        // Consumed; no further writes, no further signal.
        assert!(!obs.take());
    }

    #[test]
    fn burst_of_writes_coalesces_into_one_signal() {
        let replica = Replica::new("test");
        let list = replica.list("l").unwrap();
        let obs = Observation::list(&list, ObserveKind::Shallow);

        {
            let mut txn = replica.doc().transact_mut();
            list.push_back(&mut txn, "a");
            list.push_back(&mut txn, "b");
        }
        {
            let mut txn = replica.doc().transact_mut();
            list.push_back(&mut txn, "c");
        }
        assert!(obs.take());
        assert!(!obs.take());
    }

    #[test]
    fn shallow_ignores_nested_mutation() {
        let replica = Replica::new("test");
        let list = replica.list("l").unwrap();

        let nested = {
            let mut txn = replica.doc().transact_mut();
            list.push_back(&mut txn, MapPrelim::default())
        };
        let obs = Observation::list(&list, ObserveKind::Shallow);

        {
            let mut txn = replica.doc().transact_mut();
            nested.insert(&mut txn, "done", true);
        }
        assert!(!obs.take());
    }

    #[test]
    fn deep_sees_nested_mutation() {
        let replica = Replica::new("test");
        let list = replica.list("l").unwrap();

        let nested = {
            let mut txn = replica.doc().transact_mut();
            list.push_back(&mut txn, MapPrelim::default())
        };
        let obs = Observation::list(&list, ObserveKind::Deep);
        // The push happened before subscribing; start clean.
        let _ = obs.take();

        {
            let mut txn = replica.doc().transact_mut();
            nested.insert(&mut txn, "done", true);
        }
        assert!(obs.take());
    }

    #[test]
    fn none_never_dirties() {
        let replica = Replica::new("test");
        let map = replica.map("m").unwrap();
        let obs = Observation::map(&map, ObserveKind::None);

        {
            let mut txn = replica.doc().transact_mut();
            map.insert(&mut txn, "k", 1i64);
        }
        assert!(!obs.is_dirty());
        assert!(!obs.take());
    }

    #[test]
    fn unsubscribe_severs_the_callback() {
        let replica = Replica::new("test");
        let map = replica.map("m").unwrap();
        let mut obs = Observation::map(&map, ObserveKind::Shallow);
        obs.unsubscribe();

        {
            let mut txn = replica.doc().transact_mut();
            map.insert(&mut txn, "k", 1i64);
        }
        assert!(!obs.take());
    }

    #[test]
    fn drop_severs_the_callback() {
        let replica = Replica::new("test");
        let map = replica.map("m").unwrap();
        let obs = Observation::map(&map, ObserveKind::Shallow);
        drop(obs);

        // Mutating after drop must not touch freed state.
        let mut txn = replica.doc().transact_mut();
        map.insert(&mut txn, "k", 1i64);
    }

    #[test]
    fn remote_update_dirties_observer() {
        let src = Replica::new("test");
        let src_map = src.map("m").unwrap();
        {
            let mut txn = src.doc().transact_mut();
            src_map.insert(&mut txn, "k", "v");
        }

        let dst = Replica::new("test");
        let dst_map = dst.map("m").unwrap();
        let obs = Observation::map(&dst_map, ObserveKind::Shallow);

        dst.apply_update(&src.encode_state()).unwrap();
        assert!(obs.take());

        let txn = dst.doc().transact();
        assert_eq!(dst_map.get(&txn, "k"), Some(Out::Any(Any::from("v"))));
    }

    #[test]
    fn text_observation_fires_on_edit() {
        use yrs::Text;

        let replica = Replica::new("test");
        let text = replica.text("t").unwrap();
        let obs = Observation::text(&text, ObserveKind::Shallow);

        {
            let mut txn = replica.doc().transact_mut();
            text.insert(&mut txn, 0, "hello");
        }
        assert!(obs.take());
    }
}
