//! Whole-app flow: two participants share one todo list over a relay.

use std::time::Duration;

use lofi_replica::observe::ObserveKind;
use lofi_replica::relay::{Relay, RelayConfig};
use lofi_replica::scope::{ManagerConfig, ScopeHandle, ScopeManager, SHARED_SCOPE};
use lofi_todo::TodoList;
use tokio::time::timeout;

async fn start_relay() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let relay = Relay::new(RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
    });
    tokio::spawn(async move {
        relay.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

fn manager(endpoint: &str) -> ScopeManager {
    ScopeManager::new(ManagerConfig {
        endpoints: vec![endpoint.to_string()],
        ..ManagerConfig::default()
    })
}

async fn poll_until<F>(scope: &ScopeHandle, what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let outcome = timeout(Duration::from_secs(5), async {
        loop {
            scope.poll().unwrap();
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(outcome.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn buy_milk_round_trip() {
    let endpoint = start_relay().await;

    let alice = manager(&endpoint);
    let bob = manager(&endpoint);

    let scope_a = alice.acquire(SHARED_SCOPE);
    let scope_b = bob.acquire(SHARED_SCOPE);

    let todos_a = TodoList::new(&scope_a).unwrap();
    let todos_b = TodoList::new(&scope_b).unwrap();
    let obs_b = todos_b.observe(ObserveKind::Shallow);

    tokio::time::sleep(Duration::from_millis(150)).await;
    scope_a.poll().unwrap();
    scope_b.poll().unwrap();

    // Alice adds; the edit lands on Bob's replica and dirties his view.
    todos_a.add("buy milk");
    poll_until(&scope_b, "item to arrive", || !todos_b.is_empty()).await;
    assert!(obs_b.take());
    assert_eq!(todos_b.items()[0].text, "buy milk");
    assert!(!todos_b.items()[0].done);

    // Bob marks it done; the toggle flows back to Alice.
    todos_b.set_done(0, true);
    poll_until(&scope_a, "toggle to flow back", || {
        scope_b.poll().unwrap();
        todos_a.items().first().map(|i| i.done).unwrap_or(false)
    })
    .await;
    assert_eq!(todos_a.items()[0].text, "buy milk");
}

#[tokio::test]
async fn concurrent_adds_converge() {
    let endpoint = start_relay().await;

    let alice = manager(&endpoint);
    let bob = manager(&endpoint);

    let scope_a = alice.acquire(SHARED_SCOPE);
    let scope_b = bob.acquire(SHARED_SCOPE);

    let todos_a = TodoList::new(&scope_a).unwrap();
    let todos_b = TodoList::new(&scope_b).unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    scope_a.poll().unwrap();
    scope_b.poll().unwrap();

    todos_a.add("from alice");
    todos_b.add("from bob");
    todos_a.add("alice again");

    poll_until(&scope_b, "bob to see all three", || {
        scope_a.poll().unwrap();
        todos_b.len() == 3
    })
    .await;
    poll_until(&scope_a, "alice to see all three", || todos_a.len() == 3).await;

    let mut texts_a: Vec<String> = todos_a.items().into_iter().map(|i| i.text).collect();
    let mut texts_b: Vec<String> = todos_b.items().into_iter().map(|i| i.text).collect();
    texts_a.sort();
    texts_b.sort();
    assert_eq!(texts_a, texts_b);
}

#[tokio::test]
async fn clear_completed_syncs() {
    let endpoint = start_relay().await;

    let alice = manager(&endpoint);
    let bob = manager(&endpoint);

    let scope_a = alice.acquire(SHARED_SCOPE);
    let scope_b = bob.acquire(SHARED_SCOPE);

    let todos_a = TodoList::new(&scope_a).unwrap();
    let todos_b = TodoList::new(&scope_b).unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    scope_a.poll().unwrap();
    scope_b.poll().unwrap();

    for text in ["a", "b", "c"] {
        todos_a.add(text);
    }
    poll_until(&scope_b, "items to arrive", || todos_b.len() == 3).await;

    todos_b.set_done(0, true);
    todos_b.set_done(2, true);
    assert_eq!(todos_b.clear_completed(), 2);

    poll_until(&scope_a, "clear to propagate", || {
        scope_b.poll().unwrap();
        todos_a.len() == 1
    })
    .await;
    assert_eq!(todos_a.items()[0].text, "b");
}
