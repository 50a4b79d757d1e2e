//! Integration tests for broadcast between sibling managers.

use jasper_core::{MemoryStore, Replica, TargetRegistry};
use jasper_sync::{Channel, Initial, Manager, ManagerConfigBuilder, ManagerIds, MemoryHub};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn sibling(
    hub: &MemoryHub,
    store: &MemoryStore,
    replica: &str,
) -> jasper_sync::ManagerBuilder<String> {
    Manager::builder(Initial::value("initial".to_string()))
        .with_config(ManagerConfigBuilder::new().poll_period(None).build())
        .ids(ManagerIds::new())
        .registry(TargetRegistry::new().with_memory(store.clone()))
        .replica(Replica::new(store.target(replica)))
        .channel(hub.endpoint())
}

#[tokio::test]
async fn test_value_reaches_sibling_without_echo() {
    let hub = MemoryHub::new();
    let store = MemoryStore::new();

    let a_updates = Arc::new(AtomicUsize::new(0));
    let a_counter = a_updates.clone();
    let a = sibling(&hub, &store, "a")
        .on_value_update(move |_: &String| {
            a_counter.fetch_add(1, Ordering::SeqCst);
        })
        .start()
        .await
        .unwrap();

    let b_seen = Arc::new(Mutex::new(Vec::new()));
    let b_sink = b_seen.clone();
    let b = sibling(&hub, &store, "b")
        .on_value_update(move |value: &String| b_sink.lock().push(value.clone()))
        .start()
        .await
        .unwrap();
    a.settled().await.unwrap();
    b.settled().await.unwrap();
    let b_target = store.target("b");
    b_target.reset_counters();

    a.set_value("hello".to_string()).unwrap();
    a.settled().await.unwrap();

    eventually(|| b.value() == "hello").await;
    b.settled().await.unwrap();

    assert_eq!(*b_seen.lock(), vec!["hello".to_string()]);
    assert_eq!(a_updates.load(Ordering::SeqCst), 0);
    // A broadcast value is never pushed by the receiver.
    assert_eq!(b_target.writes(), 0);
    assert_eq!(
        store.target("a").peek_value::<String>().as_deref(),
        Some("hello")
    );
}

#[tokio::test]
async fn test_replica_set_change_reaches_sibling() {
    let hub = MemoryHub::new();
    let store = MemoryStore::new();

    let a = sibling(&hub, &store, "shared").start().await.unwrap();
    let b = sibling(&hub, &store, "shared").start().await.unwrap();
    a.settled().await.unwrap();
    b.settled().await.unwrap();

    a.add_replica(Replica::new(store.target("backup")))
        .await
        .unwrap();

    eventually(|| b.replica_states().len() == 2).await;
    let ids: Vec<_> = b
        .replica_states()
        .iter()
        .map(|state| state.target["id"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(ids, vec!["shared".to_string(), "backup".to_string()]);
}

#[tokio::test]
async fn test_undecodable_messages_are_dropped() {
    let hub = MemoryHub::new();
    let store = MemoryStore::new();
    let manager = sibling(&hub, &store, "a").start().await.unwrap();
    manager.settled().await.unwrap();

    let outsider = hub.endpoint();
    outsider.post("not json".to_string()).await.unwrap();
    outsider
        .post(r#"{"type":"VALUE","value":"from-outside"}"#.to_string())
        .await
        .unwrap();

    eventually(|| manager.value() == "from-outside").await;
    assert!(!manager.is_stopped());
}
