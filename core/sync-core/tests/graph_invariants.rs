//! Integration tests: frame streams in arbitrary order converge to a graph
//! that satisfies the link invariant.

use std::sync::Arc;

use fleetdeck_core::{
    check_links, ManualTransport, MemoryStore, ResourceRef, Store, Subscription, SyncConfig,
    TransportEvent,
};
use serde_json::{json, Value};

fn frame(resource_type: &str, resource: Value) -> String {
    json!({
        "name": "resource.change",
        "resourceType": resource_type,
        "resourceId": resource["id"],
        "resource": resource,
    })
    .to_string()
}

fn snapshot_store(snapshot: Value) -> Arc<MemoryStore> {
    let store = MemoryStore::from_snapshot(snapshot).expect("snapshot");
    store.preload();
    Arc::new(store)
}

fn member_ids(parent: &ResourceRef, field: &str) -> Vec<String> {
    parent
        .read()
        .collection(field)
        .map(|members| members.iter().map(|m| m.id().to_string()).collect())
        .unwrap_or_default()
}

/// Every ordering of `items` (Heap's algorithm).
fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    fn heap<T: Clone>(k: usize, items: &mut Vec<T>, out: &mut Vec<Vec<T>>) {
        if k <= 1 {
            out.push(items.clone());
            return;
        }
        heap(k - 1, items, out);
        for i in 0..k - 1 {
            if k % 2 == 0 {
                items.swap(i, k - 1);
            } else {
                items.swap(0, k - 1);
            }
            heap(k - 1, items, out);
        }
    }

    let mut items = items.to_vec();
    let mut out = Vec::new();
    let len = items.len();
    heap(len, &mut items, &mut out);
    out
}

async fn replay(store: Arc<MemoryStore>, frames: &[String]) -> Subscription {
    let transport = Arc::new(ManualTransport::new());
    let mut subscription = Subscription::new(transport, store, &SyncConfig::default());
    subscription.enter(Some("1a5"));
    subscription.handle_event(TransportEvent::Connected {
        attempts: 0,
        elapsed: std::time::Duration::ZERO,
    });
    for raw in frames {
        subscription.handle_event(TransportEvent::Message(raw.clone()));
    }
    subscription.settle().await;
    subscription
}

fn cluster() -> Value {
    json!({
        "host": [
            {"id": "1h1", "instances": [{"type": "container", "id": "1i1"}]},
            {"id": "1h2", "instances": [{"type": "container", "id": "1i2"}]},
            {"id": "1h3"},
        ],
        "environment": [{"id": "1e1"}, {"id": "1e2"}],
        "container": [
            {"id": "1i1", "hosts": ["1h1"], "state": "running"},
            {"id": "1i2", "hosts": ["1h2"], "state": "running"},
        ],
    })
}

#[tokio::test]
async fn test_snapshot_starts_consistent() {
    let store = snapshot_store(cluster());
    assert!(check_links(store.as_ref(), &SyncConfig::default()).is_empty());
}

#[tokio::test]
async fn test_every_ordering_converges() {
    let frames = vec![
        frame("container", json!({"type": "container", "id": "1i1", "hosts": ["1h2"]})),
        frame("container", json!({"type": "container", "id": "1i1", "hosts": ["1h3"]})),
        frame("container", json!({"type": "container", "id": "1i2", "state": "purged"})),
        frame("container", json!({"type": "container", "id": "1i3", "hosts": ["1h1"]})),
        frame("service", json!({"type": "service", "id": "1s1", "environmentId": "1e2"})),
    ];

    for ordering in permutations(&frames) {
        let store = snapshot_store(cluster());
        replay(store.clone(), &ordering).await;

        let violations = check_links(store.as_ref(), &SyncConfig::default());
        assert!(violations.is_empty(), "violations: {:?}", violations);
    }
}

#[tokio::test]
async fn test_settled_graph_matches_last_write() {
    let store = snapshot_store(cluster());
    let frames = vec![
        frame("container", json!({"type": "container", "id": "1i1", "hosts": ["1h2"]})),
        frame("container", json!({"type": "container", "id": "1i1", "hosts": ["1h3"]})),
        frame("container", json!({"type": "container", "id": "1i2", "state": "purged"})),
    ];
    replay(store.clone(), &frames).await;

    let host = |id: &str| store.get_by_id("host", id).expect("host");
    assert!(member_ids(&host("1h1"), "instances").is_empty());
    assert!(member_ids(&host("1h2"), "instances").is_empty());
    assert_eq!(member_ids(&host("1h3"), "instances"), vec!["1i1"]);
}

#[tokio::test]
async fn test_redelivery_is_a_no_op() {
    let store = snapshot_store(cluster());
    let once = frame("container", json!({"type": "container", "id": "1i3", "hosts": ["1h1"]}));
    replay(store.clone(), &[once.clone()]).await;
    let before = member_ids(&store.get_by_id("host", "1h1").expect("host"), "instances");

    let subscription = replay(store.clone(), &[once.clone(), once.clone(), once]).await;
    let after = member_ids(&store.get_by_id("host", "1h1").expect("host"), "instances");

    assert_eq!(before, after);
    assert_eq!(subscription.stats().frames_handled, 3);
    assert!(check_links(store.as_ref(), &SyncConfig::default()).is_empty());
}

#[tokio::test]
async fn test_parent_only_on_server_is_fetched() {
    let store = Arc::new(MemoryStore::new());
    store.insert_remote(match json!({"type": "machine", "id": "1ph1"}) {
        Value::Object(map) => map,
        _ => unreachable!(),
    });
    replay(
        store.clone(),
        &[frame("host", json!({"type": "host", "id": "1h1", "physicalHostId": "1ph1"}))],
    )
    .await;

    let machine = store.get_by_id("machine", "1ph1").expect("machine fetched");
    assert_eq!(member_ids(&machine, "hosts"), vec!["1h1"]);
}

#[tokio::test]
async fn test_mount_and_balancer_flow() {
    let store = snapshot_store(json!({
        "volume": [{"id": "1v1"}],
        "loadBalancerConfig": [{"id": "1lc1"}],
    }));
    let frames = vec![
        frame("mount", json!({"type": "mount", "id": "1m1", "volumeId": "1v1", "path": "/a"})),
        frame("mount", json!({"type": "mount", "id": "1m1", "volumeId": "1v1", "path": "/b"})),
        frame(
            "loadBalancer",
            json!({"type": "loadBalancer", "id": "1lb1", "loadBalancerConfigId": "1lc1"}),
        ),
    ];
    replay(store.clone(), &frames).await;

    let volume = store.get_by_id("volume", "1v1").expect("volume");
    assert_eq!(member_ids(&volume, "mounts"), vec!["1m1"]);
    let mount = store.get_by_id("mount", "1m1").expect("mount");
    assert_eq!(mount.read().field("path"), Some(&json!("/b")));

    let config = store.get_by_id("loadBalancerConfig", "1lc1").expect("config");
    assert_eq!(member_ids(&config, "loadBalancers"), vec!["1lb1"]);

    replay(
        store.clone(),
        &[frame(
            "loadBalancer",
            json!({"type": "loadBalancer", "id": "1lb1", "state": "removed"}),
        )],
    )
    .await;
    assert!(member_ids(&config, "loadBalancers").is_empty());
    assert!(check_links(store.as_ref(), &SyncConfig::default()).is_empty());
}
