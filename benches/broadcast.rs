//! Broadcast fan-out benchmarks
//!
//! Measures `Hub::broadcast_event` throughput against subscriber tables of
//! increasing size, with each subscriber holding a filter for its own slice
//! of the tree.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Map, Value};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use galena::{Hub, MemoryStore, Store};

fn bench_broadcast(c: &mut Criterion) {
    let rt = Runtime::new().expect("failed to build runtime");

    let mut group = c.benchmark_group("broadcast_event");
    for &count in &[10usize, 100, 1000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(
            BenchmarkId::new("subscribers", count),
            &count,
            |b, &count| {
                // Keep the sink receivers alive so subscribers stay registered.
                let (hub, _sinks) = rt.block_on(setup(count));

                b.iter(|| {
                    for i in 0..count {
                        hub.broadcast_event(
                            &format!(".users[{i}].status"),
                            &json!("away"),
                            "update",
                        );
                    }
                });

                rt.block_on(hub.shutdown());
            },
        );
    }
    group.finish();
}

async fn setup(count: usize) -> (Arc<Hub>, Vec<mpsc::Receiver<bytes::Bytes>>) {
    let store = MemoryStore::new();
    let users: Vec<Value> = (0..count)
        .map(|i| json!({"id": i, "name": format!("User{i}"), "status": "online"}))
        .collect();
    let mut root = Map::new();
    root.insert("users".to_string(), Value::Array(users));
    store.initialize(root).await.expect("initialize failed");

    let hub = Hub::new(Arc::new(store) as Arc<dyn Store>);

    // Register subscribers concurrently; each waits out the connected-frame
    // flush delay, so sequential registration would dominate setup time.
    let handles: Vec<_> = (0..count)
        .map(|i| {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                let (tx, rx) = mpsc::channel(128);
                hub.add_subscriber(tx, &[format!(".users[{i}].status")], false)
                    .await
                    .expect("add_subscriber failed");
                rx
            })
        })
        .collect();

    let mut sinks = Vec::with_capacity(count);
    for handle in handles {
        sinks.push(handle.await.expect("subscriber task panicked"));
    }

    (hub, sinks)
}

criterion_group!(benches, bench_broadcast);
criterion_main!(benches);
