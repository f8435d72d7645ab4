//! # Store Benchmarks
//!
//! Append, batch commit, traversal and recall over gnosis-core.
//!
//! Run with: `cargo bench -p gnosis-core`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use gnosis_core::{
    EntityId, EntityStore, EntityWrite, GnosisCore, MemoryType, NodeLabel, Payload, Provenance,
    SystemClock,
};
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;

fn node_write(i: usize) -> EntityWrite {
    EntityWrite::create(
        Payload::node(NodeLabel::Generic, json!({ "n": i })),
        Provenance::new(chrono::Utc::now()),
    )
}

/// A chain of `size` nodes, each linked to the next.
fn linear_store(size: usize) -> (EntityStore, EntityId) {
    let store = EntityStore::in_memory(Arc::new(SystemClock));
    let mut prev: Option<EntityId> = None;
    let mut first = None;

    for i in 0..size {
        let id = store.append(node_write(i)).expect("node").id;
        if let Some(prev) = prev {
            store
                .append(EntityWrite::create(
                    Payload::edge(prev, id, "next"),
                    Provenance::new(chrono::Utc::now()),
                ))
                .expect("edge");
        }
        first.get_or_insert(id);
        prev = Some(id);
    }

    (store, first.expect("at least one node"))
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");

    for size in [100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let store = EntityStore::in_memory(Arc::new(SystemClock));
                for i in 0..size {
                    let _ = store.append(node_write(i));
                }
                black_box(store.entity_count())
            });
        });
    }

    group.finish();
}

fn bench_commit_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit_batch");

    for size in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let store = EntityStore::in_memory(Arc::new(SystemClock));
                let writes: Vec<EntityWrite> = (0..size).map(node_write).collect();
                black_box(store.commit_batch(&writes, None))
            });
        });
    }

    group.finish();
}

fn bench_versioned_read(c: &mut Criterion) {
    let store = EntityStore::in_memory(Arc::new(SystemClock));
    let id = store.append(node_write(0)).expect("create").id;
    for i in 1..100 {
        store
            .append(EntityWrite::update_latest(
                id,
                Payload::node(NodeLabel::Generic, json!({ "n": i })),
                Provenance::new(chrono::Utc::now()),
            ))
            .expect("update");
    }

    c.bench_function("get_latest", |b| b.iter(|| black_box(store.get(id, None))));
    c.bench_function("get_version_50", |b| {
        b.iter(|| black_box(store.get(id, Some(50))))
    });
    c.bench_function("history_100", |b| b.iter(|| black_box(store.history(id))));
}

fn bench_traverse(c: &mut Criterion) {
    let mut group = c.benchmark_group("traverse");

    for size in [100, 500].iter() {
        let (store, start) = linear_store(*size);

        for depth in [10usize, 50] {
            group.bench_with_input(
                BenchmarkId::new(format!("depth_{}", depth), size),
                &depth,
                |b, &depth| {
                    b.iter(|| {
                        let graph = store.graph();
                        black_box(graph.traverse(start, depth, |_| true).count())
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_recall(c: &mut Criterion) {
    let mut group = c.benchmark_group("recall");

    for size in [100, 1000].iter() {
        let core = GnosisCore::in_memory().expect("core");
        for i in 0..*size {
            core.memory()
                .store(
                    MemoryType::Semantic,
                    json!({ "fact": format!("river {} flows east", i) }),
                    None,
                )
                .expect("store");
        }

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(core.memory().recall("river east", 10, None)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_append,
    bench_commit_batch,
    bench_versioned_read,
    bench_traverse,
    bench_recall,
);
criterion_main!(benches);
