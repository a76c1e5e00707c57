//! Reservation throughput under contention.
//!
//! Measures the full lock/validate/write/commit path against the in-memory
//! store, for a single hot record and for disjoint records.
//!
//! Run with: `cargo bench -p stockledger-runtime`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use stockledger_core::environment::SystemClock;
use stockledger_core::{DefaultLocationResolver, LocationId, StockKey};
use stockledger_runtime::{EngineConfig, ReleaseTarget, StockLedgerEngine};
use stockledger_testing::InMemoryStockStore;
use stockledger_testing::fixtures::{self, line, order};

const PLENTY: i64 = 1_000_000_000;

fn engine_with(records: usize) -> (StockLedgerEngine<InMemoryStockStore>, Vec<StockKey>) {
    let store = InMemoryStockStore::new();
    let location = LocationId::new();
    let keys: Vec<StockKey> = (0..records)
        .map(|_| {
            let key = StockKey::new(fixtures::product(), location);
            store
                .seed_record(fixtures::record(key, PLENTY))
                .expect("Failed to seed record");
            key
        })
        .collect();
    let engine = StockLedgerEngine::new(
        Arc::new(store),
        Arc::new(SystemClock),
        Arc::new(DefaultLocationResolver::new(location)),
        EngineConfig::default(),
    );
    (engine, keys)
}

/// Reserve then release one unit, sequentially
fn benchmark_reserve_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("reserve_release");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    group.bench_function("single_record", |b| {
        let (engine, keys) = engine_with(1);
        let actor = fixtures::actor();

        b.to_async(&runtime).iter(|| async {
            let o = order("BENCH");
            let _ = engine
                .reserve_for_order(&o, &[line(black_box(keys[0]), 1)], actor, false)
                .await;
            let _ = engine.release_reservation(&ReleaseTarget::Order(o), actor).await;
        });
    });

    group.finish();
}

/// Ten concurrent reservations, all on one record or each on its own
fn benchmark_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("contention");
    group.throughput(Throughput::Elements(10));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    group.bench_function("10_tasks_hot_record", |b| {
        let (engine, keys) = engine_with(1);
        let actor = fixtures::actor();

        b.to_async(&runtime).iter(|| async {
            let handles: Vec<_> = (0..10)
                .map(|_| {
                    let engine = engine.clone();
                    let key = keys[0];
                    tokio::spawn(async move {
                        let _ = engine
                            .reserve_for_order(&order("BENCH"), &[line(key, 1)], actor, true)
                            .await;
                    })
                })
                .collect();

            for handle in handles {
                handle.await.expect("Task failed");
            }
        });
    });

    group.bench_function("10_tasks_disjoint_records", |b| {
        let (engine, keys) = engine_with(10);
        let actor = fixtures::actor();

        b.to_async(&runtime).iter(|| async {
            let handles: Vec<_> = keys
                .iter()
                .map(|key| {
                    let engine = engine.clone();
                    let key = *key;
                    tokio::spawn(async move {
                        let _ = engine
                            .reserve_for_order(&order("BENCH"), &[line(key, 1)], actor, true)
                            .await;
                    })
                })
                .collect();

            for handle in handles {
                handle.await.expect("Task failed");
            }
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_reserve_release, benchmark_contention);
criterion_main!(benches);
