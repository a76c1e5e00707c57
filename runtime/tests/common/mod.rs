//! Shared setup for engine integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use chrono::{DateTime, Utc};
use std::sync::Arc;
use stockledger_core::{
    ActorId, DefaultLocationResolver, ItemRef, LocationId, StockKey, StockRecord,
};
use stockledger_runtime::{CartHoldManager, EngineConfig, RetryPolicy, StockLedgerEngine};
use stockledger_testing::{InMemoryStockStore, ManualClock, fixtures, test_clock};

/// Engine over an in-memory store with a controllable clock.
pub struct Harness {
    pub engine: StockLedgerEngine<InMemoryStockStore>,
    pub holds: CartHoldManager<InMemoryStockStore>,
    pub clock: ManualClock,
    pub location: LocationId,
    pub actor: ActorId,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(InMemoryStockStore::new())
    }

    pub fn with_store(store: InMemoryStockStore) -> Self {
        Self::with_store_and_config(store, EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_store_and_config(InMemoryStockStore::new(), config)
    }

    pub fn with_store_and_config(store: InMemoryStockStore, config: EngineConfig) -> Self {
        init_tracing();
        let clock = ManualClock::new(start());
        let location = LocationId::new();
        let engine = StockLedgerEngine::new(
            Arc::new(store),
            Arc::new(clock.clone()),
            Arc::new(DefaultLocationResolver::new(location)),
            config,
        )
        .with_retry_policy(
            RetryPolicy::builder()
                .max_retries(10)
                .initial_delay(std::time::Duration::from_millis(1))
                .build(),
        );
        let holds = CartHoldManager::new(engine.clone());
        Self {
            engine,
            holds,
            clock,
            location,
            actor: fixtures::actor(),
        }
    }

    pub fn store(&self) -> &InMemoryStockStore {
        self.engine.store()
    }

    /// A fresh product at the default location with `available` units.
    pub fn stocked(&self, available: i64) -> StockKey {
        self.stocked_item(fixtures::product(), available)
    }

    pub fn stocked_item(&self, item: ItemRef, available: i64) -> StockKey {
        let key = StockKey::new(item, self.location);
        self.store().seed_record(fixtures::record(key, available)).unwrap();
        key
    }

    pub fn record(&self, key: StockKey) -> StockRecord {
        self.store().record(key).unwrap()
    }

    pub fn now(&self) -> DateTime<Utc> {
        use stockledger_core::environment::Clock;
        self.clock.now()
    }

    pub fn ledger_len(&self) -> usize {
        self.store().adjustments().len()
    }
}

/// Route engine logs to the test output; `RUST_LOG=debug` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn start() -> DateTime<Utc> {
    use stockledger_core::environment::Clock;
    test_clock().now()
}
