//! # Stock Ledger Testing
//!
//! Testing utilities for the stock ledger.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - [`InMemoryStockStore`], a `StockStore` with real per-row locks so that
//!   concurrency tests exercise the same queueing the `PostgreSQL` store does
//! - Fixtures for actors, items and seeded records
//!
//! ## Example
//!
//! ```
//! use stockledger_testing::{fixtures, InMemoryStockStore};
//!
//! let store = InMemoryStockStore::new();
//! let key = fixtures::stock_key();
//! store.seed_record(fixtures::record(key, 100)).unwrap();
//! assert_eq!(store.record(key).unwrap().available_quantity, 100);
//! ```

use chrono::{DateTime, Utc};
use stockledger_core::environment::Clock;

pub mod store;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use stockledger_testing::mocks::FixedClock;
    /// use stockledger_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can keep one handle and give
    /// another to the engine.
    ///
    /// # Example
    ///
    /// ```
    /// use stockledger_testing::mocks::ManualClock;
    /// use stockledger_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let clock = ManualClock::new(Utc::now());
    /// let start = clock.now();
    /// clock.advance(Duration::minutes(31));
    /// assert_eq!(clock.now() - start, Duration::minutes(31));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock starting at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move time forward (or backward, with a negative duration)
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute time
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Builders for the values most tests need.
pub mod fixtures {
    use stockledger_core::{
        ActorId, CartId, CartLineRef, ItemRef, LineItem, LocationId, OrderId, OrderRef, ProductId,
        StockKey, StockRecord, StockStatus, VariantId,
    };

    /// Low-stock threshold used by [`record`]
    pub const THRESHOLD: i64 = 10;

    /// A fresh, valid actor
    #[must_use]
    pub fn actor() -> ActorId {
        ActorId::generate()
    }

    /// A fresh product reference
    #[must_use]
    pub fn product() -> ItemRef {
        ItemRef::Product(ProductId::new())
    }

    /// A fresh variant reference
    #[must_use]
    pub fn variant() -> ItemRef {
        ItemRef::Variant(VariantId::new())
    }

    /// A fresh product at a fresh location
    #[must_use]
    pub fn stock_key() -> StockKey {
        StockKey::new(product(), LocationId::new())
    }

    /// A sellable record with `available` units and nothing reserved
    #[must_use]
    pub fn record(key: StockKey, available: i64) -> StockRecord {
        let mut record = StockRecord::new(key, THRESHOLD, chrono::Utc::now());
        record.available_quantity = available;
        record.status = StockStatus::derive(available, THRESHOLD);
        record
    }

    /// One line for `key`
    #[must_use]
    pub fn line(key: StockKey, quantity: u32) -> LineItem {
        LineItem::at(key.item, quantity, key.location_id)
    }

    /// A fresh order with the given number
    #[must_use]
    pub fn order(number: &str) -> OrderRef {
        OrderRef::new(OrderId::new(), number)
    }

    /// A fresh cart line on a fresh cart
    #[must_use]
    pub fn cart_line() -> CartLineRef {
        cart_line_on(CartId::new())
    }

    /// A fresh cart line on `cart_id`
    #[must_use]
    pub fn cart_line_on(cart_id: CartId) -> CartLineRef {
        CartLineRef::new(cart_id, stockledger_core::CartLineId::new())
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use store::{InMemoryStockStore, InMemoryTransaction};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(Utc::now());
        let engine_side = clock.clone();
        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(clock.now(), engine_side.now());
    }

    #[test]
    fn fixture_record_has_derived_status() {
        let record = fixtures::record(fixtures::stock_key(), 3);
        assert_eq!(record.status, stockledger_core::StockStatus::LowStock);
        assert_eq!(record.sellable_quantity(), 3);
    }
}
