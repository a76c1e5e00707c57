//! # Stock Ledger Runtime
//!
//! The inventory reservation and stock ledger engine.
//!
//! ## Core Components
//!
//! - **`StockLedgerEngine`**: availability checks and the reserve, fulfill,
//!   release, return and adjust transitions, each one atomic
//! - **`CartHoldManager`**: TTL-bound holds on cart lines and the expiry sweep
//! - **`ExpirySweeper`**: background task driving the sweep until shutdown
//! - **Retry**: whole-operation retry with backoff on concurrency conflicts
//! - **Metrics**: Prometheus counters and latency histograms
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use stockledger_core::environment::SystemClock;
//! use stockledger_core::{LineItem, OrderRef, OrderId};
//! use stockledger_runtime::{AdjustmentRequest, EngineConfig, StockLedgerEngine};
//! use stockledger_testing::{fixtures, InMemoryStockStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> stockledger_core::Result<()> {
//! let engine = StockLedgerEngine::bootstrap(
//!     Arc::new(InMemoryStockStore::new()),
//!     Arc::new(SystemClock),
//!     EngineConfig::default(),
//! )
//! .await?;
//!
//! let actor = fixtures::actor();
//! let item = fixtures::product();
//! engine
//!     .adjust_inventory(&AdjustmentRequest::new(item, 100, "Initial count"), actor)
//!     .await?;
//!
//! let order = OrderRef::new(OrderId::new(), "1001");
//! let records = engine
//!     .reserve_for_order(&order, &[LineItem::new(item, 10)], actor, false)
//!     .await?;
//! assert_eq!(records[0].sellable_quantity(), 90);
//! # Ok(())
//! # }
//! ```

/// Engine configuration loaded from the environment
pub mod config;

/// The stock ledger engine
pub mod engine;

/// Cart holds and the expiry sweep
pub mod holds;

/// Default location bootstrap
pub mod location;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

/// Background expiry sweeper
pub mod sweeper;

pub use config::EngineConfig;
pub use engine::{AdjustmentRequest, AvailabilityResult, ReleaseTarget, StockLedgerEngine};
pub use holds::{CartHoldManager, SweepReport};
pub use location::ensure_default_location;
pub use retry::RetryPolicy;
pub use sweeper::ExpirySweeper;
