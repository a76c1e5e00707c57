//! `PostgreSQL` storage for the stock ledger.
//!
//! Implements [`StockStore`](stockledger_core::store::StockStore) on top of
//! sqlx. Every engine mutation runs in one database transaction that locks the
//! rows it touches with `SELECT … FOR UPDATE`, so correctness holds across any
//! number of engine processes sharing the database.
//!
//! # Schema
//!
//! Migrations live in `migrations/` and are embedded in the binary; run them
//! with [`PostgresStockStore::migrate`]:
//!
//! - `stock_locations`: physical locations, at most one flagged default
//! - `stock_records`: one row per (product or variant, location)
//! - `stock_adjustments`: append-only ledger
//! - `order_reservations`: units held per order and record
//! - `cart_holds`: TTL-bound holds keyed by cart line
//!
//! # Example
//!
//! ```no_run
//! use stockledger_postgres::PostgresStockStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = sqlx::PgPool::connect("postgres://localhost/shop").await?;
//! let store = PostgresStockStore::new(pool);
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

mod rows;
mod store;

pub use store::{DEFAULT_LOCK_TIMEOUT, PostgresStockStore, PostgresTransaction};
