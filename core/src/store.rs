//! Persistence abstraction for the stock ledger.
//!
//! The engine talks to storage through two traits:
//!
//! - [`StockStore`]: the shared handle. Opens transactions and answers
//!   read-only queries that take no locks.
//! - [`LedgerTransaction`]: one atomic unit of work. Every mutation the engine
//!   performs happens through a transaction that locks the rows it touches,
//!   re-reads them under the lock, writes, and commits or rolls back as a whole.
//!
//! # Locking contract
//!
//! - `lock_records` acquires exclusive row locks in ascending [`StockKey`]
//!   order, whatever order the caller passes keys in. Two transactions touching
//!   overlapping rows therefore queue instead of deadlocking.
//! - Cart hold rows are always locked *before* stock records.
//! - A lock that cannot be acquired within the store's lock timeout surfaces as
//!   [`LedgerError::ConcurrencyConflict`](crate::error::LedgerError::ConcurrencyConflict).
//! - Dropping a transaction without calling `commit` discards all of its writes
//!   and releases its locks.
//!
//! # Implementations
//!
//! - `PostgresStockStore` (in `stockledger-postgres`): `SELECT … FOR UPDATE`
//! - `InMemoryStockStore` (in `stockledger-testing`): per-row async mutexes
//!
//! Methods return `impl Future + Send` so that engine calls can be spawned onto
//! a multi-threaded runtime.

use crate::adjustment::AdjustmentEntry;
use crate::error::Result;
use crate::location::Location;
use crate::record::StockRecord;
use crate::reservation::{CartHold, OrderReservation};
use crate::types::{CartId, CartLineId, OrderId, StockKey};
use chrono::{DateTime, Utc};
use std::future::Future;

/// Shared handle to stock ledger storage.
pub trait StockStore: Send + Sync + 'static {
    /// Transaction type opened by [`StockStore::begin`].
    type Transaction: LedgerTransaction + 'static;

    /// Open a new transaction.
    ///
    /// # Errors
    ///
    /// Returns a storage error if no connection is available.
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction>> + Send;

    /// Read records without locking. Missing keys are omitted.
    ///
    /// The result is a snapshot and must never gate a mutation.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    fn find_records(&self, keys: &[StockKey]) -> impl Future<Output = Result<Vec<StockRecord>>> + Send;

    /// Adjustment ledger for one record, newest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    fn adjustment_history(
        &self,
        key: StockKey,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<AdjustmentEntry>>> + Send;

    /// Current hold on a cart line, if any.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    fn find_hold(&self, cart_line_id: CartLineId) -> impl Future<Output = Result<Option<CartHold>>> + Send;

    /// Holds whose `expires_at` is before `now`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    fn expired_holds(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<CartHold>>> + Send;

    /// Reservation rows of an order, in any state.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    fn order_reservations(&self, order_id: OrderId) -> impl Future<Output = Result<Vec<OrderReservation>>> + Send;

    /// The location flagged as default, if one exists.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    fn default_location(&self) -> impl Future<Output = Result<Option<Location>>> + Send;

    /// Insert a location. If one with the same code already exists, that one
    /// is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the insert fails.
    fn insert_location(&self, location: &Location) -> impl Future<Output = Result<Location>> + Send;
}

/// One atomic unit of ledger work.
pub trait LedgerTransaction: Send {
    /// Lock the records for `keys` in ascending key order and return the ones
    /// that exist, in that order.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrencyConflict` on lock timeout, or a storage error.
    fn lock_records(&mut self, keys: &[StockKey]) -> impl Future<Output = Result<Vec<StockRecord>>> + Send;

    /// Lock the record for `seed.key()`, inserting `seed` first if the record
    /// does not exist yet. Returns the locked record.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrencyConflict` on lock timeout, or a storage error.
    fn lock_or_create_record(&mut self, seed: &StockRecord) -> impl Future<Output = Result<StockRecord>> + Send;

    /// Write back a locked record.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    fn update_record(&mut self, record: &StockRecord) -> impl Future<Output = Result<()>> + Send;

    /// Append a ledger entry.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the insert fails.
    fn append_adjustment(&mut self, entry: &AdjustmentEntry) -> impl Future<Output = Result<()>> + Send;

    /// Lock a cart line's hold row and return the hold, if any.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrencyConflict` on lock timeout, or a storage error.
    fn lock_hold(&mut self, cart_line_id: CartLineId) -> impl Future<Output = Result<Option<CartHold>>> + Send;

    /// Lock every hold of a cart, in ascending cart line order.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrencyConflict` on lock timeout, or a storage error.
    fn lock_cart_holds(&mut self, cart_id: CartId) -> impl Future<Output = Result<Vec<CartHold>>> + Send;

    /// Write the hold fields of a cart line.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    fn save_hold(&mut self, hold: &CartHold) -> impl Future<Output = Result<()>> + Send;

    /// Clear the hold fields of a cart line.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    fn clear_hold(&mut self, cart_line_id: CartLineId) -> impl Future<Output = Result<()>> + Send;

    /// Reservation rows of an order as seen by this transaction.
    ///
    /// Rows are protected by the lock of the stock record they point at; read
    /// them again after locking those records.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    fn order_reservations(&mut self, order_id: OrderId) -> impl Future<Output = Result<Vec<OrderReservation>>> + Send;

    /// Insert or update an order reservation row.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    fn save_order_reservation(
        &mut self,
        reservation: &OrderReservation,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Make every write visible and release all locks.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrencyConflict` on serialization failure, or a storage error.
    fn commit(self) -> impl Future<Output = Result<()>> + Send;

    /// Discard every write and release all locks.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the rollback could not be sent.
    fn rollback(self) -> impl Future<Output = Result<()>> + Send;
}
