//! `PostgreSQL` implementation of [`StockStore`] and [`LedgerTransaction`].
//!
//! Row locks are plain `SELECT … FOR UPDATE`, taken one key at a time in
//! ascending [`StockKey`] order. Cart hold rows may not exist yet when a hold
//! is placed, so [`lock_hold`](LedgerTransaction::lock_hold) first takes a
//! transaction-scoped advisory lock on the cart line id.
//!
//! Every transaction sets a local `lock_timeout`; a wait that exceeds it, a
//! deadlock, or a serialization failure is reported as
//! [`LedgerError::ConcurrencyConflict`] so the engine retries the whole call.

use crate::rows::{
    AdjustmentRow, CartHoldRow, HOLD_SELECT, LocationRow, OrderReservationRow, RECORD_COLUMNS,
    RESERVATION_SELECT, StockRecordRow, convert, item_columns,
};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use stockledger_core::store::{LedgerTransaction, StockStore};
use stockledger_core::{
    AdjustmentEntry, CartHold, CartId, CartLineId, LedgerError, Location, OrderId, OrderReservation,
    Result, StockKey, StockRecord,
};

/// SQLSTATEs that mean "another transaction got in the way; try again".
const LOCK_NOT_AVAILABLE: &str = "55P03";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

/// Default wait for a row lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Map a sqlx error, turning lock contention into a retryable conflict.
fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> LedgerError {
    move |e| {
        if let sqlx::Error::Database(db_err) = &e {
            if let Some(code) = db_err.code() {
                if matches!(code.as_ref(), LOCK_NOT_AVAILABLE | SERIALIZATION_FAILURE | DEADLOCK_DETECTED) {
                    metrics::counter!("stock_ledger_lock_conflicts_total", "sqlstate" => code.to_string())
                        .increment(1);
                    return LedgerError::ConcurrencyConflict(format!("{context}: {db_err}"));
                }
            }
        }
        LedgerError::Storage(format!("{context}: {e}"))
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// `PostgreSQL`-backed stock store.
///
/// # Example
///
/// ```no_run
/// use stockledger_postgres::PostgresStockStore;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = sqlx::PgPool::connect("postgres://localhost/shop").await?;
/// let store = PostgresStockStore::new(pool).with_lock_timeout(Duration::from_secs(2));
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresStockStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresStockStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Set how long a transaction waits for a row lock.
    #[must_use]
    pub const fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// The underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::Storage(format!("Migration failed: {e}")))?;
        tracing::info!("Stock ledger migrations applied");
        Ok(())
    }
}

impl StockStore for PostgresStockStore {
    type Transaction = PostgresTransaction;

    async fn begin(&self) -> Result<PostgresTransaction> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;
        let timeout = format!("{}ms", self.lock_timeout.as_millis());
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(timeout)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to set lock timeout"))?;
        Ok(PostgresTransaction { tx })
    }

    async fn find_records(&self, keys: &[StockKey]) -> Result<Vec<StockRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM stock_records \
             WHERE location_id = $1 AND (product_id = $2 OR variant_id = $3)"
        );
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let (product_id, variant_id) = item_columns(key);
            let row: Option<StockRecordRow> = sqlx::query_as(&sql)
                .bind(key.location_id.as_uuid())
                .bind(product_id)
                .bind(variant_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("Failed to load stock record"))?;
            if let Some(row) = row {
                records.push(StockRecord::try_from(row)?);
            }
        }
        Ok(records)
    }

    async fn adjustment_history(&self, key: StockKey, limit: usize) -> Result<Vec<AdjustmentEntry>> {
        let (product_id, variant_id) = item_columns(&key);
        let rows: Vec<AdjustmentRow> = sqlx::query_as(
            r"
            SELECT a.id, a.inventory_id, a.adjustment_type, a.quantity_change,
                   a.quantity_before, a.quantity_after, a.reserved_before, a.reserved_after,
                   a.reason, a.reference_number, a.adjusted_by, a.notes, a.created_at
            FROM stock_adjustments a
            JOIN stock_records r ON r.id = a.inventory_id
            WHERE r.location_id = $1 AND (r.product_id = $2 OR r.variant_id = $3)
            ORDER BY a.seq DESC
            LIMIT $4
            ",
        )
        .bind(key.location_id.as_uuid())
        .bind(product_id)
        .bind(variant_id)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load adjustment history"))?;
        convert(rows)
    }

    async fn find_hold(&self, cart_line_id: CartLineId) -> Result<Option<CartHold>> {
        let row: Option<CartHoldRow> = sqlx::query_as(&format!("{HOLD_SELECT} WHERE h.cart_line_id = $1"))
            .bind(cart_line_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to load cart hold"))?;
        row.map(CartHold::try_from).transpose()
    }

    async fn expired_holds(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<CartHold>> {
        let rows: Vec<CartHoldRow> = sqlx::query_as(&format!(
            "{HOLD_SELECT} WHERE h.expires_at < $1 ORDER BY h.expires_at LIMIT $2"
        ))
        .bind(now)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list expired holds"))?;
        convert(rows)
    }

    async fn order_reservations(&self, order_id: OrderId) -> Result<Vec<OrderReservation>> {
        let rows: Vec<OrderReservationRow> = sqlx::query_as(&format!("{RESERVATION_SELECT} WHERE o.order_id = $1"))
            .bind(order_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to load order reservations"))?;
        convert(rows)
    }

    async fn default_location(&self) -> Result<Option<Location>> {
        let row: Option<LocationRow> = sqlx::query_as(
            "SELECT id, code, name, is_default, created_at FROM stock_locations WHERE is_default LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to load default location"))?;
        Ok(row.map(Location::from))
    }

    async fn insert_location(&self, location: &Location) -> Result<Location> {
        sqlx::query(
            r"
            INSERT INTO stock_locations (id, code, name, is_default, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING
            ",
        )
        .bind(location.id.as_uuid())
        .bind(&location.code)
        .bind(&location.name)
        .bind(location.is_default)
        .bind(location.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to insert location"))?;

        let row: Option<LocationRow> =
            sqlx::query_as("SELECT id, code, name, is_default, created_at FROM stock_locations WHERE code = $1")
                .bind(&location.code)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("Failed to load location"))?;
        row.map(Location::from).ok_or_else(|| {
            LedgerError::Storage(format!(
                "Location '{}' was not stored: another default location exists",
                location.code
            ))
        })
    }
}

/// An open `PostgreSQL` transaction.
///
/// Dropping it without [`commit`](LedgerTransaction::commit) rolls back.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PostgresTransaction {
    async fn lock_one(&mut self, key: &StockKey) -> Result<Option<StockRecord>> {
        let (product_id, variant_id) = item_columns(key);
        let row: Option<StockRecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM stock_records \
             WHERE location_id = $1 AND (product_id = $2 OR variant_id = $3) \
             FOR UPDATE"
        ))
        .bind(key.location_id.as_uuid())
        .bind(product_id)
        .bind(variant_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error("Failed to lock stock record"))?;
        row.map(StockRecord::try_from).transpose()
    }
}

impl LedgerTransaction for PostgresTransaction {
    async fn lock_records(&mut self, keys: &[StockKey]) -> Result<Vec<StockRecord>> {
        let mut sorted = keys.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut records = Vec::with_capacity(sorted.len());
        for key in &sorted {
            if let Some(record) = self.lock_one(key).await? {
                records.push(record);
            }
        }
        tracing::trace!(requested = sorted.len(), locked = records.len(), "Stock records locked");
        Ok(records)
    }

    async fn lock_or_create_record(&mut self, seed: &StockRecord) -> Result<StockRecord> {
        let (product_id, variant_id) = item_columns(&seed.key());
        // No conflict target: either partial unique index may fire.
        sqlx::query(
            r"
            INSERT INTO stock_records (
                id, product_id, variant_id, location_id, available_quantity, reserved_quantity,
                condition, status, low_stock_threshold, total_sold, total_fulfilled,
                last_stock_movement_at, last_sale_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT DO NOTHING
            ",
        )
        .bind(seed.id.as_uuid())
        .bind(product_id)
        .bind(variant_id)
        .bind(seed.location_id.as_uuid())
        .bind(seed.available_quantity)
        .bind(seed.reserved_quantity)
        .bind(seed.condition.as_str())
        .bind(seed.status.as_str())
        .bind(seed.low_stock_threshold)
        .bind(seed.total_sold)
        .bind(seed.total_fulfilled)
        .bind(seed.last_stock_movement_at)
        .bind(seed.last_sale_at)
        .bind(seed.created_at)
        .bind(seed.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("Failed to create stock record"))?;

        self.lock_one(&seed.key())
            .await?
            .ok_or(LedgerError::ItemNotFound(seed.key()))
    }

    async fn update_record(&mut self, record: &StockRecord) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE stock_records SET
                available_quantity = $2,
                reserved_quantity = $3,
                condition = $4,
                status = $5,
                low_stock_threshold = $6,
                total_sold = $7,
                total_fulfilled = $8,
                last_stock_movement_at = $9,
                last_sale_at = $10,
                updated_at = $11
            WHERE id = $1
            ",
        )
        .bind(record.id.as_uuid())
        .bind(record.available_quantity)
        .bind(record.reserved_quantity)
        .bind(record.condition.as_str())
        .bind(record.status.as_str())
        .bind(record.low_stock_threshold)
        .bind(record.total_sold)
        .bind(record.total_fulfilled)
        .bind(record.last_stock_movement_at)
        .bind(record.last_sale_at)
        .bind(record.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("Failed to update stock record"))?;

        if result.rows_affected() != 1 {
            return Err(LedgerError::ItemNotFound(record.key()));
        }
        Ok(())
    }

    async fn append_adjustment(&mut self, entry: &AdjustmentEntry) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO stock_adjustments (
                id, inventory_id, adjustment_type, quantity_change, quantity_before, quantity_after,
                reserved_before, reserved_after, reason, reference_number, adjusted_by, notes, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ",
        )
        .bind(entry.id.as_uuid())
        .bind(entry.inventory_id.as_uuid())
        .bind(entry.adjustment_type.as_str())
        .bind(entry.quantity_change)
        .bind(entry.quantity_before)
        .bind(entry.quantity_after)
        .bind(entry.reserved_before)
        .bind(entry.reserved_after)
        .bind(&entry.reason)
        .bind(&entry.reference_number)
        .bind(entry.adjusted_by.as_uuid())
        .bind(&entry.notes)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("Failed to append adjustment"))?;
        Ok(())
    }

    async fn lock_hold(&mut self, cart_line_id: CartLineId) -> Result<Option<CartHold>> {
        // The row may not exist yet; the advisory lock covers both cases.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(cart_line_id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(db_error("Failed to lock cart line"))?;

        let row: Option<CartHoldRow> =
            sqlx::query_as(&format!("{HOLD_SELECT} WHERE h.cart_line_id = $1 FOR UPDATE OF h"))
                .bind(cart_line_id.as_uuid())
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(db_error("Failed to lock cart hold"))?;
        row.map(CartHold::try_from).transpose()
    }

    async fn lock_cart_holds(&mut self, cart_id: CartId) -> Result<Vec<CartHold>> {
        let rows: Vec<CartHoldRow> = sqlx::query_as(&format!(
            "{HOLD_SELECT} WHERE h.cart_id = $1 ORDER BY h.cart_line_id FOR UPDATE OF h"
        ))
        .bind(cart_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_error("Failed to lock cart holds"))?;
        convert(rows)
    }

    async fn save_hold(&mut self, hold: &CartHold) -> Result<()> {
        let (product_id, variant_id) = item_columns(&hold.key);
        let result = sqlx::query(
            r"
            INSERT INTO cart_holds (
                cart_line_id, cart_id, reservation_id, inventory_id, quantity, reserved_at, expires_at
            )
            SELECT $1, $2, $3, r.id, $7, $8, $9
            FROM stock_records r
            WHERE r.location_id = $4 AND (r.product_id = $5 OR r.variant_id = $6)
            ON CONFLICT (cart_line_id) DO UPDATE SET
                cart_id = EXCLUDED.cart_id,
                reservation_id = EXCLUDED.reservation_id,
                inventory_id = EXCLUDED.inventory_id,
                quantity = EXCLUDED.quantity,
                reserved_at = EXCLUDED.reserved_at,
                expires_at = EXCLUDED.expires_at
            ",
        )
        .bind(hold.cart_line_id.as_uuid())
        .bind(hold.cart_id.as_uuid())
        .bind(hold.reservation_id.as_uuid())
        .bind(hold.key.location_id.as_uuid())
        .bind(product_id)
        .bind(variant_id)
        .bind(hold.quantity)
        .bind(hold.reserved_at)
        .bind(hold.expires_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("Failed to save cart hold"))?;

        if result.rows_affected() != 1 {
            return Err(LedgerError::ItemNotFound(hold.key));
        }
        Ok(())
    }

    async fn clear_hold(&mut self, cart_line_id: CartLineId) -> Result<()> {
        sqlx::query("DELETE FROM cart_holds WHERE cart_line_id = $1")
            .bind(cart_line_id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(db_error("Failed to clear cart hold"))?;
        Ok(())
    }

    async fn order_reservations(&mut self, order_id: OrderId) -> Result<Vec<OrderReservation>> {
        let rows: Vec<OrderReservationRow> = sqlx::query_as(&format!("{RESERVATION_SELECT} WHERE o.order_id = $1"))
            .bind(order_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_error("Failed to load order reservations"))?;
        convert(rows)
    }

    async fn save_order_reservation(&mut self, reservation: &OrderReservation) -> Result<()> {
        let (product_id, variant_id) = item_columns(&reservation.key);
        let result = sqlx::query(
            r"
            INSERT INTO order_reservations (order_id, inventory_id, quantity, state, reserved_at, updated_at)
            SELECT $1, r.id, $5, $6, $7, $8
            FROM stock_records r
            WHERE r.location_id = $2 AND (r.product_id = $3 OR r.variant_id = $4)
            ON CONFLICT (order_id, inventory_id) DO UPDATE SET
                quantity = EXCLUDED.quantity,
                state = EXCLUDED.state,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(reservation.order_id.as_uuid())
        .bind(reservation.key.location_id.as_uuid())
        .bind(product_id)
        .bind(variant_id)
        .bind(reservation.quantity)
        .bind(reservation.state.as_str())
        .bind(reservation.reserved_at)
        .bind(reservation.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("Failed to save order reservation"))?;

        if result.rows_affected() != 1 {
            return Err(LedgerError::ItemNotFound(reservation.key));
        }
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(db_error("Failed to commit transaction"))
    }

    async fn rollback(self) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(db_error("Failed to roll back transaction"))
    }
}
