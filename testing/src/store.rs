//! In-memory stock store with real row locking.
//!
//! Each stock record and each cart line hold has its own `tokio` mutex. A
//! transaction holds the owned guards of every row it has locked until it is
//! committed or dropped, and buffers its writes until commit. Concurrent
//! engine calls against this store therefore serialize on shared rows and run
//! in parallel on disjoint rows, the same as against `PostgreSQL`.

use chrono::{DateTime, Utc};
use stockledger_core::store::{LedgerTransaction, StockStore};
use stockledger_core::{
    AdjustmentEntry, CartHold, CartId, CartLineId, LedgerError, Location, OrderId,
    OrderReservation, Result, StockKey, StockRecord,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};

type RowLock = Arc<RowMutex<()>>;

#[derive(Debug, Default)]
struct Tables {
    records: BTreeMap<StockKey, StockRecord>,
    adjustments: Vec<AdjustmentEntry>,
    holds: BTreeMap<CartLineId, CartHold>,
    reservations: BTreeMap<(OrderId, StockKey), OrderReservation>,
    locations: Vec<Location>,
}

#[derive(Debug)]
struct Shared {
    tables: Mutex<Tables>,
    record_locks: Mutex<HashMap<StockKey, RowLock>>,
    hold_locks: Mutex<HashMap<CartLineId, RowLock>>,
    lock_timeout: Duration,
}

impl Shared {
    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| LedgerError::Storage("in-memory tables poisoned".to_string()))
    }

    fn record_lock(&self, key: StockKey) -> Result<RowLock> {
        let mut locks = self
            .record_locks
            .lock()
            .map_err(|_| LedgerError::Storage("record lock table poisoned".to_string()))?;
        Ok(Arc::clone(locks.entry(key).or_default()))
    }

    fn hold_lock(&self, cart_line_id: CartLineId) -> Result<RowLock> {
        let mut locks = self
            .hold_locks
            .lock()
            .map_err(|_| LedgerError::Storage("hold lock table poisoned".to_string()))?;
        Ok(Arc::clone(locks.entry(cart_line_id).or_default()))
    }
}

async fn acquire(lock: RowLock, timeout: Duration, row: impl Display) -> Result<OwnedMutexGuard<()>> {
    tokio::time::timeout(timeout, lock.lock_owned())
        .await
        .map_err(|_| LedgerError::ConcurrencyConflict(format!("lock wait timeout on {row}")))
}

/// In-memory [`StockStore`] for tests.
///
/// Cloning shares the underlying tables.
///
/// # Example
///
/// ```
/// use stockledger_testing::InMemoryStockStore;
/// use std::time::Duration;
///
/// let store = InMemoryStockStore::with_lock_timeout(Duration::from_millis(50));
/// assert!(store.adjustments().is_empty());
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryStockStore {
    shared: Arc<Shared>,
}

impl InMemoryStockStore {
    /// Store with a 5 second lock wait timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lock_timeout(Duration::from_secs(5))
    }

    /// Store with a custom lock wait timeout.
    #[must_use]
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                record_locks: Mutex::new(HashMap::new()),
                hold_locks: Mutex::new(HashMap::new()),
                lock_timeout,
            }),
        }
    }

    /// Insert or overwrite a record directly, bypassing the ledger.
    ///
    /// Stands in for catalog onboarding and data loaded before the test.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the tables are poisoned.
    pub fn seed_record(&self, record: StockRecord) -> Result<()> {
        self.shared.tables()?.records.insert(record.key(), record);
        Ok(())
    }

    /// Committed state of a record.
    #[must_use]
    pub fn record(&self, key: StockKey) -> Option<StockRecord> {
        self.shared
            .tables()
            .ok()
            .and_then(|tables| tables.records.get(&key).cloned())
    }

    /// Every committed ledger entry, oldest first.
    #[must_use]
    pub fn adjustments(&self) -> Vec<AdjustmentEntry> {
        self.shared
            .tables()
            .map(|tables| tables.adjustments.clone())
            .unwrap_or_default()
    }

    /// Every committed hold, ordered by cart line.
    #[must_use]
    pub fn holds(&self) -> Vec<CartHold> {
        self.shared
            .tables()
            .map(|tables| tables.holds.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Overwrite a hold's `expires_at`, as an operator or a test would with SQL.
    ///
    /// Returns `false` when the cart line has no hold.
    #[must_use]
    pub fn set_hold_expiry(&self, cart_line_id: CartLineId, expires_at: DateTime<Utc>) -> bool {
        let Ok(mut tables) = self.shared.tables() else {
            return false;
        };
        tables
            .holds
            .get_mut(&cart_line_id)
            .map(|hold| hold.expires_at = expires_at)
            .is_some()
    }
}

impl Default for InMemoryStockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StockStore for InMemoryStockStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction> {
        Ok(InMemoryTransaction::new(Arc::clone(&self.shared)))
    }

    async fn find_records(&self, keys: &[StockKey]) -> Result<Vec<StockRecord>> {
        let tables = self.shared.tables()?;
        Ok(keys
            .iter()
            .filter_map(|key| tables.records.get(key).cloned())
            .collect())
    }

    async fn adjustment_history(&self, key: StockKey, limit: usize) -> Result<Vec<AdjustmentEntry>> {
        let tables = self.shared.tables()?;
        let Some(record) = tables.records.get(&key) else {
            return Ok(Vec::new());
        };
        Ok(tables
            .adjustments
            .iter()
            .rev()
            .filter(|entry| entry.inventory_id == record.id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_hold(&self, cart_line_id: CartLineId) -> Result<Option<CartHold>> {
        Ok(self.shared.tables()?.holds.get(&cart_line_id).cloned())
    }

    async fn expired_holds(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<CartHold>> {
        let tables = self.shared.tables()?;
        let mut expired: Vec<CartHold> = tables
            .holds
            .values()
            .filter(|hold| hold.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|hold| hold.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn order_reservations(&self, order_id: OrderId) -> Result<Vec<OrderReservation>> {
        let tables = self.shared.tables()?;
        Ok(tables
            .reservations
            .values()
            .filter(|reservation| reservation.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn default_location(&self) -> Result<Option<Location>> {
        let tables = self.shared.tables()?;
        Ok(tables.locations.iter().find(|location| location.is_default).cloned())
    }

    async fn insert_location(&self, location: &Location) -> Result<Location> {
        let mut tables = self.shared.tables()?;
        if let Some(existing) = tables.locations.iter().find(|l| l.code == location.code) {
            return Ok(existing.clone());
        }
        tables.locations.push(location.clone());
        Ok(location.clone())
    }
}

/// Transaction over [`InMemoryStockStore`].
///
/// Writes are buffered and applied on [`commit`](LedgerTransaction::commit);
/// dropping the transaction discards them and releases every row lock.
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    record_guards: BTreeMap<StockKey, OwnedMutexGuard<()>>,
    hold_guards: BTreeMap<CartLineId, OwnedMutexGuard<()>>,
    records: BTreeMap<StockKey, StockRecord>,
    adjustments: Vec<AdjustmentEntry>,
    holds: BTreeMap<CartLineId, Option<CartHold>>,
    reservations: BTreeMap<(OrderId, StockKey), OrderReservation>,
}

impl InMemoryTransaction {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            record_guards: BTreeMap::new(),
            hold_guards: BTreeMap::new(),
            records: BTreeMap::new(),
            adjustments: Vec::new(),
            holds: BTreeMap::new(),
            reservations: BTreeMap::new(),
        }
    }

    async fn lock_record_row(&mut self, key: StockKey) -> Result<()> {
        if self.record_guards.contains_key(&key) {
            return Ok(());
        }
        let lock = self.shared.record_lock(key)?;
        let guard = acquire(lock, self.shared.lock_timeout, key).await?;
        tracing::trace!(%key, "record row locked");
        self.record_guards.insert(key, guard);
        Ok(())
    }

    async fn lock_hold_row(&mut self, cart_line_id: CartLineId) -> Result<()> {
        if self.hold_guards.contains_key(&cart_line_id) {
            return Ok(());
        }
        let lock = self.shared.hold_lock(cart_line_id)?;
        let guard = acquire(lock, self.shared.lock_timeout, cart_line_id).await?;
        self.hold_guards.insert(cart_line_id, guard);
        Ok(())
    }

    fn current_record(&self, key: StockKey) -> Result<Option<StockRecord>> {
        if let Some(pending) = self.records.get(&key) {
            return Ok(Some(pending.clone()));
        }
        Ok(self.shared.tables()?.records.get(&key).cloned())
    }

    fn current_hold(&self, cart_line_id: CartLineId) -> Result<Option<CartHold>> {
        if let Some(pending) = self.holds.get(&cart_line_id) {
            return Ok(pending.clone());
        }
        Ok(self.shared.tables()?.holds.get(&cart_line_id).cloned())
    }
}

impl LedgerTransaction for InMemoryTransaction {
    async fn lock_records(&mut self, keys: &[StockKey]) -> Result<Vec<StockRecord>> {
        let mut sorted = keys.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        for key in &sorted {
            self.lock_record_row(*key).await?;
        }

        let mut locked = Vec::with_capacity(sorted.len());
        for key in sorted {
            if let Some(record) = self.current_record(key)? {
                locked.push(record);
            }
        }
        Ok(locked)
    }

    async fn lock_or_create_record(&mut self, seed: &StockRecord) -> Result<StockRecord> {
        let key = seed.key();
        self.lock_record_row(key).await?;
        if let Some(existing) = self.current_record(key)? {
            return Ok(existing);
        }
        self.records.insert(key, seed.clone());
        Ok(seed.clone())
    }

    async fn update_record(&mut self, record: &StockRecord) -> Result<()> {
        let key = record.key();
        if !self.record_guards.contains_key(&key) {
            return Err(LedgerError::Storage(format!(
                "record {key} written without holding its lock"
            )));
        }
        self.records.insert(key, record.clone());
        Ok(())
    }

    async fn append_adjustment(&mut self, entry: &AdjustmentEntry) -> Result<()> {
        self.adjustments.push(entry.clone());
        Ok(())
    }

    async fn lock_hold(&mut self, cart_line_id: CartLineId) -> Result<Option<CartHold>> {
        self.lock_hold_row(cart_line_id).await?;
        self.current_hold(cart_line_id)
    }

    async fn lock_cart_holds(&mut self, cart_id: CartId) -> Result<Vec<CartHold>> {
        let line_ids: Vec<CartLineId> = {
            let tables = self.shared.tables()?;
            tables
                .holds
                .values()
                .filter(|hold| hold.cart_id == cart_id)
                .map(|hold| hold.cart_line_id)
                .collect()
        };

        // BTreeMap iteration already yields ascending cart line ids.
        for cart_line_id in &line_ids {
            self.lock_hold_row(*cart_line_id).await?;
        }

        let mut holds = Vec::with_capacity(line_ids.len());
        for cart_line_id in line_ids {
            if let Some(hold) = self.current_hold(cart_line_id)? {
                if hold.cart_id == cart_id {
                    holds.push(hold);
                }
            }
        }
        Ok(holds)
    }

    async fn save_hold(&mut self, hold: &CartHold) -> Result<()> {
        if !self.hold_guards.contains_key(&hold.cart_line_id) {
            return Err(LedgerError::Storage(format!(
                "hold on cart line {} written without holding its lock",
                hold.cart_line_id
            )));
        }
        self.holds.insert(hold.cart_line_id, Some(hold.clone()));
        Ok(())
    }

    async fn clear_hold(&mut self, cart_line_id: CartLineId) -> Result<()> {
        if !self.hold_guards.contains_key(&cart_line_id) {
            return Err(LedgerError::Storage(format!(
                "hold on cart line {cart_line_id} cleared without holding its lock"
            )));
        }
        self.holds.insert(cart_line_id, None);
        Ok(())
    }

    async fn order_reservations(&mut self, order_id: OrderId) -> Result<Vec<OrderReservation>> {
        let mut merged: BTreeMap<StockKey, OrderReservation> = {
            let tables = self.shared.tables()?;
            tables
                .reservations
                .values()
                .filter(|reservation| reservation.order_id == order_id)
                .map(|reservation| (reservation.key, reservation.clone()))
                .collect()
        };
        for ((pending_order, key), reservation) in &self.reservations {
            if *pending_order == order_id {
                merged.insert(*key, reservation.clone());
            }
        }
        Ok(merged.into_values().collect())
    }

    async fn save_order_reservation(&mut self, reservation: &OrderReservation) -> Result<()> {
        self.reservations
            .insert((reservation.order_id, reservation.key), reservation.clone());
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        let Self {
            shared,
            record_guards,
            hold_guards,
            records,
            adjustments,
            holds,
            reservations,
        } = self;

        {
            let mut tables = shared.tables()?;
            tables.records.extend(records);
            tables.adjustments.extend(adjustments);
            for (cart_line_id, hold) in holds {
                match hold {
                    Some(hold) => {
                        tables.holds.insert(cart_line_id, hold);
                    }
                    None => {
                        tables.holds.remove(&cart_line_id);
                    }
                }
            }
            tables.reservations.extend(reservations);
        }

        // Row locks are released only after the writes are visible.
        drop(hold_guards);
        drop(record_guards);
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use stockledger_core::{ItemRef, LocationId, ProductId};

    fn key() -> StockKey {
        StockKey::new(ItemRef::Product(ProductId::new()), LocationId::new())
    }

    fn record(key: StockKey, available: i64) -> StockRecord {
        let mut record = StockRecord::new(key, 5, Utc::now());
        record.available_quantity = available;
        record
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let store = InMemoryStockStore::new();
        let key = key();
        store.seed_record(record(key, 10)).unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            let mut locked = tx.lock_records(&[key]).await.unwrap();
            locked[0].available_quantity = 0;
            tx.update_record(&locked[0]).await.unwrap();
        }

        assert_eq!(store.record(key).unwrap().available_quantity, 10);
    }

    #[tokio::test]
    async fn committed_writes_become_visible() {
        let store = InMemoryStockStore::new();
        let key = key();
        store.seed_record(record(key, 10)).unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut locked = tx.lock_records(&[key]).await.unwrap();
        locked[0].reserved_quantity = 4;
        tx.update_record(&locked[0]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.record(key).unwrap().reserved_quantity, 4);
    }

    #[tokio::test]
    async fn lock_wait_times_out_as_concurrency_conflict() {
        let store = InMemoryStockStore::with_lock_timeout(Duration::from_millis(20));
        let key = key();
        store.seed_record(record(key, 1)).unwrap();

        let mut holder = store.begin().await.unwrap();
        holder.lock_records(&[key]).await.unwrap();

        let mut waiter = store.begin().await.unwrap();
        let err = waiter.lock_records(&[key]).await.unwrap_err();
        assert!(err.is_retryable(), "expected conflict, got {err:?}");

        holder.rollback().await.unwrap();
        assert!(waiter.lock_records(&[key]).await.is_ok());
    }

    #[tokio::test]
    async fn records_come_back_in_lock_order() {
        let store = InMemoryStockStore::new();
        let mut keys = vec![key(), key(), key()];
        for k in &keys {
            store.seed_record(record(*k, 1)).unwrap();
        }

        let mut tx = store.begin().await.unwrap();
        let reversed: Vec<StockKey> = keys.iter().rev().copied().collect();
        let locked = tx.lock_records(&reversed).await.unwrap();

        keys.sort();
        let locked_keys: Vec<StockKey> = locked.iter().map(StockRecord::key).collect();
        assert_eq!(locked_keys, keys);
    }

    #[tokio::test]
    async fn writes_require_the_row_lock() {
        let store = InMemoryStockStore::new();
        let key = key();
        store.seed_record(record(key, 1)).unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = tx.update_record(&record(key, 2)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Storage(_)));
    }

    #[tokio::test]
    async fn overlapping_transactions_serialize() {
        let store = InMemoryStockStore::new();
        let a = key();
        let b = key();
        store.seed_record(record(a, 0)).unwrap();
        store.seed_record(record(b, 0)).unwrap();

        let tasks = (0..20).map(|i| {
            let store = store.clone();
            // Alternate the order callers name the rows in.
            let keys = if i % 2 == 0 { vec![a, b] } else { vec![b, a] };
            tokio::spawn(async move {
                let mut tx = store.begin().await.unwrap();
                let locked = tx.lock_records(&keys).await.unwrap();
                for mut r in locked {
                    r.available_quantity += 1;
                    tx.update_record(&r).await.unwrap();
                }
                tokio::task::yield_now().await;
                tx.commit().await.unwrap();
            })
        });
        for result in futures::future::join_all(tasks).await {
            result.expect("task panicked");
        }

        assert_eq!(store.record(a).unwrap().available_quantity, 20);
        assert_eq!(store.record(b).unwrap().available_quantity, 20);
    }
}
