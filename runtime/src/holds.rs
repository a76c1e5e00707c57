//! Cart holds: short-lived reservations written onto cart lines.
//!
//! A hold is created when a shopper adds a line to their cart and lives until
//! it is released, replaced, converted into an order reservation, or reclaimed
//! by the expiry sweep. Expiry is lazy: a hold past its `expires_at` keeps
//! counting against stock until the sweep releases it.

use crate::engine::{StockLedgerEngine, finish};
use crate::metrics::LedgerMetrics;
use std::collections::BTreeMap;
use stockledger_core::store::{LedgerTransaction, StockStore};
use stockledger_core::{
    ActorId, AdjustmentEntry, AdjustmentType, CartHold, CartId, CartLineId, CartLineRef, DateTime,
    HoldToken, LedgerError, LineItem, MovementContext, OrderRef, OrderReservation, Result, Shortfall,
    StockKey, StockRecord, Utc,
};
use tracing::{info, warn};

/// Outcome of one expiry sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired holds found
    pub examined: usize,
    /// Holds released
    pub released: usize,
    /// Holds that could not be released this time
    pub failed: usize,
}

/// Places, extends, converts, releases and sweeps cart holds.
pub struct CartHoldManager<S: StockStore> {
    engine: StockLedgerEngine<S>,
}

impl<S: StockStore> Clone for CartHoldManager<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<S: StockStore> CartHoldManager<S> {
    /// Creates a manager sharing `engine`'s store, clock and configuration.
    #[must_use]
    pub const fn new(engine: StockLedgerEngine<S>) -> Self {
        Self { engine }
    }

    /// The engine holds are applied through
    #[must_use]
    pub const fn engine(&self) -> &StockLedgerEngine<S> {
        &self.engine
    }

    /// Hold stock for a cart line with the configured TTL.
    ///
    /// See [`reserve_for`](Self::reserve_for).
    ///
    /// # Errors
    ///
    /// See [`reserve_for`](Self::reserve_for). A configured TTL too large for
    /// a [`chrono::Duration`] is reported as [`LedgerError::InvalidRequest`].
    pub async fn reserve(&self, cart_line: CartLineRef, line: LineItem, actor: ActorId) -> Result<CartHold> {
        let ttl = self.engine.config().cart_hold_ttl()?;
        self.reserve_for(cart_line, line, actor, ttl).await
    }

    /// Hold stock for a cart line for `ttl`.
    ///
    /// Any previous hold on the line is released first, in the same
    /// transaction, so its units count towards the new request.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::ItemNotFound`] if the item has no record
    /// - [`LedgerError::InsufficientStock`] if sellable stock is too low
    /// - [`LedgerError::InvalidRequest`] for a zero quantity, or a TTL that is
    ///   not positive or runs past the representable time range
    #[tracing::instrument(skip(self, line), fields(item = %line.item, quantity = line.quantity))]
    pub async fn reserve_for(
        &self,
        cart_line: CartLineRef,
        line: LineItem,
        actor: ActorId,
        ttl: chrono::Duration,
    ) -> Result<CartHold> {
        if line.quantity == 0 {
            return Err(LedgerError::InvalidRequest("hold quantity must be positive".to_string()));
        }
        if ttl <= chrono::Duration::zero() {
            return Err(LedgerError::InvalidRequest("hold TTL must be positive".to_string()));
        }
        let key = self.engine.key_for(line.item, line.location_id);
        let quantity = i64::from(line.quantity);
        self.engine
            .run("reserve_cart_hold", || self.reserve_once(cart_line, key, quantity, actor, ttl))
            .await
    }

    async fn reserve_once(
        &self,
        cart_line: CartLineRef,
        key: StockKey,
        quantity: i64,
        actor: ActorId,
        ttl: chrono::Duration,
    ) -> Result<CartHold> {
        let mut tx = self.engine.store().begin().await?;
        let result = self
            .reserve_in(&mut tx, cart_line, key, quantity, actor, ttl)
            .await;
        finish(tx, result).await
    }

    async fn reserve_in(
        &self,
        tx: &mut S::Transaction,
        cart_line: CartLineRef,
        key: StockKey,
        quantity: i64,
        actor: ActorId,
        ttl: chrono::Duration,
    ) -> Result<CartHold> {
        let previous = tx.lock_hold(cart_line.cart_line_id).await?;

        let mut keys = vec![key];
        if let Some(previous) = &previous {
            keys.push(previous.key);
        }
        let mut records: BTreeMap<StockKey, StockRecord> = tx
            .lock_records(&keys)
            .await?
            .into_iter()
            .map(|record| (record.key(), record))
            .collect();
        if !records.contains_key(&key) {
            return Err(LedgerError::ItemNotFound(key));
        }

        let now = self.engine.now();
        if let Some(previous) = &previous {
            let ctx = MovementContext::new(actor, "Cart hold replaced", now)
                .with_reference(previous.reservation_id.to_string());
            let record = records
                .get_mut(&previous.key)
                .ok_or(LedgerError::ItemNotFound(previous.key))?;
            let entry = record.release(previous.quantity, &ctx);
            tx.append_adjustment(&entry).await?;
        }

        let record = records.get_mut(&key).ok_or(LedgerError::ItemNotFound(key))?;
        let sellable = record.sellable_quantity();
        if sellable < quantity {
            return Err(LedgerError::InsufficientStock {
                shortfalls: vec![Shortfall {
                    key,
                    requested: quantity,
                    sellable,
                }],
            });
        }

        let hold = CartHold {
            cart_line_id: cart_line.cart_line_id,
            cart_id: cart_line.cart_id,
            reservation_id: HoldToken::new(),
            key,
            quantity,
            reserved_at: now,
            expires_at: expiry_after(now, ttl)?,
        };
        let ctx = MovementContext::new(actor, "Cart hold placed", now)
            .with_reference(hold.reservation_id.to_string());
        let entry = record.reserve(quantity, &ctx)?;
        tx.append_adjustment(&entry).await?;

        for record in records.values() {
            tx.update_record(record).await?;
        }
        tx.save_hold(&hold).await?;

        info!(
            cart_line_id = %hold.cart_line_id,
            %key,
            quantity,
            replaced = previous.is_some(),
            "Cart hold placed"
        );
        Ok(hold)
    }

    /// Release the hold on a cart line. No hold is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrencyConflict` after exhausted retries, or a storage error.
    pub async fn release(&self, cart_line_id: CartLineId, actor: ActorId) -> Result<Option<StockRecord>> {
        self.engine
            .run("release_cart_hold", || self.release_once(cart_line_id, actor))
            .await
    }

    async fn release_once(&self, cart_line_id: CartLineId, actor: ActorId) -> Result<Option<StockRecord>> {
        let mut tx = self.engine.store().begin().await?;
        let result = self
            .engine
            .release_hold_in(&mut tx, cart_line_id, actor, "Cart hold released", None)
            .await;
        finish(tx, result).await
    }

    /// Push back the expiry of every hold on a cart.
    ///
    /// Each hold's new expiry is `max(expires_at, now) + additional`. Returns
    /// how many holds were extended.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidRequest`] for a non-positive extension or
    /// one that runs past the representable time range. No hold is changed
    /// in that case.
    pub async fn extend(&self, cart_id: CartId, additional: chrono::Duration) -> Result<usize> {
        if additional <= chrono::Duration::zero() {
            return Err(LedgerError::InvalidRequest("extension must be positive".to_string()));
        }
        self.engine
            .run("extend_cart_holds", || self.extend_once(cart_id, additional))
            .await
    }

    async fn extend_once(&self, cart_id: CartId, additional: chrono::Duration) -> Result<usize> {
        let mut tx = self.engine.store().begin().await?;
        let result: Result<usize> = async {
            let holds = tx.lock_cart_holds(cart_id).await?;
            let now = self.engine.now();
            for mut hold in holds.iter().cloned() {
                hold.expires_at = expiry_after(hold.expires_at.max(now), additional)?;
                tx.save_hold(&hold).await?;
            }
            Ok(holds.len())
        }
        .await;
        if let Ok(extended) = &result {
            info!(%cart_id, extended, "Cart holds extended");
        }
        finish(tx, result).await
    }

    /// Turn every hold of a cart into an order reservation.
    ///
    /// `reserved_quantity` is untouched: the same units simply change owner.
    /// Each converted hold gets a zero-change ledger entry and is cleared.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrencyConflict` after exhausted retries, or a storage error.
    #[tracing::instrument(skip(self), fields(order = %order.order_number))]
    pub async fn convert_to_order(
        &self,
        cart_id: CartId,
        order: &OrderRef,
        actor: ActorId,
    ) -> Result<Vec<OrderReservation>> {
        self.engine
            .run("convert_cart_to_order", || self.convert_once(cart_id, order, actor))
            .await
    }

    async fn convert_once(&self, cart_id: CartId, order: &OrderRef, actor: ActorId) -> Result<Vec<OrderReservation>> {
        let mut tx = self.engine.store().begin().await?;
        let result = self.convert_in(&mut tx, cart_id, order, actor).await;
        finish(tx, result).await
    }

    async fn convert_in(
        &self,
        tx: &mut S::Transaction,
        cart_id: CartId,
        order: &OrderRef,
        actor: ActorId,
    ) -> Result<Vec<OrderReservation>> {
        let holds = tx.lock_cart_holds(cart_id).await?;
        if holds.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<StockKey> = holds.iter().map(|hold| hold.key).collect();
        let records: BTreeMap<StockKey, StockRecord> = tx
            .lock_records(&keys)
            .await?
            .into_iter()
            .map(|record| (record.key(), record))
            .collect();

        let now = self.engine.now();
        let ctx = MovementContext::new(actor, format!("Cart converted to order {}", order.order_number), now)
            .with_reference(order.order_number.clone());
        let mut reservations: BTreeMap<StockKey, OrderReservation> = tx
            .order_reservations(order.order_id)
            .await?
            .into_iter()
            .map(|reservation| (reservation.key, reservation))
            .collect();

        for hold in &holds {
            let record = records.get(&hold.key).ok_or(LedgerError::ItemNotFound(hold.key))?;
            let entry = AdjustmentEntry::between(record, record, AdjustmentType::Correction, &ctx);
            tx.append_adjustment(&entry).await?;
            reservations
                .entry(hold.key)
                .and_modify(|reservation| reservation.add(hold.quantity, now))
                .or_insert_with(|| OrderReservation::active(order.order_id, hold.key, hold.quantity, now));
            tx.clear_hold(hold.cart_line_id).await?;
        }

        let converted: Vec<OrderReservation> = reservations
            .into_values()
            .filter(|reservation| keys.contains(&reservation.key))
            .collect();
        for reservation in &converted {
            tx.save_order_reservation(reservation).await?;
        }

        info!(%cart_id, order = %order.order_number, holds = holds.len(), "Cart holds converted to order");
        Ok(converted)
    }

    /// Release every hold that expired before now.
    ///
    /// Expired holds are read in batches of `sweep_batch_size` until a batch
    /// comes back short or releases nothing. Each hold is released in its own transaction that re-checks expiry
    /// under the hold's lock, so concurrent sweeps (or a shopper extending the
    /// cart mid-sweep) race to a no-op instead of a double release. Failures
    /// are logged and left for the next sweep.
    ///
    /// # Errors
    ///
    /// Returns a storage error only if the expired holds cannot be listed.
    pub async fn sweep_expired(&self, actor: ActorId) -> Result<SweepReport> {
        let now = self.engine.now();
        let batch_size = self.engine.config().sweep_batch_size;
        let mut report = SweepReport::default();

        loop {
            let expired = self.engine.store().expired_holds(now, batch_size).await?;
            let fetched = expired.len();
            let released_before = report.released;
            report.examined += fetched;

            for hold in expired {
                let outcome = self
                    .engine
                    .run("sweep_cart_hold", || self.sweep_one(hold.cart_line_id, actor, now))
                    .await;
                match outcome {
                    Ok(Some(_)) => report.released += 1,
                    Ok(None) => {}
                    Err(err) => {
                        warn!(cart_line_id = %hold.cart_line_id, error = %err, "Failed to release expired hold");
                        report.failed += 1;
                    }
                }
            }

            // Failed holds stay expired; a batch without progress would be read again.
            if fetched < batch_size || report.released == released_before {
                break;
            }
        }

        LedgerMetrics::record_sweep(report.released, report.failed);
        if report.examined > 0 {
            info!(
                examined = report.examined,
                released = report.released,
                failed = report.failed,
                "Expired cart holds swept"
            );
        }
        Ok(report)
    }

    async fn sweep_one(
        &self,
        cart_line_id: CartLineId,
        actor: ActorId,
        now: DateTime<Utc>,
    ) -> Result<Option<StockRecord>> {
        let mut tx = self.engine.store().begin().await?;
        let result = self
            .engine
            .release_hold_in(&mut tx, cart_line_id, actor, "Cart hold expired", Some(now))
            .await;
        finish(tx, result).await
    }
}

fn expiry_after(from: DateTime<Utc>, ttl: chrono::Duration) -> Result<DateTime<Utc>> {
    from.checked_add_signed(ttl)
        .ok_or_else(|| LedgerError::InvalidRequest(format!("hold expiry {from} + {ttl} is out of range")))
}
