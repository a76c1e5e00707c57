//! The stock ledger engine.
//!
//! Every mutating operation follows the same shape:
//!
//! ```text
//! begin
//!   lock touched rows (cart holds first, then stock records by StockKey)
//!   re-read and re-validate under the lock
//!   apply transitions, append one ledger entry per record change
//! commit   (any error: rollback, nothing is visible)
//! ```
//!
//! The whole shape is re-run from `begin` when it fails with a concurrency
//! conflict, up to the configured retry budget.

use crate::config::EngineConfig;
use crate::location::ensure_default_location;
use crate::metrics::LedgerMetrics;
use crate::retry::{RetryPolicy, retry_ledger_operation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use stockledger_core::environment::Clock;
use stockledger_core::store::{LedgerTransaction, StockStore};
use stockledger_core::{
    ActorId, AdjustmentEntry, AdjustmentType, CartLineId, DateTime, DefaultLocationResolver,
    ItemRef, LedgerError, LineItem, LocationId, LocationResolver, MovementContext, OrderRef,
    OrderReservation, ReservationState, Result, Shortfall, StockCondition, StockKey, StockRecord,
    Utc,
};
use tracing::{debug, info, warn};

// ============================================================================
// Requests and results
// ============================================================================

/// Read-only availability answer for one requested line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityResult {
    /// Product or variant
    pub item: ItemRef,
    /// Resolved location
    pub location_id: LocationId,
    /// Units asked for
    pub requested: i64,
    /// Units on hand (0 when no record exists)
    pub available_quantity: i64,
    /// Units already held (0 when no record exists)
    pub reserved_quantity: i64,
    /// Units that could still be promised
    pub sellable_quantity: i64,
    /// Whether `sellable_quantity >= requested`
    pub is_available: bool,
    /// Why the line is unavailable, if it is
    pub message: Option<String>,
}

/// What [`StockLedgerEngine::release_reservation`] gives back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReleaseTarget {
    /// Every active reservation of an order
    Order(OrderRef),
    /// The hold on one cart line
    CartHold(CartLineId),
}

/// A manual change to the physical stock of one record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentRequest {
    /// Product or variant
    pub item: ItemRef,
    /// Location; `None` uses the default location
    pub location_id: Option<LocationId>,
    /// Signed delta applied to `available_quantity`
    pub quantity_change: i64,
    /// Why (stock count, damage, supplier delivery, ...)
    pub reason: String,
    /// External reference such as a count sheet number
    pub reference_number: Option<String>,
    /// Operator notes
    pub notes: Option<String>,
    /// Record a negative change as a write-off instead of a plain decrease
    pub write_off: bool,
    /// Permit the result to go below zero
    pub allow_negative: bool,
}

impl AdjustmentRequest {
    /// Adjustment at the default location
    #[must_use]
    pub fn new(item: ItemRef, quantity_change: i64, reason: impl Into<String>) -> Self {
        Self {
            item,
            location_id: None,
            quantity_change,
            reason: reason.into(),
            reference_number: None,
            notes: None,
            write_off: false,
            allow_negative: false,
        }
    }

    /// Target an explicit location
    #[must_use]
    pub const fn at(mut self, location_id: LocationId) -> Self {
        self.location_id = Some(location_id);
        self
    }

    /// Attach an external reference
    #[must_use]
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference_number = Some(reference.into());
        self
    }

    /// Attach notes
    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Classify as a write-off
    #[must_use]
    pub const fn write_off(mut self) -> Self {
        self.write_off = true;
        self
    }

    /// Permit a negative result
    #[must_use]
    pub const fn allow_negative(mut self) -> Self {
        self.allow_negative = true;
        self
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Validates availability and applies the five ledger transitions.
///
/// Cheap to clone; clones share the store, clock and location resolver.
pub struct StockLedgerEngine<S: StockStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    locations: Arc<dyn LocationResolver>,
    config: EngineConfig,
    retry: RetryPolicy,
}

impl<S: StockStore> Clone for StockLedgerEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            locations: Arc::clone(&self.locations),
            config: self.config.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<S: StockStore> StockLedgerEngine<S> {
    /// Creates an engine with an explicit location resolver.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        locations: Arc<dyn LocationResolver>,
        config: EngineConfig,
    ) -> Self {
        let retry = config.retry_policy();
        Self {
            store,
            clock,
            locations,
            config,
            retry,
        }
    }

    /// Resolve (creating if needed) the default location once, then build an
    /// engine that falls back to it.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the location cannot be read or created.
    pub async fn bootstrap(store: Arc<S>, clock: Arc<dyn Clock>, config: EngineConfig) -> Result<Self> {
        let location = ensure_default_location(
            store.as_ref(),
            &config.default_location_code,
            &config.default_location_name,
            clock.now(),
        )
        .await?;
        let resolver = Arc::new(DefaultLocationResolver::new(location.id));
        Ok(Self::new(store, clock, resolver, config))
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Engine configuration
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Underlying store
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn key_for(&self, item: ItemRef, location_id: Option<LocationId>) -> StockKey {
        StockKey::new(item, self.locations.resolve(location_id))
    }

    /// Run `attempt` with retries, recording the outcome.
    pub(crate) async fn run<T, F, Fut>(&self, operation: &'static str, attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = retry_ledger_operation(&self.retry, operation, attempt).await;
        LedgerMetrics::record_operation(operation, &result, started.elapsed());
        if let Err(err) = &result {
            debug!(operation, error = %err, kind = err.kind(), "Ledger operation failed");
        }
        result
    }

    /// Sum duplicate lines per resolved key, rejecting empty or zero-quantity input.
    fn resolve_lines(&self, items: &[LineItem]) -> Result<BTreeMap<StockKey, i64>> {
        if items.is_empty() {
            return Err(LedgerError::InvalidRequest("at least one line item is required".to_string()));
        }
        let mut lines = BTreeMap::new();
        for line in items {
            if line.quantity == 0 {
                return Err(LedgerError::InvalidRequest(format!(
                    "quantity for {} must be positive",
                    line.item
                )));
            }
            *lines.entry(self.key_for(line.item, line.location_id)).or_insert(0) += i64::from(line.quantity);
        }
        Ok(lines)
    }

    // ------------------------------------------------------------------------
    // Read side
    // ------------------------------------------------------------------------

    /// Check whether each line could be reserved right now.
    ///
    /// This is an unlocked snapshot for display. It never gates a mutation:
    /// reservation re-validates under row locks.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the records cannot be read.
    pub async fn validate_availability(&self, items: &[LineItem]) -> Result<Vec<AvailabilityResult>> {
        let keys: Vec<StockKey> = items
            .iter()
            .map(|line| self.key_for(line.item, line.location_id))
            .collect();
        let records: BTreeMap<StockKey, StockRecord> = self
            .store
            .find_records(&keys)
            .await?
            .into_iter()
            .map(|record| (record.key(), record))
            .collect();

        Ok(items
            .iter()
            .zip(keys)
            .map(|(line, key)| {
                let requested = i64::from(line.quantity);
                match records.get(&key) {
                    Some(record) => {
                        let sellable = record.sellable_quantity();
                        let is_available = sellable >= requested;
                        let message = if record.condition != StockCondition::Sellable {
                            Some(format!("stock at {key} is {}", record.condition.as_str()))
                        } else if is_available {
                            None
                        } else {
                            Some(format!("only {sellable} of {requested} units sellable"))
                        };
                        AvailabilityResult {
                            item: key.item,
                            location_id: key.location_id,
                            requested,
                            available_quantity: record.available_quantity,
                            reserved_quantity: record.reserved_quantity,
                            sellable_quantity: sellable,
                            is_available,
                            message,
                        }
                    }
                    None => AvailabilityResult {
                        item: key.item,
                        location_id: key.location_id,
                        requested,
                        available_quantity: 0,
                        reserved_quantity: 0,
                        sellable_quantity: 0,
                        is_available: false,
                        message: Some(format!("no inventory record for {key}")),
                    },
                }
            })
            .collect())
    }

    /// Current state of one record.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::ItemNotFound`] if no record exists.
    pub async fn stock_record(&self, item: ItemRef, location_id: Option<LocationId>) -> Result<StockRecord> {
        let key = self.key_for(item, location_id);
        self.store
            .find_records(&[key])
            .await?
            .into_iter()
            .next()
            .ok_or(LedgerError::ItemNotFound(key))
    }

    /// Ledger entries of one record, newest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the ledger cannot be read.
    pub async fn history(
        &self,
        item: ItemRef,
        location_id: Option<LocationId>,
        limit: usize,
    ) -> Result<Vec<AdjustmentEntry>> {
        self.store
            .adjustment_history(self.key_for(item, location_id), limit)
            .await
    }

    // ------------------------------------------------------------------------
    // Reserve
    // ------------------------------------------------------------------------

    /// Hold stock for an order.
    ///
    /// All lines succeed or none do. With `allow_overselling` the hold is
    /// placed even when it exceeds sellable stock.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::ItemNotFound`] if a line has no record
    /// - [`LedgerError::InsufficientStock`] listing every failing line
    /// - [`LedgerError::InvalidRequest`] for empty input or zero quantities
    #[tracing::instrument(skip(self, items), fields(order = %order.order_number))]
    pub async fn reserve_for_order(
        &self,
        order: &OrderRef,
        items: &[LineItem],
        actor: ActorId,
        allow_overselling: bool,
    ) -> Result<Vec<StockRecord>> {
        let lines = self.resolve_lines(items)?;
        self.run("reserve_for_order", || {
            self.reserve_once(order, &lines, actor, allow_overselling)
        })
        .await
    }

    async fn reserve_once(
        &self,
        order: &OrderRef,
        lines: &BTreeMap<StockKey, i64>,
        actor: ActorId,
        allow_overselling: bool,
    ) -> Result<Vec<StockRecord>> {
        let mut tx = self.store.begin().await?;
        let result = self
            .reserve_in(&mut tx, order, lines, actor, allow_overselling)
            .await;
        finish(tx, result).await
    }

    async fn reserve_in(
        &self,
        tx: &mut S::Transaction,
        order: &OrderRef,
        lines: &BTreeMap<StockKey, i64>,
        actor: ActorId,
        allow_overselling: bool,
    ) -> Result<Vec<StockRecord>> {
        let mut records = lock_existing(tx, lines).await?;

        let shortfalls: Vec<Shortfall> = records
            .iter()
            .zip(lines.values())
            .filter(|(record, requested)| record.sellable_quantity() < **requested)
            .map(|(record, requested)| Shortfall {
                key: record.key(),
                requested: *requested,
                sellable: record.sellable_quantity(),
            })
            .collect();
        if !shortfalls.is_empty() {
            if !allow_overselling {
                return Err(LedgerError::InsufficientStock { shortfalls });
            }
            warn!(
                order = %order.order_number,
                lines = shortfalls.len(),
                "Overselling: reserving beyond sellable stock"
            );
            LedgerMetrics::record_override("reserve_for_order");
        }

        let now = self.now();
        let ctx = MovementContext::new(actor, format!("Reserved for order {}", order.order_number), now)
            .with_reference(order.order_number.clone());
        let mut reservations: BTreeMap<StockKey, OrderReservation> = tx
            .order_reservations(order.order_id)
            .await?
            .into_iter()
            .map(|reservation| (reservation.key, reservation))
            .collect();

        for (record, quantity) in records.iter_mut().zip(lines.values()) {
            let entry = record.reserve(*quantity, &ctx)?;
            tx.update_record(record).await?;
            tx.append_adjustment(&entry).await?;

            let reservation = match reservations.remove(&record.key()) {
                Some(mut existing) => {
                    existing.add(*quantity, now);
                    existing
                }
                None => OrderReservation::active(order.order_id, record.key(), *quantity, now),
            };
            tx.save_order_reservation(&reservation).await?;
        }

        info!(order = %order.order_number, lines = records.len(), "Stock reserved for order");
        Ok(records)
    }

    // ------------------------------------------------------------------------
    // Fulfill
    // ------------------------------------------------------------------------

    /// Ship an order: consume physical stock and the matching holds.
    ///
    /// `lines` are the order's shipped lines as known by the order feature.
    /// With `allow_negative` shipment proceeds even when available stock would
    /// drop below zero.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::ItemNotFound`] if a line has no record
    /// - [`LedgerError::InsufficientStock`] if available stock would go negative
    /// - [`LedgerError::InvalidRequest`] for empty input or zero quantities
    #[tracing::instrument(skip(self, lines), fields(order = %order.order_number))]
    pub async fn fulfill_order(
        &self,
        order: &OrderRef,
        lines: &[LineItem],
        actor: ActorId,
        allow_negative: bool,
    ) -> Result<Vec<StockRecord>> {
        let lines = self.resolve_lines(lines)?;
        self.run("fulfill_order", || self.fulfill_once(order, &lines, actor, allow_negative))
            .await
    }

    async fn fulfill_once(
        &self,
        order: &OrderRef,
        lines: &BTreeMap<StockKey, i64>,
        actor: ActorId,
        allow_negative: bool,
    ) -> Result<Vec<StockRecord>> {
        let mut tx = self.store.begin().await?;
        let result = self.fulfill_in(&mut tx, order, lines, actor, allow_negative).await;
        finish(tx, result).await
    }

    async fn fulfill_in(
        &self,
        tx: &mut S::Transaction,
        order: &OrderRef,
        lines: &BTreeMap<StockKey, i64>,
        actor: ActorId,
        allow_negative: bool,
    ) -> Result<Vec<StockRecord>> {
        let mut records = lock_existing(tx, lines).await?;

        let shortfalls: Vec<Shortfall> = records
            .iter()
            .zip(lines.values())
            .filter(|(record, shipped)| record.available_quantity < **shipped)
            .map(|(record, shipped)| Shortfall {
                key: record.key(),
                requested: *shipped,
                sellable: record.available_quantity,
            })
            .collect();
        if !shortfalls.is_empty() {
            if !allow_negative {
                return Err(LedgerError::InsufficientStock { shortfalls });
            }
            warn!(
                order = %order.order_number,
                lines = shortfalls.len(),
                "Fulfilling into negative available stock"
            );
            LedgerMetrics::record_override("fulfill_order");
        }

        let now = self.now();
        let ctx = MovementContext::new(actor, format!("Order {} fulfilled", order.order_number), now)
            .with_reference(order.order_number.clone());
        let mut reservations: BTreeMap<StockKey, OrderReservation> = tx
            .order_reservations(order.order_id)
            .await?
            .into_iter()
            .map(|reservation| (reservation.key, reservation))
            .collect();

        for (record, shipped) in records.iter_mut().zip(lines.values()) {
            let entry = record.fulfill(*shipped, &ctx)?;
            tx.update_record(record).await?;
            tx.append_adjustment(&entry).await?;

            if let Some(mut reservation) = reservations
                .remove(&record.key())
                .filter(OrderReservation::is_active)
            {
                reservation.consume(*shipped, now);
                tx.save_order_reservation(&reservation).await?;
            }
        }

        info!(order = %order.order_number, lines = records.len(), "Order fulfilled");
        Ok(records)
    }

    // ------------------------------------------------------------------------
    // Release
    // ------------------------------------------------------------------------

    /// Give back what an order or cart line still holds.
    ///
    /// Idempotent: when nothing is held the call succeeds, returns no records
    /// and writes no ledger entries.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrencyConflict` after exhausted retries, or a storage error.
    #[tracing::instrument(skip(self))]
    pub async fn release_reservation(&self, target: &ReleaseTarget, actor: ActorId) -> Result<Vec<StockRecord>> {
        self.run("release_reservation", || self.release_once(target, actor))
            .await
    }

    async fn release_once(&self, target: &ReleaseTarget, actor: ActorId) -> Result<Vec<StockRecord>> {
        let mut tx = self.store.begin().await?;
        let result = match target {
            ReleaseTarget::Order(order) => self.release_order_in(&mut tx, order, actor).await,
            ReleaseTarget::CartHold(cart_line_id) => self
                .release_hold_in(&mut tx, *cart_line_id, actor, "Cart hold released", None)
                .await
                .map(|released| released.into_iter().collect()),
        };
        finish(tx, result).await
    }

    async fn release_order_in(
        &self,
        tx: &mut S::Transaction,
        order: &OrderRef,
        actor: ActorId,
    ) -> Result<Vec<StockRecord>> {
        let keys: Vec<StockKey> = tx
            .order_reservations(order.order_id)
            .await?
            .into_iter()
            .filter(OrderReservation::is_active)
            .map(|reservation| reservation.key)
            .collect();
        if keys.is_empty() {
            debug!(order = %order.order_number, "Nothing held for order, release is a no-op");
            return Ok(Vec::new());
        }

        let locked = tx.lock_records(&keys).await?;
        // Re-read under the record locks: a concurrent fulfill may have closed rows.
        let mut active: BTreeMap<StockKey, OrderReservation> = tx
            .order_reservations(order.order_id)
            .await?
            .into_iter()
            .filter(OrderReservation::is_active)
            .map(|reservation| (reservation.key, reservation))
            .collect();
        // A reservation on a record that is not locked was added after the
        // first read. Start over so its record is locked too.
        if let Some(key) = active.keys().find(|key| !keys.contains(key)) {
            return Err(LedgerError::ConcurrencyConflict(format!(
                "order {} reserved {key} while being released",
                order.order_number
            )));
        }

        let now = self.now();
        let ctx = MovementContext::new(actor, format!("Reservation released for order {}", order.order_number), now)
            .with_reference(order.order_number.clone());
        let mut released = Vec::new();

        for mut record in locked {
            let Some(mut reservation) = active.remove(&record.key()) else {
                continue;
            };
            let entry = record.release(reservation.quantity, &ctx);
            tx.update_record(&record).await?;
            tx.append_adjustment(&entry).await?;
            reservation.close(ReservationState::Released, now);
            tx.save_order_reservation(&reservation).await?;
            released.push(record);
        }

        // A reservation whose record could not be locked points at a missing row.
        if let Some(key) = active.into_keys().next() {
            return Err(LedgerError::ItemNotFound(key));
        }

        info!(order = %order.order_number, lines = released.len(), "Order reservation released");
        Ok(released)
    }

    /// Release the hold on one cart line inside `tx`.
    ///
    /// With `expired_before`, the hold is only released if it is still expired
    /// at that instant once its row is locked; an extended or replaced hold is
    /// left alone.
    pub(crate) async fn release_hold_in(
        &self,
        tx: &mut S::Transaction,
        cart_line_id: CartLineId,
        actor: ActorId,
        reason: &str,
        expired_before: Option<DateTime<Utc>>,
    ) -> Result<Option<StockRecord>> {
        let Some(hold) = tx.lock_hold(cart_line_id).await? else {
            return Ok(None);
        };
        if expired_before.is_some_and(|cutoff| !hold.is_expired(cutoff)) {
            debug!(%cart_line_id, "Hold no longer expired, leaving it");
            return Ok(None);
        }

        let Some(mut record) = tx.lock_records(&[hold.key]).await?.into_iter().next() else {
            return Err(LedgerError::ItemNotFound(hold.key));
        };
        let ctx = MovementContext::new(actor, reason, self.now())
            .with_reference(hold.reservation_id.to_string());
        let entry = record.release(hold.quantity, &ctx);
        tx.update_record(&record).await?;
        tx.append_adjustment(&entry).await?;
        tx.clear_hold(cart_line_id).await?;

        info!(%cart_line_id, key = %hold.key, quantity = hold.quantity, "Cart hold released");
        Ok(Some(record))
    }

    // ------------------------------------------------------------------------
    // Return
    // ------------------------------------------------------------------------

    /// Take back returned units.
    ///
    /// With `restock` each line's units go back to `available_quantity`
    /// (creating the record if needed). Without it nothing is written and the
    /// current records are returned as they are.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidRequest`] for empty input or zero quantities.
    #[tracing::instrument(skip(self, lines), fields(order = %order.order_number))]
    pub async fn process_return(
        &self,
        order: &OrderRef,
        lines: &[LineItem],
        actor: ActorId,
        restock: bool,
    ) -> Result<Vec<StockRecord>> {
        let lines = self.resolve_lines(lines)?;
        if !restock {
            let keys: Vec<StockKey> = lines.keys().copied().collect();
            return self.store.find_records(&keys).await;
        }
        self.run("process_return", || self.return_once(order, &lines, actor))
            .await
    }

    async fn return_once(
        &self,
        order: &OrderRef,
        lines: &BTreeMap<StockKey, i64>,
        actor: ActorId,
    ) -> Result<Vec<StockRecord>> {
        let mut tx = self.store.begin().await?;
        let result = self.return_in(&mut tx, order, lines, actor).await;
        finish(tx, result).await
    }

    async fn return_in(
        &self,
        tx: &mut S::Transaction,
        order: &OrderRef,
        lines: &BTreeMap<StockKey, i64>,
        actor: ActorId,
    ) -> Result<Vec<StockRecord>> {
        let now = self.now();
        let ctx = MovementContext::new(actor, format!("Order {} returned", order.order_number), now)
            .with_reference(order.order_number.clone());

        let mut restocked = Vec::with_capacity(lines.len());
        for (key, quantity) in lines {
            let seed = StockRecord::new(*key, self.config.low_stock_threshold, now);
            let mut record = tx.lock_or_create_record(&seed).await?;
            let entry = record.restock(*quantity, &ctx)?;
            tx.update_record(&record).await?;
            tx.append_adjustment(&entry).await?;
            restocked.push(record);
        }

        info!(order = %order.order_number, lines = restocked.len(), "Return restocked");
        Ok(restocked)
    }

    // ------------------------------------------------------------------------
    // Manual adjustment and condition
    // ------------------------------------------------------------------------

    /// Apply a manual change to physical stock, creating the record if needed.
    ///
    /// Adjustments are commands: two identical calls apply twice.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::NegativeQuantity`] if the result would be negative
    ///   without `allow_negative`
    /// - [`LedgerError::InvalidRequest`] for an empty reason, a write-off
    ///   that does not remove stock, or a change that overflows the quantity
    #[tracing::instrument(skip(self, request), fields(item = %request.item, change = request.quantity_change))]
    pub async fn adjust_inventory(&self, request: &AdjustmentRequest, actor: ActorId) -> Result<StockRecord> {
        if request.reason.trim().is_empty() {
            return Err(LedgerError::InvalidRequest("adjustment reason is required".to_string()));
        }
        if request.write_off && request.quantity_change >= 0 {
            return Err(LedgerError::InvalidRequest(
                "a write-off must remove stock".to_string(),
            ));
        }
        let key = self.key_for(request.item, request.location_id);
        self.run("adjust_inventory", || self.adjust_once(key, request, actor))
            .await
    }

    async fn adjust_once(&self, key: StockKey, request: &AdjustmentRequest, actor: ActorId) -> Result<StockRecord> {
        let mut tx = self.store.begin().await?;
        let result = self.adjust_in(&mut tx, key, request, actor).await;
        finish(tx, result).await
    }

    async fn adjust_in(
        &self,
        tx: &mut S::Transaction,
        key: StockKey,
        request: &AdjustmentRequest,
        actor: ActorId,
    ) -> Result<StockRecord> {
        let now = self.now();
        let seed = StockRecord::new(key, self.config.low_stock_threshold, now);
        let mut record = tx.lock_or_create_record(&seed).await?;

        let before = record.available_quantity;
        let after = before.checked_add(request.quantity_change).ok_or_else(|| {
            LedgerError::InvalidRequest(format!(
                "change of {} overflows available quantity {before}",
                request.quantity_change
            ))
        })?;
        if after < 0 {
            if !request.allow_negative {
                return Err(LedgerError::NegativeQuantity {
                    key,
                    before,
                    change: request.quantity_change,
                    after,
                });
            }
            warn!(%key, before, after, "Adjusting into negative available stock");
            LedgerMetrics::record_override("adjust_inventory");
        }

        let adjustment_type = if request.write_off {
            AdjustmentType::WriteOff
        } else {
            AdjustmentType::from_change(request.quantity_change)
        };
        let mut ctx = MovementContext::new(actor, request.reason.clone(), now).with_notes(request.notes.clone());
        if let Some(reference) = &request.reference_number {
            ctx = ctx.with_reference(reference.clone());
        }

        let entry = record.adjust(request.quantity_change, adjustment_type, &ctx)?;
        tx.update_record(&record).await?;
        tx.append_adjustment(&entry).await?;

        info!(%key, before, after, kind = adjustment_type.as_str(), "Inventory adjusted");
        Ok(record)
    }

    /// Change the physical condition of a record.
    ///
    /// Setting the condition it already has is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::ItemNotFound`] if no record exists.
    #[tracing::instrument(skip(self, reason))]
    pub async fn set_condition(
        &self,
        item: ItemRef,
        location_id: Option<LocationId>,
        condition: StockCondition,
        actor: ActorId,
        reason: &str,
    ) -> Result<StockRecord> {
        let key = self.key_for(item, location_id);
        self.run("set_condition", || self.set_condition_once(key, condition, actor, reason))
            .await
    }

    async fn set_condition_once(
        &self,
        key: StockKey,
        condition: StockCondition,
        actor: ActorId,
        reason: &str,
    ) -> Result<StockRecord> {
        let mut tx = self.store.begin().await?;
        let result: Result<StockRecord> = async {
            let mut record = tx
                .lock_records(&[key])
                .await?
                .into_iter()
                .next()
                .ok_or(LedgerError::ItemNotFound(key))?;
            if record.condition == condition {
                return Ok(record);
            }
            let ctx = MovementContext::new(actor, reason, self.now());
            let entry = record.set_condition(condition, &ctx);
            tx.update_record(&record).await?;
            tx.append_adjustment(&entry).await?;
            info!(%key, condition = condition.as_str(), "Stock condition changed");
            Ok(record)
        }
        .await;
        finish(tx, result).await
    }

    // ------------------------------------------------------------------------
    // Onboarding
    // ------------------------------------------------------------------------

    /// Make sure a record exists, creating an empty one if needed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the record cannot be created.
    pub async fn ensure_record(&self, item: ItemRef, location_id: Option<LocationId>) -> Result<StockRecord> {
        let mut records = self.initialize_records(&[item], location_id).await?;
        records
            .pop()
            .ok_or_else(|| LedgerError::Storage("ensure_record created no record".to_string()))
    }

    /// Create empty records for many items at one location. Existing records
    /// are returned untouched.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the records cannot be created.
    pub async fn initialize_records(
        &self,
        items: &[ItemRef],
        location_id: Option<LocationId>,
    ) -> Result<Vec<StockRecord>> {
        let mut keys: Vec<StockKey> = items
            .iter()
            .map(|item| self.key_for(*item, location_id))
            .collect();
        keys.sort_unstable();
        keys.dedup();
        self.run("initialize_records", || self.initialize_once(&keys))
            .await
    }

    async fn initialize_once(&self, keys: &[StockKey]) -> Result<Vec<StockRecord>> {
        let mut tx = self.store.begin().await?;
        let result: Result<Vec<StockRecord>> = async {
            let now = self.now();
            let mut records = Vec::with_capacity(keys.len());
            for key in keys {
                let seed = StockRecord::new(*key, self.config.low_stock_threshold, now);
                records.push(tx.lock_or_create_record(&seed).await?);
            }
            Ok(records)
        }
        .await;
        finish(tx, result).await
    }
}

// ============================================================================
// Transaction helpers
// ============================================================================

/// Lock the records for `lines` and fail with `ItemNotFound` if any is missing.
///
/// The result is aligned with `lines` (both in `StockKey` order).
async fn lock_existing<T: LedgerTransaction>(
    tx: &mut T,
    lines: &BTreeMap<StockKey, i64>,
) -> Result<Vec<StockRecord>> {
    let keys: Vec<StockKey> = lines.keys().copied().collect();
    let records = tx.lock_records(&keys).await?;
    debug!(rows = records.len(), "Stock records locked");

    if records.len() != keys.len() {
        let missing = keys
            .iter()
            .find(|key| !records.iter().any(|record| record.key() == **key))
            .copied();
        if let Some(key) = missing {
            return Err(LedgerError::ItemNotFound(key));
        }
    }
    Ok(records)
}

/// Commit on success, roll back on failure.
pub(crate) async fn finish<T, X: LedgerTransaction>(tx: X, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed; transaction discarded on drop");
            }
            Err(err)
        }
    }
}
