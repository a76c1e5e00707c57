//! Stock records and the quantity transitions applied to them.
//!
//! The transitions here are the functional core of the engine: each one takes
//! a locked record, mutates it in place and returns the [`AdjustmentEntry`]
//! describing what happened. They never perform I/O and never decide whether a
//! transition is allowed; availability and override checks happen in the
//! engine, under the row lock, before a transition is applied.

use crate::adjustment::{AdjustmentEntry, AdjustmentType, MovementContext};
use crate::error::LedgerError;
use crate::types::{ItemRef, LocationId, StockKey, StockRecordId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Physical condition of the units in a record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockCondition {
    /// Can be promised to customers
    #[default]
    Sellable,
    /// Damaged, awaiting write-off or repair
    Damaged,
    /// Held back pending inspection
    Quarantined,
    /// Past its sell-by date
    Expired,
}

impl StockCondition {
    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sellable => "sellable",
            Self::Damaged => "damaged",
            Self::Quarantined => "quarantined",
            Self::Expired => "expired",
        }
    }

    /// Parse from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known condition.
    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "sellable" => Ok(Self::Sellable),
            "damaged" => Ok(Self::Damaged),
            "quarantined" => Ok(Self::Quarantined),
            "expired" => Ok(Self::Expired),
            _ => Err(LedgerError::Storage(format!("Invalid stock condition: {s}"))),
        }
    }
}

/// Derived stock label, recomputed after every mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    /// Available quantity at or above the low-stock threshold
    InStock,
    /// Available quantity below the threshold but positive
    LowStock,
    /// Nothing on hand
    OutOfStock,
}

impl StockStatus {
    /// Derive the label from an available quantity.
    #[must_use]
    pub const fn derive(available: i64, low_stock_threshold: i64) -> Self {
        if available <= 0 {
            Self::OutOfStock
        } else if available < low_stock_threshold {
            Self::LowStock
        } else {
            Self::InStock
        }
    }

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InStock => "in_stock",
            Self::LowStock => "low_stock",
            Self::OutOfStock => "out_of_stock",
        }
    }

    /// Parse from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "in_stock" => Ok(Self::InStock),
            "low_stock" => Ok(Self::LowStock),
            "out_of_stock" => Ok(Self::OutOfStock),
            _ => Err(LedgerError::Storage(format!("Invalid stock status: {s}"))),
        }
    }
}

/// Available and reserved quantity for one item at one location.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    /// Row id
    pub id: StockRecordId,
    /// Product or variant
    pub item: ItemRef,
    /// Location
    pub location_id: LocationId,
    /// Physical units on hand
    pub available_quantity: i64,
    /// Units promised to open orders and cart holds
    pub reserved_quantity: i64,
    /// Physical condition
    pub condition: StockCondition,
    /// Derived label
    pub status: StockStatus,
    /// Available quantity under which the record is low-stock
    pub low_stock_threshold: i64,
    /// Cumulative units shipped
    pub total_sold: i64,
    /// Cumulative fulfillment events
    pub total_fulfilled: i64,
    /// Last change to either quantity
    pub last_stock_movement_at: Option<DateTime<Utc>>,
    /// Last shipment
    pub last_sale_at: Option<DateTime<Utc>>,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Last write
    pub updated_at: DateTime<Utc>,
}

impl StockRecord {
    /// Creates an empty record, the state every record starts in.
    #[must_use]
    pub fn new(key: StockKey, low_stock_threshold: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: StockRecordId::new(),
            item: key.item,
            location_id: key.location_id,
            available_quantity: 0,
            reserved_quantity: 0,
            condition: StockCondition::Sellable,
            status: StockStatus::derive(0, low_stock_threshold),
            low_stock_threshold,
            total_sold: 0,
            total_fulfilled: 0,
            last_stock_movement_at: None,
            last_sale_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Unique key of this record
    #[must_use]
    pub const fn key(&self) -> StockKey {
        StockKey::new(self.item, self.location_id)
    }

    /// Units that can still be promised to a new request.
    ///
    /// Non-sellable stock can never be promised, whatever its quantities.
    #[must_use]
    pub const fn sellable_quantity(&self) -> i64 {
        match self.condition {
            StockCondition::Sellable => self.available_quantity.saturating_sub(self.reserved_quantity),
            StockCondition::Damaged | StockCondition::Quarantined | StockCondition::Expired => 0,
        }
    }

    /// Place a hold: `reserved += quantity`. Nothing physical moves.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidRequest`] if the reserved count would overflow.
    pub fn reserve(&mut self, quantity: i64, ctx: &MovementContext) -> Result<AdjustmentEntry, LedgerError> {
        let before = self.clone();
        self.reserved_quantity = shifted(self.reserved_quantity, quantity, "reserved quantity")?;
        self.touch_movement(ctx.at);
        Ok(AdjustmentEntry::between(&before, self, AdjustmentType::Correction, ctx))
    }

    /// Drop a hold: `reserved -= quantity`, floored at zero.
    pub fn release(&mut self, quantity: i64, ctx: &MovementContext) -> AdjustmentEntry {
        let before = self.clone();
        self.reserved_quantity = (self.reserved_quantity - quantity).max(0);
        self.touch_movement(ctx.at);
        AdjustmentEntry::between(&before, self, AdjustmentType::Correction, ctx)
    }

    /// Ship units: consumes both the physical stock and the matching hold.
    ///
    /// This is the only transition that advances the sales counters.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidRequest`] if a counter would overflow.
    /// The record is left unchanged in that case.
    pub fn fulfill(&mut self, quantity: i64, ctx: &MovementContext) -> Result<AdjustmentEntry, LedgerError> {
        let available = self.available_quantity.checked_sub(quantity).ok_or_else(|| {
            LedgerError::InvalidRequest(format!(
                "available quantity {} cannot drop by {quantity}",
                self.available_quantity
            ))
        })?;
        let total_sold = shifted(self.total_sold, quantity, "total sold")?;
        let total_fulfilled = shifted(self.total_fulfilled, 1, "total fulfilled")?;

        let before = self.clone();
        self.available_quantity = available;
        self.reserved_quantity = self.reserved_quantity.saturating_sub(quantity).max(0);
        self.total_sold = total_sold;
        self.total_fulfilled = total_fulfilled;
        self.last_sale_at = Some(ctx.at);
        self.touch_movement(ctx.at);
        Ok(AdjustmentEntry::between(&before, self, AdjustmentType::Decrease, ctx))
    }

    /// Put returned units back on the shelf. Sales history is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidRequest`] if available stock would overflow.
    pub fn restock(&mut self, quantity: i64, ctx: &MovementContext) -> Result<AdjustmentEntry, LedgerError> {
        self.adjust(quantity, AdjustmentType::Increase, ctx)
    }

    /// Apply a manual delta to the physical stock.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidRequest`] if available stock would overflow.
    pub fn adjust(
        &mut self,
        change: i64,
        adjustment_type: AdjustmentType,
        ctx: &MovementContext,
    ) -> Result<AdjustmentEntry, LedgerError> {
        let before = self.clone();
        self.available_quantity = shifted(self.available_quantity, change, "available quantity")?;
        self.touch_movement(ctx.at);
        Ok(AdjustmentEntry::between(&before, self, adjustment_type, ctx))
    }

    /// Change the physical condition. Quantities are untouched.
    pub fn set_condition(
        &mut self,
        condition: StockCondition,
        ctx: &MovementContext,
    ) -> AdjustmentEntry {
        let before = self.clone();
        self.condition = condition;
        self.updated_at = ctx.at;
        AdjustmentEntry::between(&before, self, AdjustmentType::Correction, ctx)
    }

    fn touch_movement(&mut self, at: DateTime<Utc>) {
        self.last_stock_movement_at = Some(at);
        self.updated_at = at;
        self.status = StockStatus::derive(self.available_quantity, self.low_stock_threshold);
    }
}

fn shifted(value: i64, change: i64, what: &str) -> Result<i64, LedgerError> {
    value
        .checked_add(change)
        .ok_or_else(|| LedgerError::InvalidRequest(format!("{what} {value} cannot change by {change}")))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::types::{ActorId, ProductId};
    use chrono::Duration;
    use uuid::Uuid;

    fn record(available: i64, reserved: i64) -> StockRecord {
        let key = StockKey::new(ItemRef::Product(ProductId::new()), LocationId::new());
        let mut record = StockRecord::new(key, 10, Utc::now() - Duration::days(1));
        record.available_quantity = available;
        record.reserved_quantity = reserved;
        record.status = StockStatus::derive(available, 10);
        record
    }

    fn ctx() -> MovementContext {
        let actor = ActorId::from_uuid(Uuid::from_u128(42)).unwrap();
        MovementContext::new(actor, "test", Utc::now())
    }

    #[test]
    fn status_thresholds() {
        assert_eq!(StockStatus::derive(0, 10), StockStatus::OutOfStock);
        assert_eq!(StockStatus::derive(-3, 10), StockStatus::OutOfStock);
        assert_eq!(StockStatus::derive(9, 10), StockStatus::LowStock);
        assert_eq!(StockStatus::derive(10, 10), StockStatus::InStock);
    }

    #[test]
    fn reserve_moves_only_the_reservation_marker() {
        let mut r = record(100, 0);
        let ctx = ctx();
        let entry = r.reserve(10, &ctx).unwrap();

        assert_eq!(r.available_quantity, 100);
        assert_eq!(r.reserved_quantity, 10);
        assert_eq!(r.last_stock_movement_at, Some(ctx.at));
        assert_eq!(r.last_sale_at, None);
        assert_eq!(entry.quantity_change, 0);
        assert_eq!(entry.reserved_change(), 10);
        assert_eq!(entry.adjustment_type, AdjustmentType::Correction);
    }

    #[test]
    fn release_floors_at_zero() {
        let mut r = record(5, 2);
        let entry = r.release(7, &ctx());
        assert_eq!(r.reserved_quantity, 0);
        assert_eq!(entry.reserved_before, 2);
        assert_eq!(entry.reserved_after, 0);
    }

    #[test]
    fn fulfill_advances_sales_counters() {
        let mut r = record(100, 10);
        let ctx = ctx();
        let entry = r.fulfill(10, &ctx).unwrap();

        assert_eq!(r.available_quantity, 90);
        assert_eq!(r.reserved_quantity, 0);
        assert_eq!(r.total_sold, 10);
        assert_eq!(r.total_fulfilled, 1);
        assert_eq!(r.last_sale_at, Some(ctx.at));
        assert_eq!(entry.adjustment_type, AdjustmentType::Decrease);
        assert_eq!(entry.quantity_change, -10);
        assert_eq!((entry.quantity_before, entry.quantity_after), (100, 90));
    }

    #[test]
    fn restock_keeps_sales_history() {
        let mut r = record(90, 0);
        r.total_sold = 10;
        let entry = r.restock(10, &ctx()).unwrap();
        assert_eq!(r.available_quantity, 100);
        assert_eq!(r.total_sold, 10);
        assert_eq!(r.last_sale_at, None);
        assert_eq!(entry.adjustment_type, AdjustmentType::Increase);
    }

    #[test]
    fn adjust_recomputes_status() {
        let mut r = record(12, 0);
        r.adjust(-5, AdjustmentType::Decrease, &ctx()).unwrap();
        assert_eq!(r.status, StockStatus::LowStock);
        r.adjust(-7, AdjustmentType::Decrease, &ctx()).unwrap();
        assert_eq!(r.status, StockStatus::OutOfStock);
    }

    #[test]
    fn overflowing_changes_are_rejected_without_mutation() {
        let mut r = record(10, 0);
        let err = r.adjust(i64::MAX, AdjustmentType::Increase, &ctx()).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRequest(_)));
        assert_eq!(r.available_quantity, 10);
        assert_eq!(r.last_stock_movement_at, None);

        let mut r = record(i64::MIN + 1, 0);
        assert!(r.fulfill(5, &ctx()).is_err());
        assert_eq!(r.total_sold, 0);
    }

    #[test]
    fn non_sellable_stock_cannot_be_promised() {
        let mut r = record(50, 5);
        assert_eq!(r.sellable_quantity(), 45);
        let entry = r.set_condition(StockCondition::Quarantined, &ctx());
        assert_eq!(r.sellable_quantity(), 0);
        assert_eq!(entry.quantity_change, 0);
        assert_eq!(r.last_stock_movement_at, None);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn reserve_then_release_restores_the_record(available in 0i64..1_000, reserved in 0i64..100, n in 1i64..100) {
                let mut r = record(available, reserved);
                let ctx = ctx();
                r.reserve(n, &ctx).unwrap();
                r.release(n, &ctx);
                prop_assert_eq!(r.available_quantity, available);
                prop_assert_eq!(r.reserved_quantity, reserved);
            }

            #[test]
            fn every_entry_balances(start in -50i64..500, change in -200i64..200) {
                let mut r = record(start, 0);
                let entry = r.adjust(change, AdjustmentType::from_change(change), &ctx()).unwrap();
                prop_assert_eq!(entry.quantity_after - entry.quantity_before, entry.quantity_change);
                prop_assert_eq!(entry.quantity_after, r.available_quantity);
                prop_assert_eq!(r.status, StockStatus::derive(r.available_quantity, r.low_stock_threshold));
            }
        }
    }
}
