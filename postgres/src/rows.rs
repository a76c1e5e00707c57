//! Row types returned by queries and their conversion into domain types.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use stockledger_core::{
    ActorId, AdjustmentEntry, AdjustmentId, AdjustmentType, CartHold, CartId, CartLineId, HoldToken,
    ItemRef, LedgerError, Location, LocationId, OrderId, OrderReservation, ReservationState,
    StockCondition, StockKey, StockRecord, StockRecordId, StockStatus,
};
use uuid::Uuid;

/// Columns selected for every stock record query.
pub(crate) const RECORD_COLUMNS: &str = "id, product_id, variant_id, location_id, available_quantity, \
     reserved_quantity, condition, status, low_stock_threshold, total_sold, total_fulfilled, \
     last_stock_movement_at, last_sale_at, created_at, updated_at";

/// Cart holds joined to their record so the key can be rebuilt.
pub(crate) const HOLD_SELECT: &str = "SELECT h.cart_line_id, h.cart_id, h.reservation_id, \
     r.product_id, r.variant_id, r.location_id, h.quantity, h.reserved_at, h.expires_at \
     FROM cart_holds h JOIN stock_records r ON r.id = h.inventory_id";

/// Order reservations joined to their record.
pub(crate) const RESERVATION_SELECT: &str = "SELECT o.order_id, r.product_id, r.variant_id, \
     r.location_id, o.quantity, o.state, o.reserved_at, o.updated_at \
     FROM order_reservations o JOIN stock_records r ON r.id = o.inventory_id";

fn key_from(product_id: Option<Uuid>, variant_id: Option<Uuid>, location_id: Uuid) -> Result<StockKey, LedgerError> {
    Ok(StockKey::new(
        ItemRef::from_columns(product_id, variant_id)?,
        LocationId::from_uuid(location_id),
    ))
}

/// `(product_id, variant_id)` bind values for a key.
pub(crate) fn item_columns(key: &StockKey) -> (Option<Uuid>, Option<Uuid>) {
    (
        key.item.product_id().map(|id| *id.as_uuid()),
        key.item.variant_id().map(|id| *id.as_uuid()),
    )
}

#[derive(Debug, FromRow)]
pub(crate) struct StockRecordRow {
    id: Uuid,
    product_id: Option<Uuid>,
    variant_id: Option<Uuid>,
    location_id: Uuid,
    available_quantity: i64,
    reserved_quantity: i64,
    condition: String,
    status: String,
    low_stock_threshold: i64,
    total_sold: i64,
    total_fulfilled: i64,
    last_stock_movement_at: Option<DateTime<Utc>>,
    last_sale_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StockRecordRow> for StockRecord {
    type Error = LedgerError;

    fn try_from(row: StockRecordRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: StockRecordId::from_uuid(row.id),
            item: ItemRef::from_columns(row.product_id, row.variant_id)?,
            location_id: LocationId::from_uuid(row.location_id),
            available_quantity: row.available_quantity,
            reserved_quantity: row.reserved_quantity,
            condition: StockCondition::parse(&row.condition)?,
            status: StockStatus::parse(&row.status)?,
            low_stock_threshold: row.low_stock_threshold,
            total_sold: row.total_sold,
            total_fulfilled: row.total_fulfilled,
            last_stock_movement_at: row.last_stock_movement_at,
            last_sale_at: row.last_sale_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct AdjustmentRow {
    id: Uuid,
    inventory_id: Uuid,
    adjustment_type: String,
    quantity_change: i64,
    quantity_before: i64,
    quantity_after: i64,
    reserved_before: i64,
    reserved_after: i64,
    reason: String,
    reference_number: Option<String>,
    adjusted_by: Uuid,
    notes: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AdjustmentRow> for AdjustmentEntry {
    type Error = LedgerError;

    fn try_from(row: AdjustmentRow) -> Result<Self, Self::Error> {
        let adjusted_by = ActorId::from_uuid(row.adjusted_by)
            .map_err(|e| LedgerError::Storage(format!("Corrupt adjustment {}: {e}", row.id)))?;
        Ok(Self {
            id: AdjustmentId::from_uuid(row.id),
            inventory_id: StockRecordId::from_uuid(row.inventory_id),
            adjustment_type: AdjustmentType::parse(&row.adjustment_type)?,
            quantity_change: row.quantity_change,
            quantity_before: row.quantity_before,
            quantity_after: row.quantity_after,
            reserved_before: row.reserved_before,
            reserved_after: row.reserved_after,
            reason: row.reason,
            reference_number: row.reference_number,
            adjusted_by,
            notes: row.notes,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct CartHoldRow {
    cart_line_id: Uuid,
    cart_id: Uuid,
    reservation_id: Uuid,
    product_id: Option<Uuid>,
    variant_id: Option<Uuid>,
    location_id: Uuid,
    quantity: i64,
    reserved_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<CartHoldRow> for CartHold {
    type Error = LedgerError;

    fn try_from(row: CartHoldRow) -> Result<Self, Self::Error> {
        Ok(Self {
            cart_line_id: CartLineId::from_uuid(row.cart_line_id),
            cart_id: CartId::from_uuid(row.cart_id),
            reservation_id: HoldToken::from_uuid(row.reservation_id),
            key: key_from(row.product_id, row.variant_id, row.location_id)?,
            quantity: row.quantity,
            reserved_at: row.reserved_at,
            expires_at: row.expires_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct OrderReservationRow {
    order_id: Uuid,
    product_id: Option<Uuid>,
    variant_id: Option<Uuid>,
    location_id: Uuid,
    quantity: i64,
    state: String,
    reserved_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderReservationRow> for OrderReservation {
    type Error = LedgerError;

    fn try_from(row: OrderReservationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            order_id: OrderId::from_uuid(row.order_id),
            key: key_from(row.product_id, row.variant_id, row.location_id)?,
            quantity: row.quantity,
            state: ReservationState::parse(&row.state)?,
            reserved_at: row.reserved_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct LocationRow {
    id: Uuid,
    code: String,
    name: String,
    is_default: bool,
    created_at: DateTime<Utc>,
}

impl From<LocationRow> for Location {
    fn from(row: LocationRow) -> Self {
        Self {
            id: LocationId::from_uuid(row.id),
            code: row.code,
            name: row.name,
            is_default: row.is_default,
            created_at: row.created_at,
        }
    }
}

/// Convert a batch of rows, failing on the first corrupt one.
pub(crate) fn convert<R, T>(rows: Vec<R>) -> Result<Vec<T>, LedgerError>
where
    T: TryFrom<R, Error = LedgerError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn record_row(product_id: Option<Uuid>, variant_id: Option<Uuid>) -> StockRecordRow {
        let now = Utc::now();
        StockRecordRow {
            id: Uuid::new_v4(),
            product_id,
            variant_id,
            location_id: Uuid::new_v4(),
            available_quantity: 12,
            reserved_quantity: 3,
            condition: "quarantined".to_string(),
            status: "in_stock".to_string(),
            low_stock_threshold: 10,
            total_sold: 0,
            total_fulfilled: 0,
            last_stock_movement_at: None,
            last_sale_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn record_row_converts() {
        let product = Uuid::new_v4();
        let record = StockRecord::try_from(record_row(Some(product), None)).unwrap();
        assert_eq!(record.item.product_id().map(|id| *id.as_uuid()), Some(product));
        assert_eq!(record.condition, StockCondition::Quarantined);
        assert_eq!(record.sellable_quantity(), 0);
    }

    #[test]
    fn record_row_without_item_is_corrupt() {
        let err = StockRecord::try_from(record_row(None, None)).unwrap_err();
        assert!(matches!(err, LedgerError::Storage(_)));
    }

    #[test]
    fn unknown_enum_text_is_corrupt() {
        let mut row = record_row(Some(Uuid::new_v4()), None);
        row.status = "plenty".to_string();
        assert!(StockRecord::try_from(row).is_err());
    }

    #[test]
    fn item_columns_set_exactly_one_side() {
        let variant = stockledger_core::VariantId::new();
        let key = StockKey::new(ItemRef::Variant(variant), LocationId::new());
        assert_eq!(item_columns(&key), (None, Some(*variant.as_uuid())));
    }
}
