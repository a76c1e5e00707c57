//! Reservations that back a `reserved_quantity` increment.
//!
//! Two kinds exist: short-lived [`CartHold`]s written onto a cart line, and
//! [`OrderReservation`]s created when an order is placed (directly, or by
//! converting the cart's holds).

use crate::error::LedgerError;
use crate::types::{CartId, CartLineId, HoldToken, OrderId, StockKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// TTL-bound hold on a cart line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartHold {
    /// Cart line carrying the hold
    pub cart_line_id: CartLineId,
    /// Owning cart
    pub cart_id: CartId,
    /// Opaque token identifying this particular hold
    pub reservation_id: HoldToken,
    /// Stock record the hold is counted against
    pub key: StockKey,
    /// Units held
    pub quantity: i64,
    /// When the hold was placed
    pub reserved_at: DateTime<Utc>,
    /// When the sweep may reclaim it
    pub expires_at: DateTime<Utc>,
}

impl CartHold {
    /// Whether the hold's TTL has passed.
    ///
    /// An expired hold still counts against stock until the sweep releases it.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Lifecycle of an order reservation row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    /// Units are held for the order
    Active,
    /// Order cancelled before shipment, hold given back
    Released,
    /// Units shipped
    Fulfilled,
}

impl ReservationState {
    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Released => "released",
            Self::Fulfilled => "fulfilled",
        }
    }

    /// Parse from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known state.
    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "active" => Ok(Self::Active),
            "released" => Ok(Self::Released),
            "fulfilled" => Ok(Self::Fulfilled),
            _ => Err(LedgerError::Storage(format!("Invalid reservation state: {s}"))),
        }
    }
}

/// Units held for one order against one stock record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReservation {
    /// Order holding the units
    pub order_id: OrderId,
    /// Stock record
    pub key: StockKey,
    /// Units still held (zero once released or fulfilled)
    pub quantity: i64,
    /// Lifecycle state
    pub state: ReservationState,
    /// First reservation time
    pub reserved_at: DateTime<Utc>,
    /// Last state change
    pub updated_at: DateTime<Utc>,
}

impl OrderReservation {
    /// A new active reservation
    #[must_use]
    pub const fn active(order_id: OrderId, key: StockKey, quantity: i64, at: DateTime<Utc>) -> Self {
        Self {
            order_id,
            key,
            quantity,
            state: ReservationState::Active,
            reserved_at: at,
            updated_at: at,
        }
    }

    /// Whether units are still held
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == ReservationState::Active && self.quantity > 0
    }

    /// Add units to an existing row, reactivating it if needed.
    pub fn add(&mut self, quantity: i64, at: DateTime<Utc>) {
        if self.state == ReservationState::Active {
            self.quantity += quantity;
        } else {
            self.quantity = quantity;
            self.state = ReservationState::Active;
        }
        self.updated_at = at;
    }

    /// Consume shipped units. The row stays active while units remain and is
    /// marked fulfilled once nothing is left.
    pub fn consume(&mut self, shipped: i64, at: DateTime<Utc>) {
        self.quantity = self.quantity.saturating_sub(shipped).max(0);
        if self.quantity == 0 {
            self.state = ReservationState::Fulfilled;
        }
        self.updated_at = at;
    }

    /// Close the row in a terminal state.
    pub fn close(&mut self, state: ReservationState, at: DateTime<Utc>) {
        self.quantity = 0;
        self.state = state;
        self.updated_at = at;
    }
}
