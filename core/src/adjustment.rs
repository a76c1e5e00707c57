//! Adjustment ledger entries.
//!
//! The adjustment ledger is append-only: entries are produced as a side effect
//! of a ledger transition and never edited afterwards.

use crate::error::LedgerError;
use crate::record::StockRecord;
use crate::types::{ActorId, AdjustmentId, StockRecordId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a ledger entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentType {
    /// Units were added
    Increase,
    /// Units were removed
    Decrease,
    /// No physical change (reservation moves, condition changes, zero counts)
    Correction,
    /// Units were written off as unsellable
    WriteOff,
}

impl AdjustmentType {
    /// Classify a manual delta by its sign.
    #[must_use]
    pub const fn from_change(change: i64) -> Self {
        if change > 0 {
            Self::Increase
        } else if change < 0 {
            Self::Decrease
        } else {
            Self::Correction
        }
    }

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Increase => "increase",
            Self::Decrease => "decrease",
            Self::Correction => "correction",
            Self::WriteOff => "write_off",
        }
    }

    /// Parse from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known type.
    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "increase" => Ok(Self::Increase),
            "decrease" => Ok(Self::Decrease),
            "correction" => Ok(Self::Correction),
            "write_off" => Ok(Self::WriteOff),
            _ => Err(LedgerError::Storage(format!("Invalid adjustment type: {s}"))),
        }
    }
}

/// Who, why and when for one ledger transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MovementContext {
    /// Attributable actor
    pub actor: ActorId,
    /// Free text or canonical event name ("Order 1001 shipped")
    pub reason: String,
    /// External key such as the order number
    pub reference_number: Option<String>,
    /// Optional operator notes
    pub notes: Option<String>,
    /// Transaction timestamp
    pub at: DateTime<Utc>,
}

impl MovementContext {
    /// Creates a new `MovementContext`
    #[must_use]
    pub fn new(actor: ActorId, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            actor,
            reason: reason.into(),
            reference_number: None,
            notes: None,
            at,
        }
    }

    /// Attach an external reference
    #[must_use]
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference_number = Some(reference.into());
        self
    }

    /// Attach notes
    #[must_use]
    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self
    }
}

/// One immutable row of the adjustment ledger.
///
/// `quantity_before`/`quantity_after` always refer to `available_quantity`;
/// reservation moves show up in `reserved_before`/`reserved_after` with a zero
/// `quantity_change`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentEntry {
    /// Entry id
    pub id: AdjustmentId,
    /// Owning stock record
    pub inventory_id: StockRecordId,
    /// Classification
    pub adjustment_type: AdjustmentType,
    /// Signed delta applied to `available_quantity`
    pub quantity_change: i64,
    /// Available quantity before
    pub quantity_before: i64,
    /// Available quantity after
    pub quantity_after: i64,
    /// Reserved quantity before
    pub reserved_before: i64,
    /// Reserved quantity after
    pub reserved_after: i64,
    /// Why the numbers changed
    pub reason: String,
    /// External key (order number, count sheet, ...)
    pub reference_number: Option<String>,
    /// Who changed them
    pub adjusted_by: ActorId,
    /// Operator notes
    pub notes: Option<String>,
    /// When
    pub created_at: DateTime<Utc>,
}

impl AdjustmentEntry {
    /// Build the entry describing the transition from `before` to `after`.
    #[must_use]
    pub fn between(
        before: &StockRecord,
        after: &StockRecord,
        adjustment_type: AdjustmentType,
        ctx: &MovementContext,
    ) -> Self {
        Self {
            id: AdjustmentId::new(),
            inventory_id: after.id,
            adjustment_type,
            quantity_change: after.available_quantity - before.available_quantity,
            quantity_before: before.available_quantity,
            quantity_after: after.available_quantity,
            reserved_before: before.reserved_quantity,
            reserved_after: after.reserved_quantity,
            reason: ctx.reason.clone(),
            reference_number: ctx.reference_number.clone(),
            adjusted_by: ctx.actor,
            notes: ctx.notes.clone(),
            created_at: ctx.at,
        }
    }

    /// Change applied to `reserved_quantity`
    #[must_use]
    pub const fn reserved_change(&self) -> i64 {
        self.reserved_after - self.reserved_before
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn sign_classifies_manual_adjustments() {
        assert_eq!(AdjustmentType::from_change(5), AdjustmentType::Increase);
        assert_eq!(AdjustmentType::from_change(-5), AdjustmentType::Decrease);
        assert_eq!(AdjustmentType::from_change(0), AdjustmentType::Correction);
    }

    #[test]
    fn database_names_round_trip() {
        for kind in [
            AdjustmentType::Increase,
            AdjustmentType::Decrease,
            AdjustmentType::Correction,
            AdjustmentType::WriteOff,
        ] {
            assert_eq!(AdjustmentType::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(AdjustmentType::parse("shrinkage").is_err());
    }
}
