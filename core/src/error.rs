//! Error taxonomy for stock ledger operations.

use crate::types::StockKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for stock ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Per-line detail attached to [`LedgerError::InsufficientStock`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortfall {
    /// Record that could not satisfy the line
    pub key: StockKey,
    /// Units requested
    pub requested: i64,
    /// Units that could still be promised: `available - reserved` for
    /// reservations, `available` for fulfillment
    pub sellable: i64,
}

impl Shortfall {
    /// Units missing to satisfy the request
    #[must_use]
    pub const fn missing(&self) -> i64 {
        self.requested - self.sellable
    }
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} requested {} but only {} sellable",
            self.key, self.requested, self.sellable
        )
    }
}

/// Everything that can go wrong in a ledger call.
///
/// Every mutation is all-or-nothing: when one of these is returned from a
/// mutating operation, nothing was committed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// No stock record exists for the item at the location (distinct from zero stock).
    #[error("No stock record for {0}")]
    ItemNotFound(StockKey),

    /// One or more lines cannot be satisfied.
    #[error("Insufficient stock: {}", format_shortfalls(.shortfalls))]
    InsufficientStock {
        /// Every failing line, in lock order
        shortfalls: Vec<Shortfall>,
    },

    /// A manual adjustment would drive available quantity below zero.
    #[error("Adjustment of {change} on {key} would leave {after} available (was {before})")]
    NegativeQuantity {
        /// Record being adjusted
        key: StockKey,
        /// Available quantity before the adjustment
        before: i64,
        /// Requested delta
        change: i64,
        /// Resulting available quantity
        after: i64,
    },

    /// No attributable actor for the audit trail.
    #[error("Invalid actor: {0}")]
    InvalidActor(String),

    /// Lock wait timeout, deadlock or serialization failure; retry the whole call.
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Malformed request (zero quantity, empty line list, ...).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Underlying store failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Whether retrying the entire operation from scratch may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }

    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ItemNotFound(_) => "item_not_found",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::NegativeQuantity { .. } => "negative_quantity",
            Self::InvalidActor(_) => "invalid_actor",
            Self::ConcurrencyConflict(_) => "concurrency_conflict",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Storage(_) => "storage",
        }
    }
}

fn format_shortfalls(shortfalls: &[Shortfall]) -> String {
    shortfalls
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ItemRef, LocationId, ProductId};

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(LedgerError::ConcurrencyConflict("lock timeout".into()).is_retryable());
        assert!(!LedgerError::Storage("boom".into()).is_retryable());
        assert!(!LedgerError::InsufficientStock { shortfalls: vec![] }.is_retryable());
    }

    #[test]
    fn insufficient_stock_message_lists_every_line() {
        let key = StockKey::new(ItemRef::Product(ProductId::new()), LocationId::new());
        let err = LedgerError::InsufficientStock {
            shortfalls: vec![
                Shortfall { key, requested: 95, sellable: 90 },
                Shortfall { key, requested: 3, sellable: 0 },
            ],
        };
        let message = err.to_string();
        assert!(message.contains("requested 95 but only 90 sellable"));
        assert!(message.contains("requested 3 but only 0 sellable"));
        assert_eq!(err.kind(), "insufficient_stock");
    }
}
