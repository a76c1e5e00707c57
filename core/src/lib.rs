//! # Stock Ledger Core
//!
//! Domain types, errors and persistence traits for the inventory reservation
//! and stock ledger engine.
//!
//! ## Core Concepts
//!
//! - **StockRecord**: available and reserved quantity for one item at one location
//! - **AdjustmentEntry**: an immutable row of the append-only audit trail
//! - **CartHold / OrderReservation**: what a `reserved_quantity` increment belongs to
//! - **Transitions**: pure methods on [`StockRecord`] that mutate a locked record
//!   and return the ledger entry describing the change
//! - **StockStore / LedgerTransaction**: the storage seam, implemented for
//!   `PostgreSQL` and in memory
//!
//! ## Quantities
//!
//! ```text
//! sellable = available_quantity - reserved_quantity
//!
//! reserve   : reserved += n
//! release   : reserved -= n (floored at 0)
//! fulfill   : available -= n, reserved -= n (floored at 0), total_sold += n
//! restock   : available += n
//! adjust    : available += delta
//! ```
//!
//! This crate performs no I/O.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adjustment;
pub mod error;
pub mod location;
pub mod record;
pub mod reservation;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use adjustment::{AdjustmentEntry, AdjustmentType, MovementContext};
pub use chrono::{DateTime, Utc};
pub use error::{LedgerError, Result, Shortfall};
pub use location::{DefaultLocationResolver, Location, LocationResolver};
pub use record::{StockCondition, StockRecord, StockStatus};
pub use reservation::{CartHold, OrderReservation, ReservationState};
pub use store::{LedgerTransaction, StockStore};
pub use types::*;

/// Environment module - Dependency injection traits
///
/// All time-dependent behavior (stamping movements, minting hold expiries,
/// deciding which holds the sweep may reclaim) reads the clock through this
/// trait so tests can pin or advance time.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use stockledger_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = chrono::Utc::now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
