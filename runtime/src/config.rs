//! Engine configuration.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use stockledger_core::{ActorId, LedgerError};

/// Settings shared by the engine, the cart hold manager and the sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Code of the location used when a request names none
    pub default_location_code: String,
    /// Display name given to the default location if it has to be created
    pub default_location_name: String,
    /// Low-stock threshold seeded into newly created records
    pub low_stock_threshold: i64,
    /// Cart hold lifetime in minutes
    pub cart_hold_ttl_minutes: i64,
    /// Retries after a concurrency conflict
    pub max_retries: usize,
    /// First backoff delay in milliseconds
    pub retry_initial_delay_ms: u64,
    /// Identity the sweeper writes into the ledger
    pub system_actor_id: Option<String>,
    /// Seconds between expiry sweeps
    pub sweep_interval_secs: u64,
    /// Maximum holds released per sweep
    pub sweep_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_location_code: "MAIN".to_string(),
            default_location_name: "Main Warehouse".to_string(),
            low_stock_threshold: 10,
            cart_hold_ttl_minutes: 30,
            max_retries: 3,
            retry_initial_delay_ms: 25,
            system_actor_id: None,
            sweep_interval_secs: 60,
            sweep_batch_size: 500,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables fall back to [`EngineConfig::default`].
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_location_code: env::var("STOCK_DEFAULT_LOCATION_CODE")
                .unwrap_or(defaults.default_location_code),
            default_location_name: env::var("STOCK_DEFAULT_LOCATION_NAME")
                .unwrap_or(defaults.default_location_name),
            low_stock_threshold: env::var("STOCK_LOW_STOCK_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.low_stock_threshold),
            cart_hold_ttl_minutes: env::var("CART_HOLD_TTL_MINUTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.cart_hold_ttl_minutes),
            max_retries: env::var("STOCK_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            retry_initial_delay_ms: env::var("STOCK_RETRY_INITIAL_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.retry_initial_delay_ms),
            system_actor_id: env::var("SYSTEM_ACTOR_ID").ok(),
            sweep_interval_secs: env::var("SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.sweep_interval_secs),
            sweep_batch_size: env::var("SWEEP_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.sweep_batch_size),
        }
    }

    /// Backoff used when an operation hits a concurrency conflict.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.max_retries)
            .initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
            .max_delay(Duration::from_secs(2))
            .build()
    }

    /// Default cart hold lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidRequest`] if `CART_HOLD_TTL_MINUTES` is
    /// too large to represent.
    pub fn cart_hold_ttl(&self) -> Result<chrono::Duration, LedgerError> {
        chrono::Duration::try_minutes(self.cart_hold_ttl_minutes).ok_or_else(|| {
            LedgerError::InvalidRequest(format!(
                "cart hold TTL of {} minutes is out of range",
                self.cart_hold_ttl_minutes
            ))
        })
    }

    /// Time between sweeps.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// The configured system actor.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidActor`] if `SYSTEM_ACTOR_ID` is unset,
    /// malformed or nil. There is no fallback identity.
    pub fn system_actor(&self) -> Result<ActorId, LedgerError> {
        let raw = self
            .system_actor_id
            .as_deref()
            .ok_or_else(|| LedgerError::InvalidActor("SYSTEM_ACTOR_ID is not configured".to_string()))?;
        ActorId::parse(raw)
    }
}
