//! Stock ledger background worker.
//!
//! Wires the engine to `PostgreSQL` and runs the process-level duties that no
//! request handler owns:
//!
//! - apply schema migrations
//! - make sure the default location exists
//! - release expired cart holds on a fixed interval
//! - expose Prometheus metrics
//!
//! Request handlers embed [`StockLedgerEngine`] directly; this crate only
//! shows how a process assembles one.

pub mod config;
pub mod lifecycle;

pub use config::WorkerConfig;
pub use lifecycle::Application;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use stockledger_core::environment::SystemClock;
use stockledger_postgres::PostgresStockStore;
use stockledger_runtime::metrics::MetricsServer;
use stockledger_runtime::{CartHoldManager, StockLedgerEngine};

/// Open the connection pool described by `config`.
///
/// # Errors
///
/// Returns an error if no connection can be established.
pub async fn connect(config: &WorkerConfig) -> anyhow::Result<sqlx::PgPool> {
    PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout))
        .connect(&config.database.url)
        .await
        .context("Failed to connect to PostgreSQL")
}

/// Build a ready-to-run worker over `pool`.
///
/// Runs migrations (unless disabled), creates the default location and
/// validates the system actor.
///
/// # Errors
///
/// Returns an error if migrations fail, the default location cannot be
/// created, `SYSTEM_ACTOR_ID` is missing or invalid, the hold TTL is out of
/// range, or the metrics address does not parse.
pub async fn build(config: &WorkerConfig, pool: sqlx::PgPool) -> anyhow::Result<Application<PostgresStockStore>> {
    let actor = config
        .engine
        .system_actor()
        .context("A system actor is required for the expiry sweeper")?;

    config
        .engine
        .cart_hold_ttl()
        .context("CART_HOLD_TTL_MINUTES is out of range")?;

    let store = PostgresStockStore::new(pool).with_lock_timeout(config.lock_timeout());
    if config.database.run_migrations {
        store.migrate().await?;
    }

    let engine = StockLedgerEngine::bootstrap(Arc::new(store), Arc::new(SystemClock), config.engine.clone())
        .await
        .context("Failed to bootstrap stock ledger engine")?;
    let holds = CartHoldManager::new(engine);

    let metrics = MetricsServer::new(config.metrics_addr().context("Invalid metrics address")?);

    Ok(Application::new(
        holds,
        actor,
        config.engine.sweep_interval(),
        config.shutdown_timeout(),
        Some(metrics),
    ))
}
