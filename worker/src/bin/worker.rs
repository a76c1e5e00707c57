//! Stock ledger worker process.
//!
//! This binary:
//! - Connects to `PostgreSQL` and applies migrations
//! - Ensures the default stock location exists
//! - Sweeps expired cart holds until shutdown
//! - Serves Prometheus metrics
//!
//! # Usage
//!
//! ```bash
//! SYSTEM_ACTOR_ID=<uuid> DATABASE_URL=postgres://... cargo run --bin stockledger-worker
//! ```

use stockledger_worker::WorkerConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stockledger=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting stock ledger worker...");

    let config = WorkerConfig::from_env();
    tracing::info!(
        sweep_interval_secs = config.engine.sweep_interval_secs,
        cart_hold_ttl_minutes = config.engine.cart_hold_ttl_minutes,
        lock_timeout_ms = config.database.lock_timeout_ms,
        "Configuration loaded"
    );

    let pool = stockledger_worker::connect(&config).await?;
    let app = stockledger_worker::build(&config, pool).await?;
    tracing::info!("✓ Worker initialized");

    app.run().await;
    Ok(())
}
