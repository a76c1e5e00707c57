//! Background task that reclaims expired cart holds.
//!
//! ```text
//! loop {
//!     select {
//!         shutdown  => break
//!         tick      => sweep_expired (errors logged, retried next tick)
//!     }
//! }
//! ```

use crate::holds::{CartHoldManager, SweepReport};
use std::time::Duration;
use stockledger_core::ActorId;
use stockledger_core::store::StockStore;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Periodically runs [`CartHoldManager::sweep_expired`] until shut down.
pub struct ExpirySweeper<S: StockStore> {
    holds: CartHoldManager<S>,
    actor: ActorId,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl<S: StockStore> ExpirySweeper<S> {
    /// Create a sweeper.
    ///
    /// # Arguments
    ///
    /// * `holds` - Manager whose holds are swept
    /// * `actor` - System identity written into the ledger for swept holds
    /// * `interval` - Time between sweeps
    /// * `shutdown` - Broadcast receiver for graceful shutdown
    #[must_use]
    pub const fn new(
        holds: CartHoldManager<S>,
        actor: ActorId,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            holds,
            actor,
            interval,
            shutdown,
        }
    }

    /// Spawn the sweep loop as a background task.
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Run one sweep now.
    pub async fn run_once(&self) -> Option<SweepReport> {
        match self.holds.sweep_expired(self.actor).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "Expiry sweep failed, retrying next interval");
                None
            }
        }
    }

    async fn run(&mut self) {
        info!(interval_secs = self.interval.as_secs(), "Expiry sweeper started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!("Expiry sweeper received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    let _ = self.run_once().await;
                }
            }
        }

        info!("Expiry sweeper stopped");
    }
}
