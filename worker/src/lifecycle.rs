//! Worker lifecycle and graceful shutdown.
//!
//! 1. **Startup**: install the metrics exporter, spawn the expiry sweeper
//! 2. **Runtime**: wait for a shutdown signal
//! 3. **Shutdown**: broadcast to background tasks and wait for them, bounded
//!    by the configured timeout
//!
//! # Example
//!
//! ```rust,ignore
//! let app = Application::new(holds, actor, sweep_interval, shutdown_timeout, Some(metrics));
//! app.run().await;
//! ```

use std::future::Future;
use std::time::Duration;
use stockledger_core::ActorId;
use stockledger_core::store::StockStore;
use stockledger_runtime::metrics::MetricsServer;
use stockledger_runtime::{CartHoldManager, ExpirySweeper};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Running worker with its background tasks.
pub struct Application<S: StockStore> {
    holds: CartHoldManager<S>,
    actor: ActorId,
    sweep_interval: Duration,
    shutdown_timeout: Duration,
    metrics: Option<MetricsServer>,
    shutdown_tx: broadcast::Sender<()>,
}

impl<S: StockStore> Application<S> {
    /// Create a new application instance.
    ///
    /// # Arguments
    ///
    /// * `holds` - Cart hold manager the sweeper runs against
    /// * `actor` - System identity recorded for swept holds
    /// * `sweep_interval` - Time between sweeps
    /// * `shutdown_timeout` - How long background tasks get to stop
    /// * `metrics` - Prometheus exporter to start, if any
    #[must_use]
    pub fn new(
        holds: CartHoldManager<S>,
        actor: ActorId,
        sweep_interval: Duration,
        shutdown_timeout: Duration,
        metrics: Option<MetricsServer>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            holds,
            actor,
            sweep_interval,
            shutdown_timeout,
            metrics,
            shutdown_tx,
        }
    }

    /// Run until Ctrl+C or SIGTERM.
    pub async fn run(self) {
        self.run_until(shutdown_signal()).await;
    }

    /// Run until `signal` completes, then shut down gracefully.
    pub async fn run_until(mut self, signal: impl Future<Output = ()> + Send) {
        if let Some(metrics) = self.metrics.as_mut() {
            if let Err(e) = metrics.start() {
                warn!(error = %e, "Metrics exporter not started, continuing without it");
            }
        }

        let sweeper = ExpirySweeper::new(
            self.holds.clone(),
            self.actor,
            self.sweep_interval,
            self.shutdown_tx.subscribe(),
        );
        let sweeper_handle = sweeper.spawn();
        info!("Stock ledger worker running");

        signal.await;
        info!("Shutdown signal received, stopping background tasks");

        // No receivers left just means the sweeper already exited.
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(self.shutdown_timeout, sweeper_handle).await {
            Ok(Ok(())) => info!("Expiry sweeper stopped gracefully"),
            Ok(Err(e)) => warn!(error = %e, "Expiry sweeper task failed"),
            Err(_) => warn!("Expiry sweeper shutdown timed out"),
        }

        info!("Graceful shutdown complete");
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
