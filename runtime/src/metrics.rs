//! Prometheus metrics for the stock ledger.
//!
//! Metrics are recorded through the `metrics` facade, so recording is a no-op
//! until a recorder is installed. [`MetricsServer`] installs the Prometheus
//! recorder and serves it over HTTP.
//!
//! # Example
//!
//! ```rust,no_run
//! use stockledger_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use stockledger_core::LedgerError;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the Prometheus recorder and spawn its HTTP listener.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., by another test), this logs a
    /// warning, leaves [`handle`](Self::handle) empty and returns `Ok`.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        let addr = self.addr;
        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!(%addr, "Metrics listener stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics server started - available at http://{}/metrics", self.addr);
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "stock_ledger_operations_total",
        "Ledger operations by operation and outcome"
    );
    describe_histogram!(
        "stock_ledger_operation_duration_seconds",
        "Wall time of ledger operations, retries included"
    );
    describe_counter!(
        "stock_ledger_insufficient_stock_total",
        "Requests rejected for insufficient stock"
    );
    describe_counter!(
        "stock_ledger_override_total",
        "Overselling and negative-stock overrides that were applied"
    );
    describe_counter!(
        "stock_ledger_retry_attempts_total",
        "Whole-operation retries after a concurrency conflict"
    );
    describe_counter!(
        "stock_ledger_retry_successes_total",
        "Operations that succeeded after at least one retry"
    );
    describe_counter!(
        "stock_ledger_retry_exhausted_total",
        "Operations that gave up after max retries"
    );
    describe_counter!(
        "stock_ledger_lock_conflicts_total",
        "Lock contention errors reported by the store, by SQLSTATE"
    );
    describe_counter!(
        "stock_ledger_holds_swept_total",
        "Expired cart holds released by the sweeper"
    );
    describe_counter!(
        "stock_ledger_sweep_failures_total",
        "Expired cart holds the sweeper failed to release"
    );
}

/// Ledger metrics recorder.
pub struct LedgerMetrics;

impl LedgerMetrics {
    /// Record the outcome and duration of one engine operation.
    pub fn record_operation<T>(operation: &'static str, result: &Result<T, LedgerError>, duration: Duration) {
        let outcome = match result {
            Ok(_) => "success",
            Err(err) => err.kind(),
        };
        counter!("stock_ledger_operations_total", "operation" => operation, "outcome" => outcome).increment(1);
        histogram!("stock_ledger_operation_duration_seconds", "operation" => operation)
            .record(duration.as_secs_f64());
        if matches!(result, Err(LedgerError::InsufficientStock { .. })) {
            counter!("stock_ledger_insufficient_stock_total", "operation" => operation).increment(1);
        }
    }

    /// Record an applied overselling or negative-stock override.
    pub fn record_override(operation: &'static str) {
        counter!("stock_ledger_override_total", "operation" => operation).increment(1);
    }

    /// Record a retry attempt.
    pub fn record_retry_attempt(operation: &'static str) {
        counter!("stock_ledger_retry_attempts_total", "operation" => operation).increment(1);
    }

    /// Record a successful retry.
    pub fn record_retry_success(operation: &'static str) {
        counter!("stock_ledger_retry_successes_total", "operation" => operation).increment(1);
    }

    /// Record exhausted retries.
    pub fn record_retry_exhausted(operation: &'static str) {
        counter!("stock_ledger_retry_exhausted_total", "operation" => operation).increment(1);
    }

    /// Record the result of one sweep.
    pub fn record_sweep(released: usize, failed: usize) {
        counter!("stock_ledger_holds_swept_total").increment(released as u64);
        counter!("stock_ledger_sweep_failures_total").increment(failed as u64);
    }
}
