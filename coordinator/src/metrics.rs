//! Prometheus metrics for the inventory coordinator.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `stockflow_events_total{event_type, outcome}` - Consumed events by audit outcome
//! - `stockflow_events_rejected_total{event_type, reason}` - Coordinator-side rejections
//! - `stockflow_undecodable_events_total` - Payloads that could not be decoded
//! - `stockflow_reservations_denied_total` - RESERVE events denied for lack of stock
//! - `stockflow_cas_retries_total` - Compare-and-set attempts lost to another writer
//! - `stockflow_cas_conflicts_total` - Conflicts detected by the `PostgreSQL` ledger
//! - `stockflow_state_publish_failures_total` - Snapshots that could not be published
//! - `stockflow_detached_publish_failures_total{event_type}` - Failed background publishes
//! - `stockflow_audit_failures_total` - Audit rows that could not be written
//! - `stockflow_channel_redeliveries_total` - Handler failures that caused a redelivery
//! - `stockflow_cache_hits_total` / `stockflow_cache_misses_total` - Snapshot cache lookups
//! - `stockflow_sweeper_runs_total`, `stockflow_sweeper_releases_total`,
//!   `stockflow_sweeper_failures_total` - Expiration sweeper activity
//!
//! ## Histograms
//! - `stockflow_event_apply_duration_seconds{event_type}` - Time to apply one event

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use stockflow_core::event::EventType;
use stockflow_core::ledger::AuditOutcome;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and start serving `/metrics`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built. A recorder
    /// that is already installed (e.g. by another test) is not an error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(async move {
                    if exporter.await.is_err() {
                        tracing::error!("Metrics exporter stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics server started");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
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
pub fn register_metrics() {
    describe_counter!(
        "stockflow_events_total",
        "Consumed inventory events by type and outcome (applied, ignored, rejected)"
    );
    describe_counter!(
        "stockflow_events_rejected_total",
        "Inventory events rejected by the coordinator, by reason"
    );
    describe_counter!(
        "stockflow_undecodable_events_total",
        "Event payloads that could not be decoded and were skipped"
    );
    describe_counter!(
        "stockflow_reservations_denied_total",
        "RESERVE events denied for insufficient stock"
    );
    describe_counter!(
        "stockflow_cas_retries_total",
        "Stock writes retried after losing a compare-and-set"
    );
    describe_counter!(
        "stockflow_cas_conflicts_total",
        "Compare-and-set conflicts detected by the stock ledger"
    );
    describe_counter!(
        "stockflow_state_publish_failures_total",
        "Stock snapshots that could not be published after retries"
    );
    describe_counter!(
        "stockflow_detached_publish_failures_total",
        "Background event publishes that failed after retries"
    );
    describe_counter!(
        "stockflow_audit_failures_total",
        "Event audit rows that could not be written"
    );
    describe_counter!(
        "stockflow_channel_redeliveries_total",
        "Messages redelivered after their handler failed"
    );
    describe_counter!("stockflow_cache_hits_total", "Stock snapshot cache hits");
    describe_counter!("stockflow_cache_misses_total", "Stock snapshot cache misses");
    describe_counter!("stockflow_sweeper_runs_total", "Expiration sweeper runs");
    describe_counter!(
        "stockflow_sweeper_releases_total",
        "RELEASE events published for expired reservations"
    );
    describe_counter!(
        "stockflow_sweeper_failures_total",
        "Sweeper scans or publishes that failed"
    );
    describe_histogram!(
        "stockflow_event_apply_duration_seconds",
        "Time taken to apply one inventory event"
    );

    tracing::info!("Inventory metrics registered");
}

/// Consumed-event metrics recorder.
pub struct EventMetrics;

impl EventMetrics {
    /// Record a processed event.
    pub fn record_outcome(event_type: EventType, outcome: AuditOutcome, duration: Duration) {
        counter!(
            "stockflow_events_total",
            "event_type" => event_type.label(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        histogram!(
            "stockflow_event_apply_duration_seconds",
            "event_type" => event_type.label()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a coordinator-side rejection.
    pub fn record_rejection(event_type: EventType, reason: &'static str) {
        counter!(
            "stockflow_events_rejected_total",
            "event_type" => event_type.label(),
            "reason" => reason
        )
        .increment(1);
    }

    /// Record a payload that could not be decoded.
    pub fn record_undecodable() {
        counter!("stockflow_undecodable_events_total").increment(1);
    }

    /// Record a denied reservation.
    pub fn record_denied() {
        counter!("stockflow_reservations_denied_total").increment(1);
    }

    /// Record a lost compare-and-set.
    pub fn record_cas_retry() {
        counter!("stockflow_cas_retries_total").increment(1);
    }

    /// Record a snapshot that could not be published.
    pub fn record_state_publish_failure() {
        counter!("stockflow_state_publish_failures_total").increment(1);
    }

    /// Record an audit write failure.
    pub fn record_audit_failure() {
        counter!("stockflow_audit_failures_total").increment(1);
    }
}

/// Snapshot cache metrics recorder.
pub struct CacheMetrics;

impl CacheMetrics {
    /// Record a cache hit.
    pub fn record_hit() {
        counter!("stockflow_cache_hits_total").increment(1);
    }

    /// Record a cache miss.
    pub fn record_miss() {
        counter!("stockflow_cache_misses_total").increment(1);
    }
}

/// Expiration sweeper metrics recorder.
pub struct SweeperMetrics;

impl SweeperMetrics {
    /// Record a completed run and the releases it published.
    pub fn record_run(released: usize) {
        counter!("stockflow_sweeper_runs_total").increment(1);
        counter!("stockflow_sweeper_releases_total").increment(u64::try_from(released).unwrap_or(u64::MAX));
    }

    /// Record a failed scan or publish.
    pub fn record_failure() {
        counter!("stockflow_sweeper_failures_total").increment(1);
    }
}
