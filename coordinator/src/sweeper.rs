//! Expiration sweeper.
//!
//! Periodically finds ACTIVE reservations whose `expires_at` has passed and
//! publishes a RELEASE event (metadata `reason = "expired"`) for each one. The
//! sweeper never writes the ledgers itself: the release goes through the same
//! ordered channel as every other mutation of the product.
//!
//! A hold that was already published stays in a dedupe window for three
//! sweep intervals, so a slow consumer does not receive one release per run.

use crate::error::InventoryError;
use crate::metrics::SweeperMetrics;
use crate::publisher::EventPublisher;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stockflow_core::environment::Clock;
use stockflow_core::event::{InventoryEvent, metadata};
use stockflow_core::ledger::ReservationLedger;
use stockflow_core::shutdown::ShutdownSignal;
use stockflow_core::types::CorrelationId;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const DEDUPE_INTERVALS: u32 = 3;
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired holds returned by the ledger
    pub scanned: usize,
    /// RELEASE events published
    pub released: usize,
    /// Holds skipped because a release is already in flight
    pub skipped: usize,
    /// Publishes that failed
    pub failed: usize,
}

/// Publishes RELEASE events for lapsed reservations.
pub struct Sweeper {
    reservations: Arc<dyn ReservationLedger>,
    publisher: EventPublisher,
    clock: Arc<dyn Clock>,
    interval: Duration,
    batch_size: usize,
    in_flight: Mutex<HashMap<CorrelationId, DateTime<Utc>>>,
}

impl Sweeper {
    /// Sweeper that scans every `interval`, releasing at most `batch_size`
    /// holds per scan.
    #[must_use]
    pub fn new(
        reservations: Arc<dyn ReservationLedger>,
        publisher: EventPublisher,
        clock: Arc<dyn Clock>,
        interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            reservations,
            publisher,
            clock,
            interval: interval.max(MIN_INTERVAL),
            batch_size: batch_size.max(1),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Scan period.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    fn dedupe_window(&self) -> chrono::Duration {
        self.interval
            .checked_mul(DEDUPE_INTERVALS)
            .and_then(|window| chrono::Duration::from_std(window).ok())
            .unwrap_or_else(|| chrono::Duration::days(1))
    }

    /// Run one scan.
    ///
    /// # Errors
    ///
    /// Returns the ledger error when the scan itself fails. Individual publish
    /// failures are counted in the report and retried on the next run.
    pub async fn sweep_once(&self) -> Result<SweepReport, InventoryError> {
        let now = self.clock.now();
        let window = self.dedupe_window();
        self.in_flight
            .lock()
            .retain(|_, published_at| *published_at + window > now);

        let expired = self.reservations.list_expired(now, self.batch_size).await?;
        let mut report = SweepReport {
            scanned: expired.len(),
            ..SweepReport::default()
        };

        for reservation in expired {
            if self.in_flight.lock().contains_key(&reservation.correlation_id) {
                report.skipped += 1;
                continue;
            }

            let event = InventoryEvent::release(
                reservation.product_id.clone(),
                reservation.quantity,
                reservation.user_id.clone(),
                reservation.correlation_id,
                now,
            )
            .with_metadata(metadata::REASON, Value::from(metadata::REASON_EXPIRED));

            match self.publisher.publish_event(&event).await {
                Ok(_) => {
                    self.in_flight.lock().insert(reservation.correlation_id, now);
                    report.released += 1;
                    tracing::info!(
                        reservation_id = %reservation.id,
                        correlation_id = %reservation.correlation_id,
                        product_id = %reservation.product_id,
                        quantity = reservation.quantity,
                        expired_at = %reservation.expires_at,
                        "Released expired reservation"
                    );
                },
                Err(e) => {
                    report.failed += 1;
                    SweeperMetrics::record_failure();
                    tracing::warn!(
                        correlation_id = %reservation.correlation_id,
                        product_id = %reservation.product_id,
                        error = %e,
                        "Failed to publish expiry release, will retry next sweep"
                    );
                },
            }
        }

        SweeperMetrics::record_run(report.released);
        if report.scanned > 0 {
            tracing::debug!(
                scanned = report.scanned,
                released = report.released,
                skipped = report.skipped,
                failed = report.failed,
                "Sweep complete"
            );
        }
        Ok(report)
    }

    /// Run the sweeper until `shutdown` fires.
    ///
    /// The first scan runs immediately. A failed scan is logged and counted;
    /// the loop keeps going.
    #[must_use]
    pub fn spawn(self: Arc<Self>, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval = ?self.interval, batch_size = self.batch_size, "Expiration sweeper started");

            loop {
                tokio::select! {
                    () = shutdown.triggered() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            SweeperMetrics::record_failure();
                            tracing::error!(error = %e, "Expiration sweep failed");
                        }
                    }
                }
            }

            tracing::info!("Expiration sweeper stopped");
        })
    }
}
