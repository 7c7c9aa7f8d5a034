//! The inventory coordinator.
//!
//! Consumes inventory events and applies them to the stock and reservation
//! ledgers:
//!
//! | Event    | Precondition                          | Effect                                   |
//! |----------|---------------------------------------|------------------------------------------|
//! | RESERVE  | `available >= quantity`               | new ACTIVE hold, available → reserved    |
//! | CONFIRM  | hold found by order ID, ACTIVE, owner | hold CONFIRMED, units leave reserved/total |
//! | RELEASE  | hold found by order ID, ACTIVE, owner | hold RELEASED, reserved → available      |
//! | RESTOCK  | product exists                        | total and available grow                 |
//! | CHECK    | product exists                        | none (read-only)                         |
//!
//! Every stock change is a compare-and-set on `(product, version)` that also
//! carries the reservation change, so both land in one transaction. A lost
//! compare-and-set is retried against freshly read state a bounded number of
//! times.
//!
//! After a write the cache is updated and the new snapshot is published on the
//! state topic. Each consumed event is then audited, counted and announced on
//! the notice channel.

use crate::cache::StockCache;
use crate::config::InventoryConfig;
use crate::error::InventoryError;
use crate::metrics::{CacheMetrics, EventMetrics};
use crate::publisher::EventPublisher;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use stockflow_core::channel::{Delivery, DeliveryHandler, HandlerError, HandlerFuture};
use stockflow_core::environment::Clock;
use stockflow_core::event::{EventType, InventoryEvent, InventoryState};
use stockflow_core::ledger::{
    AuditEntry, AuditOutcome, EventAuditLog, LedgerError, ReservationChange, ReservationLedger,
    StockLedger, StockWrite,
};
use stockflow_core::reservation::{Reservation, ReservationStatus};
use stockflow_core::stock::{StockCounts, StockError, StockRecord};
use stockflow_core::types::{CorrelationId, EventId, ProductId, UserId};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// The three ledgers the coordinator writes to.
#[derive(Clone)]
pub struct Ledgers {
    /// Product stock records
    pub stock: Arc<dyn StockLedger>,
    /// Reservations
    pub reservations: Arc<dyn ReservationLedger>,
    /// Event audit log
    pub audit: Arc<dyn EventAuditLog>,
}

impl Ledgers {
    /// Use one store for all three ledgers.
    #[must_use]
    pub fn shared<L>(ledger: Arc<L>) -> Self
    where
        L: StockLedger + ReservationLedger + EventAuditLog + 'static,
    {
        Self {
            stock: ledger.clone(),
            reservations: ledger.clone(),
            audit: ledger,
        }
    }
}

/// Coordinator tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// Lifetime of a granted hold
    pub reservation_timeout: chrono::Duration,
    /// Compare-and-set attempts per event
    pub cas_max_attempts: usize,
    /// Capacity of the notice channel
    pub notice_buffer: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&InventoryConfig::default())
    }
}

impl From<&InventoryConfig> for CoordinatorSettings {
    fn from(config: &InventoryConfig) -> Self {
        Self {
            reservation_timeout: config.reservation_timeout(),
            cas_max_attempts: config.cas_max_attempts.max(1),
            notice_buffer: config.notice_buffer.max(1),
        }
    }
}

/// What applying one event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A new ACTIVE hold was created
    Reserved(Reservation),
    /// Not enough stock; nothing changed
    Denied {
        /// Units asked for
        requested: u32,
        /// Units available when the event was applied
        available: u32,
    },
    /// The order already has a hold; nothing changed
    Duplicate(Reservation),
    /// The hold was confirmed
    Confirmed(Reservation),
    /// The hold was released
    Released {
        /// The hold, now RELEASED
        reservation: Reservation,
        /// Released by the expiration sweeper
        expired: bool,
    },
    /// Stock was added
    Restocked {
        /// Units added
        quantity: u32,
    },
    /// Availability was evaluated
    Checked {
        /// Whether the requested quantity is available
        available: bool,
    },
    /// The event was already applied; nothing changed
    Replayed,
}

impl Outcome {
    /// How the audit log classifies this outcome.
    #[must_use]
    pub const fn audit_outcome(&self) -> AuditOutcome {
        match self {
            Self::Reserved(_) | Self::Confirmed(_) | Self::Released { .. } | Self::Restocked { .. } => {
                AuditOutcome::Applied
            },
            Self::Denied { .. } | Self::Duplicate(_) | Self::Checked { .. } | Self::Replayed => {
                AuditOutcome::Ignored
            },
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            Self::Denied {
                requested,
                available,
            } => Some(format!(
                "insufficient stock: requested {requested}, available {available}"
            )),
            Self::Duplicate(reservation) => {
                Some(format!("order already holds reservation {}", reservation.id))
            },
            Self::Released { expired: true, .. } => Some("expired".to_string()),
            Self::Checked { available } => Some(format!("available: {available}")),
            Self::Replayed => Some("event already applied".to_string()),
            _ => None,
        }
    }
}

/// Result of one consumed event, broadcast to in-process observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// Consumed event
    pub event_id: EventId,
    /// Its type
    pub event_type: EventType,
    /// Product touched
    pub product_id: ProductId,
    /// Order the event belongs to
    pub correlation_id: CorrelationId,
    /// What happened
    pub result: Result<Outcome, InventoryError>,
}

enum Plan {
    Write {
        counts: StockCounts,
        reservation: Option<ReservationChange>,
    },
    Skip(Outcome),
}

enum Step {
    Written(StockRecord),
    Skipped(Outcome),
}

fn stock_error(e: StockError) -> InventoryError {
    match e {
        StockError::ZeroQuantity | StockError::Overflow => InventoryError::InvalidRequest(e.to_string()),
        StockError::Insufficient {
            requested,
            available,
        } => InventoryError::InvalidRequest(format!(
            "requested {requested} exceeds available {available}"
        )),
        StockError::ReservedUnderflow { .. } | StockError::Unbalanced { .. } => {
            InventoryError::InvariantViolation(e.to_string())
        },
    }
}

/// Applies inventory events to the ledgers.
pub struct Coordinator {
    ledgers: Ledgers,
    cache: Arc<StockCache>,
    publisher: EventPublisher,
    clock: Arc<dyn Clock>,
    settings: CoordinatorSettings,
    notices: broadcast::Sender<Notice>,
    recent: Mutex<VecDeque<Notice>>,
}

impl Coordinator {
    /// Coordinator with an empty cache.
    #[must_use]
    pub fn new(
        ledgers: Ledgers,
        publisher: EventPublisher,
        clock: Arc<dyn Clock>,
        settings: CoordinatorSettings,
    ) -> Self {
        let (notices, _) = broadcast::channel(settings.notice_buffer.max(1));
        Self {
            ledgers,
            cache: Arc::new(StockCache::new()),
            publisher,
            clock,
            recent: Mutex::new(VecDeque::with_capacity(settings.notice_buffer.max(1))),
            settings,
            notices,
        }
    }

    /// The snapshot cache, shared with request-serving code.
    #[must_use]
    pub const fn cache(&self) -> &Arc<StockCache> {
        &self.cache
    }

    /// Ledgers this coordinator writes to.
    #[must_use]
    pub const fn ledgers(&self) -> &Ledgers {
        &self.ledgers
    }

    /// Tuning in effect.
    #[must_use]
    pub const fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Receive a [`Notice`] for every event consumed from now on.
    #[must_use]
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// The latest retained notice of type `event_type` for an order.
    ///
    /// Only the last `notice_buffer` notices are retained.
    #[must_use]
    pub fn recent_notice(&self, correlation_id: CorrelationId, event_type: EventType) -> Option<Notice> {
        self.recent
            .lock()
            .iter()
            .rev()
            .find(|n| n.correlation_id == correlation_id && n.event_type == event_type)
            .cloned()
    }

    /// Current snapshot of `product_id`, read through the cache.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::NotFound`] for an unknown product, or a
    /// ledger error on a cache miss the ledger cannot serve.
    pub async fn snapshot(&self, product_id: &ProductId) -> Result<InventoryState, InventoryError> {
        if let Some(state) = self.cache.get(product_id) {
            CacheMetrics::record_hit();
            return Ok(state);
        }
        CacheMetrics::record_miss();

        let record = self
            .ledgers
            .stock
            .load_stock(product_id)
            .await?
            .ok_or_else(|| InventoryError::product_not_found(product_id))?;
        let state = InventoryState::from(&record);
        self.cache.upsert(state.clone());
        Ok(state)
    }

    /// Apply one event. Does not audit or announce it.
    ///
    /// # Errors
    ///
    /// Returns the precondition failure for rejected events, or a transient
    /// error when the ledger is unavailable or compare-and-set kept
    /// conflicting.
    pub async fn process(&self, event: &InventoryEvent) -> Result<Outcome, InventoryError> {
        match event.event_type {
            EventType::Check => self.apply_check(event).await,
            EventType::Reserve => self.apply_reserve(event).await,
            EventType::Confirm => self.apply_confirm(event).await,
            EventType::Release => self.apply_release(event).await,
            EventType::Restock => self.apply_restock(event).await,
        }
    }

    /// Apply, audit and announce one event.
    ///
    /// Rejections are reported and swallowed; only transient failures are
    /// returned, so the caller can redeliver the event.
    ///
    /// # Errors
    ///
    /// Returns the transient failure that prevented the event from being
    /// applied.
    pub async fn handle_event(&self, event: &InventoryEvent) -> Result<(), InventoryError> {
        let started = Instant::now();
        let result = self.process(event).await;

        if let Err(e) = &result {
            if e.is_transient() {
                tracing::warn!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    product_id = %event.product_id,
                    correlation_id = %event.correlation_id,
                    error = %e,
                    "Transient failure applying event, will be redelivered"
                );
                return Err(e.clone());
            }
        }

        self.settle(event, result, started).await;
        Ok(())
    }

    async fn apply_check(&self, event: &InventoryEvent) -> Result<Outcome, InventoryError> {
        let state = self.snapshot(&event.product_id).await?;
        Ok(Outcome::Checked {
            available: state.is_available(event.quantity),
        })
    }

    async fn apply_reserve(&self, event: &InventoryEvent) -> Result<Outcome, InventoryError> {
        let user_id = required_user(event)?;
        if event.quantity == 0 {
            return Err(InventoryError::InvalidRequest(
                "reservation quantity must be positive".to_string(),
            ));
        }

        if let Some(existing) = self
            .ledgers
            .reservations
            .find_by_correlation(event.correlation_id)
            .await?
        {
            return Ok(Outcome::Duplicate(existing));
        }

        let reservation = Reservation::active(
            event.correlation_id,
            user_id.clone(),
            event.product_id.clone(),
            event.quantity,
            self.clock.now(),
            self.settings.reservation_timeout,
        );

        let step = self
            .write_stock(event, |current| match current.counts.reserve(event.quantity) {
                Ok(counts) => Ok(Plan::Write {
                    counts,
                    reservation: Some(ReservationChange::Open(reservation.clone())),
                }),
                Err(StockError::Insufficient {
                    requested,
                    available,
                }) => Ok(Plan::Skip(Outcome::Denied {
                    requested,
                    available,
                })),
                Err(e) => Err(stock_error(e)),
            })
            .await;

        match step {
            Ok(Step::Written(_)) => Ok(Outcome::Reserved(reservation)),
            Ok(Step::Skipped(outcome)) => Ok(outcome),
            // Another consumer opened a hold for this order between our lookup and write.
            Err(InventoryError::Ledger(LedgerError::Duplicate { .. })) => self
                .ledgers
                .reservations
                .find_by_correlation(event.correlation_id)
                .await?
                .map(Outcome::Duplicate)
                .ok_or_else(|| InventoryError::order_not_found(event.correlation_id)),
            Err(e) => Err(e),
        }
    }

    async fn apply_confirm(&self, event: &InventoryEvent) -> Result<Outcome, InventoryError> {
        let mut reservation = self.active_hold(event).await?;
        if event.timestamp > reservation.expires_at {
            return Err(InventoryError::InvalidState {
                order_id: event.correlation_id,
                reason: format!("reservation expired at {}", reservation.expires_at),
            });
        }

        if let Step::Skipped(outcome) = self
            .close_hold(event, &reservation, ReservationStatus::Confirmed, |counts| {
                counts.confirm(reservation.quantity)
            })
            .await?
        {
            return Ok(outcome);
        }

        reservation.status = ReservationStatus::Confirmed;
        Ok(Outcome::Confirmed(reservation))
    }

    async fn apply_release(&self, event: &InventoryEvent) -> Result<Outcome, InventoryError> {
        let mut reservation = self.active_hold(event).await?;

        if let Step::Skipped(outcome) = self
            .close_hold(event, &reservation, ReservationStatus::Released, |counts| {
                counts.release(reservation.quantity)
            })
            .await?
        {
            return Ok(outcome);
        }

        reservation.status = ReservationStatus::Released;
        Ok(Outcome::Released {
            reservation,
            expired: event.is_expiry_release(),
        })
    }

    async fn apply_restock(&self, event: &InventoryEvent) -> Result<Outcome, InventoryError> {
        let quantity = event.quantity;
        let step = self
            .write_stock(event, |current| {
                Ok(Plan::Write {
                    counts: current.counts.restock(quantity).map_err(stock_error)?,
                    reservation: None,
                })
            })
            .await?;
        Ok(match step {
            Step::Written(_) => Outcome::Restocked { quantity },
            Step::Skipped(outcome) => outcome,
        })
    }

    /// The ACTIVE hold an event refers to, checked against the event's
    /// product and user.
    async fn active_hold(&self, event: &InventoryEvent) -> Result<Reservation, InventoryError> {
        let order_id = event.correlation_id;
        let reservation = self
            .ledgers
            .reservations
            .find_by_correlation(order_id)
            .await?
            .ok_or_else(|| InventoryError::order_not_found(order_id))?;

        let user_id = required_user(event)?;
        if !reservation.is_owned_by(user_id) {
            return Err(InventoryError::Unauthorized {
                order_id,
                user_id: user_id.to_string(),
            });
        }
        if reservation.product_id != event.product_id {
            return Err(InventoryError::InvalidRequest(format!(
                "order {order_id} is for product {}, not {}",
                reservation.product_id, event.product_id
            )));
        }
        if reservation.status != ReservationStatus::Active {
            return Err(InventoryError::InvalidState {
                order_id,
                reason: format!("reservation is {}", reservation.status),
            });
        }
        Ok(reservation)
    }

    async fn close_hold<F>(
        &self,
        event: &InventoryEvent,
        reservation: &Reservation,
        to: ReservationStatus,
        change: F,
    ) -> Result<Step, InventoryError>
    where
        F: Fn(StockCounts) -> Result<StockCounts, StockError> + Send + Sync,
    {
        let result = self
            .write_stock(event, |current| {
                Ok(Plan::Write {
                    counts: change(current.counts).map_err(stock_error)?,
                    reservation: Some(ReservationChange::Close {
                        reservation_id: reservation.id,
                        to,
                    }),
                })
            })
            .await;

        match result {
            Ok(step) => Ok(step),
            // Closed concurrently since we looked it up.
            Err(InventoryError::Ledger(LedgerError::InvalidTransition { actual, .. })) => {
                Err(InventoryError::InvalidState {
                    order_id: event.correlation_id,
                    reason: format!("reservation is {actual}"),
                })
            },
            Err(e) => Err(e),
        }
    }

    /// Read, plan and compare-and-set until the write lands, the plan skips,
    /// or the attempt bound is reached. A write for an event the ledger has
    /// already applied is skipped as [`Outcome::Replayed`].
    async fn write_stock<F>(&self, event: &InventoryEvent, mut plan: F) -> Result<Step, InventoryError>
    where
        F: FnMut(&StockRecord) -> Result<Plan, InventoryError> + Send,
    {
        let product_id = &event.product_id;
        let attempts = self.settings.cas_max_attempts.max(1);

        for attempt in 1..=attempts {
            let current = self
                .ledgers
                .stock
                .load_stock(product_id)
                .await?
                .ok_or_else(|| InventoryError::product_not_found(product_id))?;

            let (counts, reservation) = match plan(&current)? {
                Plan::Write {
                    counts,
                    reservation,
                } => (counts, reservation),
                Plan::Skip(outcome) => {
                    self.cache.upsert(InventoryState::from(&current));
                    return Ok(Step::Skipped(outcome));
                },
            };

            let write = StockWrite {
                event_id: event.event_id,
                product_id: product_id.clone(),
                expected_version: current.version,
                counts,
                reservation,
                at: self.clock.now(),
            };

            match self.ledgers.stock.compare_and_set(write).await {
                Ok(record) => {
                    self.after_write(&record).await;
                    return Ok(Step::Written(record));
                },
                Err(LedgerError::ConcurrencyConflict {
                    expected, actual, ..
                }) => {
                    EventMetrics::record_cas_retry();
                    tracing::debug!(
                        product_id = %product_id,
                        attempt,
                        expected,
                        actual,
                        "Lost compare-and-set, retrying with fresh state"
                    );
                },
                Err(LedgerError::AlreadyApplied { event_id }) => {
                    tracing::info!(
                        event_id = %event_id,
                        product_id = %product_id,
                        "Event already applied, skipping redelivery"
                    );
                    return Ok(Step::Skipped(Outcome::Replayed));
                },
                Err(e) => return Err(e.into()),
            }
        }

        self.cache.invalidate(product_id);
        Err(InventoryError::ConcurrencyConflict {
            product_id: product_id.clone(),
            attempts,
        })
    }

    async fn after_write(&self, record: &StockRecord) {
        let state = InventoryState::from(record);
        self.cache.upsert(state.clone());

        if let Err(e) = self.publisher.publish_state(&state).await {
            EventMetrics::record_state_publish_failure();
            tracing::error!(
                product_id = %state.product_id,
                version = state.version,
                error = %e,
                "Failed to publish inventory state"
            );
        }
    }

    async fn settle(
        &self,
        event: &InventoryEvent,
        result: Result<Outcome, InventoryError>,
        started: Instant,
    ) {
        let (outcome, detail) = match &result {
            Ok(applied) => (applied.audit_outcome(), applied.detail()),
            Err(e) => (AuditOutcome::Rejected, Some(e.to_string())),
        };
        EventMetrics::record_outcome(event.event_type, outcome, started.elapsed());
        log_result(event, &result);

        let entry = AuditEntry {
            event_id: event.event_id,
            event_type: event.event_type,
            product_id: event.product_id.clone(),
            user_id: event.user_id.clone(),
            quantity: event.quantity,
            correlation_id: event.correlation_id,
            outcome,
            detail,
            metadata: event.metadata.clone(),
            occurred_at: event.timestamp,
            processed_at: self.clock.now(),
        };
        if let Err(e) = self.ledgers.audit.record(entry).await {
            EventMetrics::record_audit_failure();
            tracing::error!(
                event_id = %event.event_id,
                error = %e,
                "Failed to write event audit entry"
            );
        }

        let notice = Notice {
            event_id: event.event_id,
            event_type: event.event_type,
            product_id: event.product_id.clone(),
            correlation_id: event.correlation_id,
            result,
        };
        {
            let mut recent = self.recent.lock();
            if recent.len() >= self.settings.notice_buffer.max(1) {
                recent.pop_front();
            }
            recent.push_back(notice.clone());
        }
        // No receivers is fine.
        let _ = self.notices.send(notice);
    }
}

fn required_user(event: &InventoryEvent) -> Result<&UserId, InventoryError> {
    event
        .user_id
        .as_ref()
        .filter(|user| !user.is_blank())
        .ok_or_else(|| {
            InventoryError::InvalidRequest(format!("{} event without a user", event.event_type))
        })
}

fn log_result(event: &InventoryEvent, result: &Result<Outcome, InventoryError>) {
    match result {
        Ok(Outcome::Denied {
            requested,
            available,
        }) => {
            EventMetrics::record_denied();
            tracing::info!(
                product_id = %event.product_id,
                correlation_id = %event.correlation_id,
                requested,
                available,
                "Reservation denied: insufficient stock"
            );
        },
        Ok(Outcome::Duplicate(existing)) => {
            tracing::info!(
                product_id = %event.product_id,
                correlation_id = %event.correlation_id,
                reservation_id = %existing.id,
                "Duplicate RESERVE ignored"
            );
        },
        // Logged where the ledger refused the write.
        Ok(Outcome::Replayed) => {},
        Ok(Outcome::Checked { available }) => {
            tracing::debug!(
                product_id = %event.product_id,
                quantity = event.quantity,
                available,
                "Availability checked"
            );
        },
        Ok(outcome) => {
            tracing::info!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                product_id = %event.product_id,
                correlation_id = %event.correlation_id,
                quantity = event.quantity,
                outcome = ?outcome.audit_outcome(),
                "Inventory event applied"
            );
        },
        Err(e) => {
            EventMetrics::record_rejection(event.event_type, e.kind());
            if event.is_expiry_release() {
                // The hold was settled after the sweeper picked it up.
                tracing::warn!(
                    product_id = %event.product_id,
                    correlation_id = %event.correlation_id,
                    error = %e,
                    "Expiry release rejected"
                );
            } else {
                tracing::error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    product_id = %event.product_id,
                    correlation_id = %event.correlation_id,
                    error = %e,
                    "Inventory event rejected"
                );
            }
        },
    }
}

impl DeliveryHandler for Coordinator {
    fn handle<'a>(&'a self, delivery: &'a Delivery) -> HandlerFuture<'a> {
        Box::pin(async move {
            let event = match InventoryEvent::decode(&delivery.message.payload) {
                Ok(event) => event,
                Err(e) => {
                    EventMetrics::record_undecodable();
                    tracing::error!(
                        topic = %delivery.topic,
                        partition = delivery.partition,
                        offset = delivery.offset,
                        key = %delivery.message.key,
                        error = %e,
                        "Skipping undecodable event"
                    );
                    return Ok(());
                },
            };

            if delivery.attempt > 1 {
                tracing::debug!(
                    event_id = %event.event_id,
                    attempt = delivery.attempt,
                    "Redelivered event"
                );
            }

            self.handle_event(&event)
                .await
                .map_err(|e| HandlerError::new(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_map_to_audit_classes() {
        assert_eq!(
            Outcome::Restocked { quantity: 1 }.audit_outcome(),
            AuditOutcome::Applied
        );
        assert_eq!(
            Outcome::Denied {
                requested: 5,
                available: 2
            }
            .audit_outcome(),
            AuditOutcome::Ignored
        );
        assert_eq!(
            Outcome::Checked { available: true }.audit_outcome(),
            AuditOutcome::Ignored
        );
    }

    #[test]
    fn stock_errors_become_inventory_errors() {
        assert!(matches!(
            stock_error(StockError::Overflow),
            InventoryError::InvalidRequest(_)
        ));
        assert!(matches!(
            stock_error(StockError::ReservedUnderflow {
                requested: 3,
                reserved: 1
            }),
            InventoryError::InvariantViolation(_)
        ));
    }

    #[test]
    fn settings_follow_inventory_config() {
        let settings = CoordinatorSettings::from(&InventoryConfig {
            cas_max_attempts: 0,
            ..InventoryConfig::default()
        });
        assert_eq!(settings.cas_max_attempts, 1);
        assert_eq!(settings.reservation_timeout, chrono::Duration::minutes(15));
    }
}
