//! Inbound inventory operations.
//!
//! [`InventoryService`] is what a request layer calls. Reads are answered from
//! the coordinator's cache and the ledgers; every mutation is turned into an
//! event on the events topic and applied later by the coordinator.
//!
//! `reserve` is asynchronous: it returns the order ID once the RESERVE event
//! is acknowledged by the broker. Whether stock was actually held is
//! observable through [`InventoryService::reservation`] or, in-process,
//! [`InventoryService::await_reservation`].

use crate::coordinator::{Coordinator, Outcome};
use crate::error::InventoryError;
use crate::publisher::EventPublisher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use stockflow_core::environment::Clock;
use stockflow_core::event::{EventType, InventoryEvent, InventoryState};
use stockflow_core::ledger::AuditEntry;
use stockflow_core::reservation::{Reservation, ReservationStatus};
use stockflow_core::stock::StockRecord;
use stockflow_core::types::{CorrelationId, ProductId, UserId};
use tokio::sync::broadcast::error::RecvError;

/// Answer to an availability check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    /// Product the answer is for
    pub product_id: ProductId,
    /// Whether the requested quantity can currently be reserved
    pub available: bool,
    /// Units available
    pub available_stock: u32,
    /// Units in the system
    pub total_stock: u32,
    /// Units held by active reservations
    pub reserved_stock: u32,
}

/// Returned by [`InventoryService::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationTicket {
    /// Order identifier; use it to confirm or release
    pub order_id: CorrelationId,
    /// Estimated end of the hold if it is granted
    pub reserved_until: DateTime<Utc>,
}

/// How a RESERVE request turned out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationOutcome {
    /// The hold exists
    Granted(Reservation),
    /// Not enough stock when the coordinator applied the request
    Denied {
        /// Units asked for
        requested: u32,
        /// Units available at the time
        available: u32,
    },
    /// The coordinator refused the request
    Rejected(String),
    /// Not applied yet
    Pending,
}

/// Aggregate view over every product.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventorySummary {
    /// Registered products
    pub products: usize,
    /// Sum of total stock
    pub total_stock: u64,
    /// Sum of available stock
    pub available_stock: u64,
    /// Sum of reserved stock
    pub reserved_stock: u64,
    /// Products whose available stock is below the low-stock threshold
    pub low_stock_products: usize,
    /// Most recent stock mutation
    pub last_updated: Option<DateTime<Utc>>,
}

/// Inventory operations for request-serving code.
#[derive(Clone)]
pub struct InventoryService {
    coordinator: Arc<Coordinator>,
    publisher: EventPublisher,
    clock: Arc<dyn Clock>,
    low_stock_threshold: u32,
}

impl InventoryService {
    /// Service in front of `coordinator`.
    #[must_use]
    pub fn new(coordinator: Arc<Coordinator>, publisher: EventPublisher, clock: Arc<dyn Clock>) -> Self {
        Self {
            coordinator,
            publisher,
            clock,
            low_stock_threshold: 10,
        }
    }

    /// Products with fewer available units count as low stock.
    #[must_use]
    pub const fn with_low_stock_threshold(mut self, threshold: u32) -> Self {
        self.low_stock_threshold = threshold;
        self
    }

    /// Whether `quantity` units of `product_id` are available.
    ///
    /// Read-only. A CHECK event recording the answer is published in the
    /// background.
    ///
    /// # Errors
    ///
    /// [`InventoryError::InvalidRequest`] for a zero quantity,
    /// [`InventoryError::NotFound`] for an unknown product.
    pub async fn check_availability(
        &self,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<Availability, InventoryError> {
        positive(quantity)?;
        let state = self.coordinator.snapshot(product_id).await?;
        let available = state.is_available(quantity);

        self.publisher.publish_event_detached(InventoryEvent::check(
            product_id.clone(),
            quantity,
            available,
            None,
            self.clock.now(),
        ));

        Ok(Availability {
            product_id: product_id.clone(),
            available,
            available_stock: state.available_stock,
            total_stock: state.total_stock,
            reserved_stock: state.reserved_stock,
        })
    }

    /// [`check_availability`](Self::check_availability) for several products.
    ///
    /// # Errors
    ///
    /// The first failing check.
    pub async fn check_availability_bulk(
        &self,
        requests: &[(ProductId, u32)],
    ) -> Result<Vec<Availability>, InventoryError> {
        let mut answers = Vec::with_capacity(requests.len());
        for (product_id, quantity) in requests {
            answers.push(self.check_availability(product_id, *quantity).await?);
        }
        Ok(answers)
    }

    /// Ask for a hold of `quantity` units for `user_id`.
    ///
    /// Returns once the RESERVE event is published. The hold is not
    /// guaranteed.
    ///
    /// # Errors
    ///
    /// [`InventoryError::InvalidRequest`] for a zero quantity or blank user,
    /// [`InventoryError::NotFound`] for an unknown product,
    /// [`InventoryError::PublishFailure`] if the event could not be published.
    pub async fn reserve(
        &self,
        product_id: &ProductId,
        quantity: u32,
        user_id: &UserId,
    ) -> Result<ReservationTicket, InventoryError> {
        positive(quantity)?;
        non_blank(user_id)?;
        self.coordinator.snapshot(product_id).await?;

        let now = self.clock.now();
        let order_id = CorrelationId::new();
        let reserved_until = now + self.coordinator.settings().reservation_timeout;

        self.publisher
            .publish_event(&InventoryEvent::reserve(
                product_id.clone(),
                quantity,
                user_id.clone(),
                order_id,
                reserved_until,
                now,
            ))
            .await?;

        tracing::info!(
            product_id = %product_id,
            user_id = %user_id,
            quantity,
            order_id = %order_id,
            "Reservation requested"
        );
        Ok(ReservationTicket {
            order_id,
            reserved_until,
        })
    }

    /// Wait up to `timeout` for the coordinator to apply the RESERVE for
    /// `order_id`.
    ///
    /// # Errors
    ///
    /// Returns a ledger error if the reservation lookup fails.
    pub async fn await_reservation(
        &self,
        order_id: CorrelationId,
        timeout: Duration,
    ) -> Result<ReservationOutcome, InventoryError> {
        // Subscribe before looking, so an outcome between the two is not lost.
        let mut notices = self.coordinator.subscribe_notices();
        if let Some(reservation) = self.reservation(order_id).await? {
            return Ok(ReservationOutcome::Granted(reservation));
        }
        if let Some(notice) = self.coordinator.recent_notice(order_id, EventType::Reserve) {
            return Ok(reservation_outcome(notice.result));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, notices.recv()).await {
                Err(_) | Ok(Err(RecvError::Closed)) => break,
                Ok(Err(RecvError::Lagged(skipped))) => {
                    tracing::debug!(skipped, order_id = %order_id, "Notice receiver lagged");
                    if let Some(reservation) = self.reservation(order_id).await? {
                        return Ok(ReservationOutcome::Granted(reservation));
                    }
                },
                Ok(Ok(notice)) => {
                    if notice.correlation_id != order_id || notice.event_type != EventType::Reserve {
                        continue;
                    }
                    return Ok(reservation_outcome(notice.result));
                },
            }
        }

        Ok(self
            .reservation(order_id)
            .await?
            .map_or(ReservationOutcome::Pending, ReservationOutcome::Granted))
    }

    /// Confirm the hold for `order_id`.
    ///
    /// # Errors
    ///
    /// - [`InventoryError::NotFound`] if the order has no hold
    /// - [`InventoryError::Unauthorized`] if `user_id` does not own it
    /// - [`InventoryError::InvalidState`] if it is not ACTIVE or has expired
    /// - [`InventoryError::PublishFailure`] if the event could not be published
    pub async fn confirm(&self, order_id: CorrelationId, user_id: &UserId) -> Result<(), InventoryError> {
        let reservation = self.owned_active(order_id, user_id).await?;
        let now = self.clock.now();
        if reservation.expires_at < now {
            return Err(InventoryError::InvalidState {
                order_id,
                reason: format!("reservation expired at {}", reservation.expires_at),
            });
        }

        self.publisher
            .publish_event(&InventoryEvent::confirm(
                reservation.product_id.clone(),
                reservation.quantity,
                user_id.clone(),
                order_id,
                now,
            ))
            .await?;

        tracing::info!(
            order_id = %order_id,
            product_id = %reservation.product_id,
            quantity = reservation.quantity,
            "Confirmation requested"
        );
        Ok(())
    }

    /// Release the hold for `order_id`.
    ///
    /// # Errors
    ///
    /// - [`InventoryError::NotFound`] if the order has no hold
    /// - [`InventoryError::Unauthorized`] if `user_id` does not own it
    /// - [`InventoryError::InvalidState`] if it is not ACTIVE
    /// - [`InventoryError::PublishFailure`] if the event could not be published
    pub async fn release(&self, order_id: CorrelationId, user_id: &UserId) -> Result<(), InventoryError> {
        let reservation = self.owned_active(order_id, user_id).await?;

        self.publisher
            .publish_event(&InventoryEvent::release(
                reservation.product_id.clone(),
                reservation.quantity,
                user_id.clone(),
                order_id,
                self.clock.now(),
            ))
            .await?;

        tracing::info!(
            order_id = %order_id,
            product_id = %reservation.product_id,
            quantity = reservation.quantity,
            "Release requested"
        );
        Ok(())
    }

    /// Current stock snapshot of a product.
    ///
    /// # Errors
    ///
    /// [`InventoryError::NotFound`] for an unknown product.
    pub async fn get_product_inventory(&self, product_id: &ProductId) -> Result<InventoryState, InventoryError> {
        self.coordinator.snapshot(product_id).await
    }

    /// Register a product with `initial_stock` units, all available.
    ///
    /// # Errors
    ///
    /// [`InventoryError::InvalidRequest`] for a blank product ID, a ledger
    /// `Duplicate` error if the product exists.
    pub async fn register_product(
        &self,
        product_id: &ProductId,
        initial_stock: u32,
    ) -> Result<InventoryState, InventoryError> {
        if product_id.as_str().trim().is_empty() {
            return Err(InventoryError::InvalidRequest("product ID must not be blank".to_string()));
        }

        let record = self
            .coordinator
            .ledgers()
            .stock
            .create_product(StockRecord::new(product_id.clone(), initial_stock, self.clock.now()))
            .await?;
        let state = InventoryState::from(&record);
        self.coordinator.cache().upsert(state.clone());

        if let Err(e) = self.publisher.publish_state(&state).await {
            tracing::warn!(product_id = %product_id, error = %e, "Failed to publish initial state");
        }
        tracing::info!(product_id = %product_id, initial_stock, "Product registered");
        Ok(state)
    }

    /// Add `quantity` units to a product.
    ///
    /// # Errors
    ///
    /// [`InventoryError::InvalidRequest`] for a zero quantity,
    /// [`InventoryError::NotFound`] for an unknown product,
    /// [`InventoryError::PublishFailure`] if the event could not be published.
    pub async fn restock(&self, product_id: &ProductId, quantity: u32) -> Result<(), InventoryError> {
        positive(quantity)?;
        self.coordinator.snapshot(product_id).await?;
        self.publisher
            .publish_event(&InventoryEvent::restock(product_id.clone(), quantity, self.clock.now()))
            .await?;
        Ok(())
    }

    /// The hold created for `order_id`, in any status.
    ///
    /// # Errors
    ///
    /// Returns a ledger error if the lookup fails.
    pub async fn reservation(&self, order_id: CorrelationId) -> Result<Option<Reservation>, InventoryError> {
        Ok(self
            .coordinator
            .ledgers()
            .reservations
            .find_by_correlation(order_id)
            .await?)
    }

    /// A user's holds, newest first.
    ///
    /// # Errors
    ///
    /// Returns a ledger error if the lookup fails.
    pub async fn user_reservations(&self, user_id: &UserId) -> Result<Vec<Reservation>, InventoryError> {
        Ok(self.coordinator.ledgers().reservations.list_for_user(user_id).await?)
    }

    /// Up to `limit` audited events of a product, newest first.
    ///
    /// # Errors
    ///
    /// Returns a ledger error if the lookup fails.
    pub async fn product_history(
        &self,
        product_id: &ProductId,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, InventoryError> {
        Ok(self.coordinator.ledgers().audit.history(product_id, limit).await?)
    }

    /// Totals over every registered product.
    ///
    /// # Errors
    ///
    /// Returns a ledger error if the products cannot be listed.
    pub async fn inventory_summary(&self) -> Result<InventorySummary, InventoryError> {
        let records = self.coordinator.ledgers().stock.list_stock().await?;

        Ok(records.iter().fold(
            InventorySummary {
                products: records.len(),
                ..InventorySummary::default()
            },
            |mut summary, record| {
                summary.total_stock += u64::from(record.counts.total());
                summary.available_stock += u64::from(record.counts.available());
                summary.reserved_stock += u64::from(record.counts.reserved());
                if record.counts.available() < self.low_stock_threshold {
                    summary.low_stock_products += 1;
                }
                summary.last_updated = summary.last_updated.max(Some(record.updated_at));
                summary
            },
        ))
    }

    async fn owned_active(&self, order_id: CorrelationId, user_id: &UserId) -> Result<Reservation, InventoryError> {
        let reservation = self
            .reservation(order_id)
            .await?
            .ok_or_else(|| InventoryError::order_not_found(order_id))?;

        if !reservation.is_owned_by(user_id) {
            return Err(InventoryError::Unauthorized {
                order_id,
                user_id: user_id.to_string(),
            });
        }
        if reservation.status != ReservationStatus::Active {
            return Err(InventoryError::InvalidState {
                order_id,
                reason: format!("reservation is {}", reservation.status),
            });
        }
        Ok(reservation)
    }
}

fn reservation_outcome(result: Result<Outcome, InventoryError>) -> ReservationOutcome {
    match result {
        Ok(Outcome::Reserved(reservation) | Outcome::Duplicate(reservation)) => {
            ReservationOutcome::Granted(reservation)
        },
        Ok(Outcome::Denied {
            requested,
            available,
        }) => ReservationOutcome::Denied {
            requested,
            available,
        },
        Ok(other) => ReservationOutcome::Rejected(format!("unexpected outcome {other:?}")),
        Err(e) => ReservationOutcome::Rejected(e.to_string()),
    }
}

fn positive(quantity: u32) -> Result<(), InventoryError> {
    if quantity == 0 {
        return Err(InventoryError::InvalidRequest("quantity must be positive".to_string()));
    }
    Ok(())
}

fn non_blank(user_id: &UserId) -> Result<(), InventoryError> {
    if user_id.is_blank() {
        return Err(InventoryError::InvalidRequest("user ID must not be blank".to_string()));
    }
    Ok(())
}
