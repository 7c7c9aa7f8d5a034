//! Errors surfaced by the coordinator and the inventory service.

use stockflow_core::channel::ChannelError;
use stockflow_core::ledger::LedgerError;
use stockflow_core::types::{CorrelationId, ProductId};
use thiserror::Error;

/// Inventory operation failure.
///
/// [`is_transient`](Self::is_transient) separates failures worth retrying
/// (storage outage, exhausted compare-and-set, broker unavailable) from
/// failures that will repeat on every attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InventoryError {
    /// Unknown product or reservation
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity
        entity: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// Confirm or release by a user who does not own the reservation
    #[error("user {user_id} does not own order {order_id}")]
    Unauthorized {
        /// Order being acted on
        order_id: CorrelationId,
        /// Requesting user
        user_id: String,
    },

    /// Confirm or release on a reservation that cannot take that transition
    #[error("order {order_id} cannot change state: {reason}")]
    InvalidState {
        /// Order being acted on
        order_id: CorrelationId,
        /// What prevents the transition
        reason: String,
    },

    /// Not enough available stock
    #[error("insufficient stock for {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        /// Product
        product_id: ProductId,
        /// Units asked for
        requested: u32,
        /// Units available at the time
        available: u32,
    },

    /// Compare-and-set kept losing to concurrent writers
    #[error("concurrent writers on {product_id}, gave up after {attempts} attempts")]
    ConcurrencyConflict {
        /// Product
        product_id: ProductId,
        /// Attempts made
        attempts: usize,
    },

    /// Event could not be published after retries
    #[error("publish failed: {0}")]
    PublishFailure(ChannelError),

    /// Subscription could not be established or was lost
    #[error("delivery failed: {0}")]
    DeliveryFailure(ChannelError),

    /// Malformed request (zero quantity, missing user, product mismatch)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A write would have broken the stock invariant
    #[error("stock invariant violated: {0}")]
    InvariantViolation(String),

    /// Storage failure
    #[error(transparent)]
    Ledger(LedgerError),
}

impl InventoryError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::ConcurrencyConflict { .. } => true,
            Self::PublishFailure(e) | Self::DeliveryFailure(e) => e.is_transient(),
            Self::Ledger(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Short machine-readable label, used as a metrics label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Unauthorized { .. } => "unauthorized",
            Self::InvalidState { .. } => "invalid_state",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::PublishFailure(_) => "publish_failure",
            Self::DeliveryFailure(_) => "delivery_failure",
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::Ledger(_) => "ledger",
        }
    }

    pub(crate) fn product_not_found(product_id: &ProductId) -> Self {
        Self::NotFound {
            entity: "product",
            id: product_id.to_string(),
        }
    }

    pub(crate) fn order_not_found(order_id: CorrelationId) -> Self {
        Self::NotFound {
            entity: "reservation",
            id: order_id.to_string(),
        }
    }
}

impl From<LedgerError> for InventoryError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound { entity, id } => Self::NotFound { entity, id },
            LedgerError::InvariantViolation(reason) => Self::InvariantViolation(reason),
            other => Self::Ledger(other),
        }
    }
}
