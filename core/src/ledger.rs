//! Durable storage traits.
//!
//! Three ledgers back the coordinator:
//!
//! - [`StockLedger`]: one row per product, mutated only by compare-and-set on
//!   `(product_id, expected_version)`
//! - [`ReservationLedger`]: read side of the reservation table; reservations are
//!   written only inside a stock compare-and-set ([`ReservationChange`]), so a
//!   hold and the stock it accounts for always commit together
//! - [`EventAuditLog`]: append-only record of every consumed event and what
//!   the coordinator did with it
//!
//! Implementations: `PostgresLedger` in `stockflow-postgres`,
//! `InMemoryLedger` in `stockflow-testing`.

use crate::event::EventType;
use crate::reservation::{Reservation, ReservationStatus};
use crate::stock::{StockCounts, StockRecord};
use crate::types::{CorrelationId, EventId, ProductId, ReservationId, UnknownVariant, UserId};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during ledger operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The product or reservation does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record
        entity: &'static str,
        /// Its identifier
        id: String,
    },

    /// Optimistic concurrency conflict.
    ///
    /// The stored version moved between the writer's read and its write.
    #[error("Concurrency conflict on product {product_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// Product being written
        product_id: ProductId,
        /// Version the writer read
        expected: u64,
        /// Version currently stored
        actual: u64,
    },

    /// A reservation transition whose precondition no longer holds.
    #[error("Reservation {reservation_id} is {actual}, expected {expected}")]
    InvalidTransition {
        /// Reservation being transitioned
        reservation_id: ReservationId,
        /// Status required by the transition
        expected: ReservationStatus,
        /// Status actually stored
        actual: ReservationStatus,
    },

    /// Unique key already taken (product ID, correlation ID).
    #[error("Duplicate {entity}: {id}")]
    Duplicate {
        /// Kind of record
        entity: &'static str,
        /// The conflicting key
        id: String,
    },

    /// The event behind a stock write was already applied.
    #[error("Event {event_id} already applied")]
    AlreadyApplied {
        /// The replayed event
        event_id: EventId,
    },

    /// A write would break the stock invariant.
    #[error("Stock invariant violation: {0}")]
    InvariantViolation(String),

    /// Stored data could not be interpreted.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Storage unavailable or query failed.
    #[error("Database error: {0}")]
    Database(String),
}

impl LedgerError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::ConcurrencyConflict { .. })
    }
}

impl From<UnknownVariant> for LedgerError {
    fn from(e: UnknownVariant) -> Self {
        Self::Corrupt(e.to_string())
    }
}

/// Future returned by ledger operations.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LedgerError>> + Send + 'a>>;

/// Reservation write committed atomically with a stock write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationChange {
    /// Insert a new hold. Fails with [`LedgerError::Duplicate`] if its
    /// correlation ID is already used.
    Open(Reservation),
    /// Move an `ACTIVE` hold to a terminal status. Fails with
    /// [`LedgerError::InvalidTransition`] if the stored hold is not `ACTIVE`.
    Close {
        /// Hold to transition
        reservation_id: ReservationId,
        /// Terminal status
        to: ReservationStatus,
    },
}

/// Conditional stock write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockWrite {
    /// Event the write applies. Recorded with the write; a second write for
    /// the same event is refused.
    pub event_id: EventId,
    /// Product being written
    pub product_id: ProductId,
    /// Version the new counts were computed from
    pub expected_version: u64,
    /// Counts to store
    pub counts: StockCounts,
    /// Reservation change that must land in the same transaction
    pub reservation: Option<ReservationChange>,
    /// Mutation time
    pub at: DateTime<Utc>,
}

/// Stock ledger.
pub trait StockLedger: Send + Sync {
    /// Register a product.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Duplicate`] if the product exists.
    fn create_product(&self, record: StockRecord) -> LedgerFuture<'_, StockRecord>;

    /// Read one product.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Database`] when storage is unavailable.
    fn load_stock<'a>(&'a self, product_id: &'a ProductId) -> LedgerFuture<'a, Option<StockRecord>>;

    /// Read every product, ordered by product ID.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Database`] when storage is unavailable.
    fn list_stock(&self) -> LedgerFuture<'_, Vec<StockRecord>>;

    /// Atomic compare-and-set.
    ///
    /// Stores `write.counts` with version `expected_version + 1` only if the
    /// stored version still equals `expected_version`, and applies
    /// `write.reservation` in the same transaction, together with
    /// `write.event_id`. Nothing is written when any part fails.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::AlreadyApplied`] if `write.event_id` was already written
    /// - [`LedgerError::NotFound`] for an unknown product
    /// - [`LedgerError::ConcurrencyConflict`] on version mismatch
    /// - [`LedgerError::InvariantViolation`] if the counts do not balance
    /// - [`LedgerError::Duplicate`] / [`LedgerError::InvalidTransition`] from
    ///   the reservation change
    fn compare_and_set(&self, write: StockWrite) -> LedgerFuture<'_, StockRecord>;
}

/// Reservation ledger (read side).
pub trait ReservationLedger: Send + Sync {
    /// Look a hold up by its row identity.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Database`] when storage is unavailable.
    fn load_reservation(&self, id: ReservationId) -> LedgerFuture<'_, Option<Reservation>>;

    /// Look a hold up by the order identifier the caller knows.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Database`] when storage is unavailable.
    fn find_by_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> LedgerFuture<'_, Option<Reservation>>;

    /// A user's holds, newest first.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Database`] when storage is unavailable.
    fn list_for_user<'a>(&'a self, user_id: &'a UserId) -> LedgerFuture<'a, Vec<Reservation>>;

    /// Up to `limit` `ACTIVE` holds with `expires_at < now`, oldest expiry first.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Database`] when storage is unavailable.
    fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> LedgerFuture<'_, Vec<Reservation>>;
}

/// What the coordinator did with a consumed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditOutcome {
    /// The transition was applied
    Applied,
    /// Nothing to do (read-only check, duplicate, insufficient stock)
    Ignored,
    /// A precondition failed and the event was reported
    Rejected,
}

impl AuditOutcome {
    /// Convert outcome to its stored string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "APPLIED",
            Self::Ignored => "IGNORED",
            Self::Rejected => "REJECTED",
        }
    }

    /// Parse outcome from its stored string.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownVariant`] if the string doesn't match a known outcome.
    pub fn parse(s: &str) -> Result<Self, UnknownVariant> {
        match s {
            "APPLIED" => Ok(Self::Applied),
            "IGNORED" => Ok(Self::Ignored),
            "REJECTED" => Ok(Self::Rejected),
            _ => Err(UnknownVariant {
                kind: "audit outcome",
                value: s.to_string(),
            }),
        }
    }
}

/// One row of the event audit log.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    /// Event identity; the log keeps the first entry per event
    pub event_id: EventId,
    /// Event type
    pub event_type: EventType,
    /// Product touched
    pub product_id: ProductId,
    /// User named by the event
    pub user_id: Option<UserId>,
    /// Quantity named by the event
    pub quantity: u32,
    /// Purchase flow
    pub correlation_id: CorrelationId,
    /// Outcome
    pub outcome: AuditOutcome,
    /// Why the event was ignored or rejected
    pub detail: Option<String>,
    /// Event metadata, verbatim
    pub metadata: Map<String, Value>,
    /// When the event was published
    pub occurred_at: DateTime<Utc>,
    /// When the coordinator processed it
    pub processed_at: DateTime<Utc>,
}

/// Append-only event audit log.
pub trait EventAuditLog: Send + Sync {
    /// Append an entry. Re-recording an event ID keeps the first entry.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Database`] when storage is unavailable.
    fn record(&self, entry: AuditEntry) -> LedgerFuture<'_, ()>;

    /// Most recent entries for a product, newest first.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Database`] when storage is unavailable.
    fn history<'a>(&'a self, product_id: &'a ProductId, limit: usize)
    -> LedgerFuture<'a, Vec<AuditEntry>>;
}
