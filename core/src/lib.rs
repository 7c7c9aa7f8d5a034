//! # Stockflow Core
//!
//! Domain types and the seams of the stockflow inventory coordinator.
//!
//! Stock is shared by many concurrent purchase attempts. Instead of locking,
//! every request is turned into an [`event::InventoryEvent`] and published on an
//! ordered, partitioned [`channel::EventChannel`] keyed by product. A single
//! logical consumer per partition applies the events to the ledgers.
//!
//! ## Modules
//!
//! - [`types`]: identifiers (`ProductId`, `UserId`, `ReservationId`, ...)
//! - [`stock`]: stock counts and their pure, checked transitions
//! - [`reservation`]: holds on stock and their forward-only lifecycle
//! - [`event`]: the inventory event and state wire contract
//! - [`channel`]: the publish/subscribe transport trait
//! - [`ledger`]: durable storage traits (stock, reservations, audit)
//! - [`shutdown`]: cooperative shutdown signal shared by long-running tasks
//! - [`environment`]: injected dependencies such as the clock
//!
//! ## Invariants
//!
//! For every product, after every mutation, `total = available + reserved` and
//! no count is negative. [`stock::StockCounts`] cannot be constructed or
//! transitioned into a state that breaks either rule.

pub use chrono::{DateTime, Utc};

pub mod channel;
pub mod event;
pub mod ledger;
pub mod reservation;
pub mod shutdown;
pub mod stock;
pub mod types;

/// Environment module - injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Reservation expiry and the sweeper's scan are both driven by this clock,
    /// so tests can move time forward instead of sleeping.
    ///
    /// # Examples
    ///
    /// ```
    /// use stockflow_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
