//! # Stockflow Testing
//!
//! Testing utilities for stockflow.
//!
//! This crate provides:
//! - [`InMemoryEventChannel`]: partitioned channel with per-group offsets,
//!   commit-after-success and redelivery, plus publish fault injection
//! - [`InMemoryLedger`]: stock, reservation and audit ledgers in one struct,
//!   with outage and write-conflict injection
//! - [`FixedClock`] / [`ManualClock`]: deterministic time
//! - [`helpers::eventually`]: poll an async condition with a deadline
//!
//! ## Example
//!
//! ```
//! use stockflow_testing::{InMemoryEventChannel, InMemoryLedger, test_clock};
//! use stockflow_core::environment::Clock;
//!
//! let channel = InMemoryEventChannel::with_partitions(4);
//! let ledger = InMemoryLedger::new();
//! let clock = test_clock();
//! # let _ = (channel, ledger, clock.now());
//! ```

use chrono::{DateTime, Utc};
use stockflow_core::environment::Clock;

pub mod channel;
pub mod ledger;

pub use channel::InMemoryEventChannel;
pub use ledger::InMemoryLedger;

/// Mock implementations of Environment traits
pub mod mocks {
    #![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use stockflow_testing::mocks::FixedClock;
    /// use stockflow_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hand one clone to the
    /// coordinator and advance another.
    ///
    /// ```
    /// use stockflow_testing::mocks::ManualClock;
    /// use stockflow_core::environment::Clock;
    /// use chrono::Duration;
    ///
    /// let clock = ManualClock::starting_at(stockflow_testing::test_instant());
    /// let before = clock.now();
    /// clock.advance(Duration::minutes(16));
    /// assert_eq!(clock.now() - before, Duration::minutes(16));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Clock reading `start` until advanced.
        #[must_use]
        pub fn starting_at(start: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(start)),
            }
        }

        /// Move time forward (or backward, for a negative duration).
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.write().unwrap();
            *time += by;
        }

        /// Jump to an absolute time.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.write().unwrap() = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap()
        }
    }

    /// 2025-01-01 00:00:00 UTC
    #[must_use]
    pub fn test_instant() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_instant())
    }
}

/// Test helpers and utilities
pub mod helpers {
    use std::future::Future;
    use std::time::Duration;

    /// Poll `condition` every few milliseconds until it holds or `timeout`
    /// elapses. Returns whether it held.
    pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock, test_instant};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), test_instant());
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::starting_at(test_instant());
        let observer = clock.clone();
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(observer.now(), test_instant() + chrono::Duration::seconds(30));
        clock.set(test_instant());
        assert_eq!(observer.now(), test_instant());
    }

    #[tokio::test]
    async fn eventually_reports_timeout() {
        assert!(helpers::eventually(Duration::from_millis(20), || async { true }).await);
        assert!(!helpers::eventually(Duration::from_millis(20), || async { false }).await);
    }
}
