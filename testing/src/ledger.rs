//! In-memory implementation of the three ledger traits.
//!
//! Behaves like the Postgres ledger: compare-and-set on the product version,
//! stock and reservation changes committed together, each event applied at
//! most once, unique correlation IDs, first-write-wins audit entries. Two fault knobs let tests exercise the
//! coordinator's error paths:
//!
//! - [`InMemoryLedger::fail_next`]: the next N operations fail with
//!   [`LedgerError::Database`]
//! - [`InMemoryLedger::conflict_next_writes`]: the next N compare-and-sets
//!   lose a race against a phantom writer that bumps the version

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use stockflow_core::ledger::{
    AuditEntry, EventAuditLog, LedgerError, LedgerFuture, ReservationChange, ReservationLedger,
    StockLedger, StockWrite,
};
use stockflow_core::reservation::{Reservation, ReservationStatus};
use stockflow_core::stock::{StockCounts, StockRecord};
use stockflow_core::types::{CorrelationId, EventId, ProductId, ReservationId, UserId};

#[derive(Debug, Default)]
struct State {
    products: BTreeMap<ProductId, StockRecord>,
    reservations: HashMap<ReservationId, Reservation>,
    by_correlation: HashMap<CorrelationId, ReservationId>,
    audit: Vec<AuditEntry>,
    audited: HashSet<EventId>,
    applied: HashSet<EventId>,
}

#[derive(Debug, Default)]
struct Faults {
    outages: AtomicUsize,
    conflicts: AtomicUsize,
    writes: AtomicUsize,
}

/// In-memory stock, reservation and audit ledger.
///
/// Clones share state.
///
/// # Example
///
/// ```
/// use stockflow_testing::{InMemoryLedger, test_instant};
/// use stockflow_core::ledger::StockLedger;
/// use stockflow_core::stock::StockRecord;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let ledger = InMemoryLedger::new();
/// ledger.create_product(StockRecord::new("sku-1".into(), 10, test_instant())).await?;
/// assert_eq!(ledger.stock(&"sku-1".into()).unwrap().counts.available(), 10);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryLedger {
    state: Arc<Mutex<State>>,
    faults: Arc<Faults>,
}

impl InMemoryLedger {
    /// Empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail as if storage were down.
    pub fn fail_next(&self, count: usize) {
        self.faults.outages.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` compare-and-sets lose to a concurrent writer.
    pub fn conflict_next_writes(&self, count: usize) {
        self.faults.conflicts.store(count, Ordering::SeqCst);
    }

    /// Successful compare-and-sets so far.
    #[must_use]
    pub fn successful_writes(&self) -> usize {
        self.faults.writes.load(Ordering::SeqCst)
    }

    /// Synchronous read for assertions.
    #[must_use]
    pub fn stock(&self, product_id: &ProductId) -> Option<StockRecord> {
        self.state.lock().unwrap().products.get(product_id).cloned()
    }

    /// Every reservation, in no particular order.
    #[must_use]
    pub fn reservations(&self) -> Vec<Reservation> {
        self.state
            .lock()
            .unwrap()
            .reservations
            .values()
            .cloned()
            .collect()
    }

    /// Reservation for an order, for assertions.
    #[must_use]
    pub fn reservation_for(&self, correlation_id: CorrelationId) -> Option<Reservation> {
        let state = self.state.lock().unwrap();
        state
            .by_correlation
            .get(&correlation_id)
            .and_then(|id| state.reservations.get(id))
            .cloned()
    }

    /// Every audit entry, in recording order.
    #[must_use]
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.state.lock().unwrap().audit.clone()
    }

    fn outage(&self) -> Result<(), LedgerError> {
        let injected = self
            .faults
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(LedgerError::Database("injected outage".to_string()))
        } else {
            Ok(())
        }
    }

    fn insert_product(&self, record: StockRecord) -> Result<StockRecord, LedgerError> {
        self.outage()?;
        let mut state = self.state.lock().unwrap();
        if state.products.contains_key(&record.product_id) {
            return Err(LedgerError::Duplicate {
                entity: "product",
                id: record.product_id.to_string(),
            });
        }
        state.products.insert(record.product_id.clone(), record.clone());
        Ok(record)
    }

    fn apply(&self, write: StockWrite) -> Result<StockRecord, LedgerError> {
        self.outage()?;
        let mut state = self.state.lock().unwrap();

        let Some(current) = state.products.get(&write.product_id).cloned() else {
            return Err(LedgerError::NotFound {
                entity: "product",
                id: write.product_id.to_string(),
            });
        };

        if state.applied.contains(&write.event_id) {
            return Err(LedgerError::AlreadyApplied {
                event_id: write.event_id,
            });
        }

        let phantom = self
            .faults
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if phantom {
            let bumped = StockRecord {
                version: current.version + 1,
                ..current.clone()
            };
            state.products.insert(write.product_id.clone(), bumped);
            return Err(LedgerError::ConcurrencyConflict {
                product_id: write.product_id,
                expected: write.expected_version,
                actual: current.version + 1,
            });
        }

        if current.version != write.expected_version {
            return Err(LedgerError::ConcurrencyConflict {
                product_id: write.product_id,
                expected: write.expected_version,
                actual: current.version,
            });
        }

        let counts = write.counts;
        StockCounts::new(counts.total(), counts.available(), counts.reserved())
            .map_err(|e| LedgerError::InvariantViolation(e.to_string()))?;

        match &write.reservation {
            Some(ReservationChange::Open(reservation)) => {
                if state.by_correlation.contains_key(&reservation.correlation_id) {
                    return Err(LedgerError::Duplicate {
                        entity: "reservation",
                        id: reservation.correlation_id.to_string(),
                    });
                }
            }
            Some(ReservationChange::Close { reservation_id, to }) => {
                let Some(stored) = state.reservations.get(reservation_id) else {
                    return Err(LedgerError::NotFound {
                        entity: "reservation",
                        id: reservation_id.to_string(),
                    });
                };
                if !stored.status.can_transition_to(*to) {
                    return Err(LedgerError::InvalidTransition {
                        reservation_id: *reservation_id,
                        expected: ReservationStatus::Active,
                        actual: stored.status,
                    });
                }
            }
            None => {}
        }

        let record = StockRecord {
            product_id: write.product_id.clone(),
            counts,
            version: current.version + 1,
            updated_at: write.at,
        };
        state.products.insert(write.product_id, record.clone());
        state.applied.insert(write.event_id);

        match write.reservation {
            Some(ReservationChange::Open(reservation)) => {
                state
                    .by_correlation
                    .insert(reservation.correlation_id, reservation.id);
                state.reservations.insert(reservation.id, reservation);
            }
            Some(ReservationChange::Close { reservation_id, to }) => {
                if let Some(stored) = state.reservations.get_mut(&reservation_id) {
                    stored.status = to;
                }
            }
            None => {}
        }

        self.faults.writes.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> T) -> Result<T, LedgerError> {
        self.outage()?;
        Ok(f(&self.state.lock().unwrap()))
    }
}

impl StockLedger for InMemoryLedger {
    fn create_product(&self, record: StockRecord) -> LedgerFuture<'_, StockRecord> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.insert_product(record)
        })
    }

    fn load_stock<'a>(&'a self, product_id: &'a ProductId) -> LedgerFuture<'a, Option<StockRecord>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.read(|state| state.products.get(product_id).cloned())
        })
    }

    fn list_stock(&self) -> LedgerFuture<'_, Vec<StockRecord>> {
        Box::pin(async move { self.read(|state| state.products.values().cloned().collect()) })
    }

    fn compare_and_set(&self, write: StockWrite) -> LedgerFuture<'_, StockRecord> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.apply(write)
        })
    }
}

impl ReservationLedger for InMemoryLedger {
    fn load_reservation(&self, id: ReservationId) -> LedgerFuture<'_, Option<Reservation>> {
        Box::pin(async move { self.read(|state| state.reservations.get(&id).cloned()) })
    }

    fn find_by_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> LedgerFuture<'_, Option<Reservation>> {
        Box::pin(async move {
            self.read(|state| {
                state
                    .by_correlation
                    .get(&correlation_id)
                    .and_then(|id| state.reservations.get(id))
                    .cloned()
            })
        })
    }

    fn list_for_user<'a>(&'a self, user_id: &'a UserId) -> LedgerFuture<'a, Vec<Reservation>> {
        Box::pin(async move {
            self.read(|state| {
                let mut held: Vec<Reservation> = state
                    .reservations
                    .values()
                    .filter(|r| &r.user_id == user_id)
                    .cloned()
                    .collect();
                held.sort_by(|a, b| b.reserved_at.cmp(&a.reserved_at));
                held
            })
        })
    }

    fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> LedgerFuture<'_, Vec<Reservation>> {
        Box::pin(async move {
            self.read(|state| {
                let mut expired: Vec<Reservation> = state
                    .reservations
                    .values()
                    .filter(|r| r.is_expired(now))
                    .cloned()
                    .collect();
                expired.sort_by_key(|r| r.expires_at);
                expired.truncate(limit);
                expired
            })
        })
    }
}

impl EventAuditLog for InMemoryLedger {
    fn record(&self, entry: AuditEntry) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            self.outage()?;
            let mut state = self.state.lock().unwrap();
            if state.audited.insert(entry.event_id) {
                state.audit.push(entry);
            }
            Ok(())
        })
    }

    fn history<'a>(
        &'a self,
        product_id: &'a ProductId,
        limit: usize,
    ) -> LedgerFuture<'a, Vec<AuditEntry>> {
        Box::pin(async move {
            self.read(|state| {
                state
                    .audit
                    .iter()
                    .rev()
                    .filter(|entry| &entry.product_id == product_id)
                    .take(limit)
                    .cloned()
                    .collect()
            })
        })
    }
}
