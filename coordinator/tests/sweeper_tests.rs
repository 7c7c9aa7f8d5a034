//! Expiration sweeper tests.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use std::sync::Arc;
use std::time::Duration;
use stockflow_coordinator::{
    Coordinator, CoordinatorSettings, EventPublisher, InventoryError, Ledgers, Outcome, Sweeper,
    Topics,
};
use stockflow_core::environment::Clock;
use stockflow_core::event::{EventType, InventoryEvent, metadata};
use stockflow_core::ledger::StockLedger;
use stockflow_core::reservation::ReservationStatus;
use stockflow_core::shutdown;
use stockflow_core::stock::StockRecord;
use stockflow_core::types::{CorrelationId, ProductId, UserId};
use stockflow_runtime::RetryPolicy;
use stockflow_testing::helpers::eventually;
use stockflow_testing::{InMemoryEventChannel, InMemoryLedger, ManualClock, test_instant};

const EVENTS: &str = "inventory-events";

// ============================================================================
// Test Fixtures
// ============================================================================

struct Fixture {
    ledger: InMemoryLedger,
    channel: InMemoryEventChannel,
    clock: ManualClock,
    coordinator: Coordinator,
    sweeper: Arc<Sweeper>,
}

fn fixture(interval: Duration) -> Fixture {
    let ledger = InMemoryLedger::new();
    let channel = InMemoryEventChannel::with_partitions(2);
    let clock = ManualClock::starting_at(test_instant());
    let publisher = EventPublisher::new(
        Arc::new(channel.clone()),
        Topics::default(),
        RetryPolicy::no_retry(),
    );
    let coordinator = Coordinator::new(
        Ledgers::shared(Arc::new(ledger.clone())),
        publisher.clone(),
        Arc::new(clock.clone()),
        CoordinatorSettings::default(),
    );
    let sweeper = Arc::new(Sweeper::new(
        Arc::new(ledger.clone()),
        publisher,
        Arc::new(clock.clone()),
        interval,
        100,
    ));
    Fixture {
        ledger,
        channel,
        clock,
        coordinator,
        sweeper,
    }
}

impl Fixture {
    /// Registers `product` and grants one hold of `quantity` units to alice.
    async fn hold(&self, product: &str, quantity: u32) -> CorrelationId {
        if self.ledger.stock(&ProductId::new(product)).is_none() {
            self.ledger
                .create_product(StockRecord::new(ProductId::new(product), 10, self.clock.now()))
                .await
                .unwrap();
        }
        let now = self.clock.now();
        let event = InventoryEvent::reserve(
            ProductId::new(product),
            quantity,
            UserId::new("alice"),
            CorrelationId::new(),
            now,
            now,
        );
        let outcome = self.coordinator.process(&event).await.unwrap();
        assert!(matches!(outcome, Outcome::Reserved(_)));
        event.correlation_id
    }

    fn lapse(&self) {
        let timeout = self.coordinator.settings().reservation_timeout;
        self.clock.advance(timeout + chrono::Duration::seconds(1));
    }

    fn releases(&self) -> Vec<InventoryEvent> {
        self.channel
            .published(EVENTS)
            .iter()
            .map(|m| InventoryEvent::decode(&m.payload).unwrap())
            .filter(|e| e.event_type == EventType::Release)
            .collect()
    }
}

// ============================================================================
// Single sweeps
// ============================================================================

#[tokio::test]
async fn active_holds_are_left_alone() {
    let f = fixture(Duration::from_secs(60));
    f.hold("sku-1", 2).await;

    let report = f.sweeper.sweep_once().await.unwrap();
    assert_eq!(report.scanned, 0);
    assert!(f.releases().is_empty());
}

#[tokio::test]
async fn lapsed_hold_gets_an_expiry_release() {
    let f = fixture(Duration::from_secs(60));
    let order = f.hold("sku-1", 2).await;
    f.lapse();

    let report = f.sweeper.sweep_once().await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.released, 1);

    let releases = f.releases();
    assert_eq!(releases.len(), 1);
    let release = &releases[0];
    assert_eq!(release.correlation_id, order);
    assert_eq!(release.quantity, 2);
    assert_eq!(release.user_id, Some(UserId::new("alice")));
    assert_eq!(release.metadata_str(metadata::REASON), Some(metadata::REASON_EXPIRED));
    assert!(release.is_expiry_release());

    // The sweeper only publishes; the hold is still active until consumed.
    assert_eq!(
        f.ledger.reservation_for(order).unwrap().status,
        ReservationStatus::Active
    );
}

#[tokio::test]
async fn in_flight_release_is_not_published_twice() {
    let f = fixture(Duration::from_secs(60));
    f.hold("sku-1", 1).await;
    f.lapse();

    assert_eq!(f.sweeper.sweep_once().await.unwrap().released, 1);
    let second = f.sweeper.sweep_once().await.unwrap();
    assert_eq!(second.released, 0);
    assert_eq!(second.skipped, 1);
    assert_eq!(f.releases().len(), 1);

    // After three intervals the hold is considered lost and retried.
    f.clock.advance(chrono::Duration::minutes(4));
    let third = f.sweeper.sweep_once().await.unwrap();
    assert_eq!(third.released, 1);
    assert_eq!(f.releases().len(), 2);
}

#[tokio::test]
async fn consumed_release_frees_the_stock() {
    let f = fixture(Duration::from_secs(60));
    let order = f.hold("sku-1", 4).await;
    f.lapse();
    f.sweeper.sweep_once().await.unwrap();

    let release = f.releases().remove(0);
    let outcome = f.coordinator.process(&release).await.unwrap();
    assert!(matches!(outcome, Outcome::Released { expired: true, .. }));

    let counts = f.ledger.stock(&ProductId::new("sku-1")).unwrap().counts;
    assert_eq!((counts.total(), counts.available(), counts.reserved()), (10, 10, 0));
    assert_eq!(
        f.ledger.reservation_for(order).unwrap().status,
        ReservationStatus::Released
    );

    // Nothing left to sweep.
    f.clock.advance(chrono::Duration::minutes(10));
    assert_eq!(f.sweeper.sweep_once().await.unwrap().scanned, 0);
}

#[tokio::test]
async fn batch_size_limits_one_sweep() {
    let f = fixture(Duration::from_secs(60));
    let sweeper = Sweeper::new(
        Arc::new(f.ledger.clone()),
        EventPublisher::new(
            Arc::new(f.channel.clone()),
            Topics::default(),
            RetryPolicy::no_retry(),
        ),
        Arc::new(f.clock.clone()),
        Duration::from_secs(60),
        2,
    );
    for _ in 0..3 {
        f.hold("sku-1", 1).await;
    }
    f.lapse();

    assert_eq!(sweeper.sweep_once().await.unwrap().released, 2);
    assert_eq!(sweeper.sweep_once().await.unwrap().released, 0);
}

#[tokio::test]
async fn publish_failure_is_counted_and_retried() {
    let f = fixture(Duration::from_secs(60));
    f.hold("sku-1", 1).await;
    f.lapse();

    f.channel.fail_next_publishes(1);
    let report = f.sweeper.sweep_once().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.released, 0);
    assert!(f.releases().is_empty());

    // Not marked in flight, so the next sweep tries again.
    assert_eq!(f.sweeper.sweep_once().await.unwrap().released, 1);
}

#[tokio::test]
async fn scan_outage_is_an_error() {
    let f = fixture(Duration::from_secs(60));
    f.ledger.fail_next(1);

    let result = f.sweeper.sweep_once().await;
    assert!(matches!(result, Err(InventoryError::Ledger(_))));
}

#[test]
fn interval_has_a_floor() {
    let f = fixture(Duration::ZERO);
    assert_eq!(f.sweeper.interval(), Duration::from_millis(10));
}

// ============================================================================
// Background loop
// ============================================================================

#[tokio::test]
async fn spawned_sweeper_runs_until_shutdown() {
    let f = fixture(Duration::from_millis(20));
    f.hold("sku-1", 1).await;
    f.lapse();

    let (trigger, signal) = shutdown::channel();
    let handle = Arc::clone(&f.sweeper).spawn(signal);

    assert!(eventually(Duration::from_secs(5), || async { !f.releases().is_empty() }).await);

    trigger.trigger();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("sweeper did not stop")
        .unwrap();
}

#[tokio::test]
async fn spawned_sweeper_survives_scan_failures() {
    let f = fixture(Duration::from_millis(20));
    f.hold("sku-1", 1).await;
    f.lapse();
    f.ledger.fail_next(2);

    let (trigger, signal) = shutdown::channel();
    let handle = Arc::clone(&f.sweeper).spawn(signal);

    assert!(eventually(Duration::from_secs(5), || async { !f.releases().is_empty() }).await);

    trigger.trigger();
    handle.await.unwrap();
}
