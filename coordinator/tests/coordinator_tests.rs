//! Coordinator tests: events applied directly, without a running consumer.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use std::sync::Arc;
use stockflow_coordinator::{
    Coordinator, CoordinatorSettings, EventPublisher, InventoryError, Ledgers, Outcome, Topics,
};
use stockflow_core::channel::{Delivery, DeliveryHandler, Message};
use stockflow_core::environment::Clock;
use stockflow_core::event::{EventType, InventoryEvent, InventoryState, metadata};
use stockflow_core::ledger::{AuditOutcome, StockLedger};
use stockflow_core::reservation::ReservationStatus;
use stockflow_core::stock::StockRecord;
use stockflow_core::types::{CorrelationId, ProductId, UserId};
use stockflow_runtime::RetryPolicy;
use stockflow_testing::{InMemoryEventChannel, InMemoryLedger, ManualClock, test_instant};

// ============================================================================
// Test Fixtures
// ============================================================================

struct Fixture {
    ledger: InMemoryLedger,
    channel: InMemoryEventChannel,
    clock: ManualClock,
    coordinator: Arc<Coordinator>,
}

fn fixture() -> Fixture {
    fixture_with(CoordinatorSettings::default())
}

fn fixture_with(settings: CoordinatorSettings) -> Fixture {
    let ledger = InMemoryLedger::new();
    let channel = InMemoryEventChannel::with_partitions(4);
    let clock = ManualClock::starting_at(test_instant());
    let publisher = EventPublisher::new(
        Arc::new(channel.clone()),
        Topics::default(),
        RetryPolicy::no_retry(),
    );
    let coordinator = Arc::new(Coordinator::new(
        Ledgers::shared(Arc::new(ledger.clone())),
        publisher,
        Arc::new(clock.clone()),
        settings,
    ));
    Fixture {
        ledger,
        channel,
        clock,
        coordinator,
    }
}

impl Fixture {
    async fn register(&self, product: &str, total: u32) {
        self.ledger
            .create_product(StockRecord::new(ProductId::new(product), total, self.clock.now()))
            .await
            .unwrap();
    }

    /// (total, available, reserved)
    fn counts(&self, product: &str) -> (u32, u32, u32) {
        let counts = self.ledger.stock(&ProductId::new(product)).unwrap().counts;
        (counts.total(), counts.available(), counts.reserved())
    }

    fn reserve(&self, product: &str, quantity: u32, user: &str) -> InventoryEvent {
        let now = self.clock.now();
        InventoryEvent::reserve(
            ProductId::new(product),
            quantity,
            UserId::new(user),
            CorrelationId::new(),
            now + chrono::Duration::minutes(15),
            now,
        )
    }

    fn confirm(&self, reserve: &InventoryEvent, user: &str) -> InventoryEvent {
        InventoryEvent::confirm(
            reserve.product_id.clone(),
            reserve.quantity,
            UserId::new(user),
            reserve.correlation_id,
            self.clock.now(),
        )
    }

    fn release(&self, reserve: &InventoryEvent, user: &str) -> InventoryEvent {
        InventoryEvent::release(
            reserve.product_id.clone(),
            reserve.quantity,
            UserId::new(user),
            reserve.correlation_id,
            self.clock.now(),
        )
    }
}

// ============================================================================
// State machine
// ============================================================================

#[tokio::test]
async fn purchase_scenario_keeps_stock_balanced() {
    let f = fixture();
    f.register("sku-1", 10).await;

    let alice = f.reserve("sku-1", 3, "alice");
    assert!(matches!(f.coordinator.process(&alice).await, Ok(Outcome::Reserved(_))));
    assert_eq!(f.counts("sku-1"), (10, 7, 3));

    let bob = f.reserve("sku-1", 5, "bob");
    assert!(matches!(f.coordinator.process(&bob).await, Ok(Outcome::Reserved(_))));
    assert_eq!(f.counts("sku-1"), (10, 2, 8));

    let carol = f.reserve("sku-1", 5, "carol");
    assert_eq!(
        f.coordinator.process(&carol).await,
        Ok(Outcome::Denied {
            requested: 5,
            available: 2
        })
    );
    assert_eq!(f.counts("sku-1"), (10, 2, 8));
    assert!(f.ledger.reservation_for(carol.correlation_id).is_none());

    let confirmed = f.coordinator.process(&f.confirm(&alice, "alice")).await.unwrap();
    assert!(matches!(confirmed, Outcome::Confirmed(ref r) if r.status == ReservationStatus::Confirmed));
    // Confirmed units leave the system.
    assert_eq!(f.counts("sku-1"), (7, 2, 5));

    f.coordinator.process(&f.release(&bob, "bob")).await.unwrap();
    assert_eq!(f.counts("sku-1"), (7, 7, 0));

    assert_eq!(
        f.ledger.reservation_for(alice.correlation_id).unwrap().status,
        ReservationStatus::Confirmed
    );
    assert_eq!(
        f.ledger.reservation_for(bob.correlation_id).unwrap().status,
        ReservationStatus::Released
    );
}

#[tokio::test]
async fn check_is_read_only() {
    let f = fixture();
    f.register("sku-1", 5).await;

    let check = InventoryEvent::check(ProductId::new("sku-1"), 100, false, None, f.clock.now());
    assert_eq!(
        f.coordinator.process(&check).await,
        Ok(Outcome::Checked { available: false })
    );

    let record = f.ledger.stock(&ProductId::new("sku-1")).unwrap();
    assert_eq!(f.counts("sku-1"), (5, 5, 0));
    assert_eq!(record.version, 1);
    assert_eq!(f.ledger.successful_writes(), 0);
}

#[tokio::test]
async fn restock_grows_total_and_available() {
    let f = fixture();
    f.register("sku-1", 2).await;
    f.coordinator
        .process(&f.reserve("sku-1", 2, "alice"))
        .await
        .unwrap();

    let restock = InventoryEvent::restock(ProductId::new("sku-1"), 8, f.clock.now());
    assert_eq!(
        f.coordinator.process(&restock).await,
        Ok(Outcome::Restocked { quantity: 8 })
    );
    assert_eq!(f.counts("sku-1"), (10, 8, 2));
}

#[tokio::test]
async fn reservation_expiry_is_stamped_by_the_coordinator() {
    let f = fixture();
    f.register("sku-1", 10).await;
    f.clock.advance(chrono::Duration::seconds(30));

    let event = f.reserve("sku-1", 1, "alice");
    let Ok(Outcome::Reserved(reservation)) = f.coordinator.process(&event).await else {
        panic!("expected a reservation");
    };
    assert_eq!(reservation.reserved_at, f.clock.now());
    assert_eq!(reservation.expires_at, f.clock.now() + chrono::Duration::minutes(15));
    assert_eq!(reservation.correlation_id, event.correlation_id);
}

// ============================================================================
// Rejections and idempotence
// ============================================================================

#[tokio::test]
async fn replayed_confirm_does_not_touch_stock_twice() {
    let f = fixture();
    f.register("sku-1", 10).await;
    let reserve = f.reserve("sku-1", 4, "alice");
    f.coordinator.process(&reserve).await.unwrap();

    let confirm = f.confirm(&reserve, "alice");
    f.coordinator.handle_event(&confirm).await.unwrap();
    assert_eq!(f.counts("sku-1"), (6, 6, 0));

    let replay = f.coordinator.process(&confirm).await;
    assert!(matches!(replay, Err(InventoryError::InvalidState { .. })));
    assert_eq!(f.counts("sku-1"), (6, 6, 0));

    // A replayed release is refused as well.
    let release = f.release(&reserve, "alice");
    assert!(matches!(
        f.coordinator.process(&release).await,
        Err(InventoryError::InvalidState { .. })
    ));
    assert_eq!(f.counts("sku-1"), (6, 6, 0));
}

#[tokio::test]
async fn duplicate_reserve_is_ignored() {
    let f = fixture();
    f.register("sku-1", 10).await;
    let reserve = f.reserve("sku-1", 3, "alice");

    f.coordinator.handle_event(&reserve).await.unwrap();
    f.coordinator.handle_event(&reserve).await.unwrap();

    assert_eq!(f.counts("sku-1"), (10, 7, 3));
    assert_eq!(f.ledger.reservations().len(), 1);

    // Redelivery of the same event is audited once.
    let entries = f.ledger.audit_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Applied);

    let second = f.reserve("sku-1", 3, "alice");
    let second = InventoryEvent {
        correlation_id: reserve.correlation_id,
        ..second
    };
    assert!(matches!(
        f.coordinator.process(&second).await,
        Ok(Outcome::Duplicate(_))
    ));
    assert_eq!(f.counts("sku-1"), (10, 7, 3));
}

#[tokio::test]
async fn redelivered_restock_is_applied_once() {
    let f = fixture();
    f.register("sku-1", 10).await;
    let restock = InventoryEvent::restock(ProductId::new("sku-1"), 5, f.clock.now());

    f.coordinator.handle_event(&restock).await.unwrap();
    f.coordinator.handle_event(&restock).await.unwrap();
    assert_eq!(f.counts("sku-1"), (15, 15, 0));

    let entries = f.ledger.audit_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Applied);

    assert_eq!(f.coordinator.process(&restock).await, Ok(Outcome::Replayed));
    assert_eq!(f.counts("sku-1"), (15, 15, 0));

    // A fresh restock event still applies.
    let another = InventoryEvent::restock(ProductId::new("sku-1"), 5, f.clock.now());
    assert_eq!(
        f.coordinator.process(&another).await,
        Ok(Outcome::Restocked { quantity: 5 })
    );
    assert_eq!(f.counts("sku-1"), (20, 20, 0));
}

#[tokio::test]
async fn confirm_by_another_user_is_unauthorized() {
    let f = fixture();
    f.register("sku-1", 10).await;
    let reserve = f.reserve("sku-1", 3, "alice");
    f.coordinator.process(&reserve).await.unwrap();

    let result = f.coordinator.process(&f.confirm(&reserve, "mallory")).await;
    assert!(matches!(result, Err(InventoryError::Unauthorized { .. })));
    assert_eq!(f.counts("sku-1"), (10, 7, 3));
}

#[tokio::test]
async fn unknown_order_is_not_found() {
    let f = fixture();
    f.register("sku-1", 10).await;
    let phantom = f.reserve("sku-1", 1, "alice");

    let result = f.coordinator.process(&f.release(&phantom, "alice")).await;
    assert!(matches!(result, Err(InventoryError::NotFound { entity: "reservation", .. })));
}

#[tokio::test]
async fn reserve_for_unknown_product_is_not_found() {
    let f = fixture();
    let result = f.coordinator.process(&f.reserve("ghost", 1, "alice")).await;
    assert!(matches!(result, Err(InventoryError::NotFound { entity: "product", .. })));
}

#[tokio::test]
async fn confirm_after_expiry_is_refused() {
    let f = fixture();
    f.register("sku-1", 10).await;
    let reserve = f.reserve("sku-1", 2, "alice");
    f.coordinator.process(&reserve).await.unwrap();

    f.clock.advance(chrono::Duration::minutes(16));
    let result = f.coordinator.process(&f.confirm(&reserve, "alice")).await;
    assert!(matches!(result, Err(InventoryError::InvalidState { .. })));
    assert_eq!(f.counts("sku-1"), (10, 8, 2));

    // Releasing a lapsed hold is still allowed.
    let release = f
        .release(&reserve, "alice")
        .with_metadata(metadata::REASON, metadata::REASON_EXPIRED.into());
    let outcome = f.coordinator.process(&release).await.unwrap();
    assert!(matches!(outcome, Outcome::Released { expired: true, .. }));
    assert_eq!(f.counts("sku-1"), (10, 10, 0));
}

#[tokio::test]
async fn rejections_are_audited_and_committed() {
    let f = fixture();
    f.register("sku-1", 10).await;
    let reserve = f.reserve("sku-1", 3, "alice");
    f.coordinator.process(&reserve).await.unwrap();

    let bad = f.confirm(&reserve, "mallory");
    assert!(f.coordinator.handle_event(&bad).await.is_ok());

    let entries = f.ledger.audit_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].event_id, bad.event_id);
    assert_eq!(entries[0].outcome, AuditOutcome::Rejected);
    assert!(entries[0].detail.as_deref().unwrap().contains("mallory"));
}

#[tokio::test]
async fn denied_reserve_is_audited_as_ignored() {
    let f = fixture();
    f.register("sku-1", 1).await;
    let reserve = f.reserve("sku-1", 2, "alice");
    f.coordinator.handle_event(&reserve).await.unwrap();

    let entries = f.ledger.audit_entries();
    assert_eq!(entries[0].outcome, AuditOutcome::Ignored);
    assert_eq!(entries[0].event_type, EventType::Reserve);
}

// ============================================================================
// Compare-and-set and transient failures
// ============================================================================

#[tokio::test]
async fn lost_compare_and_set_is_retried_with_fresh_state() {
    let f = fixture();
    f.register("sku-1", 10).await;
    f.ledger.conflict_next_writes(2);

    let outcome = f.coordinator.process(&f.reserve("sku-1", 4, "alice")).await;
    assert!(matches!(outcome, Ok(Outcome::Reserved(_))));
    assert_eq!(f.counts("sku-1"), (10, 6, 4));
    assert_eq!(f.ledger.reservations().len(), 1);
}

#[tokio::test]
async fn exhausted_compare_and_set_is_transient() {
    let f = fixture_with(CoordinatorSettings {
        cas_max_attempts: 3,
        ..CoordinatorSettings::default()
    });
    f.register("sku-1", 10).await;
    f.ledger.conflict_next_writes(3);

    let reserve = f.reserve("sku-1", 4, "alice");
    let err = f.coordinator.handle_event(&reserve).await.unwrap_err();
    assert_eq!(
        err,
        InventoryError::ConcurrencyConflict {
            product_id: ProductId::new("sku-1"),
            attempts: 3
        }
    );
    assert!(err.is_transient());
    assert!(f.ledger.audit_entries().is_empty());
    assert_eq!(f.counts("sku-1"), (10, 10, 0));

    // The redelivery goes through.
    f.coordinator.handle_event(&reserve).await.unwrap();
    assert_eq!(f.counts("sku-1"), (10, 6, 4));
}

#[tokio::test]
async fn ledger_outage_is_left_for_redelivery() {
    let f = fixture();
    f.register("sku-1", 10).await;
    let mut notices = f.coordinator.subscribe_notices();
    f.ledger.fail_next(1);

    let reserve = f.reserve("sku-1", 1, "alice");
    let err = f.coordinator.handle_event(&reserve).await.unwrap_err();
    assert!(err.is_transient());
    assert!(f.ledger.audit_entries().is_empty());
    assert!(notices.try_recv().is_err());
}

// ============================================================================
// Side effects: cache, state topic, notices, delivery handler
// ============================================================================

#[tokio::test]
async fn applied_mutation_updates_cache_and_publishes_state() {
    let f = fixture();
    f.register("sku-1", 10).await;
    f.coordinator
        .process(&f.reserve("sku-1", 3, "alice"))
        .await
        .unwrap();

    let cached = f.coordinator.cache().get(&ProductId::new("sku-1")).unwrap();
    assert_eq!((cached.available_stock, cached.reserved_stock), (7, 3));

    let published = f.channel.published("inventory-state");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].key, "sku-1");
    let state = InventoryState::decode(&published[0].payload).unwrap();
    assert_eq!(state, cached);
    assert_eq!(state.version, 2);
}

#[tokio::test]
async fn state_publish_failure_does_not_undo_the_write() {
    let f = fixture();
    f.register("sku-1", 10).await;
    f.channel.fail_next_publishes(1);

    let outcome = f.coordinator.process(&f.reserve("sku-1", 3, "alice")).await;
    assert!(matches!(outcome, Ok(Outcome::Reserved(_))));
    assert_eq!(f.counts("sku-1"), (10, 7, 3));
    assert!(f.channel.published("inventory-state").is_empty());
}

#[tokio::test]
async fn snapshot_reads_through_the_cache() {
    let f = fixture();
    f.register("sku-1", 10).await;
    assert!(f.coordinator.cache().is_empty());

    let state = f.coordinator.snapshot(&ProductId::new("sku-1")).await.unwrap();
    assert_eq!(state.available_stock, 10);
    assert_eq!(f.coordinator.cache().len(), 1);

    // Served from the cache even while storage is down.
    f.ledger.fail_next(1);
    assert!(f.coordinator.snapshot(&ProductId::new("sku-1")).await.is_ok());
}

#[tokio::test]
async fn every_consumed_event_is_announced() {
    let f = fixture();
    f.register("sku-1", 1).await;
    let mut notices = f.coordinator.subscribe_notices();

    let granted = f.reserve("sku-1", 1, "alice");
    let denied = f.reserve("sku-1", 1, "bob");
    f.coordinator.handle_event(&granted).await.unwrap();
    f.coordinator.handle_event(&denied).await.unwrap();

    let first = notices.recv().await.unwrap();
    assert_eq!(first.correlation_id, granted.correlation_id);
    assert!(matches!(first.result, Ok(Outcome::Reserved(_))));

    let second = notices.recv().await.unwrap();
    assert_eq!(second.correlation_id, denied.correlation_id);
    assert_eq!(
        second.result,
        Ok(Outcome::Denied {
            requested: 1,
            available: 0
        })
    );
}

fn delivery(message: Message) -> Delivery {
    Delivery {
        topic: "inventory-events".to_string(),
        partition: 0,
        offset: 0,
        attempt: 1,
        message,
    }
}

#[tokio::test]
async fn undecodable_payload_is_skipped() {
    let f = fixture();
    let result = f
        .coordinator
        .handle(&delivery(Message::new("sku-1", b"not json".to_vec())))
        .await;
    assert!(result.is_ok());
    assert!(f.ledger.audit_entries().is_empty());
}

#[tokio::test]
async fn delivery_handler_fails_only_on_transient_errors() {
    let f = fixture();
    f.register("sku-1", 10).await;

    let reserve = f.reserve("sku-1", 2, "alice");
    f.ledger.fail_next(1);
    let message = reserve.to_message().unwrap();
    assert!(f.coordinator.handle(&delivery(message.clone())).await.is_err());
    assert!(f.coordinator.handle(&delivery(message)).await.is_ok());

    let rejected = f.confirm(&f.reserve("sku-1", 1, "bob"), "bob");
    assert!(
        f.coordinator
            .handle(&delivery(rejected.to_message().unwrap()))
            .await
            .is_ok()
    );
    assert_eq!(f.counts("sku-1"), (10, 8, 2));
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_coordinators_never_oversell() {
    let f = fixture_with(CoordinatorSettings {
        cas_max_attempts: 50,
        ..CoordinatorSettings::default()
    });
    f.register("sku-1", 5).await;

    // A second consumer instance over the same ledger.
    let other = Arc::new(Coordinator::new(
        Ledgers::shared(Arc::new(f.ledger.clone())),
        EventPublisher::new(
            Arc::new(f.channel.clone()),
            Topics::default(),
            RetryPolicy::no_retry(),
        ),
        Arc::new(f.clock.clone()),
        CoordinatorSettings {
            cas_max_attempts: 50,
            ..CoordinatorSettings::default()
        },
    ));

    let mut tasks = Vec::new();
    for i in 0..20 {
        let coordinator = if i % 2 == 0 {
            f.coordinator.clone()
        } else {
            other.clone()
        };
        let event = f.reserve("sku-1", 1, &format!("user-{i}"));
        tasks.push(tokio::spawn(async move { coordinator.process(&event).await }));
    }

    let mut granted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(Outcome::Reserved(_)) => granted += 1,
            Ok(Outcome::Denied { .. }) | Err(InventoryError::ConcurrencyConflict { .. }) => {},
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    let (total, available, reserved) = f.counts("sku-1");
    assert_eq!(granted, 5);
    assert_eq!(total, available + reserved);
    assert_eq!(reserved, 5);
    assert_eq!(f.ledger.reservations().len(), 5);
}
