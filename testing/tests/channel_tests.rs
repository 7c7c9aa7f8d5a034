//! Delivery semantics of the in-memory channel.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stockflow_core::channel::{
    ChannelError, Delivery, DeliveryHandler, EventChannel, HandlerError, HandlerFuture, Message,
};
use stockflow_core::shutdown;
use stockflow_testing::InMemoryEventChannel;
use stockflow_testing::helpers::eventually;

const TOPIC: &str = "inventory-events";
const GROUP: &str = "coordinator";

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(String, Vec<u8>, u32)>>,
    fail_first: AtomicUsize,
}

impl Recorder {
    fn failing(times: usize) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            fail_first: AtomicUsize::new(times),
        }
    }

    fn payloads_for(&self, key: &str) -> Vec<Vec<u8>> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _, _)| k == key)
            .map(|(_, p, _)| p.clone())
            .collect()
    }
}

impl DeliveryHandler for Recorder {
    fn handle<'a>(&'a self, delivery: &'a Delivery) -> HandlerFuture<'a> {
        Box::pin(async move {
            let fail = self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(HandlerError::new("not yet"));
            }
            self.seen.lock().unwrap().push((
                delivery.message.key.clone(),
                delivery.message.payload.clone(),
                delivery.attempt,
            ));
            Ok(())
        })
    }
}

fn message(key: &str, n: u8) -> Message {
    Message::new(key, vec![n])
}

#[tokio::test]
async fn test_per_key_order_is_preserved() {
    let channel = InMemoryEventChannel::with_partitions(3);
    let recorder = Arc::new(Recorder::default());
    let (trigger, signal) = shutdown::channel();

    let subscription = channel
        .subscribe(TOPIC, GROUP, recorder.clone(), signal)
        .await
        .unwrap();
    assert_eq!(subscription.task_count(), 3);

    for n in 0..20u8 {
        channel.publish(TOPIC, message("sku-a", n)).await.unwrap();
        channel.publish(TOPIC, message("sku-b", n)).await.unwrap();
    }

    assert!(eventually(Duration::from_secs(2), || async { channel.lag(TOPIC, GROUP) == 0 }).await);
    let expected: Vec<Vec<u8>> = (0..20u8).map(|n| vec![n]).collect();
    assert_eq!(recorder.payloads_for("sku-a"), expected);
    assert_eq!(recorder.payloads_for("sku-b"), expected);

    trigger.trigger();
    assert_eq!(subscription.join().await, 0);
}

#[tokio::test]
async fn test_failed_handler_is_redelivered_before_offset_advances() {
    let channel = InMemoryEventChannel::with_partitions(1);
    let recorder = Arc::new(Recorder::failing(2));
    let (trigger, signal) = shutdown::channel();

    channel.publish(TOPIC, message("sku-a", 1)).await.unwrap();
    channel.publish(TOPIC, message("sku-a", 2)).await.unwrap();

    let subscription = channel
        .subscribe(TOPIC, GROUP, recorder.clone(), signal)
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(2), || async { channel.lag(TOPIC, GROUP) == 0 }).await);
    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].1, vec![1]);
    assert_eq!(seen[0].2, 3, "third attempt succeeds");
    assert_eq!(seen[1].1, vec![2]);
    assert_eq!(channel.redeliveries(), 2);
    assert_eq!(channel.committed_offset(TOPIC, GROUP, 0), 2);

    trigger.trigger();
    subscription.join().await;
}

#[tokio::test]
async fn test_group_resumes_from_committed_offset() {
    let channel = InMemoryEventChannel::with_partitions(1);
    let first = Arc::new(Recorder::default());
    let (trigger, signal) = shutdown::channel();

    channel.publish(TOPIC, message("k", 1)).await.unwrap();
    let subscription = channel.subscribe(TOPIC, GROUP, first.clone(), signal).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || async { channel.lag(TOPIC, GROUP) == 0 }).await);
    trigger.trigger();
    subscription.join().await;

    channel.publish(TOPIC, message("k", 2)).await.unwrap();
    let second = Arc::new(Recorder::default());
    let (trigger, signal) = shutdown::channel();
    let subscription = channel.subscribe(TOPIC, GROUP, second.clone(), signal).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || async { channel.lag(TOPIC, GROUP) == 0 }).await);

    assert_eq!(second.payloads_for("k"), vec![vec![2]]);
    trigger.trigger();
    subscription.join().await;
}

#[tokio::test]
async fn test_injected_publish_failures_surface_as_transient() {
    let channel = InMemoryEventChannel::new();
    channel.fail_next_publishes(1);

    let err = channel.publish(TOPIC, message("k", 1)).await.unwrap_err();
    assert!(matches!(err, ChannelError::PublishFailed { .. }));
    assert!(err.is_transient());

    channel.publish(TOPIC, message("k", 1)).await.unwrap();
    assert_eq!(channel.published(TOPIC).len(), 1);
}

#[tokio::test]
async fn test_empty_topic_is_rejected() {
    let channel = InMemoryEventChannel::new();
    assert!(matches!(
        channel.publish("", message("k", 1)).await,
        Err(ChannelError::InvalidTopic(_))
    ));
}

/// Fails every delivery for one key and records the rest.
struct Poisoned {
    key: String,
    inner: Recorder,
}

impl DeliveryHandler for Poisoned {
    fn handle<'a>(&'a self, delivery: &'a Delivery) -> HandlerFuture<'a> {
        if delivery.message.key == self.key {
            return Box::pin(async { Err(HandlerError::new("always fails")) });
        }
        self.inner.handle(delivery)
    }
}

#[tokio::test]
async fn test_failing_partition_does_not_stall_the_others() {
    let channel = InMemoryEventChannel::with_partitions(2);
    let stuck = "sku-0".to_string();
    let stuck_partition = channel.partition_for(&stuck);
    let healthy = (1..100)
        .map(|n| format!("sku-{n}"))
        .find(|key| channel.partition_for(key) != stuck_partition)
        .expect("a key on the other partition");
    let healthy_partition = channel.partition_for(&healthy);

    let handler = Arc::new(Poisoned {
        key: stuck.clone(),
        inner: Recorder::default(),
    });
    let (trigger, signal) = shutdown::channel();
    let subscription = channel
        .subscribe(TOPIC, GROUP, handler.clone(), signal)
        .await
        .unwrap();

    channel.publish(TOPIC, message(&stuck, 1)).await.unwrap();
    for n in 0..5u8 {
        channel.publish(TOPIC, message(&healthy, n)).await.unwrap();
    }

    assert!(
        eventually(Duration::from_secs(2), || async {
            channel.committed_offset(TOPIC, GROUP, healthy_partition) == 5
        })
        .await
    );
    let expected: Vec<Vec<u8>> = (0..5u8).map(|n| vec![n]).collect();
    assert_eq!(handler.inner.payloads_for(&healthy), expected);

    // The failing key keeps being redelivered and is never committed.
    assert!(eventually(Duration::from_secs(2), || async { channel.redeliveries() >= 2 }).await);
    assert_eq!(channel.committed_offset(TOPIC, GROUP, stuck_partition), 0);
    assert_eq!(channel.lag(TOPIC, GROUP), 1);
    assert!(handler.inner.payloads_for(&stuck).is_empty());

    trigger.trigger();
    subscription.join().await;
}
