//! In-memory [`EventChannel`] with real partition semantics.
//!
//! Messages are routed to a fixed number of partitions by hashing their key.
//! Each subscription runs one task per partition; a task hands the message at
//! the group's committed offset to the handler, commits `offset + 1` on `Ok`
//! and redelivers the same message on `Err`. Offsets are remembered per
//! consumer group, so a group that re-subscribes resumes where it committed.
//!
//! One subscription per (topic, group) is expected: there is no partition
//! rebalancing between subscriptions of the same group.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stockflow_core::channel::{
    ChannelError, Delivered, Delivery, DeliveryHandler, EventChannel, Message, Subscription,
};
use stockflow_core::shutdown::ShutdownSignal;
use tokio::sync::Notify;

const DEFAULT_PARTITIONS: usize = 4;

#[derive(Debug, Default)]
struct PartitionLog {
    messages: Mutex<Vec<Message>>,
    appended: Notify,
}

#[derive(Debug)]
struct TopicLog {
    partitions: Vec<PartitionLog>,
}

type OffsetKey = (String, String, i32);

#[derive(Debug)]
struct Inner {
    partition_count: usize,
    redelivery_delay: Duration,
    topics: Mutex<HashMap<String, Arc<TopicLog>>>,
    offsets: Mutex<HashMap<OffsetKey, i64>>,
    history: Mutex<Vec<(String, Message)>>,
    publish_failures: AtomicUsize,
    redeliveries: AtomicUsize,
}

/// In-memory event channel for tests.
///
/// # Example
///
/// ```
/// use stockflow_testing::InMemoryEventChannel;
/// use stockflow_core::channel::{EventChannel, Message};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let channel = InMemoryEventChannel::with_partitions(2);
/// let delivered = channel.publish("inventory-events", Message::new("sku-1", b"{}".to_vec())).await?;
/// assert_eq!(delivered.offset, 0);
/// assert_eq!(channel.published("inventory-events").len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryEventChannel {
    inner: Arc<Inner>,
}

impl Default for InMemoryEventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventChannel {
    /// Channel with 4 partitions per topic.
    #[must_use]
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Channel with `partitions` partitions per topic (at least one).
    #[must_use]
    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                partition_count: partitions.max(1),
                redelivery_delay: Duration::from_millis(5),
                topics: Mutex::new(HashMap::new()),
                offsets: Mutex::new(HashMap::new()),
                history: Mutex::new(Vec::new()),
                publish_failures: AtomicUsize::new(0),
                redeliveries: AtomicUsize::new(0),
            }),
        }
    }

    /// Make the next `count` publishes fail with a transient error.
    pub fn fail_next_publishes(&self, count: usize) {
        self.inner.publish_failures.store(count, Ordering::SeqCst);
    }

    /// Every message acknowledged on `topic`, in publish order.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<Message> {
        self.inner
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Partition a key is routed to.
    #[must_use]
    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let count = self.inner.partition_count as u64;
        i32::try_from(hasher.finish() % count).unwrap()
    }

    /// Next offset `group` will consume from `partition` of `topic`.
    #[must_use]
    pub fn committed_offset(&self, topic: &str, group: &str, partition: i32) -> i64 {
        self.inner.committed(topic, group, partition)
    }

    /// Messages on `topic` that `group` has not committed yet.
    #[must_use]
    pub fn lag(&self, topic: &str, group: &str) -> usize {
        let Some(log) = self.inner.topics.lock().unwrap().get(topic).cloned() else {
            return 0;
        };
        log.partitions
            .iter()
            .enumerate()
            .map(|(index, partition)| {
                let len = partition.messages.lock().unwrap().len();
                let committed = self.inner.committed(topic, group, i32::try_from(index).unwrap());
                len.saturating_sub(usize::try_from(committed).unwrap())
            })
            .sum()
    }

    /// Number of redeliveries caused by handler errors.
    #[must_use]
    pub fn redeliveries(&self) -> usize {
        self.inner.redeliveries.load(Ordering::SeqCst)
    }

    fn append(&self, topic: &str, message: Message) -> Result<Delivered, ChannelError> {
        if topic.is_empty() {
            return Err(ChannelError::InvalidTopic(topic.to_string()));
        }
        let injected = self
            .inner
            .publish_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ChannelError::PublishFailed {
                topic: topic.to_string(),
                reason: "injected broker outage".to_string(),
            });
        }

        let log = self.inner.topic(topic);
        let partition = self.partition_for(&message.key);
        let slot = &log.partitions[usize::try_from(partition).unwrap()];
        let offset = {
            let mut messages = slot.messages.lock().unwrap();
            messages.push(message.clone());
            i64::try_from(messages.len() - 1).unwrap()
        };
        self.inner
            .history
            .lock()
            .unwrap()
            .push((topic.to_string(), message));
        slot.appended.notify_waiters();

        Ok(Delivered { partition, offset })
    }
}

impl Inner {
    fn topic(&self, topic: &str) -> Arc<TopicLog> {
        let mut topics = self.topics.lock().unwrap();
        Arc::clone(topics.entry(topic.to_string()).or_insert_with(|| {
            Arc::new(TopicLog {
                partitions: (0..self.partition_count)
                    .map(|_| PartitionLog::default())
                    .collect(),
            })
        }))
    }

    fn committed(&self, topic: &str, group: &str, partition: i32) -> i64 {
        self.offsets
            .lock()
            .unwrap()
            .get(&(topic.to_string(), group.to_string(), partition))
            .copied()
            .unwrap_or(0)
    }

    fn commit(&self, topic: &str, group: &str, partition: i32, next_offset: i64) {
        self.offsets
            .lock()
            .unwrap()
            .insert((topic.to_string(), group.to_string(), partition), next_offset);
    }
}

async fn run_partition(
    inner: Arc<Inner>,
    log: Arc<TopicLog>,
    topic: String,
    group: String,
    partition: i32,
    handler: Arc<dyn DeliveryHandler>,
    mut shutdown: ShutdownSignal,
) {
    let slot = &log.partitions[usize::try_from(partition).unwrap()];

    loop {
        if shutdown.is_triggered() {
            break;
        }

        let offset = inner.committed(&topic, &group, partition);
        // Registered before reading so an append in between is not missed.
        let appended = slot.appended.notified();
        let next = slot
            .messages
            .lock()
            .unwrap()
            .get(usize::try_from(offset).unwrap())
            .cloned();

        let message = match next {
            Some(message) => message,
            None => {
                tokio::select! {
                    () = appended => {}
                    () = shutdown.triggered() => {}
                }
                continue;
            }
        };

        let mut delivery = Delivery {
            topic: topic.clone(),
            partition,
            offset,
            attempt: 1,
            message,
        };
        loop {
            match handler.handle(&delivery).await {
                Ok(()) => {
                    inner.commit(&topic, &group, partition, offset + 1);
                    break;
                }
                Err(e) => {
                    inner.redeliveries.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        attempt = delivery.attempt,
                        error = %e,
                        "Handler failed, redelivering"
                    );
                    delivery.attempt += 1;
                    tokio::select! {
                        () = tokio::time::sleep(inner.redelivery_delay) => {}
                        () = shutdown.triggered() => return,
                    }
                }
            }
        }
    }
}

impl EventChannel for InMemoryEventChannel {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: Message,
    ) -> Pin<Box<dyn Future<Output = Result<Delivered, ChannelError>> + Send + 'a>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.append(topic, message)
        })
    }

    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        group: &'a str,
        handler: Arc<dyn DeliveryHandler>,
        shutdown: ShutdownSignal,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, ChannelError>> + Send + 'a>> {
        Box::pin(async move {
            if topic.is_empty() {
                return Err(ChannelError::InvalidTopic(topic.to_string()));
            }
            let log = self.inner.topic(topic);
            let tasks = (0..self.inner.partition_count)
                .map(|index| {
                    tokio::spawn(run_partition(
                        Arc::clone(&self.inner),
                        Arc::clone(&log),
                        topic.to_string(),
                        group.to_string(),
                        i32::try_from(index).unwrap(),
                        Arc::clone(&handler),
                        shutdown.clone(),
                    ))
                })
                .collect();
            Ok(Subscription::new(tasks))
        })
    }
}
