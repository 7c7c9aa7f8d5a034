//! Redpanda event channel for stockflow.
//!
//! This crate implements the [`EventChannel`] trait from `stockflow-core` on
//! top of rdkafka, so it works against Redpanda or any Kafka-compatible
//! broker.
//!
//! # Architecture
//!
//! ```text
//!            publish(topic, Message{key = productId})
//!                          │
//!                          ▼
//!                 ┌─────────────────┐
//!                 │ FutureProducer  │  acks=all, key + headers
//!                 └────────┬────────┘
//!                          ▼
//!                 ┌─────────────────┐
//!                 │    Redpanda     │
//!                 └────────┬────────┘
//!                          ▼
//!                 ┌─────────────────┐
//!                 │ StreamConsumer  │  one per subscription, manual commit
//!                 │   dispatcher    │
//!                 └──┬──────┬────┬──┘
//!                    ▼      ▼    ▼
//!                  p0     p1    p2         one worker per (topic, partition)
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - An offset is committed only after the handler returned `Ok`
//! - A failing handler is retried in place with backoff; its partition does
//!   not advance, other partitions keep flowing
//! - When a partition worker falls behind, the dispatcher pauses that
//!   partition at the broker and parks already fetched messages in order
//!
//! # Example
//!
//! ```no_run
//! use stockflow_core::channel::{EventChannel, Message};
//! use stockflow_redpanda::RedpandaChannel;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let channel = RedpandaChannel::builder()
//!     .brokers("localhost:9092")
//!     .producer_acks("all")
//!     .build()?;
//!
//! let message = Message::new("sku-1", br#"{"quantity":1}"#.to_vec())
//!     .with_header("eventType", "INVENTORY_RESERVE");
//! channel.publish("inventory-events", message).await?;
//! # Ok(())
//! # }
//! ```

mod dispatch;

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use stockflow_core::channel::{
    ChannelError, Delivered, DeliveryHandler, EventChannel, Message, Subscription,
};
use stockflow_core::shutdown::ShutdownSignal;
use stockflow_runtime::RetryPolicy;

/// Default number of messages buffered per partition worker.
pub const DEFAULT_PARTITION_BUFFER: usize = 256;

/// Redpanda-backed [`EventChannel`].
///
/// One producer is shared by all publishes. Every call to
/// [`subscribe`](EventChannel::subscribe) creates its own consumer in the
/// requested group.
///
/// # Example
///
/// ```no_run
/// use stockflow_redpanda::RedpandaChannel;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let channel = RedpandaChannel::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .partition_buffer(512)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaChannel {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    partition_buffer: usize,
    auto_offset_reset: String,
    session_timeout: Duration,
    redelivery: RetryPolicy,
}

impl RedpandaChannel {
    /// Create a channel with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ConnectionFailed`] if the producer cannot be
    /// created.
    pub fn new(brokers: &str) -> Result<Self, ChannelError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the channel.
    #[must_use]
    pub fn builder() -> RedpandaChannelBuilder {
        RedpandaChannelBuilder::default()
    }

    /// Bootstrap servers this channel talks to.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Create `topics` with `partitions` partitions if they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidTopic`] if the broker refuses a topic
    /// for any reason other than it already existing, or
    /// [`ChannelError::ConnectionFailed`] if the admin client cannot reach
    /// the cluster.
    pub async fn ensure_topics(
        &self,
        topics: &[&str],
        partitions: i32,
        replication: i32,
    ) -> Result<(), ChannelError> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .create()
            .map_err(|e| {
                ChannelError::ConnectionFailed(format!("Failed to create admin client: {e}"))
            })?;

        let new_topics: Vec<NewTopic<'_>> = topics
            .iter()
            .map(|topic| NewTopic::new(topic, partitions, TopicReplication::Fixed(replication)))
            .collect();
        let options = AdminOptions::new().operation_timeout(Some(self.timeout));

        let results = admin
            .create_topics(&new_topics, &options)
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

        for result in results {
            match result {
                Ok(topic) => tracing::info!(topic = %topic, partitions, "Topic created"),
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    tracing::debug!(topic = %topic, "Topic already exists");
                },
                Err((topic, code)) => {
                    return Err(ChannelError::InvalidTopic(format!("{topic}: {code}")));
                },
            }
        }
        Ok(())
    }

    fn consumer(&self, group: &str) -> Result<StreamConsumer, rdkafka::error::KafkaError> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout.as_millis().to_string())
            .set("enable.partition.eof", "false")
            .create()
    }
}

/// Builder for configuring a [`RedpandaChannel`].
#[derive(Default)]
pub struct RedpandaChannelBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    partition_buffer: Option<usize>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
    redelivery: Option<RetryPolicy>,
}

impl RedpandaChannelBuilder {
    /// Comma-separated list of broker addresses (e.g. `"localhost:9092"`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Messages buffered per partition worker before the partition is paused.
    ///
    /// Values below 1 are raised to 1. Default: [`DEFAULT_PARTITION_BUFFER`]
    #[must_use]
    pub fn partition_buffer(mut self, size: usize) -> Self {
        self.partition_buffer = Some(size.max(1));
        self
    }

    /// Where a new consumer group starts reading: `"earliest"` or `"latest"`.
    ///
    /// Default: `"earliest"`, so a freshly created group replays the topic.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Consumer group session timeout.
    ///
    /// Default: 6 seconds
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Backoff between redeliveries of a message whose handler failed.
    ///
    /// Redelivery never gives up; `max_retries` only caps the backoff growth.
    #[must_use]
    pub fn redelivery(mut self, policy: RetryPolicy) -> Self {
        self.redelivery = Some(policy);
        self
    }

    /// Build the [`RedpandaChannel`].
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Configuration`] if no brokers were set, or
    /// [`ChannelError::ConnectionFailed`] if the producer cannot be created.
    pub fn build(self) -> Result<RedpandaChannel, ChannelError> {
        let brokers = self
            .brokers
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| ChannelError::Configuration("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("enable.idempotence", if acks == "all" { "true" } else { "false" })
            .set("compression.type", compression)
            .create()
            .map_err(|e| {
                ChannelError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        let partition_buffer = self.partition_buffer.unwrap_or(DEFAULT_PARTITION_BUFFER);
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            partition_buffer,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaChannel created"
        );

        Ok(RedpandaChannel {
            producer,
            brokers,
            timeout,
            partition_buffer,
            auto_offset_reset,
            session_timeout: self.session_timeout.unwrap_or(Duration::from_secs(6)),
            redelivery: self.redelivery.unwrap_or_else(|| {
                RetryPolicy::builder()
                    .max_retries(8)
                    .initial_delay(Duration::from_millis(200))
                    .max_delay(Duration::from_secs(10))
                    .jitter(true)
                    .build()
            }),
        })
    }
}

/// Convert message headers to Kafka record headers.
fn record_headers(message: &Message) -> OwnedHeaders {
    message
        .headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(message.headers.len()), |headers, (key, value)| {
            headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            })
        })
}

impl EventChannel for RedpandaChannel {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: Message,
    ) -> Pin<Box<dyn Future<Output = Result<Delivered, ChannelError>> + Send + 'a>> {
        Box::pin(async move {
            if topic.is_empty() {
                return Err(ChannelError::InvalidTopic("topic name is empty".to_string()));
            }

            let record = FutureRecord::to(topic)
                .key(message.key.as_str())
                .payload(message.payload.as_slice())
                .headers(record_headers(&message));

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        key = %message.key,
                        partition,
                        offset,
                        "Message published"
                    );
                    Ok(Delivered { partition, offset })
                },
                Err((kafka_error, _)) => {
                    tracing::warn!(
                        topic = %topic,
                        key = %message.key,
                        error = %kafka_error,
                        "Failed to publish message"
                    );
                    Err(ChannelError::PublishFailed {
                        topic: topic.to_string(),
                        reason: kafka_error.to_string(),
                    })
                },
            }
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
                return Err(ChannelError::InvalidTopic("topic name is empty".to_string()));
            }

            let consumer = self.consumer(group).map_err(|e| ChannelError::SubscriptionFailed {
                topic: topic.to_string(),
                reason: format!("Failed to create consumer: {e}"),
            })?;
            consumer
                .subscribe(&[topic])
                .map_err(|e| ChannelError::SubscriptionFailed {
                    topic: topic.to_string(),
                    reason: format!("Failed to subscribe: {e}"),
                })?;

            tracing::info!(
                topic = %topic,
                consumer_group = %group,
                partition_buffer = self.partition_buffer,
                auto_offset_reset = %self.auto_offset_reset,
                manual_commit = true,
                "Subscribed to topic"
            );

            let dispatcher = dispatch::Dispatcher::new(
                Arc::new(consumer),
                handler,
                self.partition_buffer,
                self.redelivery.clone(),
                shutdown,
            );
            Ok(Subscription::new(vec![tokio::spawn(dispatcher.run())]))
        })
    }
}
