//! Ordered, partitioned publish/subscribe transport.
//!
//! This module provides the [`EventChannel`] trait the coordinator publishes
//! inventory events through and consumes them from.
//!
//! # Delivery contract
//!
//! ```text
//!   publish(topic, message{key = productId})
//!        │
//!        ▼
//!  ┌──────────────┬──────────────┬──────────────┐
//!  │ partition 0  │ partition 1  │ partition 2  │   key → partition
//!  └──────┬───────┴──────┬───────┴──────┬───────┘
//!         ▼              ▼              ▼
//!      worker 0       worker 1       worker 2        one task per partition
//!         │              │              │
//!   handler Ok → commit offset      handler Err → redeliver same message
//! ```
//!
//! - **Durable publish**: `publish` returns only after the broker acknowledged
//!   the write. Retrying transient failures is the caller's policy.
//! - **At-least-once**: an offset is committed only after the handler returned
//!   `Ok`. Handlers must tolerate duplicates.
//! - **Ordered within partition**: a failing message is retried in place and
//!   blocks only its own partition.
//!
//! # Implementations
//!
//! - `InMemoryEventChannel` in `stockflow-testing`
//! - `RedpandaChannel` in `stockflow-redpanda`
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` so the channel can be shared as
//! `Arc<dyn EventChannel>`.

use crate::shutdown::ShutdownSignal;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Errors that can occur during channel operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker did not acknowledge a publish
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to join a consumer group or subscribe to a topic
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Topic name is not acceptable
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Invalid client configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    Transport(String),
}

impl ChannelError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::PublishFailed { .. } | Self::Transport(_)
        )
    }
}

/// A keyed message with string headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Partition key
    pub key: String,
    /// Header name/value pairs, in insertion order
    pub headers: Vec<(String, String)>,
    /// Opaque body
    pub payload: Vec<u8>,
}

impl Message {
    /// Message without headers.
    #[must_use]
    pub fn new(key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            headers: Vec::new(),
            payload,
        }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header value with this name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Where an acknowledged message landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    /// Partition the message was appended to
    pub partition: i32,
    /// Offset within that partition
    pub offset: i64,
}

/// One message handed to a [`DeliveryHandler`].
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// 1 on first delivery, incremented on every redelivery of this offset
    pub attempt: u32,
    /// The message itself
    pub message: Message,
}

/// Handler failure. The message will be delivered again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct HandlerError {
    /// Human readable cause
    pub reason: String,
}

impl HandlerError {
    /// Wrap a cause.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Future returned by [`DeliveryHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Consumer-side callback.
///
/// Returning `Ok` lets the channel commit the offset. Returning `Err` keeps the
/// offset uncommitted; the same message is delivered again and the partition
/// does not advance until it succeeds.
pub trait DeliveryHandler: Send + Sync + 'static {
    /// Process one delivery.
    fn handle<'a>(&'a self, delivery: &'a Delivery) -> HandlerFuture<'a>;
}

/// Running subscription: one or more partition tasks.
#[derive(Debug)]
pub struct Subscription {
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap the tasks driving a subscription.
    #[must_use]
    pub const fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }

    /// Number of tasks driving this subscription.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every task to exit; tasks exit once shutdown is signalled.
    ///
    /// Returns how many tasks panicked or were aborted.
    pub async fn join(self) -> usize {
        let mut failed = 0;
        for task in self.tasks {
            if task.await.is_err() {
                failed += 1;
            }
        }
        failed
    }

    /// Abort all tasks without waiting.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Trait for event channel implementations.
pub trait EventChannel: Send + Sync {
    /// Append `message` to the partition chosen by its key.
    ///
    /// Resolves once the broker acknowledged durable receipt.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PublishFailed`] (or another transient variant)
    /// when the broker did not acknowledge the write.
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: Message,
    ) -> Pin<Box<dyn Future<Output = Result<Delivered, ChannelError>> + Send + 'a>>;

    /// Start delivering `topic` to `handler` as member of `group`.
    ///
    /// Delivery continues in background tasks until `shutdown` fires; tasks
    /// stop between messages, never while a handler is running.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::SubscriptionFailed`] if the subscription could
    /// not be established.
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        group: &'a str,
        handler: Arc<dyn DeliveryHandler>,
        shutdown: ShutdownSignal,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, ChannelError>> + Send + 'a>>;
}
