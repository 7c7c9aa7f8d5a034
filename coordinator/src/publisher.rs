//! Publishing inventory events and stock snapshots.
//!
//! Every publish goes through the retry policy; a failure that survives the
//! retries surfaces as [`InventoryError::PublishFailure`]. Publishes the
//! caller does not want to wait for run as tracked background tasks and hand
//! back a [`TaskHandle`].

use crate::error::InventoryError;
use std::sync::Arc;
use std::time::Duration;
use stockflow_core::channel::{ChannelError, Delivered, EventChannel, Message};
use stockflow_core::event::{InventoryEvent, InventoryState};
use stockflow_runtime::{BackgroundTasks, DrainReport, RetryPolicy, TaskHandle, retry_with_predicate};

/// Topic names used by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Inventory events, keyed by product
    pub events: String,
    /// Stock snapshots, keyed by product
    pub state: String,
}

impl Topics {
    /// `<prefix>inventory-events` and `<prefix>inventory-state`.
    #[must_use]
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            events: format!("{prefix}inventory-events"),
            state: format!("{prefix}inventory-state"),
        }
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::with_prefix("")
    }
}

/// Retrying publisher shared by the coordinator, sweeper and service.
#[derive(Clone)]
pub struct EventPublisher {
    channel: Arc<dyn EventChannel>,
    topics: Topics,
    retry: RetryPolicy,
    tasks: Arc<BackgroundTasks>,
}

impl EventPublisher {
    /// Publisher over `channel`.
    #[must_use]
    pub fn new(channel: Arc<dyn EventChannel>, topics: Topics, retry: RetryPolicy) -> Self {
        Self {
            channel,
            topics,
            retry,
            tasks: Arc::new(BackgroundTasks::new()),
        }
    }

    /// Topic names in use.
    #[must_use]
    pub const fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Publish an event to the events topic, keyed by its product.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::PublishFailure`] once retries are exhausted
    /// or on a non-transient channel error.
    pub async fn publish_event(&self, event: &InventoryEvent) -> Result<Delivered, InventoryError> {
        let message = event
            .to_message()
            .map_err(|e| InventoryError::InvalidRequest(e.to_string()))?;
        let delivered = self.send(&self.topics.events, message).await?;

        tracing::debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            product_id = %event.product_id,
            correlation_id = %event.correlation_id,
            partition = delivered.partition,
            offset = delivered.offset,
            "Event published"
        );
        Ok(delivered)
    }

    /// Publish a stock snapshot to the state topic.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::PublishFailure`] once retries are exhausted.
    pub async fn publish_state(&self, state: &InventoryState) -> Result<Delivered, InventoryError> {
        let message = state
            .to_message()
            .map_err(|e| InventoryError::InvalidRequest(e.to_string()))?;
        self.send(&self.topics.state, message).await
    }

    /// Publish `event` on a tracked background task.
    ///
    /// Failures are logged and counted by the task itself; awaiting the
    /// handle is optional.
    pub fn publish_event_detached(
        &self,
        event: InventoryEvent,
    ) -> TaskHandle<Result<Delivered, InventoryError>> {
        let publisher = self.clone();
        self.tasks.spawn(async move {
            let result = publisher.publish_event(&event).await;
            if let Err(e) = &result {
                metrics::counter!(
                    "stockflow_detached_publish_failures_total",
                    "event_type" => event.event_type.label()
                )
                .increment(1);
                tracing::error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    product_id = %event.product_id,
                    error = %e,
                    "Background publish failed"
                );
            }
            result
        })
    }

    /// Background publishes still running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tasks.in_flight()
    }

    /// Wait up to `timeout` for background publishes, then abandon the rest.
    pub async fn drain(&self, timeout: Duration) -> DrainReport {
        self.tasks.drain(timeout).await
    }

    async fn send(&self, topic: &str, message: Message) -> Result<Delivered, InventoryError> {
        retry_with_predicate(
            &self.retry,
            "publish",
            || self.channel.publish(topic, message.clone()),
            ChannelError::is_transient,
        )
        .await
        .map_err(InventoryError::PublishFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_default_to_no_prefix() {
        let topics = Topics::default();
        assert_eq!(topics.events, "inventory-events");
        assert_eq!(topics.state, "inventory-state");
        assert_eq!(Topics::with_prefix("dev-").state, "dev-inventory-state");
    }
}
