//! Wiring and lifecycle.
//!
//! [`Inventory`] assembles the coordinator, sweeper and service over any
//! ledgers and channel; [`Application`] does the same over `PostgreSQL` and
//! Redpanda and runs until Ctrl+C or SIGTERM.
//!
//! # Graceful Shutdown
//!
//! 1. The shutdown signal is broadcast to partition workers and the sweeper
//! 2. Both finish their current unit of work and exit (bounded by the grace
//!    period)
//! 3. Background publishes are drained (same bound)
//! 4. The connection pool is closed

use crate::config::{Config, InventoryConfig};
use crate::coordinator::{Coordinator, CoordinatorSettings, Ledgers};
use crate::error::InventoryError;
use crate::publisher::{EventPublisher, Topics};
use crate::service::InventoryService;
use crate::sweeper::Sweeper;
use std::sync::Arc;
use std::time::Duration;
use stockflow_core::channel::{ChannelError, EventChannel, Subscription};
use stockflow_core::environment::{Clock, SystemClock};
use stockflow_core::ledger::LedgerError;
use stockflow_core::shutdown::{self, ShutdownTrigger};
use stockflow_postgres::PostgresLedger;
use stockflow_redpanda::RedpandaChannel;
use stockflow_runtime::RetryPolicy;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Startup and run failures.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database connection or bootstrap failed
    #[error("Storage error: {0}")]
    Ledger(#[from] LedgerError),

    /// Broker connection or topic setup failed
    #[error("Event channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Subscription could not be started
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    /// Signal handlers could not be installed
    #[error("Signal handler error: {0}")]
    Signal(#[from] std::io::Error),
}

/// The inventory components, wired together.
#[derive(Clone)]
pub struct Inventory {
    /// Applies consumed events
    pub coordinator: Arc<Coordinator>,
    /// Releases lapsed holds
    pub sweeper: Arc<Sweeper>,
    /// Inbound operations
    pub service: InventoryService,
    /// Shared publisher
    pub publisher: EventPublisher,
    channel: Arc<dyn EventChannel>,
}

impl Inventory {
    /// Wire the components over `ledgers` and `channel`.
    #[must_use]
    pub fn wire(
        ledgers: Ledgers,
        channel: Arc<dyn EventChannel>,
        clock: Arc<dyn Clock>,
        topics: Topics,
        config: &InventoryConfig,
    ) -> Self {
        let retry = RetryPolicy::builder()
            .max_retries(config.publish_max_retries)
            .initial_delay(Duration::from_millis(config.publish_initial_backoff_ms))
            .build();
        let publisher = EventPublisher::new(channel.clone(), topics, retry);

        let coordinator = Arc::new(Coordinator::new(
            ledgers.clone(),
            publisher.clone(),
            clock.clone(),
            CoordinatorSettings::from(config),
        ));
        let sweeper = Arc::new(Sweeper::new(
            ledgers.reservations,
            publisher.clone(),
            clock.clone(),
            config.sweep_interval(),
            config.sweep_batch_size,
        ));
        let service = InventoryService::new(coordinator.clone(), publisher.clone(), clock)
            .with_low_stock_threshold(config.low_stock_threshold);

        Self {
            coordinator,
            sweeper,
            service,
            publisher,
            channel,
        }
    }

    /// Subscribe the coordinator to the events topic as `group` and start the
    /// sweeper.
    ///
    /// # Errors
    ///
    /// [`InventoryError::DeliveryFailure`] if the subscription cannot be
    /// established.
    pub async fn start(&self, group: &str) -> Result<Running, InventoryError> {
        let (trigger, signal) = shutdown::channel();
        let topic = self.publisher.topics().events.clone();

        let subscription = self
            .channel
            .subscribe(&topic, group, self.coordinator.clone(), signal.clone())
            .await
            .map_err(InventoryError::DeliveryFailure)?;
        let sweeper = self.sweeper.clone().spawn(signal);

        info!(topic = %topic, group, workers = subscription.task_count(), "Inventory coordinator subscribed");
        Ok(Running {
            trigger,
            subscription,
            sweeper,
        })
    }
}

/// Handle to the running consumer and sweeper.
pub struct Running {
    trigger: ShutdownTrigger,
    subscription: Subscription,
    sweeper: JoinHandle<()>,
}

impl Running {
    /// Signal shutdown and wait up to `grace` for the consumer and the sweeper
    /// to exit.
    pub async fn shutdown(self, grace: Duration) {
        self.trigger.trigger();

        match tokio::time::timeout(grace, self.subscription.join()).await {
            Ok(0) => info!("Event consumer stopped gracefully"),
            Ok(failed) => warn!(failed, "Event consumer tasks failed"),
            Err(_) => warn!("Event consumer shutdown timed out"),
        }

        match tokio::time::timeout(grace, self.sweeper).await {
            Ok(Ok(())) => info!("Sweeper stopped gracefully"),
            Ok(Err(e)) => warn!(error = %e, "Sweeper task failed"),
            Err(_) => warn!("Sweeper shutdown timed out"),
        }
    }
}

/// The inventory coordinator over `PostgreSQL` and Redpanda.
pub struct Application {
    config: Config,
    ledger: Arc<PostgresLedger>,
    inventory: Inventory,
}

impl Application {
    /// Connect to the infrastructure and wire the components.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] if the database or broker is unreachable, or if
    /// table or topic bootstrap fails.
    pub async fn build(config: Config) -> Result<Self, AppError> {
        let ledger =
            Arc::new(PostgresLedger::connect(&config.postgres.url, config.postgres.max_connections).await?);
        if config.postgres.run_migrations {
            ledger.migrate().await?;
            info!("Database schema ready");
        }

        let redpanda = &config.redpanda;
        let redelivery = RetryPolicy::builder()
            .max_retries(usize::MAX)
            .initial_delay(Duration::from_millis(redpanda.redelivery_initial_backoff_ms))
            .max_delay(Duration::from_millis(redpanda.redelivery_max_backoff_ms))
            .build();
        let channel = RedpandaChannel::builder()
            .brokers(redpanda.brokers.clone())
            .producer_acks(redpanda.producer_acks.clone())
            .compression(redpanda.compression.clone())
            .timeout(Duration::from_millis(redpanda.send_timeout_ms))
            .partition_buffer(redpanda.partition_buffer)
            .auto_offset_reset(redpanda.auto_offset_reset.clone())
            .session_timeout(Duration::from_millis(redpanda.session_timeout_ms))
            .redelivery(redelivery)
            .build()?;

        let topics = Topics::with_prefix(&redpanda.topic_prefix);
        if redpanda.create_topics {
            channel
                .ensure_topics(
                    &[topics.events.as_str(), topics.state.as_str()],
                    redpanda.topic_partitions,
                    redpanda.topic_replication,
                )
                .await?;
            info!(events = %topics.events, state = %topics.state, "Topics ready");
        }

        let inventory = Inventory::wire(
            Ledgers::shared(ledger.clone()),
            Arc::new(channel),
            Arc::new(SystemClock),
            topics,
            &config.inventory,
        );

        Ok(Self {
            config,
            ledger,
            inventory,
        })
    }

    /// Inbound operations, for an embedding request layer.
    #[must_use]
    pub const fn service(&self) -> &InventoryService {
        &self.inventory.service
    }

    /// Run until Ctrl+C or SIGTERM, then shut down gracefully.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] if the subscription cannot start or the signal
    /// handlers cannot be installed.
    pub async fn run(self) -> Result<(), AppError> {
        let running = self
            .inventory
            .start(&self.config.redpanda.consumer_group)
            .await?;
        info!("Inventory coordinator running");

        let signalled = shutdown_signal().await;
        info!("Shutting down gracefully...");

        let grace = self.config.inventory.shutdown_timeout();
        running.shutdown(grace).await;

        let report = self.inventory.publisher.drain(grace).await;
        if report.abandoned > 0 {
            warn!(
                completed = report.completed,
                abandoned = report.abandoned,
                "Background publishes abandoned at shutdown"
            );
        }

        self.ledger.close().await;
        info!("Graceful shutdown complete");
        signalled.map_err(AppError::from)
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C signal");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM signal");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C signal");
    }

    Ok(())
}
