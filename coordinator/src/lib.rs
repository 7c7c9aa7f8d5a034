//! # Stockflow Coordinator
//!
//! The inventory reservation coordinator.
//!
//! Requests arrive at the [`InventoryService`], which validates them and
//! publishes inventory events keyed by product. The [`Coordinator`] consumes
//! the events partition by partition, applies them to the stock and
//! reservation ledgers with compare-and-set, keeps the [`StockCache`] current
//! and republishes every new stock snapshot. The [`Sweeper`] turns lapsed
//! holds into RELEASE events.
//!
//! ## Modules
//!
//! - [`coordinator`]: event application, audit and outcome notices
//! - [`cache`]: versioned in-memory stock snapshots
//! - [`sweeper`]: periodic expiry releases
//! - [`service`]: inbound operations
//! - [`publisher`]: retrying, tracked event publication
//! - [`app`]: wiring and graceful shutdown
//! - [`config`], [`metrics`], [`error`]: ambient concerns
//!
//! ## Example
//!
//! ```rust,ignore
//! let config = Config::from_env();
//! let app = Application::build(config).await?;
//! app.run().await?;
//! ```

pub mod app;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod publisher;
pub mod service;
pub mod sweeper;

pub use app::{AppError, Application, Inventory, Running};
pub use cache::StockCache;
pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorSettings, Ledgers, Notice, Outcome};
pub use error::InventoryError;
pub use publisher::{EventPublisher, Topics};
pub use service::{Availability, InventoryService, InventorySummary, ReservationOutcome, ReservationTicket};
pub use sweeper::{SweepReport, Sweeper};
