//! # Stockflow Runtime
//!
//! Execution utilities shared by the channel implementations and the
//! coordinator.
//!
//! - [`retry`]: exponential backoff with optional jitter, used for broker
//!   publishes and for redelivering a failed message to its handler
//! - [`background`]: tracked detached tasks whose results can be awaited and
//!   which are drained on shutdown

/// Retry logic with exponential backoff
pub mod retry;

/// Tracked background tasks
pub mod background;

pub use background::{BackgroundTasks, DrainReport, TaskHandle};
pub use retry::{RetryPolicy, retry_with_backoff, retry_with_predicate};
