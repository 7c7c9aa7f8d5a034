//! Cooperative shutdown signal.
//!
//! Long-running tasks (partition workers, the expiration sweeper) hold a
//! [`ShutdownSignal`] and check it between units of work. The application owns
//! the single [`ShutdownTrigger`].
//!
//! ```
//! # async fn example() {
//! use stockflow_core::shutdown;
//!
//! let (trigger, mut signal) = shutdown::channel();
//! trigger.trigger();
//! signal.triggered().await;
//! assert!(signal.is_triggered());
//! # }
//! ```

use tokio::sync::watch;

/// Create a trigger and a first signal observing it.
#[must_use]
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

/// Sending half: flips every signal to "shut down".
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Signal shutdown to every observer. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Another signal observing this trigger.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Whether shutdown has been triggered.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Receiving half, cheap to clone into every task.
///
/// Dropping the trigger counts as shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Non-blocking check, used between units of work.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once shutdown has been triggered (or the trigger dropped).
    pub async fn triggered(&mut self) {
        // Err means the trigger is gone, which is treated as shutdown.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}
