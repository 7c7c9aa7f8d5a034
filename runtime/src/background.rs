//! Tracked background tasks.
//!
//! Work that callers do not want to wait for (analytics publishes, for
//! example) is spawned here rather than as a bare `tokio::spawn`: every task
//! hands back a [`TaskHandle`] that can be awaited for its result, and the
//! set is drained on shutdown so in-flight work finishes or is explicitly
//! abandoned.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Awaitable result of a tracked task.
///
/// Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Wait for the task's output. `None` if the task panicked or was aborted.
    pub async fn wait(self) -> Option<T> {
        self.rx.await.ok()
    }

    /// Wait at most `timeout`. `None` on timeout, panic or abort.
    pub async fn wait_timeout(self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.rx).await.ok()?.ok()
    }
}

/// Outcome of [`BackgroundTasks::drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks that finished before the deadline
    pub completed: usize,
    /// Tasks aborted at the deadline
    pub abandoned: usize,
}

/// A set of detached but tracked tasks.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `future` and track it until it completes or the set is drained.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F>(&self, future: F) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let output = future.await;
            // The caller may have dropped its handle.
            let _ = tx.send(output);
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);

        TaskHandle { rx }
    }

    /// Tasks still running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tasks.lock().iter().filter(|task| !task.is_finished()).count()
    }

    /// Wait up to `timeout` for every tracked task, including tasks spawned
    /// while draining, then abort whatever is left.
    pub async fn drain(&self, timeout: Duration) -> DrainReport {
        let deadline = Instant::now() + timeout;
        let mut report = DrainReport::default();

        loop {
            let batch = std::mem::take(&mut *self.tasks.lock());
            if batch.is_empty() {
                break;
            }
            for mut task in batch {
                if tokio::time::timeout_at(deadline, &mut task).await.is_ok() {
                    report.completed += 1;
                } else {
                    task.abort();
                    report.abandoned += 1;
                }
            }
        }

        if report.abandoned > 0 {
            tracing::warn!(
                completed = report.completed,
                abandoned = report.abandoned,
                "Background tasks abandoned at shutdown deadline"
            );
        } else {
            tracing::debug!(completed = report.completed, "Background tasks drained");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn handle_yields_task_output() {
        let tasks = BackgroundTasks::new();
        let handle = tasks.spawn(async { 7 });
        assert_eq!(handle.wait().await, Some(7));
    }

    #[tokio::test]
    async fn dropped_handle_does_not_cancel_work() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        drop(tasks.spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            d.fetch_add(1, Ordering::SeqCst);
        }));

        let report = tasks.drain(Duration::from_secs(1)).await;
        assert_eq!(report, DrainReport { completed: 1, abandoned: 0 });
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(tasks.in_flight(), 0);
    }

    #[tokio::test]
    async fn drain_aborts_tasks_past_the_deadline() {
        let tasks = BackgroundTasks::new();
        let handle = tasks.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let report = tasks.drain(Duration::from_millis(20)).await;
        assert_eq!(report.abandoned, 1);
        assert_eq!(handle.wait().await, None);
    }

    #[tokio::test]
    async fn wait_timeout_gives_up() {
        let tasks = BackgroundTasks::new();
        let handle = tasks.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert_eq!(handle.wait_timeout(Duration::from_millis(10)).await, None);
        tasks.drain(Duration::ZERO).await;
    }
}
