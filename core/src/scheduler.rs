//! Cancellable delayed tasks
//!
//! Every timer in the crate (relay retries, pending-relay eviction) is owned
//! through a `ScheduledTask`. Dropping the handle aborts the task, so removing
//! it from its owner's map is enough to cancel it.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Handle to a future scheduled to run after a delay
#[derive(Debug)]
pub struct ScheduledTask {
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Run `task` once `delay` has elapsed. Must be called inside a Tokio runtime.
    pub fn after<F>(delay: Duration, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Abort the task if it has not run yet
    pub fn cancel(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Release the handle without aborting.
    ///
    /// Used by a task that removes its own entry from the owner's map while
    /// it is firing.
    pub fn detach(mut self) {
        self.handle.take();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
