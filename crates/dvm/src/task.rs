//! Cancellable background tasks
//!
//! Every long-running piece of the engine runs as a [`ScheduledTask`]: a
//! spawned future paired with the [`CancellationToken`] it checks at each
//! suspension point. Sleeps go through [`sleep_or_cancel`] so a cancel is
//! observed at the next sleep boundary instead of after the full delay.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Sleep for `duration`, returning `false` if cancelled first.
pub async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// A spawned task and the token that stops it.
pub struct ScheduledTask<T> {
    token: CancellationToken,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> ScheduledTask<T> {
    /// Spawn `make(token)` on `tracker`. The task receives a child of `parent`.
    pub fn spawn<F, Fut>(tracker: &TaskTracker, parent: &CancellationToken, make: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let token = parent.child_token();
        let handle = tracker.spawn(make(token.clone()));
        Self { token, handle }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task's output. `None` if the task panicked or was aborted.
    pub async fn join(self) -> Option<T> {
        match self.handle.await {
            Ok(output) => Some(output),
            Err(err) => {
                tracing::error!("background task ended abnormally: {err}");
                None
            }
        }
    }
}
