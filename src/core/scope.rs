use std::future::Future;

use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;

use crate::core::errors::{SyncError, SyncResult};

/// Lifetime shared by all work an engine starts. Cancelling it (explicitly or
/// by dropping the owner) stops every in-flight operation and side effect.
#[derive(Debug, Default)]
pub struct TaskScope {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl TaskScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled together with this scope.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Starts `fut` in the background; it is dropped when the scope is cancelled.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        });
    }

    /// Starts a long-lived listener. It stops with the scope but [`idle`](Self::idle)
    /// does not wait for it.
    pub fn spawn_listener<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        });
    }

    /// Runs `fut` to completion unless the scope is cancelled first.
    pub async fn run<F: Future>(&self, fut: F) -> SyncResult<F::Output> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(SyncError::Cancelled),
            out = fut => Ok(out),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Guard that cancels the scope once dropped. Engine handles hold it;
    /// tasks spawned on the scope must not.
    pub fn owner_guard(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }

    /// Waits until every spawned task (including ones spawned meanwhile) has finished.
    pub async fn idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
