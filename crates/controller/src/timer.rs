//! One-shot, cancellable deferred callbacks backed by tokio tasks.
//!
//! The service captures a runtime [`Handle`] at construction so callers do
//! not need to be inside a runtime context when scheduling.

use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

#[derive(Clone, Debug)]
pub struct TimerService {
    runtime: Handle,
}

/// Handle to a scheduled callback. Dropping it does not cancel the callback.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerService {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Run `callback` once after `delay` unless cancelled first.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            callback.await;
        });
        TimerHandle { task }
    }
}

impl TimerHandle {
    /// Cancel the callback. A no-op if it already ran or was cancelled.
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
