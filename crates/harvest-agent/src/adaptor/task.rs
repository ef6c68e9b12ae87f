// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Worker task shared by the built-in adaptors, stoppable per [`ShutdownPolicy`].

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::adaptor::ShutdownPolicy;

/// Handed to the worker; resolves once the worker should finish its current
/// unit of work and exit.
#[derive(Debug, Clone)]
pub struct TaskSignals {
    drain: CancellationToken,
}

impl TaskSignals {
    pub async fn draining(&self) {
        self.drain.cancelled().await;
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }
}

#[derive(Debug, Default)]
pub struct AdaptorTask {
    drain: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AdaptorTask {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F, Fut>(&self, worker: F)
    where
        F: FnOnce(TaskSignals) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let signals = TaskSignals {
            drain: self.drain.clone(),
        };
        let handle = tokio::spawn(worker(signals));
        #[allow(clippy::expect_used)]
        let previous = self.handle.lock().expect("lock poisoned").replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stops the worker. `HardStop` aborts it; `Gracefully` and `Restarting` let
    /// it drain for up to `grace` before aborting; `WaitTillFinished` waits as
    /// long as it takes. Calling this twice is harmless.
    pub async fn stop(&self, policy: ShutdownPolicy, grace: Duration) {
        #[allow(clippy::expect_used)]
        let handle = self.handle.lock().expect("lock poisoned").take();
        let Some(mut handle) = handle else {
            return;
        };

        match policy {
            ShutdownPolicy::HardStop => {
                self.drain.cancel();
                handle.abort();
                let _ = handle.await;
            }
            ShutdownPolicy::Gracefully | ShutdownPolicy::Restarting => {
                self.drain.cancel();
                if tokio::time::timeout(grace, &mut handle).await.is_err() {
                    warn!("adaptor worker did not drain within {grace:?}, aborting");
                    handle.abort();
                    let _ = handle.await;
                }
            }
            ShutdownPolicy::WaitTillFinished => {
                self.drain.cancel();
                let _ = handle.await;
            }
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        #[allow(clippy::expect_used)]
        self.handle
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_graceful_stop_lets_worker_finish() {
        let task = AdaptorTask::new();
        let flushed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&flushed);
        task.spawn(|signals| async move {
            signals.draining().await;
            flag.store(true, Ordering::SeqCst);
        });

        task.stop(ShutdownPolicy::Gracefully, Duration::from_secs(5))
            .await;
        assert!(flushed.load(Ordering::SeqCst));
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn test_hard_stop_abandons_work() {
        let task = AdaptorTask::new();
        let flushed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&flushed);
        task.spawn(|_signals| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            flag.store(true, Ordering::SeqCst);
        });

        task.stop(ShutdownPolicy::HardStop, Duration::from_secs(5))
            .await;
        assert!(!flushed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop_is_bounded() {
        let task = AdaptorTask::new();
        task.spawn(|_signals| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let started = tokio::time::Instant::now();
        task.stop(ShutdownPolicy::Restarting, Duration::from_secs(2))
            .await;
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_stop_without_worker_is_noop() {
        let task = AdaptorTask::new();
        task.stop(ShutdownPolicy::WaitTillFinished, Duration::from_secs(1))
            .await;
    }
}
