use crate::sync::Stopper;
use std::future::Future;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Duration;

/// A spawned worker task plus the means to stop it.
pub(crate) struct WorkerHandle<T> {
    stopper: Stopper,
    join: JoinHandle<T>,
}

impl<T: Send + 'static> WorkerHandle<T> {
    pub(crate) fn spawn<F>(stopper: Stopper, worker: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        WorkerHandle {
            stopper,
            join: tokio::spawn(worker),
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for a worker that exits on its own.
    pub(crate) async fn join(self) -> Result<T, JoinError> {
        self.join.await
    }

    /// Signals the worker and waits for it to exit. The signal and `wake` are repeated every
    /// `poll` until it does, so a waiter that checked the flag just before it was set still
    /// wakes up.
    pub(crate) async fn stop(mut self, poll: Duration, wake: impl Fn()) -> Result<T, JoinError> {
        loop {
            self.stopper.stop();
            wake();
            if let Ok(result) = tokio::time::timeout(poll, &mut self.join).await {
                return result;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn stop_waits_for_worker_exit() {
        // -- setup --
        let (stopper, stop_check) = sync::stop_signal();
        let handle = WorkerHandle::spawn(stopper, async move {
            stop_check.stopped().await;
            42
        });
        assert!(!handle.is_finished());

        // -- execute --
        let wakes = Arc::new(AtomicUsize::new(0));
        let wakes_clone = wakes.clone();
        let result = handle
            .stop(Duration::from_millis(10), move || {
                wakes_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        // -- verify --
        assert_eq!(result.unwrap(), 42);
        assert!(wakes.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn stop_keeps_signalling_slow_worker() {
        // -- setup --
        let (stopper, stop_check) = sync::stop_signal();
        let handle = WorkerHandle::spawn(stopper, async move {
            // Ignores the signal for a while, like a worker stuck in a blocking call.
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop_check.should_stop()
        });

        // -- execute --
        let wakes = Arc::new(AtomicUsize::new(0));
        let wakes_clone = wakes.clone();
        let result = handle
            .stop(Duration::from_millis(10), move || {
                wakes_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        // -- verify --
        assert!(result.unwrap());
        assert!(wakes.load(Ordering::SeqCst) > 1);
    }
}
