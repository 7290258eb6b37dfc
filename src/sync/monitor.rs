use crate::sync::StopCheck;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

/// Mutex-guarded state paired with a broadcast condition.
///
/// Writers mutate through `update()`, which wakes every waiter. Waiters block in `wait_until()`,
/// which re-evaluates its predicate under the lock after every wake-up, so spurious or stale
/// notifications are harmless.
pub(crate) struct Monitor<T> {
    state: Mutex<T>,
    changed: Notify,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WaitOutcome<R> {
    Ready(R),
    TimedOut,
    Stopped,
}

impl<T> Monitor<T> {
    pub(crate) fn new(state: T) -> Self {
        Monitor {
            state: Mutex::new(state),
            changed: Notify::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock().expect("Monitor mutex guard poison")
    }

    pub(crate) fn update<R>(&self, mutate: impl FnOnce(&mut T) -> R) -> R {
        let output = {
            let mut guard = self.lock();
            mutate(&mut *guard)
        };
        self.changed.notify_waiters();
        output
    }

    /// Wakes waiters without touching the state. Used to make them re-check a stop signal.
    pub(crate) fn notify_all(&self) {
        self.changed.notify_waiters();
    }

    /// Waits until `predicate` returns `Some`, the optional timeout elapses, or `stop` fires.
    pub(crate) async fn wait_until<R>(
        &self,
        stop: &StopCheck,
        timeout: Option<Duration>,
        mut predicate: impl FnMut(&mut T) -> Option<R>,
    ) -> WaitOutcome<R> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let notified = self.changed.notified();
            let ready = {
                let mut guard = self.lock();
                predicate(&mut *guard)
            };
            if let Some(ready) = ready {
                return WaitOutcome::Ready(ready);
            }
            if stop.should_stop() {
                return WaitOutcome::Stopped;
            }

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = stop.stopped() => {}
                        _ = tokio::time::sleep_until(deadline) => return WaitOutcome::TimedOut,
                    }
                }
                None => {
                    tokio::select! {
                        _ = notified => {}
                        _ = stop.stopped() => {}
                    }
                }
            }
        }
    }
}
