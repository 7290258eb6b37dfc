use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

struct Signal {
    stopped: AtomicBool,
    notify: Notify,
}

/// Owned by whoever may cancel a worker. Dropping it also cancels, so a worker can never outlive
/// the handle that controls it.
pub(crate) struct Stopper {
    signal: Arc<Signal>,
}

#[derive(Clone)]
pub(crate) struct StopCheck {
    signal: Arc<Signal>,
}

impl Stopper {
    /// Safe to call repeatedly. Every call wakes all current waiters again.
    pub(crate) fn stop(&self) {
        self.signal.stopped.store(true, Ordering::Release);
        self.signal.notify.notify_waiters();
    }

    pub(crate) fn check(&self) -> StopCheck {
        StopCheck {
            signal: self.signal.clone(),
        }
    }
}

impl Drop for Stopper {
    fn drop(&mut self) {
        self.stop();
    }
}

impl StopCheck {
    pub(crate) fn should_stop(&self) -> bool {
        self.signal.stopped.load(Ordering::Acquire)
    }

    /// Resolves once `Stopper::stop()` has been called (or the stopper dropped).
    pub(crate) async fn stopped(&self) {
        loop {
            // Register before checking the flag, otherwise a stop between the check and the
            // await would be missed.
            let notified = self.signal.notify.notified();
            if self.should_stop() {
                return;
            }
            notified.await;
        }
    }
}

pub(super) fn new() -> (Stopper, StopCheck) {
    let signal = Arc::new(Signal {
        stopped: AtomicBool::new(false),
        notify: Notify::new(),
    });

    let stopper = Stopper { signal: signal.clone() };
    let stop_check = StopCheck { signal };

    (stopper, stop_check)
}
