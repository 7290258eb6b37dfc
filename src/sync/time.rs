use crate::sync::StopCheck;
use tokio::time::{Duration, Instant};

#[async_trait::async_trait]
pub(crate) trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;
    async fn sleep_until(&mut self, deadline: Instant);

    async fn sleep(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

#[derive(Copy, Clone)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

/// Returns false if the sleep was cut short by the stop signal.
pub(crate) async fn sleep_or_stop<C: Clock>(clock: &mut C, duration: Duration, stop: &StopCheck) -> bool {
    if stop.should_stop() {
        return false;
    }

    tokio::select! {
        _ = clock.sleep(duration) => !stop.should_stop(),
        _ = stop.stopped() => false,
    }
}

#[cfg(test)]
pub(crate) use mock::{mocked_clock, MockClock};
