mod monitor;
mod stop_signal;
mod time;

pub(crate) use monitor::Monitor;
pub(crate) use monitor::WaitOutcome;
pub(crate) use stop_signal::StopCheck;
pub(crate) use stop_signal::Stopper;
pub(crate) use time::sleep_or_stop;
pub(crate) use time::Clock;
pub(crate) use time::RealClock;

pub(crate) fn stop_signal() -> (Stopper, StopCheck) {
    stop_signal::new()
}

#[cfg(test)]
pub(crate) use time::mocked_clock;
#[cfg(test)]
pub(crate) use time::MockClock;
