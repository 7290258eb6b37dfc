use crate::api::{Engine, ReplicationStatus};
use crate::position::Position;
use crate::relaylog::RelayLog;
use crate::replica::{
    Applier, Fetcher, PrimaryConnector, RecoveryStore, ReplicaSettings, SharedState, UntilCondition, WorkerHandle,
};
use crate::sync::{self, RealClock};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;

// How often a stop request is re-broadcast while waiting for a worker to exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("The applier must be stopped first")]
    ApplierRunning,
    #[error("The applier task panicked and took the execution engine with it")]
    EngineLost,
}

enum ApplierSlot {
    Stopped(Box<dyn Engine>),
    Running(WorkerHandle<Box<dyn Engine>>),
    Lost,
}

/// Handle to a replica: a fetcher copying the primary's stream into the relay log, and an
/// applier replaying the relay log into the execution engine.
///
/// Each worker can be started and stopped on its own. Both operations are idempotent. Dropping
/// the handle stops both workers.
pub struct Replication {
    logger: slog::Logger,
    settings: Arc<ReplicaSettings>,
    connector: Arc<dyn PrimaryConnector>,
    relay: Arc<RelayLog>,
    recovery: Arc<RecoveryStore>,
    shared: Arc<SharedState>,

    fetcher: Mutex<Option<WorkerHandle<()>>>,
    applier: Mutex<ApplierSlot>,
}

impl Replication {
    pub(crate) fn new(
        logger: slog::Logger,
        settings: Arc<ReplicaSettings>,
        connector: Arc<dyn PrimaryConnector>,
        relay: Arc<RelayLog>,
        recovery: Arc<RecoveryStore>,
        shared: Arc<SharedState>,
        engine: Box<dyn Engine>,
    ) -> Self {
        Replication {
            logger,
            settings,
            connector,
            relay,
            recovery,
            shared,
            fetcher: Mutex::new(None),
            applier: Mutex::new(ApplierSlot::Stopped(engine)),
        }
    }

    pub async fn start(&self) -> Result<(), ReplicationError> {
        self.start_fetcher().await;
        self.start_applier().await
    }

    pub async fn stop(&self) -> Result<(), ReplicationError> {
        self.stop_fetcher().await;
        self.stop_applier().await
    }

    pub async fn start_fetcher(&self) {
        let mut slot = self.fetcher.lock().await;
        if let Some(worker) = slot.take() {
            if !worker.is_finished() {
                *slot = Some(worker);
                return;
            }
            self.reap_fetcher(worker.join().await);
        }

        let (stopper, stop_check) = sync::stop_signal();
        let fetcher = Fetcher::new(
            self.logger.new(slog::o!("worker" => "fetcher")),
            self.connector.clone(),
            self.relay.clone(),
            self.recovery.clone(),
            self.shared.clone(),
            self.settings.clone(),
            RealClock,
            stop_check,
        );
        // Visible to `status()` before the task gets to run.
        self.shared.fetcher(|status| status.running = true);
        *slot = Some(WorkerHandle::spawn(stopper, fetcher.run()));
    }

    pub async fn stop_fetcher(&self) {
        let mut slot = self.fetcher.lock().await;
        if let Some(worker) = slot.take() {
            let relay = self.relay.clone();
            let result = worker.stop(STOP_POLL_INTERVAL, move || relay.wake_all()).await;
            self.reap_fetcher(result);
        }
    }

    pub async fn start_applier(&self) -> Result<(), ReplicationError> {
        let mut slot = self.applier.lock().await;
        let engine = match std::mem::replace(&mut *slot, ApplierSlot::Lost) {
            ApplierSlot::Running(worker) if !worker.is_finished() => {
                *slot = ApplierSlot::Running(worker);
                return Ok(());
            }
            ApplierSlot::Running(worker) => self.reap_applier(worker.join().await)?,
            ApplierSlot::Stopped(engine) => engine,
            ApplierSlot::Lost => return Err(ReplicationError::EngineLost),
        };

        let (stopper, stop_check) = sync::stop_signal();
        let applier = Applier::new(
            self.logger.new(slog::o!("worker" => "applier")),
            engine,
            self.relay.clone(),
            self.recovery.clone(),
            self.shared.clone(),
            self.settings.clone(),
            RealClock,
            stop_check,
        );
        self.shared.applier(|status| status.running = true);
        *slot = ApplierSlot::Running(WorkerHandle::spawn(stopper, applier.run()));
        Ok(())
    }

    /// Starts the applier, which stops by itself right before the first event at or past
    /// `until`.
    pub async fn start_applier_until(&self, until: UntilCondition) -> Result<(), ReplicationError> {
        self.set_until(Some(until)).await?;
        self.start_applier().await
    }

    pub async fn stop_applier(&self) -> Result<(), ReplicationError> {
        let mut slot = self.applier.lock().await;
        if let ApplierSlot::Running(_) = &*slot {
            if let ApplierSlot::Running(worker) = std::mem::replace(&mut *slot, ApplierSlot::Lost) {
                let relay = self.relay.clone();
                let result = worker.stop(STOP_POLL_INTERVAL, move || relay.wake_all()).await;
                *slot = ApplierSlot::Stopped(self.reap_applier(result)?);
            }
        }
        Ok(())
    }

    /// Makes the applier skip the next `count` events once started. A partially skipped group is
    /// skipped to its end.
    pub async fn set_skip_counter(&self, count: u64) -> Result<(), ReplicationError> {
        let slot = self.applier.lock().await;
        if is_running(&slot) {
            return Err(ReplicationError::ApplierRunning);
        }
        self.shared.applier(|status| status.relay.skip_counter = count);
        Ok(())
    }

    pub async fn set_until(&self, until: Option<UntilCondition>) -> Result<(), ReplicationError> {
        let slot = self.applier.lock().await;
        if is_running(&slot) {
            return Err(ReplicationError::ApplierRunning);
        }
        self.shared.applier(|status| status.relay.until = until);
        Ok(())
    }

    pub fn status(&self) -> ReplicationStatus {
        let fetcher = self.shared.fetcher(|status| status.clone());
        let applier = self.shared.applier(|status| status.clone());
        let hot = self.relay.hot_position();

        let seconds_behind = if !(fetcher.running && applier.running) {
            None
        } else if applier.relay.event_relay_position == hot {
            Some(0)
        } else {
            lag_seconds(
                Utc::now().timestamp(),
                applier.relay.last_event_timestamp,
                fetcher.clock_skew_secs,
            )
        };

        ReplicationStatus {
            fetcher_running: fetcher.running,
            fetcher_state: fetcher.state,
            applier_running: applier.running,
            applier_state: applier.state,
            fetched_primary_position: fetcher.position,
            relay_position: applier.relay.event_relay_position,
            group_relay_position: applier.relay.group_relay_position,
            group_primary_position: applier.relay.group_primary_position,
            last_fetcher_error: fetcher.last_error,
            last_applier_error: applier.last_error,
            seconds_behind,
            relay_space_used: self.relay.space_used(),
            primary_server_id: fetcher.primary_server_id,
            heartbeats_received: fetcher.heartbeats_received,
            last_heartbeat: fetcher.last_heartbeat,
            retried_transactions: applier.retried_transactions,
            skip_counter: applier.relay.skip_counter,
            until: applier.relay.until,
        }
    }

    /// Primary position of the last committed group.
    pub fn applied_position(&self) -> Position {
        self.shared.applier(|status| status.relay.group_primary_position.clone())
    }

    fn reap_fetcher(&self, result: Result<(), tokio::task::JoinError>) {
        if let Err(e) = result {
            slog::error!(self.logger, "Fetcher task panicked: {}", e);
            self.shared.fetcher(|status| status.running = false);
        }
    }

    fn reap_applier(
        &self,
        result: Result<Box<dyn Engine>, tokio::task::JoinError>,
    ) -> Result<Box<dyn Engine>, ReplicationError> {
        result.map_err(|e| {
            slog::error!(self.logger, "Applier task panicked: {}", e);
            self.shared.applier(|status| status.running = false);
            ReplicationError::EngineLost
        })
    }
}

fn is_running(slot: &ApplierSlot) -> bool {
    matches!(slot, ApplierSlot::Running(worker) if !worker.is_finished())
}

/// Age of the last applied event at `now`, corrected for the primary's clock skew. A primary
/// clock running ahead of ours never yields a negative lag.
fn lag_seconds(now: i64, last_event_timestamp: Option<u32>, clock_skew_secs: i64) -> Option<u64> {
    last_event_timestamp.map(|timestamp| (now - timestamp as i64 - clock_skew_secs).max(0) as u64)
}
