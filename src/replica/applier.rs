use crate::api::{ApplierState, ApplyContext, ApplyError, Engine, RetryPolicy, Verdict};
use crate::event::{Event, Payload};
use crate::position::Position;
use crate::relaylog::RelayLog;
use crate::replica::recovery::{RecoveryStore, RelayInfo};
use crate::replica::relay_state::{RelayState, UntilCondition};
use crate::replica::settings::ReplicaSettings;
use crate::replica::shared::{worker_error, SharedState};
use crate::replica::ApplierError;
use crate::sync::{self, Clock, RealClock, StopCheck};
use std::sync::Arc;

enum Step {
    Next,
    // Re-read the current group from its start.
    Reposition,
    Finish,
}

/// Replays the relay log into the execution engine, one group at a time.
///
/// Group positions only move once the engine accepted a whole group, and are persisted before
/// the next event is read. A group is retried from its first event after a recoverable engine
/// error, up to the configured number of times.
pub(crate) struct Applier<C: Clock = RealClock> {
    logger: slog::Logger,
    engine: Box<dyn Engine>,
    policy: RetryPolicy,
    relay: Arc<RelayLog>,
    recovery: Arc<RecoveryStore>,
    shared: Arc<SharedState>,
    settings: Arc<ReplicaSettings>,
    clock: C,
    stop: StopCheck,

    state: RelayState,
}

impl<C: Clock> Applier<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        logger: slog::Logger,
        engine: Box<dyn Engine>,
        relay: Arc<RelayLog>,
        recovery: Arc<RecoveryStore>,
        shared: Arc<SharedState>,
        settings: Arc<ReplicaSettings>,
        clock: C,
        stop: StopCheck,
    ) -> Self {
        let state = shared.applier(|status| status.relay.clone());
        let policy = RetryPolicy::new(&settings.options.recoverable_error_codes);

        Applier {
            logger,
            engine,
            policy,
            relay,
            recovery,
            shared,
            settings,
            clock,
            stop,
            state,
        }
    }

    /// Runs until stopped, until the until condition is reached, or until a fatal error.
    /// Hands the engine back so the applier can be started again.
    pub(crate) async fn run(mut self) -> Box<dyn Engine> {
        slog::info!(
            self.logger,
            "Applier starting from relay {:?}, primary {:?}",
            self.state.group_relay_position,
            self.state.group_primary_position
        );
        self.shared.applier(|status| {
            status.running = true;
            status.last_error = None;
        });

        let result = self.apply_all().await;
        if let Err(e) = &result {
            let position = self.state.event_primary_position.clone();
            slog::error!(self.logger, "Applier failed at {:?}: {}", position, e);
            let error = worker_error(e.to_string(), e.code(), position);
            self.shared.applier(|status| status.last_error = Some(error));
        }
        let engine_failed = matches!(
            result,
            Err(ApplierError::Apply(_)) | Err(ApplierError::RetriesExhausted { .. })
        );
        if self.state.in_group || engine_failed {
            slog::info!(self.logger, "Rolling back incomplete group.");
            self.engine.rollback();
        }
        self.state.rewind_to_group();
        slog::info!(self.logger, "Applier stopped at {:?}", self.state.group_primary_position);

        let state = self.state.clone();
        self.shared.applier(|status| {
            status.relay = state;
            status.running = false;
            status.state = ApplierState::Stopped;
        });
        self.engine
    }

    async fn apply_all(&mut self) -> Result<(), ApplierError> {
        self.state.rewind_to_group();
        let mut cursor = self.relay.cursor(&self.state.group_relay_position)?;

        loop {
            let idle = cursor.position() == self.relay.hot_position();
            self.set_state(if idle { ApplierState::Idle } else { ApplierState::Reading });

            let event = match cursor.next(&self.stop).await? {
                Some(event) => event,
                None => return Ok(()),
            };
            let step = self.handle(&event, cursor.position()).await?;
            self.publish();

            match step {
                Step::Next => {}
                Step::Reposition => cursor = self.relay.cursor(&self.state.group_relay_position)?,
                Step::Finish => return Ok(()),
            }
        }
    }

    async fn handle(&mut self, event: &Event, relay_after: Position) -> Result<Step, ApplierError> {
        let is_change = event.as_change().is_some();

        if self.state.skip_counter > 0 && is_change {
            let closed = self.state.advance(event, relay_after);
            // The last skipped event drags the rest of its group along.
            if self.state.skip_counter > 1 || closed {
                self.state.skip_counter -= 1;
            }
            slog::debug!(self.logger, "Skipped event ending at {:?}", self.state.event_primary_position);
            if closed {
                self.commit()?;
            }
            return Ok(Step::Next);
        }

        if self.until_reached(event)? {
            slog::info!(self.logger, "Reached until condition {:?}", self.state.until);
            self.state.until = None;
            return Ok(Step::Finish);
        }

        let own = event.origin_server_id() == self.settings.server_id;
        if !is_change || (own && !self.settings.options.replicate_same_server_id) {
            if self.state.advance(event, relay_after) {
                self.commit()?;
            }
            return Ok(Step::Next);
        }

        self.set_state(ApplierState::Applying);
        let context = self.context(event);
        let outcome = self.engine.apply(event, &context);
        match self.policy.judge(outcome) {
            Verdict::Applied => {
                if self.state.advance(event, relay_after) {
                    self.commit()?;
                }
                Ok(Step::Next)
            }
            Verdict::Retry(e) => self.back_off(e).await,
            // `run` rolls back on the way out.
            Verdict::Fatal(e) => Err(ApplierError::Apply(e)),
        }
    }

    fn context(&self, event: &Event) -> ApplyContext {
        let primary_position = match event.log_pos() {
            0 => self.state.event_primary_position.clone(),
            log_pos => self.state.event_primary_position.with_offset(log_pos),
        };
        let database = match &event.payload {
            Payload::Change(change) => change.database.clone(),
            _ => String::new(),
        };

        ApplyContext {
            origin_server_id: event.origin_server_id(),
            timestamp: event.timestamp(),
            database,
            primary_position,
            in_group: self.state.in_group || event.starts_group(),
        }
    }

    fn until_reached(&self, event: &Event) -> Result<bool, ApplierError> {
        let (current, target) = match &self.state.until {
            None => return Ok(false),
            Some(UntilCondition::Relay(target)) => {
                let current = if self.state.in_group {
                    self.state.group_relay_position.clone()
                } else {
                    self.state.event_relay_position.clone()
                };
                (current, target)
            }
            Some(UntilCondition::Primary(target)) => (self.state.primary_position_before(event), target),
        };
        if current.is_unset() {
            return Ok(false);
        }

        current.reached(target).ok_or_else(|| ApplierError::IncomparableUntil {
            until: target.clone(),
            current,
        })
    }

    async fn back_off(&mut self, error: ApplyError) -> Result<Step, ApplierError> {
        let retries = self.state.transaction_retries;
        if retries >= self.settings.options.max_transaction_retries {
            return Err(ApplierError::RetriesExhausted { retries, source: error });
        }

        self.engine.rollback();
        self.state.rewind_to_group();
        self.set_state(ApplierState::RetryWait);
        let options = &self.settings.options;
        let delay = (options.retry_backoff_unit * retries).min(options.retry_backoff_ceiling);
        slog::warn!(
            self.logger,
            "Retrying group at {:?} in {:?} (retry {}): {}",
            self.state.group_primary_position,
            delay,
            retries + 1,
            error
        );
        if !sync::sleep_or_stop(&mut self.clock, delay, &self.stop).await {
            return Ok(Step::Finish);
        }

        self.state.transaction_retries = retries + 1;
        self.shared.applier(|status| status.retried_transactions += 1);
        Ok(Step::Reposition)
    }

    fn commit(&mut self) -> Result<(), ApplierError> {
        self.recovery.save_relay(&RelayInfo {
            relay_position: self.state.group_relay_position.clone(),
            primary_position: self.state.group_primary_position.clone(),
        })?;
        if self.settings.options.relay_log_purge {
            self.relay.purge_consumed(&self.state.group_relay_position)?;
        }
        self.set_state(ApplierState::Committed);
        Ok(())
    }

    fn publish(&self) {
        let state = self.state.clone();
        self.shared.applier(|status| status.relay = state);
    }

    fn set_state(&self, state: ApplierState) {
        self.shared.applier(|status| status.state = state);
    }
}
