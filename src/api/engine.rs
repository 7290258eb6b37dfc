use crate::event::{Event, Payload};
use crate::position::Position;
use std::collections::HashSet;

/// The local execution engine that replayed changes are handed to.
///
/// Only change events reach the engine. Calls arrive one at a time and in the primary's order.
/// A group that fails part way through is rolled back with `rollback()` before it is retried.
pub trait Engine: Send + 'static {
    fn apply(&mut self, event: &Event, context: &ApplyContext) -> ApplyOutcome;

    /// Discards any effect of the currently open group.
    fn rollback(&mut self);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyContext {
    pub origin_server_id: u32,
    pub timestamp: u32,
    pub database: String,
    /// Primary position right after this event.
    pub primary_position: Position,
    pub in_group: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    RecoverableError(ApplyError),
    FatalError(ApplyError),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("engine error {code}: {message}")]
pub struct ApplyError {
    pub code: u16,
    pub message: String,
}

impl ApplyError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        ApplyError {
            code,
            message: message.into(),
        }
    }
}

/// Accepts everything. Handy for wiring tests and dry runs.
pub struct NoOpEngine {
    logger: slog::Logger,
}

impl NoOpEngine {
    pub fn new(logger: slog::Logger) -> Self {
        NoOpEngine { logger }
    }
}

impl Engine for NoOpEngine {
    fn apply(&mut self, event: &Event, context: &ApplyContext) -> ApplyOutcome {
        if let Payload::Change(change) = &event.payload {
            slog::debug!(
                self.logger,
                "Applying {:?} on {:?} at {:?}",
                change.kind,
                context.database,
                context.primary_position
            );
        }
        ApplyOutcome::Applied
    }

    fn rollback(&mut self) {
        slog::debug!(self.logger, "Rollback");
    }
}

pub(crate) enum Verdict {
    Applied,
    Retry(ApplyError),
    Fatal(ApplyError),
}

/// Decides which engine failures are worth retrying: whatever the engine calls recoverable,
/// plus any configured error code.
pub(crate) struct RetryPolicy {
    recoverable_codes: HashSet<u16>,
}

impl RetryPolicy {
    pub(crate) fn new(recoverable_codes: &[u16]) -> Self {
        RetryPolicy {
            recoverable_codes: recoverable_codes.iter().copied().collect(),
        }
    }

    pub(crate) fn judge(&self, outcome: ApplyOutcome) -> Verdict {
        match outcome {
            ApplyOutcome::Applied => Verdict::Applied,
            ApplyOutcome::RecoverableError(e) => Verdict::Retry(e),
            ApplyOutcome::FatalError(e) if self.recoverable_codes.contains(&e.code) => Verdict::Retry(e),
            ApplyOutcome::FatalError(e) => Verdict::Fatal(e),
        }
    }
}
