use crate::api::{ApplierState, FetcherState, WorkerError};
use crate::position::Position;
use crate::replica::relay_state::RelayState;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

#[derive(Clone, Default)]
pub(crate) struct FetcherStatus {
    pub running: bool,
    pub state: FetcherState,
    /// Where the next stream request starts. Survives fetcher restarts.
    pub position: Position,
    pub last_error: Option<WorkerError>,
    pub primary_server_id: Option<u32>,
    /// Local clock minus the primary's clock, in seconds.
    pub clock_skew_secs: i64,
    pub heartbeats_received: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Clone, Default)]
pub(crate) struct ApplierStatus {
    pub running: bool,
    pub state: ApplierState,
    /// Survives applier restarts.
    pub relay: RelayState,
    pub last_error: Option<WorkerError>,
    pub retried_transactions: u64,
}

/// What the workers publish for `status()`, and what a restarted worker resumes from.
pub(crate) struct SharedState {
    fetcher: Mutex<FetcherStatus>,
    applier: Mutex<ApplierStatus>,
}

impl SharedState {
    pub(crate) fn new(fetch_from: Position, relay: RelayState) -> Self {
        SharedState {
            fetcher: Mutex::new(FetcherStatus {
                position: fetch_from,
                ..Default::default()
            }),
            applier: Mutex::new(ApplierStatus {
                relay,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn fetcher<R>(&self, f: impl FnOnce(&mut FetcherStatus) -> R) -> R {
        let mut status = self.fetcher.lock().expect("SharedState.fetcher mutex guard poison");
        f(&mut *status)
    }

    pub(crate) fn applier<R>(&self, f: impl FnOnce(&mut ApplierStatus) -> R) -> R {
        let mut status = self.applier.lock().expect("SharedState.applier mutex guard poison");
        f(&mut *status)
    }
}

pub(crate) fn worker_error(message: String, code: Option<u16>, position: Position) -> WorkerError {
    WorkerError {
        message,
        code,
        position,
        at: Utc::now(),
    }
}
