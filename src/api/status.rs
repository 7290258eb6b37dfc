use crate::position::Position;
use crate::replica::UntilCondition;
use chrono::{DateTime, Utc};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FetcherState {
    Stopped,
    Connecting,
    Registering,
    RequestingStream,
    Streaming,
    Reconnecting,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ApplierState {
    Stopped,
    Idle,
    Reading,
    Applying,
    Committed,
    RetryWait,
}

impl Default for FetcherState {
    fn default() -> Self {
        FetcherState::Stopped
    }
}

impl Default for ApplierState {
    fn default() -> Self {
        ApplierState::Stopped
    }
}

/// The error that stopped a worker, and where it stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerError {
    pub message: String,
    pub code: Option<u16>,
    pub position: Position,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct ReplicationStatus {
    pub fetcher_running: bool,
    pub fetcher_state: FetcherState,
    pub applier_running: bool,
    pub applier_state: ApplierState,

    /// Primary position right after the last fetched event.
    pub fetched_primary_position: Position,
    /// Relay position of the next event the applier will read.
    pub relay_position: Position,
    pub group_relay_position: Position,
    pub group_primary_position: Position,

    pub last_fetcher_error: Option<WorkerError>,
    pub last_applier_error: Option<WorkerError>,

    /// `None` unless both workers are running.
    pub seconds_behind: Option<u64>,
    pub relay_space_used: u64,
    pub primary_server_id: Option<u32>,
    pub heartbeats_received: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub retried_transactions: u64,
    pub skip_counter: u64,
    pub until: Option<UntilCondition>,
}
