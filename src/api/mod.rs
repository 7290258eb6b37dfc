//! This mod is meant to hold most of the code for the library's client-facing API.
mod engine;
mod options;
mod replication;
mod status;
mod wiring;

pub use engine::ApplyContext;
pub use engine::ApplyError;
pub use engine::ApplyOutcome;
pub use engine::Engine;
pub use engine::NoOpEngine;
pub use options::ReplicationOptions;
pub use replication::Replication;
pub use replication::ReplicationError;
pub use status::ApplierState;
pub use status::FetcherState;
pub use status::ReplicationStatus;
pub use status::WorkerError;
pub use wiring::try_create_replication;
pub use wiring::ReplicationConfig;
pub use wiring::ReplicationCreationError;

// So the workers can use them.
pub(crate) use engine::RetryPolicy;
pub(crate) use engine::Verdict;
pub(crate) use options::ReplicationOptionsValidated;
