mod api;
mod event;
mod position;
mod relaylog;
mod replica;
mod sync;

pub use api::try_create_replication;
pub use api::ApplierState;
pub use api::ApplyContext;
pub use api::ApplyError;
pub use api::ApplyOutcome;
pub use api::Engine;
pub use api::FetcherState;
pub use api::NoOpEngine;
pub use api::Replication;
pub use api::ReplicationConfig;
pub use api::ReplicationCreationError;
pub use api::ReplicationError;
pub use api::ReplicationOptions;
pub use api::ReplicationStatus;
pub use api::WorkerError;
pub use event::Change;
pub use event::ChangeKind;
pub use event::DecodeError;
pub use event::EncodeError;
pub use event::Event;
pub use event::EventHeader;
pub use event::FormatDescriptor;
pub use event::Heartbeat;
pub use event::Payload;
pub use event::Rotate;
pub use event::RowsOp;
pub use position::Position;
pub use replica::ApplierError;
pub use replica::FetchError;
pub use replica::ProtocolError;
pub use replica::UntilCondition;
