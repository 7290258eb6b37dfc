//! The change-log event model shared by the fetcher, the relay log and the applier.
mod codec;
mod event;
mod format;
mod header;

pub use codec::DecodeError;
pub use codec::EncodeError;
pub use event::Change;
pub use event::ChangeKind;
pub use event::Event;
pub use event::Heartbeat;
pub use event::Payload;
pub use event::Rotate;
pub use event::RowsOp;
pub use format::FormatDescriptor;
pub use header::type_code;
pub use header::EventHeader;
pub use header::ARTIFICIAL_FLAG;
pub use header::HEADER_LEN;
