use crate::event::header::{type_code, EventHeader, ARTIFICIAL_FLAG};
use crate::event::FormatDescriptor;
use crate::position::Position;
use bytes::Bytes;

#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub header: EventHeader,
    pub payload: Payload,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Rotate(Rotate),
    FormatDescriptor(FormatDescriptor),
    Heartbeat(Heartbeat),
    Change(Change),
    Stop,
}

/// The primary switched to a new log. `position` is where the stream continues in it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rotate {
    pub next_log_name: String,
    pub position: u64,
}

/// Sent by an idle primary. Carries the primary's current position, which must match what the
/// replica has fetched so far.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    pub log_name: String,
    pub position: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Change {
    pub kind: ChangeKind,
    pub database: String,
    pub status: Bytes,
    pub data: Bytes,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Statement,
    Rows(RowsOp),
    Commit { xid: u64 },
    Unknown(u8),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RowsOp {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub(super) fn from_type_code(code: u8) -> Self {
        match code {
            type_code::STATEMENT => ChangeKind::Statement,
            type_code::INSERT_ROWS => ChangeKind::Rows(RowsOp::Insert),
            type_code::UPDATE_ROWS => ChangeKind::Rows(RowsOp::Update),
            type_code::DELETE_ROWS => ChangeKind::Rows(RowsOp::Delete),
            // Xid is filled in by the decoder.
            type_code::COMMIT => ChangeKind::Commit { xid: 0 },
            other => ChangeKind::Unknown(other),
        }
    }

    pub(super) fn type_code(&self) -> u8 {
        match self {
            ChangeKind::Statement => type_code::STATEMENT,
            ChangeKind::Rows(RowsOp::Insert) => type_code::INSERT_ROWS,
            ChangeKind::Rows(RowsOp::Update) => type_code::UPDATE_ROWS,
            ChangeKind::Rows(RowsOp::Delete) => type_code::DELETE_ROWS,
            ChangeKind::Commit { .. } => type_code::COMMIT,
            ChangeKind::Unknown(code) => *code,
        }
    }
}

impl Change {
    /// Statement text, for `Statement` changes only.
    pub fn statement(&self) -> Option<&str> {
        match self.kind {
            ChangeKind::Statement => std::str::from_utf8(&self.data).ok(),
            _ => None,
        }
    }

    fn statement_is(&self, keyword: &str) -> bool {
        self.statement()
            .map(|text| text.trim().eq_ignore_ascii_case(keyword))
            .unwrap_or(false)
    }
}

impl Event {
    pub fn log_pos(&self) -> u64 {
        self.header.log_pos
    }

    pub fn origin_server_id(&self) -> u32 {
        self.header.origin_server_id
    }

    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn is_artificial(&self) -> bool {
        self.header.is_artificial()
    }

    pub fn as_change(&self) -> Option<&Change> {
        match &self.payload {
            Payload::Change(change) => Some(change),
            _ => None,
        }
    }

    pub fn starts_group(&self) -> bool {
        self.as_change().map(|c| c.statement_is("BEGIN")).unwrap_or(false)
    }

    pub fn ends_group(&self) -> bool {
        match self.as_change() {
            Some(Change {
                kind: ChangeKind::Commit { .. },
                ..
            }) => true,
            Some(change) => change.statement_is("COMMIT") || change.statement_is("ROLLBACK"),
            None => false,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.header.timestamp = timestamp;
        self
    }

    pub fn rotate(origin_server_id: u32, next_log_name: impl Into<String>, position: u64) -> Self {
        Event {
            header: EventHeader::new(type_code::ROTATE, origin_server_id, 0),
            payload: Payload::Rotate(Rotate {
                next_log_name: next_log_name.into(),
                position,
            }),
        }
    }

    /// A rotate the replica makes up to move its applied primary position past events it
    /// never relayed.
    pub fn artificial_rotate(to: &Position) -> Self {
        let mut event = Event::rotate(0, to.log_name(), to.offset());
        event.header.flags |= ARTIFICIAL_FLAG;
        event
    }

    pub fn format_descriptor(origin_server_id: u32, format: FormatDescriptor, log_pos: u64) -> Self {
        Event {
            header: EventHeader::new(type_code::FORMAT_DESCRIPTOR, origin_server_id, log_pos),
            payload: Payload::FormatDescriptor(format),
        }
    }

    pub fn heartbeat(origin_server_id: u32, at: &Position) -> Self {
        Event {
            header: EventHeader::new(type_code::HEARTBEAT, origin_server_id, 0),
            payload: Payload::Heartbeat(Heartbeat {
                log_name: at.log_name().to_string(),
                position: at.offset(),
            }),
        }
    }

    pub fn statement(origin_server_id: u32, log_pos: u64, database: &str, text: &str) -> Self {
        Event::change(
            origin_server_id,
            log_pos,
            ChangeKind::Statement,
            database,
            Bytes::copy_from_slice(text.as_bytes()),
        )
    }

    pub fn rows(origin_server_id: u32, log_pos: u64, database: &str, op: RowsOp, data: Bytes) -> Self {
        Event::change(origin_server_id, log_pos, ChangeKind::Rows(op), database, data)
    }

    pub fn commit(origin_server_id: u32, log_pos: u64, xid: u64) -> Self {
        Event::change(origin_server_id, log_pos, ChangeKind::Commit { xid }, "", Bytes::new())
    }

    pub fn stop(origin_server_id: u32, log_pos: u64) -> Self {
        Event {
            header: EventHeader::new(type_code::STOP, origin_server_id, log_pos),
            payload: Payload::Stop,
        }
    }

    fn change(origin_server_id: u32, log_pos: u64, kind: ChangeKind, database: &str, data: Bytes) -> Self {
        Event {
            header: EventHeader::new(kind.type_code(), origin_server_id, log_pos),
            payload: Payload::Change(Change {
                kind,
                database: database.to_string(),
                status: Bytes::new(),
                data,
            }),
        }
    }
}
