use crate::event::DecodeError;
use bytes::{Buf, BufMut, BytesMut};

/// timestamp(4) type(1) origin(4) event_len(4) log_pos(8) flags(2), little endian.
pub const HEADER_LEN: usize = 23;

/// Set on events the replica fabricates itself. They never carry a primary position.
pub const ARTIFICIAL_FLAG: u16 = 0x20;

pub mod type_code {
    pub const STATEMENT: u8 = 2;
    pub const STOP: u8 = 3;
    pub const ROTATE: u8 = 4;
    pub const FORMAT_DESCRIPTOR: u8 = 15;
    pub const COMMIT: u8 = 16;
    pub const INSERT_ROWS: u8 = 23;
    pub const UPDATE_ROWS: u8 = 24;
    pub const DELETE_ROWS: u8 = 25;
    pub const HEARTBEAT: u8 = 27;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventHeader {
    pub timestamp: u32,
    pub type_code: u8,
    pub origin_server_id: u32,
    pub event_len: u32,
    /// Position in the primary's log right after this event. Zero when the event does not
    /// correspond to a primary position.
    pub log_pos: u64,
    pub flags: u16,
}

impl EventHeader {
    pub fn new(type_code: u8, origin_server_id: u32, log_pos: u64) -> Self {
        EventHeader {
            timestamp: chrono::Utc::now().timestamp() as u32,
            type_code,
            origin_server_id,
            event_len: 0,
            log_pos,
            flags: 0,
        }
    }

    pub fn is_artificial(&self) -> bool {
        self.flags & ARTIFICIAL_FLAG != 0
    }

    pub(super) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.timestamp);
        dst.put_u8(self.type_code);
        dst.put_u32_le(self.origin_server_id);
        dst.put_u32_le(self.event_len);
        dst.put_u64_le(self.log_pos);
        dst.put_u16_le(self.flags);
    }

    pub(super) fn decode(src: &mut &[u8]) -> Result<Self, DecodeError> {
        if src.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                what: "header",
                needed: HEADER_LEN,
                available: src.len(),
            });
        }

        Ok(EventHeader {
            timestamp: src.get_u32_le(),
            type_code: src.get_u8(),
            origin_server_id: src.get_u32_le(),
            event_len: src.get_u32_le(),
            log_pos: src.get_u64_le(),
            flags: src.get_u16_le(),
        })
    }
}
