/// Describes how the primary encodes the body of change events.
///
/// The descriptor in effect is always the last one seen on the stream. A rotate to a new log
/// resets it to `base()` until the new log's own descriptor arrives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub binlog_version: u16,
    pub server_version: String,
    pub created: u32,
    /// Change events carry a trailing crc32.
    pub checksum: bool,
}

impl FormatDescriptor {
    pub const BASE_VERSION: u16 = 3;
    pub const CURRENT_VERSION: u16 = 4;

    pub fn base() -> Self {
        FormatDescriptor {
            binlog_version: Self::BASE_VERSION,
            server_version: String::new(),
            created: 0,
            checksum: false,
        }
    }

    pub fn current(server_version: impl Into<String>, checksum: bool) -> Self {
        FormatDescriptor {
            binlog_version: Self::CURRENT_VERSION,
            server_version: server_version.into(),
            created: chrono::Utc::now().timestamp() as u32,
            checksum,
        }
    }

    pub fn is_supported(&self) -> bool {
        (Self::BASE_VERSION..=Self::CURRENT_VERSION).contains(&self.binlog_version)
    }

    /// Version 4 change bodies carry a status block between the database name and the data.
    pub(super) fn has_status_block(&self) -> bool {
        self.binlog_version >= Self::CURRENT_VERSION
    }
}

impl Default for FormatDescriptor {
    fn default() -> Self {
        Self::base()
    }
}
