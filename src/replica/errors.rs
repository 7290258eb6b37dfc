use crate::api::ApplyError;
use crate::event::DecodeError;
use crate::position::Position;
use crate::relaylog::RelayLogError;
use crate::replica::recovery::RecoveryError;
use std::io;

// Error codes a primary may send that mean retrying the same request cannot help.
pub(crate) const PRIMARY_OUT_OF_MEMORY: u16 = 1037;
pub(crate) const PRIMARY_PACKET_TOO_LARGE: u16 = 1153;
pub(crate) const PRIMARY_FATAL_LOG_READ: u16 = 1236;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("network failure: {0}")]
    Network(#[from] io::Error),
    #[error("timed out waiting for the primary")]
    Timeout,
    #[error("primary closed the stream")]
    EndOfStream,
    #[error("primary replied with error {code}: {message}")]
    Refused { code: u16, message: String },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("primary is out of resources: {0}")]
    ResourceExhausted(String),
    #[error("gave up after {attempts} connection attempts, last error: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    #[error(transparent)]
    RelayLog(#[from] RelayLogError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error("fetcher stopped")]
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("primary and replica share server id {0}; enable same-origin replication to allow this")]
    IdentityCollision(u32),
    #[error("primary speaks protocol version {0}, which is not supported")]
    UnsupportedVersion(u8),
    #[error("heartbeat at {received} is not compatible with fetched position {expected}")]
    HeartbeatMismatch { expected: Position, received: Position },
    #[error("packet of {size} bytes exceeds the {limit} byte limit")]
    PacketTooLarge { size: usize, limit: usize },
    #[error("primary failed fatally with error {code}: {message}")]
    PrimaryFatal { code: u16, message: String },
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("{field} is {len} bytes long, the protocol allows at most {limit}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        limit: usize,
    },
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl FetchError {
    /// Classifies an error reply from the primary.
    pub(crate) fn from_primary(code: u16, message: String) -> Self {
        match code {
            PRIMARY_OUT_OF_MEMORY => FetchError::ResourceExhausted(message),
            PRIMARY_PACKET_TOO_LARGE | PRIMARY_FATAL_LOG_READ => {
                FetchError::Protocol(ProtocolError::PrimaryFatal { code, message })
            }
            _ => FetchError::Refused { code, message },
        }
    }

    /// Whether reconnecting and re-requesting the stream may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_) | FetchError::Timeout | FetchError::EndOfStream | FetchError::Refused { .. }
        )
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            FetchError::Refused { code, .. } => Some(*code),
            FetchError::Protocol(ProtocolError::PrimaryFatal { code, .. }) => Some(*code),
            FetchError::ResourceExhausted(_) => Some(PRIMARY_OUT_OF_MEMORY),
            _ => None,
        }
    }
}

impl From<DecodeError> for FetchError {
    fn from(e: DecodeError) -> Self {
        FetchError::Protocol(ProtocolError::Decode(e))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApplierError {
    #[error(transparent)]
    RelayLog(#[from] RelayLogError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error("{0}")]
    Apply(ApplyError),
    #[error("transaction retried {retries} time(s) in vain, giving up: {source}")]
    RetriesExhausted { retries: u32, source: ApplyError },
    #[error("until position {until} cannot be compared with {current}")]
    IncomparableUntil { until: Position, current: Position },
}

impl ApplierError {
    pub fn code(&self) -> Option<u16> {
        match self {
            ApplierError::Apply(e) | ApplierError::RetriesExhausted { source: e, .. } => Some(e.code),
            _ => None,
        }
    }
}
