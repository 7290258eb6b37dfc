use crate::event::{DecodeError, EncodeError};
use crate::position::Position;
use std::io;
use std::path::{Path, PathBuf};

/// Every relay log error is fatal to the worker that hits it.
#[derive(Debug, thiserror::Error)]
pub enum RelayLogError {
    #[error("relay log I/O failure on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("relay log segment {segment} is corrupted at offset {offset}: {reason}")]
    Corrupted {
        segment: String,
        offset: u64,
        reason: &'static str,
    },
    #[error("relay log segment {0} is missing")]
    MissingSegment(String),
    #[error("undecodable relay log event before {position}: {source}")]
    Decode { position: Position, source: DecodeError },
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

pub(super) fn io_error(path: &Path) -> impl FnOnce(io::Error) -> RelayLogError + '_ {
    move |source| RelayLogError::Io {
        path: path.to_path_buf(),
        source,
    }
}
