use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A byte offset inside a named log file. Used for both the primary's change log and the local
/// relay log.
///
/// Positions in different logs are not comparable through `PartialOrd`. Callers that need to
/// order positions across files (e.g. an until condition) use `reached()`, which compares the
/// numeric file extension first.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    log_name: String,
    offset: u64,
}

impl Position {
    pub fn new(log_name: impl Into<String>, offset: u64) -> Self {
        Position {
            log_name: log_name.into(),
            offset,
        }
    }

    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// True for the default position, meaning no history at all.
    pub fn is_unset(&self) -> bool {
        self.log_name.is_empty()
    }

    pub fn with_offset(&self, offset: u64) -> Position {
        Position {
            log_name: self.log_name.clone(),
            offset,
        }
    }

    /// Numeric extension of the log name, `7` for `primary-bin.000007`.
    pub fn log_sequence(&self) -> Option<u64> {
        let (_, extension) = self.log_name.rsplit_once('.')?;
        if extension.is_empty() || !extension.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        extension.parse().ok()
    }

    /// Whether `self` is at or past `target`. Returns `None` when the two log names have no
    /// comparable numeric extension.
    pub fn reached(&self, target: &Position) -> Option<bool> {
        if self.log_name == target.log_name {
            return Some(self.offset >= target.offset);
        }

        let mine = self.log_sequence()?;
        let theirs = target.log_sequence()?;
        Some(match mine.cmp(&theirs) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.offset >= target.offset,
        })
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.log_name != other.log_name {
            return None;
        }
        Some(self.offset.cmp(&other.offset))
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_name, self.offset)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_name, self.offset)
    }
}
