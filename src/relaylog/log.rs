use crate::event::{Event, FormatDescriptor, Payload, ARTIFICIAL_FLAG};
use crate::position::Position;
use crate::relaylog::errors::io_error;
use crate::relaylog::index::SegmentIndex;
use crate::relaylog::segment::{self, SegmentReader, SegmentWriter};
use crate::relaylog::{RelayCursor, RelayLogError};
use crate::sync::{Monitor, StopCheck, WaitOutcome};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub struct RelayLogConfig {
    pub directory: PathBuf,
    pub basename: String,
    /// A segment is rotated once it grows past this many bytes.
    pub max_segment_size: u64,
    /// Appends block while the relay log holds more than this many bytes. Zero is unlimited.
    pub space_limit: u64,
    /// Delete every existing segment on open.
    pub discard_existing: bool,
}

/// The relay log has one writer (the fetcher) and one reader (the applier's cursor).
///
/// Segment bookkeeping and file writes happen under `writer`. Readers learn how far they may
/// read from `appended`, which is only advanced once a record is durable. Space accounting has
/// its own monitor so the fetcher can wait for space without blocking readers.
pub struct RelayLog {
    logger: slog::Logger,
    dir: PathBuf,
    max_segment_size: u64,
    relayed_at_open: RelayedTail,
    writer: Mutex<Writer>,
    appended: Monitor<AppendState>,
    space: Monitor<SpaceState>,
}

struct Writer {
    index: SegmentIndex,
    segment: SegmentWriter,
    // Written as the first record of every new segment.
    format: FormatDescriptor,
}

struct AppendState {
    hot: Position,
    // Set when the fetcher skips events after the last appended one.
    ignored_until: Option<Position>,
}

struct SpaceState {
    total: u64,
    limit: u64,
    ignore_limit: bool,
}

/// How far into the primary's log the newest relayed event reached.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct RelayedTail {
    // From the newest rotate still in the relay log. `None` once that rotate was purged.
    log_name: Option<String>,
    offset: Option<u64>,
}

impl RelayLog {
    pub fn open(logger: slog::Logger, config: RelayLogConfig) -> Result<Arc<RelayLog>, RelayLogError> {
        let dir = config.directory;
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        let mut index = SegmentIndex::load(&dir, &config.basename)?;
        if config.discard_existing {
            for name in index.names() {
                remove_segment(&dir, name)?;
            }
            slog::info!(logger, "Discarded {} existing relay log segment(s).", index.names().len());
            index.retain(|_| false)?;
        } else {
            let missing: Vec<String> = index
                .names()
                .iter()
                .filter(|name| !dir.join(name.as_str()).exists())
                .cloned()
                .collect();
            if !missing.is_empty() {
                slog::warn!(logger, "Relay log segments listed in index are missing: {:?}", missing);
                index.retain(|name| !missing.contains(name))?;
            }
            if let Some(last) = index.names().last() {
                let removed = segment::repair_tail(&dir, last)?;
                if removed > 0 {
                    slog::warn!(logger, "Truncated {} torn byte(s) from relay log segment {}.", removed, last);
                }
            }
        }

        let relayed_at_open = scan_relayed_tail(&dir, index.names())?;
        if relayed_at_open != RelayedTail::default() {
            slog::debug!(logger, "Newest relayed event reached {:?}", relayed_at_open);
        }

        let mut total = 0;
        for name in index.names() {
            let path = dir.join(name);
            total += fs::metadata(&path).map_err(io_error(&path))?.len();
        }

        let format = FormatDescriptor::base();
        let (segment, created) = create_segment(&dir, &mut index, &format)?;
        total += created;
        let hot = Position::new(segment.name(), segment.len());
        slog::info!(logger, "Relay log open. Writing to {:?}, {} bytes in use.", hot, total);

        Ok(Arc::new(RelayLog {
            logger,
            dir,
            max_segment_size: config.max_segment_size,
            relayed_at_open,
            writer: Mutex::new(Writer { index, segment, format }),
            appended: Monitor::new(AppendState {
                hot,
                ignored_until: None,
            }),
            space: Monitor::new(SpaceState {
                total,
                limit: config.space_limit,
                ignore_limit: false,
            }),
        }))
    }

    /// Durably appends one raw event. `event` must be the decoded form of `raw`. Returns the
    /// relay position right after the new record.
    pub fn append(&self, event: &Event, raw: &[u8]) -> Result<Position, RelayLogError> {
        let mut writer = self.lock_writer();

        let end = writer.segment.append(raw)?;
        if let Payload::FormatDescriptor(format) = &event.payload {
            writer.format = format.clone();
        }

        let hot = Position::new(writer.segment.name(), end);
        self.appended.update(|state| {
            state.hot = hot.clone();
            state.ignored_until = None;
        });
        self.space.update(|state| state.total += segment::record_len(raw));

        if end >= self.max_segment_size {
            let format = writer.format.clone();
            self.rotate_locked(&mut writer, format)?;
        }

        Ok(hot)
    }

    /// Closes the hot segment and starts a new one whose first record is `prefix`.
    pub fn rotate(&self, prefix: FormatDescriptor) -> Result<Position, RelayLogError> {
        let mut writer = self.lock_writer();
        self.rotate_locked(&mut writer, prefix)
    }

    fn rotate_locked(&self, writer: &mut Writer, prefix: FormatDescriptor) -> Result<Position, RelayLogError> {
        let (segment, created) = create_segment(&self.dir, &mut writer.index, &prefix)?;
        writer.segment = segment;
        writer.format = prefix;

        let hot = Position::new(writer.segment.name(), writer.segment.len());
        slog::debug!(self.logger, "Rotated relay log to {:?}", hot);
        self.appended.update(|state| state.hot = hot.clone());
        self.space.update(|state| state.total += created);

        Ok(hot)
    }

    /// Records that the primary's stream advanced to `until` without anything being appended.
    pub fn set_ignored_until(&self, until: Position) {
        self.appended.update(|state| state.ignored_until = Some(until));
    }

    /// Hands out the ignored span, but only to a reader that has seen everything up to `hot`.
    pub(super) fn take_ignored_until(&self, hot: &Position) -> Option<Position> {
        let mut state = self.appended.lock();
        if state.hot != *hot {
            return None;
        }
        state.ignored_until.take()
    }

    /// The primary position right after the newest event that was in the relay log when it was
    /// opened. A rotate that was purged since leaves the log name unknown; `current_log_name`
    /// fills it in.
    pub fn relayed_primary_position(&self, current_log_name: &str) -> Option<Position> {
        let tail = &self.relayed_at_open;
        match (&tail.log_name, tail.offset) {
            (Some(name), Some(offset)) => Some(Position::new(name.as_str(), offset)),
            (None, Some(offset)) if !current_log_name.is_empty() => Some(Position::new(current_log_name, offset)),
            _ => None,
        }
    }

    pub fn hot_position(&self) -> Position {
        self.appended.lock().hot.clone()
    }

    /// Position of the first record of the oldest live segment.
    pub fn first_position(&self) -> Position {
        let writer = self.lock_writer();
        let name = writer.index.first().unwrap_or_else(|| writer.segment.name());
        Position::new(name, segment::FIRST_RECORD_OFFSET)
    }

    pub fn segments(&self) -> Vec<String> {
        self.lock_writer().index.names().to_vec()
    }

    pub fn cursor(self: &Arc<Self>, from: &Position) -> Result<RelayCursor, RelayLogError> {
        let from = if from.is_unset() {
            self.first_position()
        } else {
            from.clone()
        };
        RelayCursor::open(self.clone(), &from)
    }

    /// Waits until an append moves the hot position past `seen`, or an ignored span shows up.
    /// Returns false if stopped first.
    pub(super) async fn wait_for_append(&self, seen: &Position, stop: &StopCheck) -> bool {
        let outcome = self
            .appended
            .wait_until(stop, None, |state| {
                (state.hot != *seen || state.ignored_until.is_some()).then(|| ())
            })
            .await;

        matches!(outcome, WaitOutcome::Ready(()))
    }

    pub(super) fn segment_after(&self, name: &str) -> Option<String> {
        self.lock_writer().index.next_after(name).map(String::from)
    }

    pub(super) fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deletes every segment older than the one holding `group`. The segment being read or
    /// written is never older than the group position, so it always survives.
    pub fn purge_consumed(&self, group: &Position) -> Result<usize, RelayLogError> {
        let mut writer = self.lock_writer();
        let count = match writer.index.position_of(group.log_name()) {
            Some(count) if count > 0 => count,
            _ => return Ok(0),
        };

        let mut freed = 0;
        for name in &writer.index.names()[..count] {
            freed += remove_segment(&self.dir, name)?;
        }
        let removed = writer.index.remove_first(count)?;
        slog::debug!(self.logger, "Purged consumed relay log segments {:?}", removed);

        self.space.update(|state| {
            state.total = state.total.saturating_sub(freed);
            state.ignore_limit = false;
        });
        Ok(count)
    }

    pub fn space_used(&self) -> u64 {
        self.space.lock().total
    }

    /// Blocks while the relay log is over its space limit. Returns false if stopped first.
    pub async fn wait_for_space(&self, stop: &StopCheck) -> bool {
        let outcome = self
            .space
            .wait_until(stop, None, |state| {
                (state.limit == 0 || state.total <= state.limit || state.ignore_limit).then(|| ())
            })
            .await;

        matches!(outcome, WaitOutcome::Ready(()))
    }

    /// Called by a reader that has caught up. If the log is over its limit, let the writer
    /// through anyway: nothing can be purged until the writer rotates.
    pub(super) fn reader_caught_up(&self) {
        let over_limit = {
            let state = self.space.lock();
            state.limit != 0 && state.total > state.limit && !state.ignore_limit
        };
        if over_limit {
            slog::debug!(self.logger, "Relay log reader caught up while over space limit. Lifting limit.");
            self.space.update(|state| state.ignore_limit = true);
        }
    }

    /// Re-broadcasts both conditions so that waiters re-check their stop signal.
    pub(crate) fn wake_all(&self) {
        self.appended.notify_all();
        self.space.notify_all();
    }

    fn lock_writer(&self) -> MutexGuard<'_, Writer> {
        self.writer.lock().expect("RelayLog writer mutex guard poison")
    }
}

fn create_segment(
    dir: &Path,
    index: &mut SegmentIndex,
    prefix: &FormatDescriptor,
) -> Result<(SegmentWriter, u64), RelayLogError> {
    let name = index.next_name();
    let mut segment = SegmentWriter::create(dir, &name)?;

    let mut prefix_event = Event::format_descriptor(0, prefix.clone(), 0);
    prefix_event.header.flags |= ARTIFICIAL_FLAG;
    let len = segment.append(&prefix_event.encode(prefix)?)?;
    index.push(name)?;

    Ok((segment, len))
}

/// Walks the segments newest first until one holds a rotate from the primary. Offsets come from
/// the newest event with a known end position, as the fetcher tracks them.
fn scan_relayed_tail(dir: &Path, names: &[String]) -> Result<RelayedTail, RelayLogError> {
    let mut newest_offset = None;
    for name in names.iter().rev() {
        let mut reader = SegmentReader::open(dir, name, segment::FIRST_RECORD_OFFSET)?;
        let end = reader.file_len()?;
        let mut format = FormatDescriptor::base();
        let mut rotated_to = None;
        let mut last_offset = None;

        while let Some(raw) = reader.read_next(end)? {
            let position = Position::new(name.as_str(), reader.offset());
            let event = Event::decode(&raw, &format).map_err(|source| RelayLogError::Decode { position, source })?;
            match &event.payload {
                Payload::Rotate(rotate) if !event.is_artificial() => {
                    rotated_to = Some(rotate.next_log_name.clone());
                    last_offset = Some(rotate.position);
                }
                Payload::FormatDescriptor(fd) => {
                    format = fd.clone();
                    if event.log_pos() != 0 {
                        last_offset = Some(event.log_pos());
                    }
                }
                _ if event.log_pos() != 0 => last_offset = Some(event.log_pos()),
                _ => {}
            }
        }

        newest_offset = newest_offset.or(last_offset);
        if rotated_to.is_some() {
            return Ok(RelayedTail {
                log_name: rotated_to,
                offset: newest_offset,
            });
        }
    }

    Ok(RelayedTail {
        log_name: None,
        offset: newest_offset,
    })
}

fn remove_segment(dir: &Path, name: &str) -> Result<u64, RelayLogError> {
    let path = dir.join(name);
    let len = match fs::metadata(&path) {
        Ok(metadata) => metadata.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_error(&path)(e)),
    };
    fs::remove_file(&path).map_err(io_error(&path))?;
    Ok(len)
}
