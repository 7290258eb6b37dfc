use crate::event::{Event, FormatDescriptor, Payload};
use crate::position::Position;
use crate::relaylog::segment::{SegmentReader, FIRST_RECORD_OFFSET};
use crate::relaylog::{RelayLog, RelayLogError};
use crate::sync::StopCheck;
use bytes::Bytes;
use std::sync::Arc;

/// Sequential reader over the relay log.
///
/// Tracks the format descriptor in effect at its position, so change events are always decoded
/// the way the primary encoded them. On the hot segment it waits for new appends instead of
/// reporting end of log.
pub struct RelayCursor {
    log: Arc<RelayLog>,
    reader: SegmentReader,
    format: FormatDescriptor,
}

impl RelayCursor {
    pub(super) fn open(log: Arc<RelayLog>, at: &Position) -> Result<Self, RelayLogError> {
        let mut reader = SegmentReader::open(log.dir(), at.log_name(), FIRST_RECORD_OFFSET)?;
        let mut format = FormatDescriptor::base();

        // Replay the descriptors that precede the requested offset.
        while reader.offset() < at.offset() {
            let raw = match reader.read_next(at.offset())? {
                Some(raw) => raw,
                None => break,
            };
            let position = Position::new(reader.name(), reader.offset());
            let event = decode(&raw, &format, position)?;
            if let Payload::FormatDescriptor(fd) = event.payload {
                format = fd;
            }
        }

        if reader.offset() != at.offset() {
            return Err(RelayLogError::Corrupted {
                segment: at.log_name().to_string(),
                offset: at.offset(),
                reason: "position is not a record boundary",
            });
        }

        Ok(RelayCursor { log, reader, format })
    }

    /// Position of the next record to be read.
    pub fn position(&self) -> Position {
        Position::new(self.reader.name(), self.reader.offset())
    }

    pub fn format(&self) -> &FormatDescriptor {
        &self.format
    }

    /// Returns the next event, waiting for the fetcher if needed. `Ok(None)` means stopped.
    pub async fn next(&mut self, stop: &StopCheck) -> Result<Option<Event>, RelayLogError> {
        loop {
            if stop.should_stop() {
                return Ok(None);
            }

            let hot = self.log.hot_position();
            if self.reader.name() == hot.log_name() {
                if let Some(raw) = self.reader.read_next(hot.offset())? {
                    return self.accept(raw).map(Some);
                }
                if let Some(skipped) = self.log.take_ignored_until(&hot) {
                    return Ok(Some(Event::artificial_rotate(&skipped)));
                }
                self.log.reader_caught_up();
                if !self.log.wait_for_append(&hot, stop).await {
                    return Ok(None);
                }
            } else {
                let end = self.reader.file_len()?;
                if let Some(raw) = self.reader.read_next(end)? {
                    return self.accept(raw).map(Some);
                }
                let next = self
                    .log
                    .segment_after(self.reader.name())
                    .ok_or_else(|| RelayLogError::MissingSegment(format!("after {}", self.reader.name())))?;
                self.reader = SegmentReader::open(self.log.dir(), &next, FIRST_RECORD_OFFSET)?;
            }
        }
    }

    fn accept(&mut self, raw: Bytes) -> Result<Event, RelayLogError> {
        let event = decode(&raw, &self.format, self.position())?;
        if let Payload::FormatDescriptor(fd) = &event.payload {
            self.format = fd.clone();
        }
        Ok(event)
    }
}

fn decode(raw: &[u8], format: &FormatDescriptor, position: Position) -> Result<Event, RelayLogError> {
    Event::decode(raw, format).map_err(|source| RelayLogError::Decode { position, source })
}
