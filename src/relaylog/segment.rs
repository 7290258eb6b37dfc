use crate::relaylog::errors::io_error;
use crate::relaylog::RelayLogError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

// Segment file layout:
//
// 0..4 : magic
// then records of
//   len   : u32 LE, payload length
//   crc   : u32 LE, crc32 of payload
//   bytes : payload, one raw event
pub(super) const MAGIC: [u8; 4] = [0xfe, b'R', b'L', b'G'];
pub(super) const FIRST_RECORD_OFFSET: u64 = MAGIC.len() as u64;
const RECORD_HEADER_LEN: u64 = 8;

pub(super) fn record_len(payload: &[u8]) -> u64 {
    RECORD_HEADER_LEN + payload.len() as u64
}

pub(super) struct SegmentWriter {
    name: String,
    path: PathBuf,
    file: File,
    len: u64,
    // A failed write may have left part of a record past `len`.
    torn: bool,
}

impl SegmentWriter {
    pub(super) fn create(dir: &Path, name: &str) -> Result<Self, RelayLogError> {
        let path = dir.join(name);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(io_error(&path))?;
        file.write_all(&MAGIC).map_err(io_error(&path))?;
        file.sync_all().map_err(io_error(&path))?;

        Ok(SegmentWriter {
            name: name.to_string(),
            path,
            file,
            len: FIRST_RECORD_OFFSET,
            torn: false,
        })
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn len(&self) -> u64 {
        self.len
    }

    /// Returns once the record is on disk. The returned offset is the end of the new record.
    pub(super) fn append(&mut self, payload: &[u8]) -> Result<u64, RelayLogError> {
        if self.torn {
            self.cut_torn_tail()?;
        }

        let mut record = BytesMut::with_capacity(record_len(payload) as usize);
        record.put_u32_le(payload.len() as u32);
        record.put_u32_le(crc32fast::hash(payload));
        record.put_slice(payload);

        let written = self.file.write_all(&record).and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            self.torn = true;
            return Err(io_error(&self.path)(e));
        }
        self.len += record.len() as u64;

        Ok(self.len)
    }

    /// Drops whatever a failed append left behind and moves the file cursor back to `len`.
    fn cut_torn_tail(&mut self) -> Result<(), RelayLogError> {
        self.file.set_len(self.len).map_err(io_error(&self.path))?;
        self.file.seek(SeekFrom::Start(self.len)).map_err(io_error(&self.path))?;
        self.file.sync_data().map_err(io_error(&self.path))?;
        self.torn = false;
        Ok(())
    }
}

pub(super) struct SegmentReader {
    name: String,
    path: PathBuf,
    file: File,
    offset: u64,
}

impl SegmentReader {
    pub(super) fn open(dir: &Path, name: &str, offset: u64) -> Result<Self, RelayLogError> {
        let path = dir.join(name);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RelayLogError::MissingSegment(name.to_string()));
            }
            Err(e) => return Err(io_error(&path)(e)),
        };

        let mut magic = [0u8; 4];
        let magic_ok = match file.read_exact(&mut magic) {
            Ok(()) => magic == MAGIC,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
            Err(e) => return Err(io_error(&path)(e)),
        };
        if !magic_ok {
            return Err(RelayLogError::Corrupted {
                segment: name.to_string(),
                offset: 0,
                reason: "bad segment magic",
            });
        }

        let offset = offset.max(FIRST_RECORD_OFFSET);
        file.seek(SeekFrom::Start(offset)).map_err(io_error(&path))?;

        Ok(SegmentReader {
            name: name.to_string(),
            path,
            file,
            offset,
        })
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn offset(&self) -> u64 {
        self.offset
    }

    pub(super) fn file_len(&self) -> Result<u64, RelayLogError> {
        Ok(self.file.metadata().map_err(io_error(&self.path))?.len())
    }

    /// Reads the record starting at the current offset, if it ends at or before `limit`.
    /// Anything between the offset and `limit` that is not a whole, intact record is corruption.
    pub(super) fn read_next(&mut self, limit: u64) -> Result<Option<Bytes>, RelayLogError> {
        if self.offset >= limit {
            return Ok(None);
        }
        if self.offset + RECORD_HEADER_LEN > limit {
            return Err(self.corrupted("truncated record header"));
        }

        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        self.file.read_exact(&mut header).map_err(io_error(&self.path))?;
        let mut header = &header[..];
        let len = header.get_u32_le() as u64;
        let crc = header.get_u32_le();

        if self.offset + RECORD_HEADER_LEN + len > limit {
            return Err(self.corrupted("truncated record"));
        }

        let mut payload = vec![0u8; len as usize];
        self.file.read_exact(&mut payload).map_err(io_error(&self.path))?;
        if crc32fast::hash(&payload) != crc {
            return Err(self.corrupted("record checksum mismatch"));
        }

        self.offset += RECORD_HEADER_LEN + len;
        Ok(Some(Bytes::from(payload)))
    }

    fn corrupted(&self, reason: &'static str) -> RelayLogError {
        RelayLogError::Corrupted {
            segment: self.name.clone(),
            offset: self.offset,
            reason,
        }
    }
}

/// Cuts a torn final record off a segment left behind by a crash. Returns the number of bytes
/// removed. A bad record followed by more data is real corruption and is reported as such.
pub(super) fn repair_tail(dir: &Path, name: &str) -> Result<u64, RelayLogError> {
    let mut reader = SegmentReader::open(dir, name, FIRST_RECORD_OFFSET)?;
    let file_len = reader.file_len()?;

    loop {
        let record_start = reader.offset();
        match reader.read_next(file_len) {
            Ok(Some(_)) => continue,
            Ok(None) => return Ok(0),
            Err(e @ RelayLogError::Corrupted { .. }) => {
                if !is_last_record(&reader, record_start, file_len)? {
                    return Err(e);
                }
                let path = dir.join(name);
                let file = OpenOptions::new().write(true).open(&path).map_err(io_error(&path))?;
                file.set_len(record_start).map_err(io_error(&path))?;
                file.sync_all().map_err(io_error(&path))?;
                return Ok(file_len - record_start);
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_last_record(reader: &SegmentReader, record_start: u64, file_len: u64) -> Result<bool, RelayLogError> {
    if record_start + RECORD_HEADER_LEN > file_len {
        return Ok(true);
    }

    let mut file = File::open(&reader.path).map_err(io_error(&reader.path))?;
    file.seek(SeekFrom::Start(record_start)).map_err(io_error(&reader.path))?;
    let mut len = [0u8; 4];
    file.read_exact(&mut len).map_err(io_error(&reader.path))?;
    let declared_end = record_start + RECORD_HEADER_LEN + u32::from_le_bytes(len) as u64;

    Ok(declared_end >= file_len)
}
