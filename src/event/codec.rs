use crate::event::header::{type_code, EventHeader, HEADER_LEN};
use crate::event::{Change, ChangeKind, Event, FormatDescriptor, Heartbeat, Payload, Rotate};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const CHECKSUM_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated {what}: need {needed} bytes, have {available}")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("event declares {declared} bytes but {actual} were received")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("event checksum mismatch")]
    ChecksumMismatch,
    #[error("{0} is not valid utf-8")]
    InvalidText(&'static str),
    #[error("unsupported binlog version {0}")]
    UnsupportedFormat(u16),
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("{field} is {len} bytes long, an event allows at most {limit}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        limit: usize,
    },
}

impl Event {
    /// Serializes the event. `format` must be the descriptor in effect at this point of the
    /// stream; it only affects change events.
    pub fn encode(&self, format: &FormatDescriptor) -> Result<Bytes, EncodeError> {
        let mut body = BytesMut::new();
        let mut checksummed = false;
        match &self.payload {
            Payload::Rotate(rotate) => {
                body.put_u64_le(rotate.position);
                body.put_slice(rotate.next_log_name.as_bytes());
            }
            Payload::FormatDescriptor(fd) => {
                body.put_u16_le(fd.binlog_version);
                body.put_u32_le(fd.created);
                body.put_u8(fd.checksum as u8);
                body.put_slice(fd.server_version.as_bytes());
            }
            Payload::Heartbeat(heartbeat) => {
                body.put_u64_le(heartbeat.position);
                body.put_slice(heartbeat.log_name.as_bytes());
            }
            Payload::Change(change) => {
                encode_change(change, format, &mut body)?;
                checksummed = format.checksum;
            }
            Payload::Stop => {}
        }

        let trailer = if checksummed { CHECKSUM_LEN } else { 0 };
        let event_len = HEADER_LEN + body.len() + trailer;
        check_len("event", event_len, u32::MAX as usize)?;
        let mut header = self.header.clone();
        header.event_len = event_len as u32;

        let mut out = BytesMut::with_capacity(header.event_len as usize);
        header.encode(&mut out);
        out.put_slice(&body);
        if checksummed {
            let crc = crc32fast::hash(&out);
            out.put_u32_le(crc);
        }

        Ok(out.freeze())
    }

    pub fn decode(raw: &[u8], format: &FormatDescriptor) -> Result<Event, DecodeError> {
        let mut src = raw;
        let header = EventHeader::decode(&mut src)?;
        if header.event_len as usize != raw.len() {
            return Err(DecodeError::LengthMismatch {
                declared: header.event_len as usize,
                actual: raw.len(),
            });
        }

        let payload = match header.type_code {
            type_code::ROTATE => {
                let position = read_u64(&mut src, "rotate")?;
                Payload::Rotate(Rotate {
                    next_log_name: read_text(src, "rotate log name")?,
                    position,
                })
            }
            type_code::FORMAT_DESCRIPTOR => {
                need(src, 7, "format descriptor")?;
                let binlog_version = src.get_u16_le();
                let created = src.get_u32_le();
                let checksum = src.get_u8() != 0;
                let fd = FormatDescriptor {
                    binlog_version,
                    server_version: read_text(src, "server version")?,
                    created,
                    checksum,
                };
                if !fd.is_supported() {
                    return Err(DecodeError::UnsupportedFormat(fd.binlog_version));
                }
                Payload::FormatDescriptor(fd)
            }
            type_code::HEARTBEAT => {
                let position = read_u64(&mut src, "heartbeat")?;
                Payload::Heartbeat(Heartbeat {
                    log_name: read_text(src, "heartbeat log name")?,
                    position,
                })
            }
            type_code::STOP => Payload::Stop,
            other => {
                let mut body = src;
                if format.checksum {
                    need(body, CHECKSUM_LEN, "checksum")?;
                    let split = raw.len() - CHECKSUM_LEN;
                    let mut trailer = &raw[split..];
                    let expected = trailer.get_u32_le();
                    if crc32fast::hash(&raw[..split]) != expected {
                        return Err(DecodeError::ChecksumMismatch);
                    }
                    body = &body[..body.len() - CHECKSUM_LEN];
                }
                Payload::Change(decode_change(ChangeKind::from_type_code(other), body, format)?)
            }
        };

        Ok(Event { header, payload })
    }
}

fn encode_change(change: &Change, format: &FormatDescriptor, dst: &mut BytesMut) -> Result<(), EncodeError> {
    if let ChangeKind::Commit { xid } = change.kind {
        dst.put_u64_le(xid);
        return Ok(());
    }

    check_len("database name", change.database.len(), u8::MAX as usize)?;
    dst.put_u8(change.database.len() as u8);
    dst.put_slice(change.database.as_bytes());
    if format.has_status_block() {
        check_len("status block", change.status.len(), u16::MAX as usize)?;
        dst.put_u16_le(change.status.len() as u16);
        dst.put_slice(&change.status);
    }
    dst.put_slice(&change.data);
    Ok(())
}

fn check_len(field: &'static str, len: usize, limit: usize) -> Result<(), EncodeError> {
    if len > limit {
        return Err(EncodeError::FieldTooLong { field, len, limit });
    }
    Ok(())
}

fn decode_change(kind: ChangeKind, mut src: &[u8], format: &FormatDescriptor) -> Result<Change, DecodeError> {
    if let ChangeKind::Commit { .. } = kind {
        let xid = read_u64(&mut src, "commit")?;
        return Ok(Change {
            kind: ChangeKind::Commit { xid },
            database: String::new(),
            status: Bytes::new(),
            data: Bytes::new(),
        });
    }

    need(src, 1, "database length")?;
    let db_len = src.get_u8() as usize;
    need(src, db_len, "database")?;
    let database = read_text(&src[..db_len], "database")?;
    src.advance(db_len);

    let status = if format.has_status_block() {
        need(src, 2, "status length")?;
        let status_len = src.get_u16_le() as usize;
        need(src, status_len, "status block")?;
        let status = Bytes::copy_from_slice(&src[..status_len]);
        src.advance(status_len);
        status
    } else {
        Bytes::new()
    };

    Ok(Change {
        kind,
        database,
        status,
        data: Bytes::copy_from_slice(src),
    })
}

fn need(src: &[u8], needed: usize, what: &'static str) -> Result<(), DecodeError> {
    if src.len() < needed {
        return Err(DecodeError::Truncated {
            what,
            needed,
            available: src.len(),
        });
    }
    Ok(())
}

fn read_u64(src: &mut &[u8], what: &'static str) -> Result<u64, DecodeError> {
    need(src, 8, what)?;
    Ok(src.get_u64_le())
}

fn read_text(src: &[u8], what: &'static str) -> Result<String, DecodeError> {
    String::from_utf8(src.to_vec()).map_err(|_| DecodeError::InvalidText(what))
}
