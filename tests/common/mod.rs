use bytes::{BufMut, Bytes, BytesMut};
use logship::{ApplyContext, ApplyOutcome, Engine, Event, FormatDescriptor, Position};
use slog::Drain;
use std::convert::TryInto;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::Duration;

pub const PRIMARY_ID: u32 = 1;
pub const LOG_NAME: &str = "bin.000001";
const FIRST_OFFSET: u64 = 4;

/// A primary that serves one log over the real wire protocol. Events can be appended while
/// replicas are connected.
pub struct FakePrimary {
    pub port: u16,
    shared: Arc<Shared>,
}

struct Shared {
    log: Mutex<Binlog>,
    appended: Notify,
    requests: Mutex<Vec<Position>>,
    drop_next_after: Mutex<Option<usize>>,
    corrupt_heartbeats: AtomicBool,
}

struct Binlog {
    // End offset and encoded event.
    events: Vec<(u64, Bytes)>,
    next_offset: u64,
    format: FormatDescriptor,
}

impl FakePrimary {
    pub async fn start() -> FakePrimary {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Shared {
            log: Mutex::new(Binlog {
                events: Vec::new(),
                next_offset: FIRST_OFFSET,
                format: FormatDescriptor::current("fake-primary-1.0", true),
            }),
            appended: Notify::new(),
            requests: Mutex::new(Vec::new()),
            drop_next_after: Mutex::new(None),
            corrupt_heartbeats: AtomicBool::new(false),
        });

        let accept_shared = shared.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let shared = accept_shared.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, shared).await;
                });
            }
        });

        FakePrimary { port, shared }
    }

    /// Appends `event` at the end of the log and returns the position right after it.
    pub fn append(&self, mut event: Event) -> Position {
        let end = {
            let mut log = self.shared.log.lock().unwrap();
            let len = event.encode(&log.format).unwrap().len() as u64;
            event.header.log_pos = log.next_offset + len;
            let raw = event.encode(&log.format).unwrap();
            log.next_offset += len;
            let end = log.next_offset;
            log.events.push((end, raw));
            end
        };
        self.shared.appended.notify_waiters();

        Position::new(LOG_NAME, end)
    }

    pub fn statement(&self, text: &str) -> Position {
        self.append(Event::statement(PRIMARY_ID, 0, "test", text))
    }

    pub fn transaction(&self, statements: &[&str], xid: u64) -> Position {
        self.statement("BEGIN");
        for statement in statements {
            self.statement(statement);
        }
        self.append(Event::commit(PRIMARY_ID, 0, xid))
    }

    /// Positions replicas asked to stream from, in order.
    pub fn requests(&self) -> Vec<Position> {
        self.shared.requests.lock().unwrap().clone()
    }

    /// The next connection is closed after sending `count` events.
    pub fn drop_next_connection_after(&self, count: usize) {
        *self.shared.drop_next_after.lock().unwrap() = Some(count);
    }

    pub fn corrupt_heartbeats(&self) {
        self.shared.corrupt_heartbeats.store(true, Ordering::SeqCst);
    }
}

async fn serve(mut socket: TcpStream, shared: Arc<Shared>) -> io::Result<()> {
    let mut greeting = BytesMut::new();
    greeting.put_u8(10);
    put_short_text(&mut greeting, "fake-primary-1.0");
    greeting.put_u32_le(PRIMARY_ID);
    greeting.put_u32_le(0);
    greeting.put_u32_le(chrono::Utc::now().timestamp() as u32);
    write_packet(&mut socket, &greeting).await?;

    let handshake = read_packet(&mut socket).await?;
    let heartbeat_ms = u32::from_le_bytes(handshake[8..12].try_into().unwrap());
    let heartbeat_period = Duration::from_millis(heartbeat_ms as u64);
    write_packet(&mut socket, &[0x00]).await?;

    let request = loop {
        let packet = read_packet(&mut socket).await?;
        match packet[0] {
            0x15 => write_packet(&mut socket, &[0x00]).await?,
            0x12 => break packet,
            _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "unknown command")),
        }
    };
    let offset = u64::from_le_bytes(request[1..9].try_into().unwrap());
    let log_name = String::from_utf8(request[15..].to_vec()).unwrap();
    shared.requests.lock().unwrap().push(Position::new(log_name.as_str(), offset));

    let start = if log_name.is_empty() { FIRST_OFFSET } else { offset };
    let drop_after = shared.drop_next_after.lock().unwrap().take();
    let format = shared.log.lock().unwrap().format.clone();

    // Each stream opens with a rotate to the requested log and that log's descriptor.
    let base = FormatDescriptor::base();
    send_event(&mut socket, &Event::rotate(PRIMARY_ID, LOG_NAME, start).encode(&base).unwrap()).await?;
    send_event(&mut socket, &Event::format_descriptor(PRIMARY_ID, format, 0).encode(&base).unwrap()).await?;

    let mut position = start;
    let mut sent = 0;
    loop {
        let notified = shared.appended.notified();
        let pending: Vec<(u64, Bytes)> = {
            let log = shared.log.lock().unwrap();
            log.events.iter().filter(|(end, _)| *end > position).cloned().collect()
        };

        if pending.is_empty() {
            if heartbeat_period == Duration::from_millis(0) {
                notified.await;
                continue;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(heartbeat_period) => {
                    let mut at = position;
                    if shared.corrupt_heartbeats.load(Ordering::SeqCst) {
                        at += 1000;
                    }
                    let heartbeat = Event::heartbeat(PRIMARY_ID, &Position::new(LOG_NAME, at));
                    send_event(&mut socket, &heartbeat.encode(&base).unwrap()).await?;
                }
            }
            continue;
        }

        for (end, raw) in pending {
            if drop_after == Some(sent) {
                return Ok(());
            }
            send_event(&mut socket, &raw).await?;
            sent += 1;
            position = end;
        }
    }
}

fn put_short_text(dst: &mut BytesMut, text: &str) {
    dst.put_u8(text.len() as u8);
    dst.put_slice(text.as_bytes());
}

async fn send_event(socket: &mut TcpStream, raw: &[u8]) -> io::Result<()> {
    let mut packet = BytesMut::with_capacity(raw.len() + 1);
    packet.put_u8(0x00);
    packet.put_slice(raw);
    write_packet(socket, &packet).await
}

async fn write_packet(socket: &mut TcpStream, payload: &[u8]) -> io::Result<()> {
    socket.write_u32_le(payload.len() as u32).await?;
    socket.write_all(payload).await
}

async fn read_packet(socket: &mut TcpStream) -> io::Result<Vec<u8>> {
    let len = socket.read_u32_le().await? as usize;
    let mut payload = vec![0; len];
    socket.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Records what was committed, shared with the test after the engine moved into the replica.
#[derive(Clone, Default)]
pub struct Applied(Arc<Mutex<Vec<String>>>);

impl Applied {
    pub fn statements(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

pub struct RecordingEngine {
    applied: Applied,
    pending: Vec<String>,
}

impl RecordingEngine {
    pub fn new() -> (Box<dyn Engine>, Applied) {
        let applied = Applied::default();
        let engine = RecordingEngine {
            applied: applied.clone(),
            pending: Vec::new(),
        };
        (Box::new(engine), applied)
    }
}

impl Engine for RecordingEngine {
    fn apply(&mut self, event: &Event, context: &ApplyContext) -> ApplyOutcome {
        let text = match event.as_change().and_then(|change| change.statement()) {
            Some(statement) => statement.to_string(),
            None => "COMMIT".to_string(),
        };
        self.pending.push(text);
        if !context.in_group || event.ends_group() {
            self.applied.0.lock().unwrap().append(&mut self.pending);
        }
        ApplyOutcome::Applied
    }

    fn rollback(&mut self) {
        self.pending.clear();
    }
}

pub fn create_root_logger_for_stdout() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}
