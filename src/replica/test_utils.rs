use crate::api::{ApplyContext, ApplyOutcome, Engine, ReplicationOptions};
use crate::event::{Event, FormatDescriptor, Payload};
use crate::position::Position;
use crate::relaylog::{RelayLog, RelayLogConfig};
use crate::replica::recovery::RecoveryStore;
use crate::replica::relay_state::RelayState;
use crate::replica::settings::{PrimaryEndpoint, ReplicaSettings};
use crate::replica::shared::SharedState;
use crate::replica::transport::{Greeting, Handshake, PrimaryConnector, PrimarySession, Registration, StreamPacket};
use crate::replica::FetchError;
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

pub(crate) use crate::relaylog::test_support::test_logger;

pub(crate) fn test_options() -> ReplicationOptions {
    ReplicationOptions {
        connect_retry_interval: Some(Duration::from_millis(10)),
        max_connect_retries: Some(10),
        net_read_timeout: Some(Duration::from_secs(5)),
        heartbeat_period: Some(Duration::from_secs(1)),
        retry_backoff_unit: Some(Duration::from_millis(1)),
        retry_backoff_ceiling: Some(Duration::from_millis(5)),
        ..Default::default()
    }
}

pub(crate) fn test_settings(server_id: u32) -> Arc<ReplicaSettings> {
    Arc::new(ReplicaSettings {
        server_id,
        primary: PrimaryEndpoint {
            host: "primary.test".into(),
            port: 3306,
            user: "repl".into(),
            password: "secret".into(),
        },
        report: None,
        options: TryFrom::try_from(test_options()).unwrap(),
    })
}

/// A relay log, recovery store and shared state in a temp directory.
pub(crate) struct TestReplica {
    pub dir: tempfile::TempDir,
    pub relay: Arc<RelayLog>,
    pub recovery: Arc<RecoveryStore>,
    pub shared: Arc<SharedState>,
}

impl TestReplica {
    pub(crate) fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let relay = RelayLog::open(
            test_logger(),
            RelayLogConfig {
                directory: dir.path().join("relay"),
                basename: "relay".into(),
                max_segment_size: 1 << 20,
                space_limit: 0,
                discard_existing: false,
            },
        )
        .unwrap();
        let recovery = Arc::new(RecoveryStore::open(dir.path()).unwrap());
        let relay_state = RelayState::resume_at(relay.first_position(), Position::default());
        let shared = Arc::new(SharedState::new(Position::default(), relay_state));

        TestReplica {
            dir,
            relay,
            recovery,
            shared,
        }
    }
}

/// Hands out pre-built sessions, one per connection attempt. Once the script runs out every
/// attempt is refused.
pub(crate) struct ScriptedConnector {
    script: Mutex<VecDeque<Result<ScriptedSession, FetchError>>>,
    attempts: AtomicUsize,
    handshakes: Mutex<Vec<Handshake>>,
}

impl ScriptedConnector {
    pub(crate) fn new(script: Vec<Result<ScriptedSession, FetchError>>) -> Arc<Self> {
        Arc::new(ScriptedConnector {
            script: Mutex::new(script.into()),
            attempts: AtomicUsize::new(0),
            handshakes: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn handshakes(&self) -> Vec<Handshake> {
        self.handshakes.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl PrimaryConnector for ScriptedConnector {
    async fn connect(&self, handshake: &Handshake) -> Result<Box<dyn PrimarySession>, FetchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.handshakes.lock().unwrap().push(handshake.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(session)) => Ok(Box::new(session)),
            Some(Err(e)) => Err(e),
            None => Err(FetchError::Network(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "script exhausted",
            ))),
        }
    }
}

/// A primary that replays a fixed list of packets and then goes quiet.
pub(crate) struct ScriptedSession {
    pub greeting: Greeting,
    packets: VecDeque<Result<StreamPacket, FetchError>>,
    format: FormatDescriptor,
    requests: Arc<Mutex<Vec<Position>>>,
    registrations: Arc<Mutex<Vec<Registration>>>,
}

impl ScriptedSession {
    pub(crate) fn new(server_id: u32) -> Self {
        ScriptedSession {
            greeting: Greeting {
                protocol_version: 10,
                server_version: "8.0.0-test".into(),
                server_id,
                capabilities: 0,
                unix_time: chrono::Utc::now().timestamp() as u32,
            },
            packets: VecDeque::new(),
            format: FormatDescriptor::base(),
            requests: Arc::new(Mutex::new(Vec::new())),
            registrations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queues `event`, encoded the way the primary would at this point of its stream.
    pub(crate) fn send(mut self, event: &Event) -> Self {
        let raw = event.encode(&self.format).unwrap();
        match &event.payload {
            Payload::FormatDescriptor(fd) => self.format = fd.clone(),
            Payload::Rotate(_) => self.format = FormatDescriptor::base(),
            _ => {}
        }
        self.packets.push_back(Ok(StreamPacket::Event(raw)));
        self
    }

    pub(crate) fn send_raw(mut self, raw: bytes::Bytes) -> Self {
        self.packets.push_back(Ok(StreamPacket::Event(raw)));
        self
    }

    pub(crate) fn end_stream(mut self) -> Self {
        self.packets.push_back(Ok(StreamPacket::EndOfStream));
        self
    }

    pub(crate) fn fail_with(mut self, error: FetchError) -> Self {
        self.packets.push_back(Err(error));
        self
    }

    /// Positions streams were requested from, shared with the test.
    pub(crate) fn requests(&self) -> Arc<Mutex<Vec<Position>>> {
        self.requests.clone()
    }

    pub(crate) fn registrations(&self) -> Arc<Mutex<Vec<Registration>>> {
        self.registrations.clone()
    }
}

#[async_trait::async_trait]
impl PrimarySession for ScriptedSession {
    fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    async fn register(&mut self, registration: &Registration) -> Result<(), FetchError> {
        self.registrations.lock().unwrap().push(registration.clone());
        Ok(())
    }

    async fn request_stream(&mut self, from: &Position, _server_id: u32) -> Result<(), FetchError> {
        self.requests.lock().unwrap().push(from.clone());
        Ok(())
    }

    async fn next_packet(&mut self) -> Result<StreamPacket, FetchError> {
        match self.packets.pop_front() {
            Some(packet) => packet,
            None => std::future::pending().await,
        }
    }
}

/// What a `RecordingEngine` did, readable after the engine moved into the applier.
#[derive(Clone, Default)]
pub(crate) struct EngineLog {
    committed: Arc<Mutex<Vec<String>>>,
    attempts: Arc<AtomicUsize>,
    rollbacks: Arc<AtomicUsize>,
}

impl EngineLog {
    /// Descriptions of changes whose group committed, in order.
    pub(crate) fn committed(&self) -> Vec<String> {
        self.committed.lock().unwrap().clone()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

/// A transactional engine that records statements and can be told to fail.
pub(crate) struct RecordingEngine {
    log: EngineLog,
    pending: Vec<String>,
    outcomes: VecDeque<ApplyOutcome>,
}

impl RecordingEngine {
    pub(crate) fn new() -> (Self, EngineLog) {
        let log = EngineLog::default();
        let engine = RecordingEngine {
            log: log.clone(),
            pending: Vec::new(),
            outcomes: VecDeque::new(),
        };
        (engine, log)
    }

    /// The next calls to `apply` return these, in order. Later calls succeed.
    pub(crate) fn with_outcomes(mut self, outcomes: Vec<ApplyOutcome>) -> Self {
        self.outcomes = outcomes.into();
        self
    }
}

impl Engine for RecordingEngine {
    fn apply(&mut self, event: &Event, context: &ApplyContext) -> ApplyOutcome {
        self.log.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcomes.pop_front().unwrap_or(ApplyOutcome::Applied);
        if outcome != ApplyOutcome::Applied {
            return outcome;
        }

        let description = match event.as_change() {
            Some(change) => change
                .statement()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{:?}", change.kind)),
            None => format!("{:?}", event.payload),
        };
        self.pending.push(description);
        if !context.in_group || event.ends_group() {
            self.log.committed.lock().unwrap().append(&mut self.pending);
        }

        ApplyOutcome::Applied
    }

    fn rollback(&mut self) {
        self.log.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.pending.clear();
    }
}
