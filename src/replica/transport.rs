use crate::position::Position;
use crate::replica::FetchError;
use bytes::Bytes;

/// What the primary announces when a connection opens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Greeting {
    pub protocol_version: u8,
    pub server_version: String,
    pub server_id: u32,
    pub capabilities: u32,
    /// Primary's wall clock, seconds since the epoch.
    pub unix_time: u32,
}

/// The replica's answer to the greeting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub capabilities: u32,
    pub server_id: u32,
    /// Zero disables heartbeats.
    pub heartbeat_period_ms: u32,
    pub user: String,
    pub password: String,
}

/// Lets the primary list this replica among its known replicas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Registration {
    pub server_id: u32,
    pub host: String,
    pub user: String,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum StreamPacket {
    /// One raw event, header included.
    Event(Bytes),
    EndOfStream,
}

#[async_trait::async_trait]
pub(crate) trait PrimaryConnector: Send + Sync {
    /// Opens a session and completes the handshake.
    async fn connect(&self, handshake: &Handshake) -> Result<Box<dyn PrimarySession>, FetchError>;
}

#[async_trait::async_trait]
pub(crate) trait PrimarySession: Send {
    fn greeting(&self) -> &Greeting;

    async fn register(&mut self, registration: &Registration) -> Result<(), FetchError>;

    async fn request_stream(&mut self, from: &Position, server_id: u32) -> Result<(), FetchError>;

    /// Waits for the next stream packet, up to the session's read timeout.
    async fn next_packet(&mut self) -> Result<StreamPacket, FetchError>;
}
