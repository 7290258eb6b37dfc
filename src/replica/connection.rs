use crate::position::Position;
use crate::replica::settings::ReplicaSettings;
use crate::replica::transport::{Handshake, PrimaryConnector, PrimarySession, Registration, StreamPacket};
use crate::replica::wire::MIN_PROTOCOL_VERSION;
use crate::replica::{FetchError, ProtocolError};
use crate::sync::{self, Clock, RealClock, StopCheck};
use chrono::Utc;
use std::io;
use std::sync::Arc;

/// Owns the session with the primary and the bounded reconnect policy.
///
/// The first retry after a failure is immediate. Later ones wait the configured interval, and
/// once the retry counter passes the configured maximum the manager gives up. The counter only
/// resets after an event is read successfully, so a primary that accepts connections and then
/// drops them still exhausts the budget.
pub(crate) struct ConnectionManager<C: Clock = RealClock> {
    logger: slog::Logger,
    connector: Arc<dyn PrimaryConnector>,
    settings: Arc<ReplicaSettings>,
    session: Option<Box<dyn PrimarySession>>,
    retry_count: u32,
    // Identical consecutive failures are only logged once.
    last_logged_error: Option<String>,
    primary_server_id: Option<u32>,
    clock_skew_secs: i64,
    clock: C,
    stop: StopCheck,
}

impl<C: Clock> ConnectionManager<C> {
    pub(crate) fn new(
        logger: slog::Logger,
        connector: Arc<dyn PrimaryConnector>,
        settings: Arc<ReplicaSettings>,
        clock: C,
        stop: StopCheck,
    ) -> Self {
        ConnectionManager {
            logger,
            connector,
            settings,
            session: None,
            retry_count: 0,
            last_logged_error: None,
            primary_server_id: None,
            clock_skew_secs: 0,
            clock,
            stop,
        }
    }

    /// A single connection attempt, including the identity and version checks.
    pub(crate) async fn connect(&mut self) -> Result<(), FetchError> {
        let handshake = Handshake {
            capabilities: 0,
            server_id: self.settings.server_id,
            heartbeat_period_ms: self.settings.options.heartbeat_period.as_millis() as u32,
            user: self.settings.primary.user.clone(),
            password: self.settings.primary.password.clone(),
        };

        let session = tokio::select! {
            result = self.connector.connect(&handshake) => result?,
            _ = self.stop.stopped() => return Err(FetchError::Stopped),
        };

        let greeting = session.greeting().clone();
        if greeting.protocol_version < MIN_PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(greeting.protocol_version).into());
        }
        if greeting.server_id == self.settings.server_id && !self.settings.options.replicate_same_server_id {
            return Err(ProtocolError::IdentityCollision(greeting.server_id).into());
        }

        self.clock_skew_secs = Utc::now().timestamp() - greeting.unix_time as i64;
        self.primary_server_id = Some(greeting.server_id);
        self.session = Some(session);
        slog::info!(
            self.logger,
            "Connected to primary {}:{} (server id {}, version {:?}, clock skew {}s).",
            self.settings.primary.host,
            self.settings.primary.port,
            greeting.server_id,
            greeting.server_version,
            self.clock_skew_secs
        );

        Ok(())
    }

    pub(crate) async fn connect_with_retry(&mut self) -> Result<(), FetchError> {
        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => self.back_off(&e).await?,
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) async fn reconnect(&mut self, cause: &FetchError) -> Result<(), FetchError> {
        self.disconnect();
        self.back_off(cause).await?;
        self.connect_with_retry().await
    }

    pub(crate) fn disconnect(&mut self) {
        self.session = None;
    }

    /// Registration is best effort. Failing to register never stops replication.
    pub(crate) async fn register(&mut self) -> Result<(), FetchError> {
        let (host, port) = match &self.settings.report {
            Some(report) => report.clone(),
            None => return Ok(()),
        };
        let registration = Registration {
            server_id: self.settings.server_id,
            host,
            user: self.settings.primary.user.clone(),
            port,
        };

        let session = self.session.as_mut().ok_or_else(not_connected)?;
        let result = tokio::select! {
            result = session.register(&registration) => result,
            _ = self.stop.stopped() => return Err(FetchError::Stopped),
        };
        if let Err(e) = result {
            slog::warn!(self.logger, "Failed to register with primary: {}", e);
        }

        Ok(())
    }

    pub(crate) async fn request_stream(&mut self, from: &Position) -> Result<(), FetchError> {
        let server_id = self.settings.server_id;
        let session = self.session.as_mut().ok_or_else(not_connected)?;
        tokio::select! {
            result = session.request_stream(from, server_id) => result,
            _ = self.stop.stopped() => Err(FetchError::Stopped),
        }
    }

    pub(crate) async fn next_packet(&mut self) -> Result<StreamPacket, FetchError> {
        let session = self.session.as_mut().ok_or_else(not_connected)?;
        tokio::select! {
            result = session.next_packet() => result,
            _ = self.stop.stopped() => Err(FetchError::Stopped),
        }
    }

    pub(crate) fn note_event_received(&mut self) {
        self.retry_count = 0;
        self.last_logged_error = None;
    }

    pub(crate) fn primary_server_id(&self) -> Option<u32> {
        self.primary_server_id
    }

    pub(crate) fn clock_skew_secs(&self) -> i64 {
        self.clock_skew_secs
    }

    async fn back_off(&mut self, cause: &FetchError) -> Result<(), FetchError> {
        let message = cause.to_string();
        if self.last_logged_error.as_deref() != Some(message.as_str()) {
            slog::warn!(
                self.logger,
                "Connection to primary failed (retry {}): {}",
                self.retry_count,
                message
            );
            self.last_logged_error = Some(message.clone());
        }

        self.retry_count += 1;
        if self.retry_count > self.settings.options.max_connect_retries {
            return Err(FetchError::RetriesExhausted {
                attempts: self.retry_count,
                last: message,
            });
        }
        if self.retry_count == 1 {
            return Ok(());
        }

        let interval = self.settings.options.connect_retry_interval;
        if !sync::sleep_or_stop(&mut self.clock, interval, &self.stop).await {
            return Err(FetchError::Stopped);
        }
        Ok(())
    }
}

fn not_connected() -> FetchError {
    FetchError::Network(io::Error::new(io::ErrorKind::NotConnected, "no session with primary"))
}
