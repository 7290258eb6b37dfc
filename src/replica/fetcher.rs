use crate::api::FetcherState;
use crate::event::{Event, FormatDescriptor, Payload};
use crate::position::Position;
use crate::relaylog::RelayLog;
use crate::replica::connection::ConnectionManager;
use crate::replica::heartbeat::HeartbeatMonitor;
use crate::replica::recovery::{ConnectionInfo, RecoveryStore};
use crate::replica::settings::ReplicaSettings;
use crate::replica::shared::{worker_error, SharedState};
use crate::replica::transport::{PrimaryConnector, StreamPacket};
use crate::replica::FetchError;
use crate::sync::{Clock, RealClock, StopCheck};
use bytes::Bytes;
use std::sync::Arc;

/// Pulls the primary's event stream into the relay log.
///
/// Every relayed event is durable in the relay log before the fetched position moves past it,
/// and the fetched position is persisted after every event. Transient failures reconnect and
/// resume from the fetched position; anything else stops the fetcher with an error.
pub(crate) struct Fetcher<C: Clock = RealClock> {
    logger: slog::Logger,
    conn: ConnectionManager<C>,
    relay: Arc<RelayLog>,
    recovery: Arc<RecoveryStore>,
    shared: Arc<SharedState>,
    settings: Arc<ReplicaSettings>,
    stop: StopCheck,

    position: Position,
    // Descriptor in effect for the stream as it arrives.
    format: FormatDescriptor,
    heartbeats: HeartbeatMonitor,
}

impl<C: Clock> Fetcher<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        logger: slog::Logger,
        connector: Arc<dyn PrimaryConnector>,
        relay: Arc<RelayLog>,
        recovery: Arc<RecoveryStore>,
        shared: Arc<SharedState>,
        settings: Arc<ReplicaSettings>,
        clock: C,
        stop: StopCheck,
    ) -> Self {
        let position = shared.fetcher(|status| status.position.clone());
        let conn = ConnectionManager::new(logger.clone(), connector, settings.clone(), clock, stop.clone());

        Fetcher {
            logger,
            conn,
            relay,
            recovery,
            shared,
            settings,
            stop,
            position,
            format: FormatDescriptor::base(),
            heartbeats: HeartbeatMonitor::default(),
        }
    }

    pub(crate) async fn run(mut self) {
        slog::info!(self.logger, "Fetcher starting from {:?}", self.position);
        self.shared.fetcher(|status| {
            status.running = true;
            status.last_error = None;
        });

        let result = self.fetch().await;
        self.conn.disconnect();

        match result {
            Ok(()) | Err(FetchError::Stopped) => {
                slog::info!(self.logger, "Fetcher stopped at {:?}", self.position);
            }
            Err(e) => {
                slog::error!(self.logger, "Fetcher failed at {:?}: {}", self.position, e);
                let error = worker_error(e.to_string(), e.code(), self.position.clone());
                self.shared.fetcher(|status| status.last_error = Some(error));
            }
        }

        self.shared.fetcher(|status| {
            status.running = false;
            status.state = FetcherState::Stopped;
        });
    }

    async fn fetch(&mut self) -> Result<(), FetchError> {
        self.set_state(FetcherState::Connecting);
        self.conn.connect_with_retry().await?;
        self.publish_connection();

        loop {
            let result = match self.open_stream().await {
                Ok(()) => self.stream().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    slog::warn!(self.logger, "Lost primary stream at {:?}: {}", self.position, e);
                    self.set_state(FetcherState::Reconnecting);
                    self.conn.reconnect(&e).await?;
                    self.publish_connection();
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn open_stream(&mut self) -> Result<(), FetchError> {
        if self.settings.report.is_some() {
            self.set_state(FetcherState::Registering);
            self.conn.register().await?;
        }

        self.set_state(FetcherState::RequestingStream);
        // A new stream starts over with the primary's descriptor for the requested log.
        self.format = FormatDescriptor::base();
        self.conn.request_stream(&self.position).await?;
        slog::debug!(self.logger, "Requested stream from {:?}", self.position);

        self.set_state(FetcherState::Streaming);
        Ok(())
    }

    /// Returns `Ok(())` only when stopped while waiting for relay log space.
    async fn stream(&mut self) -> Result<(), FetchError> {
        loop {
            if !self.relay.wait_for_space(&self.stop).await {
                return Ok(());
            }

            match self.conn.next_packet().await? {
                StreamPacket::Event(raw) => {
                    self.conn.note_event_received();
                    self.queue_event(raw)?;
                }
                StreamPacket::EndOfStream => return Err(FetchError::EndOfStream),
            }
        }
    }

    fn queue_event(&mut self, raw: Bytes) -> Result<(), FetchError> {
        let event = Event::decode(&raw, &self.format)?;

        match &event.payload {
            Payload::Heartbeat(heartbeat) => {
                let checked = self.heartbeats.check(heartbeat, &mut self.position);
                let (received, last_seen) = (self.heartbeats.received(), self.heartbeats.last_seen());
                let position = self.position.clone();
                self.shared.fetcher(|status| {
                    status.heartbeats_received = received;
                    status.last_heartbeat = last_seen;
                    status.position = position;
                });
                return checked.map_err(FetchError::from);
            }
            Payload::Stop => {
                slog::info!(self.logger, "Primary is shutting down at {:?}", self.position);
                return Ok(());
            }
            Payload::Rotate(rotate) => {
                self.format = FormatDescriptor::base();
                self.relay.rotate(FormatDescriptor::base())?;
                self.relay.append(&event, &raw)?;
                self.position = Position::new(rotate.next_log_name.as_str(), rotate.position);
            }
            Payload::FormatDescriptor(format) => {
                if !format.is_supported() {
                    return Err(crate::event::DecodeError::UnsupportedFormat(format.binlog_version).into());
                }
                self.format = format.clone();
                self.relay.append(&event, &raw)?;
                // Descriptors resent at the start of a stream carry no position.
                if event.log_pos() != 0 {
                    self.position = self.position.with_offset(event.log_pos());
                }
            }
            Payload::Change(_) => {
                let own = event.origin_server_id() == self.settings.server_id;
                if own && !self.settings.options.replicate_same_server_id {
                    self.advance(&event);
                    self.relay.set_ignored_until(self.position.clone());
                    slog::trace!(self.logger, "Skipped own event, now at {:?}", self.position);
                } else {
                    self.relay.append(&event, &raw)?;
                    self.advance(&event);
                }
            }
        }

        self.persist_position()
    }

    fn advance(&mut self, event: &Event) {
        if event.log_pos() != 0 {
            self.position = self.position.with_offset(event.log_pos());
        }
    }

    fn persist_position(&self) -> Result<(), FetchError> {
        let info = ConnectionInfo::new(&self.settings, self.position.clone());
        self.recovery.save_connection(&info)?;

        let position = self.position.clone();
        self.shared.fetcher(|status| status.position = position);
        Ok(())
    }

    fn publish_connection(&self) {
        let (server_id, skew) = (self.conn.primary_server_id(), self.conn.clock_skew_secs());
        self.shared.fetcher(|status| {
            status.primary_server_id = server_id;
            status.clock_skew_secs = skew;
        });
    }

    fn set_state(&self, state: FetcherState) {
        self.shared.fetcher(|status| status.state = state);
    }
}
