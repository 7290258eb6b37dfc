use crate::api::options::ReplicationOptionsValidated;
use crate::api::{Engine, Replication, ReplicationOptions};
use crate::position::Position;
use crate::relaylog::{RelayLog, RelayLogConfig, RelayLogError};
use crate::replica::{
    ConnectionInfo, PrimaryConnector, PrimaryEndpoint, RecoveryError, RecoveryStore, RelayInfo, RelayState,
    ReplicaSettings, SharedState, TcpConnector,
};
use std::convert::TryFrom;
use std::path::PathBuf;
use std::sync::Arc;

const RELAY_LOG_DIRECTORY: &str = "relay";
const RELAY_LOG_BASENAME: &str = "relay-log";

pub struct ReplicationConfig {
    /// Must differ from the primary's id, unless same-origin replication is enabled.
    pub server_id: u32,
    pub primary_host: String,
    pub primary_port: u16,
    pub user: String,
    pub password: String,
    /// Host and port announced to the primary. No registration when `None`.
    pub report_address: Option<(String, u16)>,
    // A directory where we can create files and sub-directories for the relay log and the
    // recovery records.
    pub data_directory: PathBuf,
    /// Where to start fetching when there are no recovery records yet. `None` lets the primary
    /// start from its oldest log.
    pub initial_position: Option<Position>,
    pub info_logger: slog::Logger,
    pub options: ReplicationOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicationCreationError {
    #[error("Illegal options for configuring replication: {0}")]
    IllegalOptions(String),
    #[error("Recovery records unusable: {0}")]
    Recovery(#[from] RecoveryError),
    #[error("Relay log initialization failure: {0}")]
    RelayLog(#[from] RelayLogError),
}

/// Builds a stopped replica that talks to its primary over TCP. Call `start()` on the result.
pub fn try_create_replication(
    config: ReplicationConfig,
    engine: Box<dyn Engine>,
) -> Result<Replication, ReplicationCreationError> {
    let options = ReplicationOptionsValidated::try_from(config.options.clone())
        .map_err(|e| ReplicationCreationError::IllegalOptions(e.to_string()))?;
    let connector = Arc::new(TcpConnector::new(
        &config.primary_host,
        config.primary_port,
        options.net_read_timeout,
        options.max_packet_size,
    ));

    create_replication(config, options, connector, engine)
}

pub(crate) fn create_replication(
    config: ReplicationConfig,
    options: ReplicationOptionsValidated,
    connector: Arc<dyn PrimaryConnector>,
    engine: Box<dyn Engine>,
) -> Result<Replication, ReplicationCreationError> {
    let root_logger = config.info_logger;

    let recovery = Arc::new(RecoveryStore::open(&config.data_directory)?);
    let saved_connection = recovery.load_connection()?;
    let saved_relay = recovery.load_relay()?;

    let relay = RelayLog::open(
        root_logger.new(slog::o!("component" => "relay_log")),
        RelayLogConfig {
            directory: config.data_directory.join(RELAY_LOG_DIRECTORY),
            basename: RELAY_LOG_BASENAME.to_string(),
            max_segment_size: options.max_relay_segment_size,
            space_limit: options.relay_log_space_limit,
            discard_existing: options.relay_log_recovery,
        },
    )?;

    let initial = config.initial_position.unwrap_or_default();
    let (fetch_from, relay_state) = if options.relay_log_recovery {
        // Relayed but unapplied events are gone. Fetch them again, starting right after the
        // last committed group.
        let committed = saved_relay
            .map(|info| info.primary_position)
            .filter(|position| !position.is_unset())
            .unwrap_or(initial);
        slog::info!(root_logger, "Relay log recovery: refetching from {:?}", committed);
        (committed.clone(), RelayState::resume_at(relay.first_position(), committed))
    } else {
        let recorded = saved_connection
            .as_ref()
            .map(|info| info.position.clone())
            .unwrap_or_else(|| initial.clone());
        let relayed = relay.relayed_primary_position(recorded.log_name());
        let fetch_from = resume_fetch_position(recorded.clone(), relayed);
        if fetch_from != recorded {
            slog::info!(
                root_logger,
                "Relay log holds events up to {:?}, past the recorded fetch position {:?}.",
                fetch_from,
                recorded
            );
        }
        let relay_state = match saved_relay {
            Some(info) => RelayState::resume_at(info.relay_position, info.primary_position),
            None => RelayState::resume_at(relay.first_position(), initial),
        };
        (fetch_from, relay_state)
    };

    let settings = Arc::new(ReplicaSettings {
        server_id: config.server_id,
        primary: PrimaryEndpoint {
            host: config.primary_host,
            port: config.primary_port,
            user: config.user,
            password: config.password,
        },
        report: config.report_address,
        options,
    });

    if settings.options.relay_log_recovery {
        recovery.save_relay(&RelayInfo {
            relay_position: relay_state.group_relay_position.clone(),
            primary_position: relay_state.group_primary_position.clone(),
        })?;
        recovery.save_connection(&ConnectionInfo::new(&settings, fetch_from.clone()))?;
    }

    slog::info!(
        root_logger,
        "Replica {} created. Fetching from {:?}, applying from relay {:?} (primary {:?}).",
        settings.server_id,
        fetch_from,
        relay_state.group_relay_position,
        relay_state.group_primary_position
    );

    let shared = Arc::new(SharedState::new(fetch_from, relay_state));

    Ok(Replication::new(
        root_logger,
        settings,
        connector,
        relay,
        recovery,
        shared,
        engine,
    ))
}

/// The connection record is saved after the relay log append, so a crash in between leaves the
/// relay log one event ahead. Fetching resumes after whichever got further.
fn resume_fetch_position(recorded: Position, relayed: Option<Position>) -> Position {
    match relayed {
        None => recorded,
        Some(relayed) if recorded.is_unset() => relayed,
        Some(relayed) if relayed.log_name() == recorded.log_name() => {
            if relayed.offset() > recorded.offset() {
                relayed
            } else {
                recorded
            }
        }
        // The log name only changes through a rotate, which is relayed before it is recorded.
        Some(relayed) => relayed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::NoOpEngine;
    use crate::replica::test_utils::{test_logger, test_options, ScriptedConnector, ScriptedSession};
    use std::path::Path;

    fn config(dir: &Path, options: ReplicationOptions) -> ReplicationConfig {
        ReplicationConfig {
            server_id: 2,
            // Nothing listens here. These tests never start the fetcher.
            primary_host: "127.0.0.1".into(),
            primary_port: 1,
            user: "repl".into(),
            password: "secret".into(),
            report_address: None,
            data_directory: dir.to_path_buf(),
            initial_position: Some(Position::new("bin.000003", 4)),
            info_logger: test_logger(),
            options,
        }
    }

    fn create(dir: &Path, options: ReplicationOptions) -> Replication {
        try_create_replication(config(dir, options), Box::new(NoOpEngine::new(test_logger()))).unwrap()
    }

    #[tokio::test]
    async fn fresh_replica_starts_at_initial_position() {
        // -- setup --
        let dir = tempfile::tempdir().unwrap();

        // -- execute --
        let replication = create(dir.path(), ReplicationOptions::default());

        // -- verify --
        let status = replication.status();
        assert_eq!(status.fetched_primary_position, Position::new("bin.000003", 4));
        assert_eq!(status.group_primary_position, Position::new("bin.000003", 4));
        assert_eq!(status.group_relay_position, Position::new("relay-log.000001", 4));
        assert!(!status.fetcher_running);
        assert!(!status.applier_running);
        assert_eq!(status.seconds_behind, None);
        assert!(dir.path().join(RELAY_LOG_DIRECTORY).join("relay-log.index").exists());
    }

    #[tokio::test]
    async fn recovery_records_win_over_initial_position() {
        // -- setup --
        let dir = tempfile::tempdir().unwrap();
        drop(create(dir.path(), ReplicationOptions::default()));
        let store = RecoveryStore::open(dir.path()).unwrap();
        store
            .save_relay(&RelayInfo {
                relay_position: Position::new("relay-log.000001", 4),
                primary_position: Position::new("bin.000005", 300),
            })
            .unwrap();
        store
            .save_connection(&ConnectionInfo {
                host: "127.0.0.1".into(),
                port: 1,
                user: "repl".into(),
                password: "secret".into(),
                position: Position::new("bin.000005", 900),
                connect_retry_secs: 60,
                heartbeat_period_ms: 1000,
            })
            .unwrap();

        // -- execute --
        let replication = create(dir.path(), ReplicationOptions::default());

        // -- verify --
        let status = replication.status();
        assert_eq!(status.fetched_primary_position, Position::new("bin.000005", 900));
        assert_eq!(status.group_primary_position, Position::new("bin.000005", 300));
        assert_eq!(status.group_relay_position, Position::new("relay-log.000001", 4));
    }

    #[tokio::test]
    async fn relay_log_recovery_refetches_from_committed_group() {
        // -- setup --
        let dir = tempfile::tempdir().unwrap();
        drop(create(dir.path(), ReplicationOptions::default()));
        let store = RecoveryStore::open(dir.path()).unwrap();
        store
            .save_relay(&RelayInfo {
                relay_position: Position::new("relay-log.000001", 4),
                primary_position: Position::new("bin.000005", 300),
            })
            .unwrap();

        // -- execute --
        let options = ReplicationOptions {
            relay_log_recovery: Some(true),
            ..Default::default()
        };
        let replication = create(dir.path(), options);

        // -- verify --
        let status = replication.status();
        assert_eq!(status.fetched_primary_position, Position::new("bin.000005", 300));
        assert_eq!(status.group_primary_position, Position::new("bin.000005", 300));
        // Old segments were dropped and numbering restarted.
        assert_eq!(status.group_relay_position, Position::new("relay-log.000001", 4));

        let saved_connection = store.load_connection().unwrap().unwrap();
        assert_eq!(saved_connection.position, Position::new("bin.000005", 300));
        let saved_relay = store.load_relay().unwrap().unwrap();
        assert_eq!(saved_relay.relay_position, status.group_relay_position);
    }

    fn relay_with_events(dir: &Path, events: &[crate::event::Event]) {
        let relay = RelayLog::open(
            test_logger(),
            RelayLogConfig {
                directory: dir.join(RELAY_LOG_DIRECTORY),
                basename: RELAY_LOG_BASENAME.to_string(),
                max_segment_size: 1 << 20,
                space_limit: 0,
                discard_existing: false,
            },
        )
        .unwrap();
        let format = crate::event::FormatDescriptor::base();
        relay.rotate(format.clone()).unwrap();
        for event in events {
            crate::relaylog::test_support::append(&relay, event, &format);
        }
    }

    #[tokio::test]
    async fn relayed_but_unrecorded_event_is_not_fetched_again() {
        // -- setup --
        let dir = tempfile::tempdir().unwrap();
        relay_with_events(
            dir.path(),
            &[
                crate::event::Event::rotate(1, "bin.000001", 4),
                crate::event::Event::statement(1, 100, "db", "INSERT A"),
            ],
        );
        let session = ScriptedSession::new(1);
        let requests = session.requests();
        let connector = ScriptedConnector::new(vec![Ok(session)]);
        let options = ReplicationOptionsValidated::try_from(test_options()).unwrap();
        let mut config = config(dir.path(), ReplicationOptions::default());
        config.initial_position = None;

        // -- execute --
        let replication =
            create_replication(config, options, connector, Box::new(NoOpEngine::new(test_logger()))).unwrap();
        replication.start_fetcher().await;
        for _ in 0..200 {
            if !requests.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        replication.stop_fetcher().await;

        // -- verify --
        assert_eq!(*requests.lock().unwrap(), vec![Position::new("bin.000001", 100)]);
        assert_eq!(replication.status().fetched_primary_position, Position::new("bin.000001", 100));
    }

    #[tokio::test]
    async fn connection_record_ahead_of_relay_log_wins() {
        // -- setup --
        let dir = tempfile::tempdir().unwrap();
        relay_with_events(
            dir.path(),
            &[
                crate::event::Event::rotate(1, "bin.000005", 4),
                crate::event::Event::statement(1, 100, "db", "INSERT A"),
            ],
        );
        // Events of our own origin were skipped after INSERT A without being relayed.
        let store = RecoveryStore::open(dir.path()).unwrap();
        store
            .save_connection(&ConnectionInfo {
                host: "127.0.0.1".into(),
                port: 1,
                user: "repl".into(),
                password: "secret".into(),
                position: Position::new("bin.000005", 900),
                connect_retry_secs: 60,
                heartbeat_period_ms: 1000,
            })
            .unwrap();

        // -- execute --
        let replication = create(dir.path(), ReplicationOptions::default());

        // -- verify --
        assert_eq!(replication.status().fetched_primary_position, Position::new("bin.000005", 900));
    }

    #[test]
    fn resume_position_prefers_the_further_one() {
        let recorded = Position::new("bin.000001", 100);

        assert_eq!(resume_fetch_position(recorded.clone(), None), recorded);
        assert_eq!(
            resume_fetch_position(recorded.clone(), Some(Position::new("bin.000001", 250))),
            Position::new("bin.000001", 250)
        );
        assert_eq!(
            resume_fetch_position(recorded.clone(), Some(Position::new("bin.000001", 40))),
            recorded
        );
        assert_eq!(
            resume_fetch_position(recorded, Some(Position::new("bin.000002", 4))),
            Position::new("bin.000002", 4)
        );
        assert_eq!(
            resume_fetch_position(Position::default(), Some(Position::new("bin.000001", 4))),
            Position::new("bin.000001", 4)
        );
    }

    #[test]
    fn illegal_options_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let options = ReplicationOptions {
            net_read_timeout: Some(std::time::Duration::from_secs(10)),
            heartbeat_period: Some(std::time::Duration::from_secs(20)),
            ..Default::default()
        };

        let result = try_create_replication(config(dir.path(), options), Box::new(NoOpEngine::new(test_logger())));

        assert!(matches!(result, Err(ReplicationCreationError::IllegalOptions(_))));
    }

    #[tokio::test]
    async fn skip_counter_and_until_are_set_while_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let replication = create(dir.path(), ReplicationOptions::default());
        let until = crate::replica::UntilCondition::Primary(Position::new("bin.000004", 100));

        replication.set_skip_counter(3).await.unwrap();
        replication.set_until(Some(until.clone())).await.unwrap();

        let status = replication.status();
        assert_eq!(status.skip_counter, 3);
        assert_eq!(status.until, Some(until));
    }
}
