use crate::position::Position;
use crate::replica::settings::ReplicaSettings;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const CONNECTION_FILE: &str = "primary.info";
const RELAY_FILE: &str = "relay.info";

/// Fetcher-side record, rewritten after every relayed event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Primary position right after the last event handed to the relay log.
    pub position: Position,
    pub connect_retry_secs: u64,
    pub heartbeat_period_ms: u64,
}

impl ConnectionInfo {
    pub(crate) fn new(settings: &ReplicaSettings, position: Position) -> Self {
        ConnectionInfo {
            host: settings.primary.host.clone(),
            port: settings.primary.port,
            user: settings.primary.user.clone(),
            password: settings.primary.password.clone(),
            position,
            connect_retry_secs: settings.options.connect_retry_interval.as_secs(),
            heartbeat_period_ms: settings.options.heartbeat_period.as_millis() as u64,
        }
    }
}

/// Applier-side record, rewritten after every committed group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    pub relay_position: Position,
    pub primary_position: Position,
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("recovery file I/O failure on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("recovery file {path} is unreadable: {source}")]
    Format { path: PathBuf, source: serde_json::Error },
}

/// Crash-safe storage for the two recovery records. Each record has a single writer, so the
/// two files never need a shared lock.
pub(crate) struct RecoveryStore {
    dir: PathBuf,
}

impl RecoveryStore {
    pub(crate) fn open(dir: &Path) -> Result<Self, RecoveryError> {
        fs::create_dir_all(dir).map_err(io_error(dir))?;
        Ok(RecoveryStore { dir: dir.to_path_buf() })
    }

    pub(crate) fn load_connection(&self) -> Result<Option<ConnectionInfo>, RecoveryError> {
        self.load(CONNECTION_FILE)
    }

    pub(crate) fn save_connection(&self, info: &ConnectionInfo) -> Result<(), RecoveryError> {
        self.save(CONNECTION_FILE, info)
    }

    pub(crate) fn load_relay(&self) -> Result<Option<RelayInfo>, RecoveryError> {
        self.load(RELAY_FILE)
    }

    pub(crate) fn save_relay(&self, info: &RelayInfo) -> Result<(), RecoveryError> {
        self.save(RELAY_FILE, info)
    }

    fn load<T: DeserializeOwned>(&self, file_name: &str) -> Result<Option<T>, RecoveryError> {
        let path = self.dir.join(file_name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path)(e)),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| RecoveryError::Format { path, source })
    }

    /// Write to a temp file, fsync, rename over the old record, fsync the directory.
    fn save<T: Serialize>(&self, file_name: &str, value: &T) -> Result<(), RecoveryError> {
        let path = self.dir.join(file_name);
        let tmp_path = self.dir.join(format!("{}.tmp", file_name));
        let content = serde_json::to_vec_pretty(value).map_err(|source| RecoveryError::Format {
            path: path.clone(),
            source,
        })?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(io_error(&tmp_path))?;
        file.write_all(&content).map_err(io_error(&tmp_path))?;
        file.sync_all().map_err(io_error(&tmp_path))?;
        fs::rename(&tmp_path, &path).map_err(io_error(&path))?;

        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> RecoveryError {
    let path = path.to_path_buf();
    move |source| RecoveryError::Io { path, source }
}
