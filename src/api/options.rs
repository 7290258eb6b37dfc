use std::convert::TryFrom;
use tokio::time::Duration;

/// Tuning knobs. Every `None` falls back to a default.
#[derive(Clone, Default)]
pub struct ReplicationOptions {
    pub connect_retry_interval: Option<Duration>,
    pub max_connect_retries: Option<u32>,
    pub net_read_timeout: Option<Duration>,
    /// `Some(Duration::ZERO)` disables heartbeats. Defaults to half the read timeout.
    pub heartbeat_period: Option<Duration>,
    pub max_transaction_retries: Option<u32>,
    pub retry_backoff_unit: Option<Duration>,
    pub retry_backoff_ceiling: Option<Duration>,
    /// Zero means unlimited.
    pub relay_log_space_limit: Option<u64>,
    pub max_relay_segment_size: Option<u64>,
    pub relay_log_purge: Option<bool>,
    /// Discard the relay log at startup and refetch from the last applied position.
    pub relay_log_recovery: Option<bool>,
    pub replicate_same_server_id: Option<bool>,
    /// Engine error codes that are retried even when the engine reports them as fatal.
    pub recoverable_error_codes: Option<Vec<u16>>,
    pub max_packet_size: Option<usize>,
}

#[derive(Clone, Debug)]
pub(crate) struct ReplicationOptionsValidated {
    pub connect_retry_interval: Duration,
    pub max_connect_retries: u32,
    pub net_read_timeout: Duration,
    pub heartbeat_period: Duration,
    pub max_transaction_retries: u32,
    pub retry_backoff_unit: Duration,
    pub retry_backoff_ceiling: Duration,
    pub relay_log_space_limit: u64,
    pub max_relay_segment_size: u64,
    pub relay_log_purge: bool,
    pub relay_log_recovery: bool,
    pub replicate_same_server_id: bool,
    pub recoverable_error_codes: Vec<u16>,
    pub max_packet_size: usize,
}

pub(crate) const LOCK_WAIT_TIMEOUT: u16 = 1205;
pub(crate) const DEADLOCK: u16 = 1213;

impl ReplicationOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.net_read_timeout == Duration::from_secs(0) {
            return Err("Network read timeout must be positive");
        }
        if self.heartbeat_period > self.net_read_timeout {
            return Err("Heartbeat period must not exceed the network read timeout");
        }
        if self.retry_backoff_unit > self.retry_backoff_ceiling {
            return Err("Retry backoff unit must not exceed the backoff ceiling");
        }
        if self.max_relay_segment_size == 0 {
            return Err("Maximum relay log segment size must be positive");
        }
        if self.max_packet_size < crate::event::HEADER_LEN + 1 {
            return Err("Maximum packet size is too small to carry an event");
        }
        if self.heartbeat_period.as_millis() > u32::MAX as u128 {
            return Err("Heartbeat period is too long");
        }

        Ok(())
    }
}

impl TryFrom<ReplicationOptions> for ReplicationOptionsValidated {
    type Error = &'static str;

    fn try_from(options: ReplicationOptions) -> Result<Self, Self::Error> {
        let net_read_timeout = options.net_read_timeout.unwrap_or(Duration::from_secs(3600));
        let values = ReplicationOptionsValidated {
            connect_retry_interval: options.connect_retry_interval.unwrap_or(Duration::from_secs(60)),
            max_connect_retries: options.max_connect_retries.unwrap_or(86_400),
            net_read_timeout,
            heartbeat_period: options.heartbeat_period.unwrap_or(net_read_timeout / 2),
            max_transaction_retries: options.max_transaction_retries.unwrap_or(10),
            retry_backoff_unit: options.retry_backoff_unit.unwrap_or(Duration::from_secs(1)),
            retry_backoff_ceiling: options.retry_backoff_ceiling.unwrap_or(Duration::from_secs(5)),
            relay_log_space_limit: options.relay_log_space_limit.unwrap_or(0),
            max_relay_segment_size: options.max_relay_segment_size.unwrap_or(1 << 30),
            relay_log_purge: options.relay_log_purge.unwrap_or(true),
            relay_log_recovery: options.relay_log_recovery.unwrap_or(false),
            replicate_same_server_id: options.replicate_same_server_id.unwrap_or(false),
            recoverable_error_codes: options
                .recoverable_error_codes
                .unwrap_or_else(|| vec![LOCK_WAIT_TIMEOUT, DEADLOCK]),
            max_packet_size: options.max_packet_size.unwrap_or(64 << 20),
        };

        values.validate()?;
        Ok(values)
    }
}
