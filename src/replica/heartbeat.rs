use crate::event::Heartbeat;
use crate::position::Position;
use crate::replica::ProtocolError;
use chrono::{DateTime, Utc};

/// Validates heartbeats from an idle primary.
///
/// A heartbeat is only sent after the event whose end position it carries, so the replica must
/// be at exactly that position. Any difference means events were lost.
#[derive(Default)]
pub(crate) struct HeartbeatMonitor {
    received: u64,
    last_seen: Option<DateTime<Utc>>,
}

impl HeartbeatMonitor {
    pub(crate) fn check(&mut self, heartbeat: &Heartbeat, fetched: &mut Position) -> Result<(), ProtocolError> {
        self.received += 1;
        self.last_seen = Some(Utc::now());

        let carried = Position::new(heartbeat.log_name.as_str(), heartbeat.position);
        if fetched.is_unset() {
            // No history with this primary yet. Nothing to compare against.
            *fetched = carried;
            return Ok(());
        }
        if *fetched != carried {
            return Err(ProtocolError::HeartbeatMismatch {
                expected: fetched.clone(),
                received: carried,
            });
        }

        Ok(())
    }

    pub(crate) fn received(&self) -> u64 {
        self.received
    }

    pub(crate) fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }
}
