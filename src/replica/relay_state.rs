use crate::event::{Event, Payload};
use crate::position::Position;

/// Stop the applier before the first event at or past the given position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UntilCondition {
    Primary(Position),
    Relay(Position),
}

/// The applier's bookkeeping.
///
/// `event_*` positions move with every event read. `group_*` positions only move when a group
/// commits, and are what recovery resumes from.
#[derive(Clone, Debug, Default)]
pub(crate) struct RelayState {
    pub event_relay_position: Position,
    pub event_primary_position: Position,
    pub group_relay_position: Position,
    pub group_primary_position: Position,
    pub in_group: bool,
    pub skip_counter: u64,
    pub until: Option<UntilCondition>,
    pub transaction_retries: u32,
    pub last_event_timestamp: Option<u32>,
}

impl RelayState {
    pub(crate) fn resume_at(relay: Position, primary: Position) -> Self {
        RelayState {
            event_relay_position: relay.clone(),
            event_primary_position: primary.clone(),
            group_relay_position: relay,
            group_primary_position: primary,
            ..Default::default()
        }
    }

    /// Moves the event positions past `event`, which ended at `relay_after`. Returns true if
    /// this closed a group.
    pub(crate) fn advance(&mut self, event: &Event, relay_after: Position) -> bool {
        self.event_relay_position = relay_after;
        match &event.payload {
            Payload::Rotate(rotate) => {
                self.event_primary_position = Position::new(rotate.next_log_name.as_str(), rotate.position);
            }
            _ if event.log_pos() != 0 => {
                self.event_primary_position = self.event_primary_position.with_offset(event.log_pos());
            }
            _ => {}
        }
        if !event.is_artificial() && event.timestamp() != 0 {
            self.last_event_timestamp = Some(event.timestamp());
        }

        if event.starts_group() {
            self.in_group = true;
            return false;
        }
        if self.in_group && !event.ends_group() {
            return false;
        }

        self.in_group = false;
        self.group_relay_position = self.event_relay_position.clone();
        self.group_primary_position = self.event_primary_position.clone();
        self.transaction_retries = 0;
        true
    }

    /// Forgets everything read since the last committed group.
    pub(crate) fn rewind_to_group(&mut self) {
        self.event_relay_position = self.group_relay_position.clone();
        self.event_primary_position = self.group_primary_position.clone();
        self.in_group = false;
    }

    /// The primary position the until condition is compared against before applying `event`.
    pub(crate) fn primary_position_before(&self, event: &Event) -> Position {
        let start = event.log_pos().saturating_sub(event.header.event_len as u64);
        if self.in_group || event.log_pos() == 0 || start == 0 {
            return self.group_primary_position.clone();
        }
        self.event_primary_position.with_offset(start)
    }
}
