use std::fmt::{Display, Formatter};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::resource::{CollectionId, ResourceId};
use crate::table::{RowId, TableRow};

/// Where an alarm trigger is in its life
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlarmState {
    /// Waiting to fire
    Pending,
    /// Fired, and postponed by the user
    Snoozed,
    /// Acknowledged by the user. Kept so that it does not fire again
    Dismissed,
}

impl AlarmState {
    /// Whether the alarm may still fire
    pub fn is_active(&self) -> bool {
        matches!(self, AlarmState::Pending | AlarmState::Snoozed)
    }
}

/// One trigger instant of an alarm of a resource
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlarmRow {
    id: Option<RowId>,
    resource_id: ResourceId,
    collection_id: CollectionId,
    recurrence_id: String,
    /// When the alarm was meant to fire, before any snooze
    base_time_to_fire: DateTime<Utc>,
    time_to_fire: DateTime<Utc>,
    state: AlarmState,
    snooze_count: u32,
    summary: String,
}

impl AlarmRow {
    /// A pending trigger firing at `base_time_to_fire`
    pub fn new(resource_id: ResourceId, collection_id: CollectionId, recurrence_id: String, base_time_to_fire: DateTime<Utc>) -> Self {
        Self {
            id: None,
            resource_id, collection_id, recurrence_id, base_time_to_fire,
            time_to_fire: base_time_to_fire,
            state: AlarmState::Pending,
            snooze_count: 0,
            summary: String::new(),
        }
    }

    pub fn with_summary(mut self, summary: &str) -> Self {
        self.summary = summary.to_string();
        self
    }

    pub fn id(&self) -> Option<RowId>                     { self.id }
    pub fn resource_id(&self) -> ResourceId               { self.resource_id }
    pub fn collection_id(&self) -> CollectionId           { self.collection_id }
    pub fn recurrence_id(&self) -> &str                   { &self.recurrence_id }
    pub fn base_time_to_fire(&self) -> DateTime<Utc>      { self.base_time_to_fire }
    pub fn time_to_fire(&self) -> DateTime<Utc>           { self.time_to_fire }
    pub fn state(&self) -> AlarmState                     { self.state }
    pub fn snooze_count(&self) -> u32                     { self.snooze_count }
    pub fn summary(&self) -> &str                         { &self.summary }

    /// Whether both rows are the same trigger of the same occurrence
    pub fn same_trigger(&self, other: &AlarmRow) -> bool {
        self.resource_id == other.resource_id
            && self.recurrence_id == other.recurrence_id
            && self.base_time_to_fire == other.base_time_to_fire
    }

    /// Postpone the alarm by `duration`, counted from now if it is overdue
    pub fn snooze(&mut self, now: DateTime<Utc>, duration: Duration) -> Result<()> {
        if self.state == AlarmState::Dismissed {
            return Err(Error::InvalidTransition { from: self.state, to: AlarmState::Snoozed });
        }
        self.time_to_fire = self.time_to_fire.max(now) + duration;
        self.snooze_count += 1;
        self.state = AlarmState::Snoozed;
        Ok(())
    }

    pub fn dismiss(&mut self) -> Result<()> {
        if self.state == AlarmState::Dismissed {
            return Err(Error::InvalidTransition { from: self.state, to: AlarmState::Dismissed });
        }
        self.state = AlarmState::Dismissed;
        Ok(())
    }

    /// Apply a user action. Nothing ever goes back to [`AlarmState::Pending`]
    pub fn transition(&mut self, to: AlarmState, now: DateTime<Utc>, snooze: Duration) -> Result<()> {
        match to {
            AlarmState::Snoozed => self.snooze(now, snooze),
            AlarmState::Dismissed => self.dismiss(),
            AlarmState::Pending => Err(Error::InvalidTransition { from: self.state, to }),
        }
    }

    /// A freshly computed version of this trigger, keeping what the user did with it
    pub(crate) fn refreshed_from(&self, computed: &AlarmRow) -> AlarmRow {
        AlarmRow {
            id: self.id,
            collection_id: computed.collection_id,
            summary: computed.summary.clone(),
            ..self.clone()
        }
    }

    /// This trigger as a new pending alarm
    pub(crate) fn into_pending(mut self) -> AlarmRow {
        self.id = None;
        self.time_to_fire = self.base_time_to_fire;
        self.state = AlarmState::Pending;
        self.snooze_count = 0;
        self
    }
}

impl TableRow for AlarmRow {
    fn row_id(&self) -> Option<RowId> {
        self.id
    }

    fn set_row_id(&mut self, id: RowId) {
        self.id = Some(id);
    }

    fn resource_id(&self) -> ResourceId {
        self.resource_id
    }
}

impl Display for AlarmRow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} alarm of resource {} ({}) at {}", self.state, self.resource_id, self.recurrence_id, self.time_to_fire.to_rfc3339())?;
        if self.snooze_count > 0 {
            write!(f, ", snoozed {} times", self.snooze_count)?;
        }
        if !self.summary.is_empty() {
            write!(f, ": {}", self.summary)?;
        }
        Ok(())
    }
}
