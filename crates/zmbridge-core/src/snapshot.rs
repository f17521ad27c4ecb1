use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::derive;
use crate::model::{MonitorFunction, SubModes, TimePeriod};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EventQuery {
    pub period: TimePeriod,
    pub include_archived: bool,
}

impl EventQuery {
    pub fn new(period: TimePeriod, include_archived: bool) -> Self {
        Self {
            period,
            include_archived,
        }
    }

    pub fn label(&self) -> String {
        if self.include_archived {
            format!("{}+archived", self.period.key())
        } else {
            self.period.key().to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorSnapshot {
    pub id: u32,
    pub function: Option<MonitorFunction>,
    pub is_recording: bool,
    pub is_available: bool,
    pub sub_modes: Option<SubModes>,
    /// `None` marks a count whose fetch returned no data this cycle.
    #[serde(serialize_with = "serialize_events")]
    pub events: BTreeMap<EventQuery, Option<u64>>,
}

impl MonitorSnapshot {
    pub fn event_count(&self, query: EventQuery) -> Option<u64> {
        self.events.get(&query).copied().flatten()
    }

    pub fn status_text(&self) -> Option<String> {
        derive::status_text(self.function, self.sub_modes)
    }
}

fn serialize_events<S: Serializer>(
    events: &BTreeMap<EventQuery, Option<u64>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let labelled: BTreeMap<String, Option<u64>> =
        events.iter().map(|(query, count)| (query.label(), *count)).collect();
    labelled.serialize(serializer)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerSnapshot {
    pub fetched_at: DateTime<Utc>,
    pub monitors: BTreeMap<u32, MonitorSnapshot>,
    pub run_state: Option<String>,
    pub available_run_states: Vec<String>,
    pub server_available: bool,
}

impl ServerSnapshot {
    pub fn monitor(&self, id: u32) -> Option<&MonitorSnapshot> {
        self.monitors.get(&id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Freshness {
    Fresh,
    Stale,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshState {
    pub snapshot: Option<Arc<ServerSnapshot>>,
    pub last_refresh_ok: bool,
    pub last_error: Option<String>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub cycles_ok: u64,
    pub cycles_err: u64,
}

impl RefreshState {
    pub fn freshness(&self) -> Freshness {
        if self.last_refresh_ok {
            Freshness::Fresh
        } else {
            Freshness::Stale
        }
    }

    pub fn monitor(&self, id: u32) -> Option<&MonitorSnapshot> {
        self.snapshot.as_deref().and_then(|s| s.monitor(id))
    }
}
