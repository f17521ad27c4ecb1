use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, warn};

use crate::client::{EventCounts, MonitorDescriptor, ZmApi, ZmError};
use crate::config::CoordinatorConfig;
use crate::snapshot::{EventQuery, MonitorSnapshot, RefreshState, ServerSnapshot};

pub type SharedClient = Arc<dyn ZmApi>;

pub struct Coordinator {
    name: String,
    client: SharedClient,
    config: CoordinatorConfig,
    monitors: Mutex<Vec<MonitorDescriptor>>,
    queries: RwLock<BTreeSet<EventQuery>>,
    state: watch::Sender<RefreshState>,
    requested: Notify,
}

impl Coordinator {
    pub fn new(
        name: impl Into<String>,
        client: SharedClient,
        monitors: Vec<MonitorDescriptor>,
        config: CoordinatorConfig,
    ) -> Self {
        let (state, _) = watch::channel(RefreshState::default());
        Self {
            name: name.into(),
            client,
            config,
            monitors: Mutex::new(monitors),
            queries: RwLock::new(BTreeSet::new()),
            state,
            requested: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &SharedClient {
        &self.client
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn register_event_queries(&self, queries: impl IntoIterator<Item = EventQuery>) {
        let mut registered = self.queries.write().unwrap_or_else(|e| e.into_inner());
        registered.extend(queries);
    }

    pub fn event_queries(&self) -> Vec<EventQuery> {
        self.queries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    pub fn current_snapshot(&self) -> Option<Arc<ServerSnapshot>> {
        self.state.borrow().snapshot.clone()
    }

    pub fn last_refresh_succeeded(&self) -> bool {
        self.state.borrow().last_refresh_ok
    }

    pub fn state(&self) -> RefreshState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RefreshState> {
        self.state.subscribe()
    }

    pub fn request_refresh(&self) {
        self.requested.notify_one();
    }

    pub async fn refresh(&self) -> bool {
        let mut monitors = self.monitors.lock().await;
        let queries = self.event_queries();
        let started = Instant::now();
        let attempted_at = Utc::now();

        match self.fetch_all(&mut monitors, &queries).await {
            Ok(snapshot) => {
                debug!(
                    server = %self.name,
                    monitors = snapshot.monitors.len(),
                    queries = queries.len(),
                    elapsed_ms = %started.elapsed().as_millis(),
                    "refresh ok"
                );
                let snapshot = Arc::new(snapshot);
                self.state.send_modify(|state| {
                    state.snapshot = Some(snapshot);
                    state.last_refresh_ok = true;
                    state.last_error = None;
                    state.last_attempt = Some(attempted_at);
                    state.cycles_ok += 1;
                });
                true
            }
            Err(err) => {
                warn!(server = %self.name, "error fetching data: {err}");
                self.state.send_modify(|state| {
                    state.last_refresh_ok = false;
                    state.last_error = Some(err.to_string());
                    state.last_attempt = Some(attempted_at);
                    state.cycles_err += 1;
                });
                false
            }
        }
    }

    pub async fn run(&self) {
        let period = self.config.scan_interval;
        // Setup already ran the first cycle.
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.requested.notified() => {}
            }
            self.refresh().await;
        }
    }

    async fn fetch_all(
        &self,
        monitors: &mut [MonitorDescriptor],
        queries: &[EventQuery],
    ) -> Result<ServerSnapshot, ZmError> {
        self.client.bulk_refresh_monitor_status(monitors).await?;

        let mut counts: BTreeMap<EventQuery, Option<EventCounts>> = BTreeMap::new();
        for query in queries {
            let result = self
                .client
                .fetch_event_counts(query.period, query.include_archived)
                .await?;
            if result.is_none() {
                warn!(server = %self.name, query = %query.label(), "no event counts returned");
            }
            counts.insert(*query, result);
        }

        let monitor_snapshots = monitors
            .iter()
            .map(|monitor| (monitor.id, monitor_snapshot(monitor, &counts)))
            .collect();

        let run_states = self.client.fetch_run_states().await?;
        let run_state = run_states
            .iter()
            .find(|state| state.active)
            .map(|state| state.name.clone());
        let mut available_run_states: Vec<String> =
            run_states.into_iter().map(|state| state.name).collect();
        available_run_states.sort();

        let server_available = self.client.is_available().await?;

        Ok(ServerSnapshot {
            fetched_at: Utc::now(),
            monitors: monitor_snapshots,
            run_state,
            available_run_states,
            server_available,
        })
    }
}

fn monitor_snapshot(
    monitor: &MonitorDescriptor,
    counts: &BTreeMap<EventQuery, Option<EventCounts>>,
) -> MonitorSnapshot {
    let key = monitor.id.to_string();
    // Monitors missing from a successful result simply had no events.
    let events = counts
        .iter()
        .map(|(query, result)| {
            let count = result
                .as_ref()
                .map(|by_monitor| by_monitor.get(&key).copied().unwrap_or(0));
            (*query, count)
        })
        .collect();

    MonitorSnapshot {
        id: monitor.id,
        function: monitor.function,
        is_recording: monitor.is_recording,
        is_available: monitor.is_available,
        sub_modes: monitor.sub_modes,
        events,
    }
}
