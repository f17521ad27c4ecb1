use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::client::{EventCounts, MonitorDescriptor, StreamOptions, StreamUrls, ZmApi, ZmError};
use crate::model::{
    Analysing, Capturing, MonitorFunction, PtzCommand, RecordingMode, RunState, TimePeriod,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeCall {
    Login,
    Version,
    MonitorList,
    BulkStatus,
    EventCounts,
    RunStates,
    SetRunState,
    Availability,
    SetFunction,
    SetCapturing,
    SetAnalysing,
    SetRecording,
    ForceAlarm,
    Ptz,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FakeWrite {
    RunState(String),
    Function(u32, MonitorFunction),
    Capturing(u32, Capturing),
    Analysing(u32, Analysing),
    Recording(u32, RecordingMode),
    ForceAlarm(u32, bool),
    Ptz(u32, PtzCommand),
}

struct FakeState {
    monitors: Vec<MonitorDescriptor>,
    counts: HashMap<(TimePeriod, bool), Option<EventCounts>>,
    run_states: Vec<RunState>,
    available: bool,
    login_result: bool,
    write_result: bool,
    version: Option<String>,
    calls: HashMap<FakeCall, usize>,
    failures: HashMap<FakeCall, VecDeque<ZmError>>,
    event_requests: Vec<(TimePeriod, bool)>,
    writes: Vec<FakeWrite>,
}

pub struct FakeZm {
    state: Mutex<FakeState>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeZm {
    pub fn with_monitors(monitors: &[(u32, &str)]) -> Self {
        let monitors = monitors
            .iter()
            .map(|(id, name)| {
                let mut monitor = MonitorDescriptor::new(*id, *name);
                monitor.function = Some(MonitorFunction::Modect);
                monitor.is_available = true;
                monitor
            })
            .collect();

        Self {
            state: Mutex::new(FakeState {
                monitors,
                counts: HashMap::new(),
                run_states: vec![RunState::new("Running", true)],
                available: true,
                login_result: true,
                write_result: true,
                version: Some("1.36.33".to_string()),
                calls: HashMap::new(),
                failures: HashMap::new(),
                event_requests: Vec::new(),
                writes: Vec::new(),
            }),
            gate: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn monitor_list(&self) -> Vec<MonitorDescriptor> {
        self.lock().monitors.clone()
    }

    pub fn update_monitor(&self, id: u32, f: impl FnOnce(&mut MonitorDescriptor)) {
        let mut state = self.lock();
        if let Some(monitor) = state.monitors.iter_mut().find(|m| m.id == id) {
            f(monitor);
        }
    }

    pub fn set_counts(&self, period: TimePeriod, include_archived: bool, counts: Option<&[(u32, u64)]>) {
        let counts = counts.map(|pairs| {
            pairs
                .iter()
                .map(|(id, count)| (id.to_string(), *count))
                .collect::<EventCounts>()
        });
        self.lock().counts.insert((period, include_archived), counts);
    }

    pub fn set_run_states(&self, states: Vec<RunState>) {
        self.lock().run_states = states;
    }

    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    pub fn set_version(&self, version: Option<&str>) {
        self.lock().version = version.map(str::to_string);
    }

    pub fn set_login_result(&self, result: bool) {
        self.lock().login_result = result;
    }

    pub fn set_write_result(&self, result: bool) {
        self.lock().write_result = result;
    }

    // The next call of `call` fails with `err`; later calls succeed again.
    pub fn fail_next(&self, call: FakeCall, err: ZmError) {
        self.lock().failures.entry(call).or_default().push_back(err);
    }

    // Blocks bulk status refreshes until permits are added to the returned gate.
    pub fn hold_bulk_status(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(gate.clone());
        gate
    }

    pub fn calls(&self, call: FakeCall) -> usize {
        self.lock().calls.get(&call).copied().unwrap_or(0)
    }

    pub fn event_count_requests(&self) -> Vec<(TimePeriod, bool)> {
        self.lock().event_requests.clone()
    }

    pub fn writes(&self) -> Vec<FakeWrite> {
        self.lock().writes.clone()
    }

    fn enter(&self, call: FakeCall) -> Result<MutexGuard<'_, FakeState>, ZmError> {
        let mut state = self.lock();
        *state.calls.entry(call).or_insert(0) += 1;
        if let Some(err) = state.failures.get_mut(&call).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(state)
    }

    fn write(&self, call: FakeCall, write: FakeWrite) -> Result<bool, ZmError> {
        let mut state = self.enter(call)?;
        let result = state.write_result;
        if result {
            apply_write(&mut state.monitors, &write);
        }
        state.writes.push(write);
        Ok(result)
    }
}

fn apply_write(monitors: &mut [MonitorDescriptor], write: &FakeWrite) {
    let target = |id: u32, monitors: &mut [MonitorDescriptor]| -> Option<usize> {
        monitors.iter().position(|m| m.id == id)
    };
    match write {
        FakeWrite::Function(id, function) => {
            if let Some(idx) = target(*id, monitors) {
                monitors[idx].function = Some(*function);
            }
        }
        FakeWrite::Capturing(id, value) => {
            if let Some(modes) = target(*id, monitors).and_then(|i| monitors[i].sub_modes.as_mut()) {
                modes.capturing = *value;
            }
        }
        FakeWrite::Analysing(id, value) => {
            if let Some(modes) = target(*id, monitors).and_then(|i| monitors[i].sub_modes.as_mut()) {
                modes.analysing = *value;
            }
        }
        FakeWrite::Recording(id, value) => {
            if let Some(modes) = target(*id, monitors).and_then(|i| monitors[i].sub_modes.as_mut()) {
                modes.recording = *value;
            }
        }
        FakeWrite::ForceAlarm(id, on) => {
            if let Some(idx) = target(*id, monitors) {
                monitors[idx].is_recording = *on;
            }
        }
        FakeWrite::RunState(_) | FakeWrite::Ptz(..) => {}
    }
}

#[async_trait]
impl ZmApi for FakeZm {
    async fn login(&self) -> Result<bool, ZmError> {
        Ok(self.enter(FakeCall::Login)?.login_result)
    }

    async fn server_version(&self) -> Result<Option<String>, ZmError> {
        Ok(self.enter(FakeCall::Version)?.version.clone())
    }

    async fn fetch_monitor_list(&self) -> Result<Vec<MonitorDescriptor>, ZmError> {
        Ok(self.enter(FakeCall::MonitorList)?.monitors.clone())
    }

    async fn bulk_refresh_monitor_status(
        &self,
        monitors: &mut [MonitorDescriptor],
    ) -> Result<(), ZmError> {
        let latest = self.enter(FakeCall::BulkStatus)?.monitors.clone();

        let gate = self.gate.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        for monitor in monitors.iter_mut() {
            match latest.iter().find(|m| m.id == monitor.id) {
                Some(fresh) => {
                    monitor.function = fresh.function;
                    monitor.sub_modes = fresh.sub_modes;
                    monitor.controllable = fresh.controllable;
                    monitor.is_recording = fresh.is_recording;
                    monitor.is_available = fresh.is_available;
                }
                None => monitor.is_available = false,
            }
        }
        Ok(())
    }

    async fn fetch_event_counts(
        &self,
        period: TimePeriod,
        include_archived: bool,
    ) -> Result<Option<EventCounts>, ZmError> {
        let mut state = self.enter(FakeCall::EventCounts)?;
        state.event_requests.push((period, include_archived));
        Ok(state
            .counts
            .get(&(period, include_archived))
            .cloned()
            .unwrap_or_else(|| Some(EventCounts::new())))
    }

    async fn fetch_run_states(&self) -> Result<Vec<RunState>, ZmError> {
        Ok(self.enter(FakeCall::RunStates)?.run_states.clone())
    }

    async fn set_active_run_state(&self, name: &str) -> Result<bool, ZmError> {
        let result = self.write(FakeCall::SetRunState, FakeWrite::RunState(name.to_string()))?;
        if result {
            let mut state = self.lock();
            for run_state in state.run_states.iter_mut() {
                run_state.active = run_state.name == name;
            }
        }
        Ok(result)
    }

    async fn is_available(&self) -> Result<bool, ZmError> {
        Ok(self.enter(FakeCall::Availability)?.available)
    }

    async fn set_function(&self, monitor_id: u32, function: MonitorFunction) -> Result<bool, ZmError> {
        self.write(FakeCall::SetFunction, FakeWrite::Function(monitor_id, function))
    }

    async fn set_capturing(&self, monitor_id: u32, value: Capturing) -> Result<bool, ZmError> {
        self.write(FakeCall::SetCapturing, FakeWrite::Capturing(monitor_id, value))
    }

    async fn set_analysing(&self, monitor_id: u32, value: Analysing) -> Result<bool, ZmError> {
        self.write(FakeCall::SetAnalysing, FakeWrite::Analysing(monitor_id, value))
    }

    async fn set_recording_mode(&self, monitor_id: u32, value: RecordingMode) -> Result<bool, ZmError> {
        self.write(FakeCall::SetRecording, FakeWrite::Recording(monitor_id, value))
    }

    async fn set_force_alarm(&self, monitor_id: u32, on: bool) -> Result<bool, ZmError> {
        self.write(FakeCall::ForceAlarm, FakeWrite::ForceAlarm(monitor_id, on))
    }

    async fn ptz(&self, monitor_id: u32, command: PtzCommand) -> Result<bool, ZmError> {
        self.write(FakeCall::Ptz, FakeWrite::Ptz(monitor_id, command))
    }

    fn stream_urls(&self, monitor_id: u32, _options: StreamOptions) -> StreamUrls {
        StreamUrls {
            mjpeg: format!("http://fake/zms?mode=jpeg&monitor={monitor_id}"),
            still: format!("http://fake/zms?mode=single&monitor={monitor_id}"),
        }
    }
}
