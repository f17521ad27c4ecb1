use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::client::{MonitorDescriptor, StreamOptions, StreamUrls, ZmError};
use crate::config::ServerOptions;
use crate::coordinator::{Coordinator, SharedClient};
use crate::derive::{self, EffectiveFunction, CUSTOM_LABEL};
use crate::model::{Analysing, ApiShape, Capturing, MonitorFunction, PtzCommand, RecordingMode};
use crate::snapshot::{EventQuery, MonitorSnapshot, RefreshState};

pub const MANUFACTURER: &str = "ZoneMinder";
pub const EVENTS_UNIT: &str = "Events";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Sensor,
    BinarySensor,
    Switch,
    Select,
    Camera,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Sensor => "sensor",
            EntityKind::BinarySensor => "binary_sensor",
            EntityKind::Switch => "switch",
            EntityKind::Select => "select",
            EntityKind::Camera => "camera",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub identifier: String,
    pub name: String,
    pub manufacturer: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via_device: Option<String>,
}

impl DeviceInfo {
    pub fn server(host: &str, sw_version: Option<String>) -> Self {
        Self {
            identifier: host.to_string(),
            name: host.to_string(),
            manufacturer: MANUFACTURER,
            sw_version,
            via_device: None,
        }
    }

    pub fn monitor(host: &str, id: u32, name: &str) -> Self {
        Self {
            identifier: format!("{host}_{id}"),
            name: name.to_string(),
            manufacturer: MANUFACTURER,
            sw_version: None,
            via_device: Some(host.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StateValue {
    On(bool),
    Count(u64),
    Text(String),
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::On(true) => f.write_str("on"),
            StateValue::On(false) => f.write_str("off"),
            StateValue::Count(n) => write!(f, "{n}"),
            StateValue::Text(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityState {
    pub unique_id: String,
    pub name: String,
    pub kind: EntityKind,
    pub device: String,
    pub available: bool,
    pub state: Option<StateValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl EntityState {
    fn new(entity: &dyn Entity, available: bool, state: Option<StateValue>) -> Self {
        Self {
            unique_id: entity.unique_id().to_string(),
            name: entity.name().to_string(),
            kind: entity.kind(),
            device: entity.device().identifier.clone(),
            available,
            state,
            icon: None,
            unit: None,
            device_class: None,
            options: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    fn icon(mut self, icon: &'static str) -> Self {
        self.icon = Some(icon);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntityCommand {
    TurnOn,
    TurnOff,
    SelectOption(String),
    Ptz(PtzCommand),
}

impl EntityCommand {
    pub fn name(&self) -> &'static str {
        match self {
            EntityCommand::TurnOn => "turn_on",
            EntityCommand::TurnOff => "turn_off",
            EntityCommand::SelectOption(_) => "select_option",
            EntityCommand::Ptz(_) => "ptz",
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{action} failed: {source}")]
    Failed {
        action: String,
        #[source]
        source: ZmError,
    },
    #[error("{0} was rejected by the server")]
    Rejected(String),
    #[error("{entity} has no option {option:?}")]
    InvalidOption { entity: String, option: String },
    #[error("{entity} does not support {command}")]
    Unsupported { entity: String, command: &'static str },
    #[error("no data yet for {0}")]
    NoData(String),
}

fn unsupported(entity: &dyn Entity, command: &EntityCommand) -> CommandError {
    CommandError::Unsupported {
        entity: entity.unique_id().to_string(),
        command: command.name(),
    }
}

fn invalid_option(entity: &dyn Entity, option: &str) -> CommandError {
    CommandError::InvalidOption {
        entity: entity.unique_id().to_string(),
        option: option.to_string(),
    }
}

#[async_trait]
pub trait Entity: Send + Sync {
    fn unique_id(&self) -> &str;
    fn name(&self) -> &str;
    fn kind(&self) -> EntityKind;
    fn device(&self) -> &DeviceInfo;

    fn event_queries(&self) -> Vec<EventQuery> {
        Vec::new()
    }

    fn render(&self, state: &RefreshState) -> EntityState;

    async fn command(&self, command: &EntityCommand) -> Result<(), CommandError>;
}

pub type SharedEntity = Arc<dyn Entity>;

pub struct ServerContext {
    pub host: String,
    pub shape: ApiShape,
    pub options: ServerOptions,
    pub coordinator: Arc<Coordinator>,
    pub device: DeviceInfo,
}

impl ServerContext {
    pub fn client(&self) -> &SharedClient {
        self.coordinator.client()
    }

    // Runs one write, requests a refresh whatever the outcome, and maps the result.
    pub(crate) async fn write<F>(&self, action: String, call: F) -> Result<(), CommandError>
    where
        F: Future<Output = Result<bool, ZmError>> + Send,
    {
        let result = call.await;
        self.coordinator.request_refresh();
        match result {
            Ok(true) => {
                info!(server = %self.host, "{action}");
                Ok(())
            }
            Ok(false) => {
                error!(server = %self.host, "{action} was rejected");
                Err(CommandError::Rejected(action))
            }
            Err(source) => {
                error!(server = %self.host, "error during {action}: {source}");
                Err(CommandError::Failed { action, source })
            }
        }
    }
}

struct MonitorInfo {
    id: u32,
    name: String,
    controllable: bool,
    device: DeviceInfo,
}

impl MonitorInfo {
    fn new(host: &str, monitor: &MonitorDescriptor) -> Self {
        Self {
            id: monitor.id,
            name: monitor.name.clone(),
            controllable: monitor.controllable,
            device: DeviceInfo::monitor(host, monitor.id, &monitor.name),
        }
    }

    fn available(&self, state: &RefreshState) -> bool {
        state.last_refresh_ok && state.monitor(self.id).is_some_and(|m| m.is_available)
    }

    fn snapshot<'a>(&self, state: &'a RefreshState) -> Option<&'a MonitorSnapshot> {
        state.monitor(self.id)
    }
}

fn server_available(state: &RefreshState) -> bool {
    state.last_refresh_ok && state.snapshot.as_ref().is_some_and(|s| s.server_available)
}

pub fn build_entities(ctx: &Arc<ServerContext>, monitors: &[MonitorDescriptor]) -> Vec<SharedEntity> {
    let host = ctx.host.as_str();
    let mut entities: Vec<SharedEntity> = vec![
        Arc::new(RunStateSensor::new(ctx.clone())),
        Arc::new(RunStateSelect::new(ctx.clone())),
        Arc::new(AvailabilitySensor::new(ctx.clone())),
    ];

    for monitor in monitors {
        entities.push(Arc::new(MonitorStatusSensor {
            unique_id: format!("{host}_{}_status", monitor.id),
            name: format!("{} Status", monitor.name),
            monitor: MonitorInfo::new(host, monitor),
        }));
        for period in &ctx.options.monitored_conditions {
            let query = EventQuery::new(*period, ctx.options.include_archived);
            entities.push(Arc::new(EventCountSensor {
                unique_id: format!("{host}_{}_events_{}", monitor.id, period.key()),
                name: format!("{} {}", monitor.name, period.title()),
                monitor: MonitorInfo::new(host, monitor),
                query,
            }));
        }

        match ctx.shape {
            ApiShape::Classic => entities.push(Arc::new(FunctionSwitch {
                ctx: ctx.clone(),
                unique_id: format!("{host}_{}_switch", monitor.id),
                name: format!("{} State", monitor.name),
                monitor: MonitorInfo::new(host, monitor),
            })),
            ApiShape::Extended => {
                entities.push(Arc::new(FunctionSelect {
                    ctx: ctx.clone(),
                    unique_id: format!("{host}_{}_function", monitor.id),
                    name: format!("{} Function", monitor.name),
                    monitor: MonitorInfo::new(host, monitor),
                }));
                for field in SubModeField::ALL {
                    entities.push(Arc::new(SubModeSelect {
                        ctx: ctx.clone(),
                        unique_id: format!("{host}_{}_{}", monitor.id, field.key()),
                        name: format!("{} {}", monitor.name, field.title()),
                        monitor: MonitorInfo::new(host, monitor),
                        field,
                    }));
                }
            }
        }

        entities.push(Arc::new(ForceAlarmSwitch {
            ctx: ctx.clone(),
            unique_id: format!("{host}_{}_force_alarm", monitor.id),
            name: format!("{} Force Alarm", monitor.name),
            monitor: MonitorInfo::new(host, monitor),
        }));

        let stream = StreamOptions {
            scale: ctx.options.stream_scale,
            maxfps: ctx.options.stream_maxfps,
        };
        entities.push(Arc::new(MonitorCamera {
            ctx: ctx.clone(),
            unique_id: format!("{host}_{}", monitor.id),
            name: monitor.name.clone(),
            urls: ctx.client().stream_urls(monitor.id, stream),
            monitor: MonitorInfo::new(host, monitor),
        }));
    }

    entities
}

pub struct MonitorStatusSensor {
    unique_id: String,
    name: String,
    monitor: MonitorInfo,
}

#[async_trait]
impl Entity for MonitorStatusSensor {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Sensor
    }

    fn device(&self) -> &DeviceInfo {
        &self.monitor.device
    }

    fn render(&self, state: &RefreshState) -> EntityState {
        let value = self
            .monitor
            .snapshot(state)
            .and_then(MonitorSnapshot::status_text)
            .map(StateValue::Text);
        EntityState::new(self, self.monitor.available(state), value)
    }

    async fn command(&self, command: &EntityCommand) -> Result<(), CommandError> {
        Err(unsupported(self, command))
    }
}

pub struct EventCountSensor {
    unique_id: String,
    name: String,
    monitor: MonitorInfo,
    query: EventQuery,
}

#[async_trait]
impl Entity for EventCountSensor {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Sensor
    }

    fn device(&self) -> &DeviceInfo {
        &self.monitor.device
    }

    fn event_queries(&self) -> Vec<EventQuery> {
        vec![self.query]
    }

    fn render(&self, state: &RefreshState) -> EntityState {
        let value = self
            .monitor
            .snapshot(state)
            .and_then(|m| m.event_count(self.query))
            .map(StateValue::Count);
        let mut rendered = EntityState::new(self, state.last_refresh_ok, value);
        rendered.unit = Some(EVENTS_UNIT);
        rendered
    }

    async fn command(&self, command: &EntityCommand) -> Result<(), CommandError> {
        Err(unsupported(self, command))
    }
}

pub struct RunStateSensor {
    ctx: Arc<ServerContext>,
    unique_id: String,
}

impl RunStateSensor {
    fn new(ctx: Arc<ServerContext>) -> Self {
        let unique_id = format!("{}_run_state", ctx.host);
        Self { ctx, unique_id }
    }
}

#[async_trait]
impl Entity for RunStateSensor {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn name(&self) -> &str {
        "Run State"
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Sensor
    }

    fn device(&self) -> &DeviceInfo {
        &self.ctx.device
    }

    fn render(&self, state: &RefreshState) -> EntityState {
        let value = state
            .snapshot
            .as_ref()
            .and_then(|s| s.run_state.clone())
            .map(StateValue::Text);
        EntityState::new(self, server_available(state), value)
    }

    async fn command(&self, command: &EntityCommand) -> Result<(), CommandError> {
        Err(unsupported(self, command))
    }
}

pub struct RunStateSelect {
    ctx: Arc<ServerContext>,
    unique_id: String,
}

impl RunStateSelect {
    fn new(ctx: Arc<ServerContext>) -> Self {
        let unique_id = format!("{}_run_state_select", ctx.host);
        Self { ctx, unique_id }
    }
}

#[async_trait]
impl Entity for RunStateSelect {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn name(&self) -> &str {
        "Run State Select"
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Select
    }

    fn device(&self) -> &DeviceInfo {
        &self.ctx.device
    }

    fn render(&self, state: &RefreshState) -> EntityState {
        let snapshot = state.snapshot.as_deref();
        let value = snapshot
            .and_then(|s| s.run_state.clone())
            .map(StateValue::Text);
        let mut rendered = EntityState::new(self, server_available(state), value);
        rendered.options = snapshot
            .map(|s| s.available_run_states.clone())
            .unwrap_or_default();
        rendered
    }

    async fn command(&self, command: &EntityCommand) -> Result<(), CommandError> {
        let EntityCommand::SelectOption(option) = command else {
            return Err(unsupported(self, command));
        };
        let snapshot = self
            .ctx
            .coordinator
            .current_snapshot()
            .ok_or_else(|| CommandError::NoData(self.unique_id.clone()))?;
        if !snapshot.available_run_states.iter().any(|s| s == option) {
            return Err(invalid_option(self, option));
        }

        self.ctx
            .write(
                format!("change run state to {option}"),
                self.ctx.client().set_active_run_state(option),
            )
            .await
    }
}

pub struct AvailabilitySensor {
    ctx: Arc<ServerContext>,
    unique_id: String,
}

impl AvailabilitySensor {
    fn new(ctx: Arc<ServerContext>) -> Self {
        let unique_id = format!("{}_availability", ctx.host);
        Self { ctx, unique_id }
    }
}

#[async_trait]
impl Entity for AvailabilitySensor {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn name(&self) -> &str {
        &self.ctx.host
    }

    fn kind(&self) -> EntityKind {
        EntityKind::BinarySensor
    }

    fn device(&self) -> &DeviceInfo {
        &self.ctx.device
    }

    fn render(&self, state: &RefreshState) -> EntityState {
        let on = state.snapshot.as_ref().is_some_and(|s| s.server_available);
        let mut rendered = EntityState::new(self, state.last_refresh_ok, Some(StateValue::On(on)));
        rendered.device_class = Some("connectivity");
        rendered
    }

    async fn command(&self, command: &EntityCommand) -> Result<(), CommandError> {
        Err(unsupported(self, command))
    }
}

pub struct FunctionSwitch {
    ctx: Arc<ServerContext>,
    unique_id: String,
    name: String,
    monitor: MonitorInfo,
}

#[async_trait]
impl Entity for FunctionSwitch {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Switch
    }

    fn device(&self) -> &DeviceInfo {
        &self.monitor.device
    }

    fn render(&self, state: &RefreshState) -> EntityState {
        let value = self.monitor.snapshot(state).map(|m| {
            let effective = derive::effective_function(m.function, m.sub_modes);
            StateValue::On(effective == EffectiveFunction::Classic(self.ctx.options.command_on))
        });
        EntityState::new(self, self.monitor.available(state), value).icon("mdi:record-rec")
    }

    async fn command(&self, command: &EntityCommand) -> Result<(), CommandError> {
        let function = match command {
            EntityCommand::TurnOn => self.ctx.options.command_on,
            EntityCommand::TurnOff => self.ctx.options.command_off,
            _ => return Err(unsupported(self, command)),
        };
        self.ctx
            .write(
                format!("set {} function to {function}", self.monitor.name),
                self.ctx.client().set_function(self.monitor.id, function),
            )
            .await
    }
}

pub struct ForceAlarmSwitch {
    ctx: Arc<ServerContext>,
    unique_id: String,
    name: String,
    monitor: MonitorInfo,
}

#[async_trait]
impl Entity for ForceAlarmSwitch {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Switch
    }

    fn device(&self) -> &DeviceInfo {
        &self.monitor.device
    }

    fn render(&self, state: &RefreshState) -> EntityState {
        let value = self
            .monitor
            .snapshot(state)
            .map(|m| StateValue::On(m.is_recording));
        EntityState::new(self, self.monitor.available(state), value).icon("mdi:alarm-light")
    }

    async fn command(&self, command: &EntityCommand) -> Result<(), CommandError> {
        let on = match command {
            EntityCommand::TurnOn => true,
            EntityCommand::TurnOff => false,
            _ => return Err(unsupported(self, command)),
        };
        let verb = if on { "turn on" } else { "turn off" };
        self.ctx
            .write(
                format!("{verb} force alarm for {}", self.monitor.name),
                self.ctx.client().set_force_alarm(self.monitor.id, on),
            )
            .await
    }
}

pub struct FunctionSelect {
    ctx: Arc<ServerContext>,
    unique_id: String,
    name: String,
    monitor: MonitorInfo,
}

#[async_trait]
impl Entity for FunctionSelect {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Select
    }

    fn device(&self) -> &DeviceInfo {
        &self.monitor.device
    }

    fn render(&self, state: &RefreshState) -> EntityState {
        let current = self
            .monitor
            .snapshot(state)
            .and_then(|m| derive::select_option(m.function, m.sub_modes));
        let mut options: Vec<String> = MonitorFunction::ALL.iter().map(|f| f.to_string()).collect();
        if current.as_deref() == Some(CUSTOM_LABEL) {
            options.push(CUSTOM_LABEL.to_string());
        }

        let mut rendered =
            EntityState::new(self, self.monitor.available(state), current.map(StateValue::Text));
        rendered.options = options;
        rendered
    }

    async fn command(&self, command: &EntityCommand) -> Result<(), CommandError> {
        let EntityCommand::SelectOption(option) = command else {
            return Err(unsupported(self, command));
        };
        let function: MonitorFunction = option.parse().map_err(|_| invalid_option(self, option))?;
        let modes = derive::sub_modes_for(function);
        let client = self.ctx.client();
        let id = self.monitor.id;
        let name = &self.monitor.name;

        self.ctx
            .write(
                format!("set {name} capturing to {}", modes.capturing),
                client.set_capturing(id, modes.capturing),
            )
            .await?;
        self.ctx
            .write(
                format!("set {name} analysing to {}", modes.analysing),
                client.set_analysing(id, modes.analysing),
            )
            .await?;
        self.ctx
            .write(
                format!("set {name} recording to {}", modes.recording),
                client.set_recording_mode(id, modes.recording),
            )
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubModeField {
    Capturing,
    Analysing,
    Recording,
}

impl SubModeField {
    pub const ALL: [SubModeField; 3] = [
        SubModeField::Capturing,
        SubModeField::Analysing,
        SubModeField::Recording,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            SubModeField::Capturing => "capturing",
            SubModeField::Analysing => "analysing",
            SubModeField::Recording => "recording",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            SubModeField::Capturing => "Capturing",
            SubModeField::Analysing => "Analysing",
            SubModeField::Recording => "Recording",
        }
    }

    fn options(&self) -> Vec<String> {
        fn names<T: ToString>(values: &[T]) -> Vec<String> {
            values.iter().map(ToString::to_string).collect()
        }
        match self {
            SubModeField::Capturing => names(Capturing::ALL),
            SubModeField::Analysing => names(Analysing::ALL),
            SubModeField::Recording => names(RecordingMode::ALL),
        }
    }
}

pub struct SubModeSelect {
    ctx: Arc<ServerContext>,
    unique_id: String,
    name: String,
    monitor: MonitorInfo,
    field: SubModeField,
}

#[async_trait]
impl Entity for SubModeSelect {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Select
    }

    fn device(&self) -> &DeviceInfo {
        &self.monitor.device
    }

    fn render(&self, state: &RefreshState) -> EntityState {
        let current = self
            .monitor
            .snapshot(state)
            .and_then(|m| m.sub_modes)
            .map(|modes| match self.field {
                SubModeField::Capturing => modes.capturing.to_string(),
                SubModeField::Analysing => modes.analysing.to_string(),
                SubModeField::Recording => modes.recording.to_string(),
            });
        let mut rendered =
            EntityState::new(self, self.monitor.available(state), current.map(StateValue::Text));
        rendered.options = self.field.options();
        rendered
    }

    async fn command(&self, command: &EntityCommand) -> Result<(), CommandError> {
        let EntityCommand::SelectOption(option) = command else {
            return Err(unsupported(self, command));
        };
        let client = self.ctx.client();
        let id = self.monitor.id;
        let action = format!("set {} {} to {option}", self.monitor.name, self.field.key());

        match self.field {
            SubModeField::Capturing => {
                let value: Capturing = option.parse().map_err(|_| invalid_option(self, option))?;
                self.ctx.write(action, client.set_capturing(id, value)).await
            }
            SubModeField::Analysing => {
                let value: Analysing = option.parse().map_err(|_| invalid_option(self, option))?;
                self.ctx.write(action, client.set_analysing(id, value)).await
            }
            SubModeField::Recording => {
                let value: RecordingMode = option.parse().map_err(|_| invalid_option(self, option))?;
                self.ctx.write(action, client.set_recording_mode(id, value)).await
            }
        }
    }
}

pub struct MonitorCamera {
    ctx: Arc<ServerContext>,
    unique_id: String,
    name: String,
    urls: StreamUrls,
    monitor: MonitorInfo,
}

#[async_trait]
impl Entity for MonitorCamera {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Camera
    }

    fn device(&self) -> &DeviceInfo {
        &self.monitor.device
    }

    fn render(&self, state: &RefreshState) -> EntityState {
        let recording = self.monitor.snapshot(state).is_some_and(|m| m.is_recording);
        let value = StateValue::Text(if recording { "recording" } else { "idle" }.to_string());
        let mut rendered = EntityState::new(self, self.monitor.available(state), Some(value));
        rendered.attributes.insert("mjpeg_url".into(), self.urls.mjpeg.clone().into());
        rendered.attributes.insert("still_image_url".into(), self.urls.still.clone().into());
        rendered
            .attributes
            .insert("supports_ptz".into(), self.monitor.controllable.into());
        rendered
    }

    async fn command(&self, command: &EntityCommand) -> Result<(), CommandError> {
        match command {
            EntityCommand::Ptz(ptz) if self.monitor.controllable => {
                self.ctx
                    .write(
                        format!("ptz {} on {}", ptz.control(), self.monitor.name),
                        self.ctx.client().ptz(self.monitor.id, *ptz),
                    )
                    .await
            }
            _ => Err(unsupported(self, command)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::fake::{FakeCall, FakeWrite, FakeZm};
    use crate::model::{SubModes, TimePeriod};

    const HOST: &str = "zm.example.com";

    fn context(fake: &Arc<FakeZm>, shape: ApiShape, options: ServerOptions) -> Arc<ServerContext> {
        let coordinator = Arc::new(Coordinator::new(
            HOST,
            fake.clone(),
            fake.monitor_list(),
            CoordinatorConfig::default(),
        ));
        Arc::new(ServerContext {
            host: HOST.to_string(),
            shape,
            options,
            coordinator,
            device: DeviceInfo::server(HOST, Some("1.36.33".into())),
        })
    }

    fn entity<'a>(entities: &'a [SharedEntity], unique_id: &str) -> &'a SharedEntity {
        entities
            .iter()
            .find(|e| e.unique_id() == unique_id)
            .unwrap_or_else(|| panic!("missing entity {unique_id}"))
    }

    fn ids(entities: &[SharedEntity]) -> Vec<&str> {
        entities.iter().map(|e| e.unique_id()).collect()
    }

    #[tokio::test]
    async fn classic_server_entity_set() {
        // Arrange
        let fake = Arc::new(FakeZm::with_monitors(&[(1, "Front Door")]));
        let mut options = ServerOptions::default();
        options.monitored_conditions = vec![TimePeriod::All, TimePeriod::Hour];
        let ctx = context(&fake, ApiShape::Classic, options);

        // Act
        let entities = build_entities(&ctx, &fake.monitor_list());

        // Assert
        assert_eq!(
            ids(&entities),
            vec![
                "zm.example.com_run_state",
                "zm.example.com_run_state_select",
                "zm.example.com_availability",
                "zm.example.com_1_status",
                "zm.example.com_1_events_all",
                "zm.example.com_1_events_hour",
                "zm.example.com_1_switch",
                "zm.example.com_1_force_alarm",
                "zm.example.com_1",
            ]
        );
        let hour = entity(&entities, "zm.example.com_1_events_hour");
        assert_eq!(hour.name(), "Front Door Events Last Hour");
        assert_eq!(hour.event_queries(), vec![EventQuery::new(TimePeriod::Hour, false)]);
        let device = entity(&entities, "zm.example.com_1_status").device();
        assert_eq!(device.identifier, "zm.example.com_1");
        assert_eq!(device.via_device.as_deref(), Some(HOST));
    }

    #[tokio::test]
    async fn extended_server_gets_selects_instead_of_switch() {
        let fake = Arc::new(FakeZm::with_monitors(&[(2, "Yard")]));
        let ctx = context(&fake, ApiShape::Extended, ServerOptions::default());

        let entities = build_entities(&ctx, &fake.monitor_list());
        let ids = ids(&entities);

        assert!(!ids.contains(&"zm.example.com_2_switch"));
        for id in [
            "zm.example.com_2_function",
            "zm.example.com_2_capturing",
            "zm.example.com_2_analysing",
            "zm.example.com_2_recording",
            "zm.example.com_2_force_alarm",
        ] {
            assert!(ids.contains(&id), "{id}");
        }
    }

    #[tokio::test]
    async fn zero_monitors_keep_server_entities() {
        let fake = Arc::new(FakeZm::with_monitors(&[]));
        let ctx = context(&fake, ApiShape::Classic, ServerOptions::default());

        let entities = build_entities(&ctx, &[]);

        assert_eq!(entities.len(), 3);
    }

    #[tokio::test]
    async fn status_sensor_renders_derived_function_and_goes_unavailable_on_failure() {
        // Arrange
        let fake = Arc::new(FakeZm::with_monitors(&[(1, "Front Door")]));
        fake.update_monitor(1, |m| {
            m.function = Some(MonitorFunction::None);
            m.sub_modes = SubModes::parse(Some("Always"), Some("Always"), Some("None"));
        });
        let ctx = context(&fake, ApiShape::Extended, ServerOptions::default());
        let entities = build_entities(&ctx, &fake.monitor_list());
        let status = entity(&entities, "zm.example.com_1_status");
        assert!(ctx.coordinator.refresh().await);

        // Act
        let fresh = status.render(&ctx.coordinator.state());
        fake.fail_next(FakeCall::BulkStatus, ZmError::Connectivity("down".into()));
        assert!(!ctx.coordinator.refresh().await);
        let stale = status.render(&ctx.coordinator.state());

        // Assert
        assert!(fresh.available);
        assert_eq!(fresh.state, Some(StateValue::Text("Always/Always/None".into())));
        assert!(!stale.available);
        assert_eq!(stale.state, fresh.state);
    }

    #[tokio::test]
    async fn event_sensor_shows_absent_count_as_no_value() {
        let fake = Arc::new(FakeZm::with_monitors(&[(1, "A"), (2, "B")]));
        fake.set_counts(TimePeriod::All, false, Some(&[(1, 12)]));
        let ctx = context(&fake, ApiShape::Classic, ServerOptions::default());
        let entities = build_entities(&ctx, &fake.monitor_list());
        ctx.coordinator
            .register_event_queries(entities.iter().flat_map(|e| e.event_queries()));
        assert!(ctx.coordinator.refresh().await);

        let first = entity(&entities, "zm.example.com_1_events_all").render(&ctx.coordinator.state());
        let second = entity(&entities, "zm.example.com_2_events_all").render(&ctx.coordinator.state());

        assert_eq!(first.state, Some(StateValue::Count(12)));
        assert_eq!(first.unit, Some(EVENTS_UNIT));
        assert_eq!(second.state, Some(StateValue::Count(0)));

        fake.set_counts(TimePeriod::All, false, None);
        assert!(ctx.coordinator.refresh().await);
        let absent = entity(&entities, "zm.example.com_1_events_all").render(&ctx.coordinator.state());
        assert_eq!(absent.state, None);
    }

    #[tokio::test]
    async fn run_state_select_lists_sorted_states_and_changes_state() {
        // Arrange
        let fake = Arc::new(FakeZm::with_monitors(&[]));
        fake.set_run_states(vec![
            crate::model::RunState::new("Running", true),
            crate::model::RunState::new("Away", false),
        ]);
        let ctx = context(&fake, ApiShape::Classic, ServerOptions::default());
        let entities = build_entities(&ctx, &[]);
        let select = entity(&entities, "zm.example.com_run_state_select");
        assert!(ctx.coordinator.refresh().await);

        // Act
        let rendered = select.render(&ctx.coordinator.state());
        select
            .command(&EntityCommand::SelectOption("Away".into()))
            .await
            .expect("change run state");
        let bogus = select.command(&EntityCommand::SelectOption("Vacation".into())).await;

        // Assert
        assert_eq!(rendered.options, vec!["Away", "Running"]);
        assert_eq!(rendered.state, Some(StateValue::Text("Running".into())));
        assert_eq!(fake.writes(), vec![FakeWrite::RunState("Away".into())]);
        assert!(matches!(bogus, Err(CommandError::InvalidOption { .. })));
    }

    #[tokio::test]
    async fn function_switch_writes_configured_functions() {
        let fake = Arc::new(FakeZm::with_monitors(&[(3, "Garage")]));
        let mut options = ServerOptions::default();
        options.command_on = MonitorFunction::Record;
        options.command_off = MonitorFunction::None;
        let ctx = context(&fake, ApiShape::Classic, options);
        let entities = build_entities(&ctx, &fake.monitor_list());
        let switch = entity(&entities, "zm.example.com_3_switch");
        assert!(ctx.coordinator.refresh().await);

        let before = switch.render(&ctx.coordinator.state());
        switch.command(&EntityCommand::TurnOn).await.expect("turn on");
        assert!(ctx.coordinator.refresh().await);
        let after = switch.render(&ctx.coordinator.state());
        switch.command(&EntityCommand::TurnOff).await.expect("turn off");

        assert_eq!(before.state, Some(StateValue::On(false)));
        assert_eq!(before.icon, Some("mdi:record-rec"));
        assert_eq!(after.state, Some(StateValue::On(true)));
        assert_eq!(
            fake.writes(),
            vec![
                FakeWrite::Function(3, MonitorFunction::Record),
                FakeWrite::Function(3, MonitorFunction::None),
            ]
        );
    }

    #[tokio::test]
    async fn failed_and_rejected_writes_surface_command_errors() {
        // Arrange
        let fake = Arc::new(FakeZm::with_monitors(&[(1, "A")]));
        let ctx = context(&fake, ApiShape::Classic, ServerOptions::default());
        let entities = build_entities(&ctx, &fake.monitor_list());
        let alarm = entity(&entities, "zm.example.com_1_force_alarm");

        // Act
        fake.fail_next(FakeCall::ForceAlarm, ZmError::Protocol("500".into()));
        let failed = alarm.command(&EntityCommand::TurnOn).await;
        fake.set_write_result(false);
        let rejected = alarm.command(&EntityCommand::TurnOn).await;
        let unsupported = alarm.command(&EntityCommand::SelectOption("x".into())).await;

        // Assert
        assert!(matches!(failed, Err(CommandError::Failed { .. })));
        assert!(matches!(rejected, Err(CommandError::Rejected(_))));
        assert!(matches!(unsupported, Err(CommandError::Unsupported { .. })));
        assert_eq!(fake.calls(FakeCall::ForceAlarm), 2);
    }

    #[tokio::test]
    async fn write_requests_refresh_even_when_it_fails() {
        let fake = Arc::new(FakeZm::with_monitors(&[(1, "A")]));
        let ctx = context(&fake, ApiShape::Classic, ServerOptions::default());
        let entities = build_entities(&ctx, &fake.monitor_list());
        let runner = {
            let coordinator = ctx.coordinator.clone();
            tokio::spawn(async move { coordinator.run().await })
        };

        fake.fail_next(FakeCall::ForceAlarm, ZmError::Connectivity("reset".into()));
        let result = entity(&entities, "zm.example.com_1_force_alarm")
            .command(&EntityCommand::TurnOn)
            .await;
        for _ in 0..200 {
            if fake.calls(FakeCall::BulkStatus) > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert!(result.is_err());
        assert_eq!(fake.calls(FakeCall::BulkStatus), 1);
        runner.abort();
    }

    #[tokio::test]
    async fn function_select_offers_custom_only_when_unmatched_and_rejects_it() {
        // Arrange
        let fake = Arc::new(FakeZm::with_monitors(&[(1, "A")]));
        fake.update_monitor(1, |m| {
            m.sub_modes = SubModes::parse(Some("Ondemand"), Some("None"), Some("None"));
        });
        let ctx = context(&fake, ApiShape::Extended, ServerOptions::default());
        let entities = build_entities(&ctx, &fake.monitor_list());
        let select = entity(&entities, "zm.example.com_1_function");
        assert!(ctx.coordinator.refresh().await);

        // Act
        let custom = select.render(&ctx.coordinator.state());
        let rejected = select.command(&EntityCommand::SelectOption(CUSTOM_LABEL.into())).await;
        select
            .command(&EntityCommand::SelectOption("Mocord".into()))
            .await
            .expect("select Mocord");
        assert!(ctx.coordinator.refresh().await);
        let classic = select.render(&ctx.coordinator.state());

        // Assert
        assert_eq!(custom.state, Some(StateValue::Text(CUSTOM_LABEL.into())));
        assert_eq!(custom.options.len(), 7);
        assert!(matches!(rejected, Err(CommandError::InvalidOption { .. })));
        assert_eq!(classic.state, Some(StateValue::Text("Mocord".into())));
        assert_eq!(classic.options.len(), 6);
        assert_eq!(
            fake.writes(),
            vec![
                FakeWrite::Capturing(1, Capturing::Always),
                FakeWrite::Analysing(1, Analysing::Always),
                FakeWrite::Recording(1, RecordingMode::Always),
            ]
        );
    }

    #[tokio::test]
    async fn sub_mode_select_parses_its_own_field() {
        let fake = Arc::new(FakeZm::with_monitors(&[(1, "A")]));
        let ctx = context(&fake, ApiShape::Extended, ServerOptions::default());
        let entities = build_entities(&ctx, &fake.monitor_list());
        let recording = entity(&entities, "zm.example.com_1_recording");

        recording
            .command(&EntityCommand::SelectOption("OnMotion".into()))
            .await
            .expect("valid recording mode");
        let invalid = recording.command(&EntityCommand::SelectOption("Ondemand".into())).await;

        assert_eq!(fake.writes(), vec![FakeWrite::Recording(1, RecordingMode::OnMotion)]);
        assert!(matches!(invalid, Err(CommandError::InvalidOption { .. })));
        assert_eq!(
            recording.render(&RefreshState::default()).options,
            vec!["None", "OnMotion", "Always"]
        );
    }

    #[tokio::test]
    async fn camera_reports_recording_streams_and_gates_ptz() {
        // Arrange
        let fake = Arc::new(FakeZm::with_monitors(&[(1, "Fixed"), (2, "Dome")]));
        fake.update_monitor(2, |m| {
            m.controllable = true;
            m.is_recording = true;
        });
        let ctx = context(&fake, ApiShape::Classic, ServerOptions::default());
        let entities = build_entities(&ctx, &fake.monitor_list());
        assert!(ctx.coordinator.refresh().await);
        let fixed = entity(&entities, "zm.example.com_1");
        let dome = entity(&entities, "zm.example.com_2");

        // Act
        let fixed_state = fixed.render(&ctx.coordinator.state());
        let dome_state = dome.render(&ctx.coordinator.state());
        let refused = fixed.command(&EntityCommand::Ptz(PtzCommand::Left)).await;
        dome.command(&EntityCommand::Ptz(PtzCommand::Preset(2)))
            .await
            .expect("ptz on controllable monitor");

        // Assert
        assert_eq!(fixed_state.state, Some(StateValue::Text("idle".into())));
        assert_eq!(dome_state.state, Some(StateValue::Text("recording".into())));
        assert_eq!(dome_state.attributes["supports_ptz"], serde_json::json!(true));
        assert_eq!(
            dome_state.attributes["mjpeg_url"],
            serde_json::json!("http://fake/zms?mode=jpeg&monitor=2")
        );
        assert!(matches!(refused, Err(CommandError::Unsupported { .. })));
        assert_eq!(fake.writes(), vec![FakeWrite::Ptz(2, PtzCommand::Preset(2))]);
    }

    #[tokio::test]
    async fn availability_sensor_follows_server_reachability() {
        let fake = Arc::new(FakeZm::with_monitors(&[]));
        fake.set_available(false);
        let ctx = context(&fake, ApiShape::Classic, ServerOptions::default());
        let entities = build_entities(&ctx, &[]);
        let availability = entity(&entities, "zm.example.com_availability");
        let run_state = entity(&entities, "zm.example.com_run_state");
        assert!(ctx.coordinator.refresh().await);

        let rendered = availability.render(&ctx.coordinator.state());
        let run = run_state.render(&ctx.coordinator.state());

        assert!(rendered.available);
        assert_eq!(rendered.state, Some(StateValue::On(false)));
        assert_eq!(rendered.device_class, Some("connectivity"));
        assert_eq!(rendered.name, HOST);
        assert!(!run.available);
    }
}
