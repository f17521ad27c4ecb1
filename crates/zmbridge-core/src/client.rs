use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::model::{
    Analysing, Capturing, MonitorFunction, PtzCommand, RecordingMode, RunState, SubModes,
    TimePeriod,
};

const OPEN_EVENTS_ENDPOINT: &str = "api/events/index/EndDateTime IS NULL.json";

#[derive(Debug, Error)]
pub enum ZmError {
    #[error("connection error: {0}")]
    Connectivity(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("login failed: {0}")]
    Login(String),
}

impl From<reqwest::Error> for ZmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ZmError::Malformed(err.to_string())
        } else if err.is_status() {
            ZmError::Protocol(err.to_string())
        } else {
            ZmError::Connectivity(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorDescriptor {
    pub id: u32,
    pub name: String,
    pub function: Option<MonitorFunction>,
    pub sub_modes: Option<SubModes>,
    pub controllable: bool,
    pub is_recording: bool,
    pub is_available: bool,
}

impl MonitorDescriptor {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            function: None,
            sub_modes: None,
            controllable: false,
            is_recording: false,
            is_available: false,
        }
    }
}

pub type EventCounts = HashMap<String, u64>;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamOptions {
    pub scale: Option<u32>,
    pub maxfps: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamUrls {
    pub mjpeg: String,
    pub still: String,
}

#[async_trait]
pub trait ZmApi: Send + Sync {
    async fn login(&self) -> Result<bool, ZmError>;
    async fn server_version(&self) -> Result<Option<String>, ZmError>;
    async fn fetch_monitor_list(&self) -> Result<Vec<MonitorDescriptor>, ZmError>;
    async fn bulk_refresh_monitor_status(
        &self,
        monitors: &mut [MonitorDescriptor],
    ) -> Result<(), ZmError>;
    /// `Ok(None)` means the server answered, but not with usable counts: an
    /// HTTP error status or a body that does not decode. Transport failures are
    /// still errors.
    async fn fetch_event_counts(
        &self,
        period: TimePeriod,
        include_archived: bool,
    ) -> Result<Option<EventCounts>, ZmError>;
    async fn fetch_run_states(&self) -> Result<Vec<RunState>, ZmError>;
    async fn set_active_run_state(&self, name: &str) -> Result<bool, ZmError>;
    async fn is_available(&self) -> Result<bool, ZmError>;
    async fn set_function(&self, monitor_id: u32, function: MonitorFunction) -> Result<bool, ZmError>;
    async fn set_capturing(&self, monitor_id: u32, value: Capturing) -> Result<bool, ZmError>;
    async fn set_analysing(&self, monitor_id: u32, value: Analysing) -> Result<bool, ZmError>;
    async fn set_recording_mode(&self, monitor_id: u32, value: RecordingMode) -> Result<bool, ZmError>;
    async fn set_force_alarm(&self, monitor_id: u32, on: bool) -> Result<bool, ZmError>;
    async fn ptz(&self, monitor_id: u32, command: PtzCommand) -> Result<bool, ZmError>;
    fn stream_urls(&self, monitor_id: u32, options: StreamOptions) -> StreamUrls;
}

#[derive(Debug, Default)]
struct Session {
    access_token: Option<String>,
    version: Option<String>,
}

pub struct HttpZmClient {
    http: Client,
    host: String,
    base: String,
    zms: String,
    username: Option<String>,
    password: Option<String>,
    session: RwLock<Session>,
}

impl HttpZmClient {
    pub fn new(config: &ServerConfig) -> Result<Self, ZmError> {
        let http = Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(!config.verify_ssl)
            .timeout(config.timeout())
            .build()?;

        let origin = config.origin();
        Ok(Self {
            http,
            host: config.host.clone(),
            base: format!("{origin}{}", normalize_dir(&config.path)),
            zms: format!("{origin}{}", normalize_path(&config.path_zms)),
            username: config.username.clone().filter(|u| !u.is_empty()),
            password: config.password.clone(),
            session: RwLock::new(Session::default()),
        })
    }

    fn token(&self) -> Option<String> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .access_token
            .clone()
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match self.token() {
            Some(token) => req.query(&[("token", token)]),
            None => req,
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.base)
    }

    // Resends once after a fresh login when the session has expired.
    async fn send<F>(&self, build: F) -> Result<Response, ZmError>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let resp = self.authorize(build()).send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED || self.username.is_none() {
            return Ok(resp);
        }

        debug!(host = %self.host, url = %resp.url().path(), "session expired, logging in again");
        if !self.login().await? {
            return Ok(resp);
        }
        Ok(self.authorize(build()).send().await?)
    }

    async fn get_json(&self, endpoint: &str) -> Result<Value, ZmError> {
        let url = self.url(endpoint);
        let resp = self.send(|| self.http.get(&url)).await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn get_ok(&self, endpoint: &str) -> Result<bool, ZmError> {
        let url = self.url(endpoint);
        let resp = self.send(|| self.http.get(&url)).await?;
        debug!(host = %self.host, endpoint, status = %resp.status(), "get");
        Ok(resp.status().is_success())
    }

    async fn post_ok(&self, url: &str, form: &[(&str, String)]) -> Result<bool, ZmError> {
        let resp = self.send(|| self.http.post(url).form(form)).await?;
        debug!(host = %self.host, url, status = %resp.status(), "post");
        Ok(resp.status().is_success())
    }

    fn run_state_url(&self, name: &str) -> Result<Url, ZmError> {
        let mut url = Url::parse(&self.url("api/states/change"))
            .map_err(|err| ZmError::Protocol(format!("invalid base url: {err}")))?;
        url.path_segments_mut()
            .map_err(|()| ZmError::Protocol(format!("{} cannot carry a path", self.base)))?
            .push(&format!("{name}.json"));
        Ok(url)
    }

    async fn edit_monitor(&self, monitor_id: u32, field: &str, value: &str) -> Result<bool, ZmError> {
        let key = format!("Monitor[{field}]");
        self.post_ok(
            &self.url(&format!("api/monitors/{monitor_id}.json")),
            &[(key.as_str(), value.to_string())],
        )
        .await
    }

    fn stream_url(&self, mode: &str, monitor_id: u32, options: StreamOptions) -> String {
        let mut params = vec![
            ("mode".to_string(), mode.to_string()),
            ("monitor".to_string(), monitor_id.to_string()),
        ];
        if let Some(scale) = options.scale {
            params.push(("scale".into(), scale.to_string()));
        }
        if let Some(fps) = options.maxfps {
            params.push(("maxfps".into(), fps.to_string()));
        }
        if let Some(token) = self.token() {
            params.push(("token".into(), token));
        } else if let Some(user) = &self.username {
            params.push(("user".into(), user.clone()));
            params.push(("pass".into(), self.password.clone().unwrap_or_default()));
        }

        match Url::parse_with_params(&self.zms, &params) {
            Ok(url) => url.to_string(),
            Err(err) => {
                warn!(host = %self.host, zms = %self.zms, "invalid stream url: {err}");
                self.zms.clone()
            }
        }
    }
}

#[async_trait]
impl ZmApi for HttpZmClient {
    async fn login(&self) -> Result<bool, ZmError> {
        let Some(user) = self.username.clone() else {
            return Ok(true);
        };

        let form = [
            ("user", user),
            ("pass", self.password.clone().unwrap_or_default()),
        ];
        let resp = self
            .http
            .post(self.url("api/host/login.json"))
            .form(&form)
            .send()
            .await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(ZmError::Login(format!("{} rejected the credentials", self.host)));
        }
        if !resp.status().is_success() {
            warn!(host = %self.host, status = %resp.status(), "login refused");
            return Ok(false);
        }

        let body: Value = resp.json().await?;
        let mut session = self.session.write().unwrap_or_else(|e| e.into_inner());
        session.access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string);
        session.version = body.get("version").and_then(Value::as_str).map(str::to_string);
        Ok(true)
    }

    async fn server_version(&self) -> Result<Option<String>, ZmError> {
        let cached = self
            .session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .version
            .clone();
        if cached.is_some() {
            return Ok(cached);
        }

        let body = self.get_json("api/host/getVersion.json").await?;
        let version = body.get("version").and_then(Value::as_str).map(str::to_string);
        self.session
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .version = version.clone();
        Ok(version)
    }

    async fn fetch_monitor_list(&self) -> Result<Vec<MonitorDescriptor>, ZmError> {
        let body = self.get_json("api/monitors.json").await?;
        parse_monitors(&body)
    }

    async fn bulk_refresh_monitor_status(
        &self,
        monitors: &mut [MonitorDescriptor],
    ) -> Result<(), ZmError> {
        let body = self.get_json("api/monitors.json").await?;
        let fresh: HashMap<u32, MonitorDescriptor> = parse_monitors(&body)?
            .into_iter()
            .map(|m| (m.id, m))
            .collect();

        let recording = match self.get_json(OPEN_EVENTS_ENDPOINT).await {
            Ok(body) => parse_open_event_monitors(&body),
            Err(err) => {
                warn!(host = %self.host, "open events query failed: {err}");
                HashSet::new()
            }
        };

        for monitor in monitors.iter_mut() {
            match fresh.get(&monitor.id) {
                Some(latest) => {
                    monitor.function = latest.function;
                    monitor.sub_modes = latest.sub_modes;
                    monitor.controllable = latest.controllable;
                    monitor.is_available = latest.is_available;
                }
                None => monitor.is_available = false,
            }
            monitor.is_recording = recording.contains(&monitor.id);
        }

        Ok(())
    }

    async fn fetch_event_counts(
        &self,
        period: TimePeriod,
        include_archived: bool,
    ) -> Result<Option<EventCounts>, ZmError> {
        let archived = if include_archived { "" } else { "/Archived=:0" };
        let endpoint = format!("api/events/consoleEvents/{}{archived}.json", period.interval());
        let url = self.url(&endpoint);
        let resp = self.send(|| self.http.get(&url)).await?;
        if !resp.status().is_success() {
            warn!(host = %self.host, endpoint = %endpoint, status = %resp.status(), "event counts unavailable");
            return Ok(None);
        }

        match resp.json::<Value>().await {
            Ok(body) => Ok(parse_event_counts(&body)),
            Err(err) if err.is_decode() => {
                warn!(host = %self.host, endpoint = %endpoint, "undecodable event counts: {err}");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn fetch_run_states(&self) -> Result<Vec<RunState>, ZmError> {
        let body = self.get_json("api/states.json").await?;
        parse_run_states(&body)
    }

    async fn set_active_run_state(&self, name: &str) -> Result<bool, ZmError> {
        let url = self.run_state_url(name)?;
        self.post_ok(url.as_str(), &[]).await
    }

    async fn is_available(&self) -> Result<bool, ZmError> {
        let body = self.get_json("api/host/daemonCheck.json").await?;
        Ok(parse_daemon_check(&body))
    }

    async fn set_function(&self, monitor_id: u32, function: MonitorFunction) -> Result<bool, ZmError> {
        self.edit_monitor(monitor_id, "Function", function.as_str()).await
    }

    async fn set_capturing(&self, monitor_id: u32, value: Capturing) -> Result<bool, ZmError> {
        self.edit_monitor(monitor_id, "Capturing", value.as_str()).await
    }

    async fn set_analysing(&self, monitor_id: u32, value: Analysing) -> Result<bool, ZmError> {
        self.edit_monitor(monitor_id, "Analysing", value.as_str()).await
    }

    async fn set_recording_mode(&self, monitor_id: u32, value: RecordingMode) -> Result<bool, ZmError> {
        self.edit_monitor(monitor_id, "Recording", value.as_str()).await
    }

    async fn set_force_alarm(&self, monitor_id: u32, on: bool) -> Result<bool, ZmError> {
        let command = if on { "on" } else { "off" };
        self.get_ok(&format!("api/monitors/alarm/id:{monitor_id}/command:{command}.json"))
            .await
    }

    async fn ptz(&self, monitor_id: u32, command: PtzCommand) -> Result<bool, ZmError> {
        let form = [
            ("view", "request".to_string()),
            ("request", "control".to_string()),
            ("id", monitor_id.to_string()),
            ("control", command.control()),
        ];
        self.post_ok(&self.url("index.php"), &form).await
    }

    fn stream_urls(&self, monitor_id: u32, options: StreamOptions) -> StreamUrls {
        StreamUrls {
            mjpeg: self.stream_url("jpeg", monitor_id, options),
            still: self.stream_url("single", monitor_id, options),
        }
    }
}

fn normalize_dir(path: &str) -> String {
    let mut out = normalize_path(path);
    if !out.ends_with('/') {
        out.push('/');
    }
    out
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

// The API encodes most numbers as strings.
fn value_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_flag(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        other => value_u64(other) == Some(1),
    }
}

fn parse_monitors(body: &Value) -> Result<Vec<MonitorDescriptor>, ZmError> {
    let entries = body
        .get("monitors")
        .and_then(Value::as_array)
        .ok_or_else(|| ZmError::Malformed("missing monitors list".into()))?;

    entries.iter().map(parse_monitor).collect()
}

fn parse_monitor(entry: &Value) -> Result<MonitorDescriptor, ZmError> {
    let monitor = entry
        .get("Monitor")
        .ok_or_else(|| ZmError::Malformed("monitor entry without Monitor".into()))?;
    let id = monitor
        .get("Id")
        .and_then(value_u64)
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| ZmError::Malformed("monitor without Id".into()))?;
    let field = |name: &str| monitor.get(name).and_then(Value::as_str);

    Ok(MonitorDescriptor {
        id,
        name: field("Name").unwrap_or_default().to_string(),
        function: field("Function").and_then(|f| f.parse().ok()),
        sub_modes: SubModes::parse(field("Capturing"), field("Analysing"), field("Recording")),
        controllable: monitor.get("Controllable").map(value_flag).unwrap_or(false),
        is_recording: false,
        is_available: entry
            .get("Monitor_Status")
            .and_then(|s| s.get("Status"))
            .and_then(Value::as_str)
            == Some("Connected"),
    })
}

fn parse_open_event_monitors(body: &Value) -> HashSet<u32> {
    body.get("events")
        .and_then(Value::as_array)
        .map(|events| {
            events
                .iter()
                .filter_map(|e| e.get("Event"))
                .filter(|e| {
                    let end = e.get("EndDateTime").or_else(|| e.get("EndTime"));
                    end.map_or(true, Value::is_null)
                })
                .filter_map(|e| e.get("MonitorId").and_then(value_u64))
                .filter_map(|id| u32::try_from(id).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_event_counts(body: &Value) -> Option<EventCounts> {
    match body.get("results")? {
        Value::Object(map) => Some(
            map.iter()
                .filter_map(|(id, count)| value_u64(count).map(|c| (id.clone(), c)))
                .collect(),
        ),
        // An empty PHP associative array serializes as `[]`.
        Value::Array(items) if items.is_empty() => Some(EventCounts::new()),
        _ => None,
    }
}

fn parse_run_states(body: &Value) -> Result<Vec<RunState>, ZmError> {
    let states = body
        .get("states")
        .and_then(Value::as_array)
        .ok_or_else(|| ZmError::Malformed("missing states list".into()))?;

    states
        .iter()
        .map(|entry| {
            let state = entry
                .get("State")
                .ok_or_else(|| ZmError::Malformed("state entry without State".into()))?;
            let name = state
                .get("Name")
                .and_then(Value::as_str)
                .ok_or_else(|| ZmError::Malformed("state without Name".into()))?;
            let active = state.get("IsActive").map(value_flag).unwrap_or(false);
            Ok(RunState::new(name, active))
        })
        .collect()
}

fn parse_daemon_check(body: &Value) -> bool {
    body.get("result").map(value_flag).unwrap_or(false)
}
