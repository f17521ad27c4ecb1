use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseModeError {
    kind: &'static str,
    value: String,
}

impl ParseModeError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonitorFunction {
    None,
    Monitor,
    Modect,
    Record,
    Mocord,
    Nodect,
}

impl MonitorFunction {
    pub const ALL: [MonitorFunction; 6] = [
        MonitorFunction::None,
        MonitorFunction::Monitor,
        MonitorFunction::Modect,
        MonitorFunction::Record,
        MonitorFunction::Mocord,
        MonitorFunction::Nodect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorFunction::None => "None",
            MonitorFunction::Monitor => "Monitor",
            MonitorFunction::Modect => "Modect",
            MonitorFunction::Record => "Record",
            MonitorFunction::Mocord => "Mocord",
            MonitorFunction::Nodect => "Nodect",
        }
    }
}

impl fmt::Display for MonitorFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MonitorFunction {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MonitorFunction::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| ParseModeError::new("function", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capturing {
    None,
    Ondemand,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Analysing {
    None,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordingMode {
    None,
    OnMotion,
    Always,
}

macro_rules! string_enum {
    ($ty:ident, $kind:literal, [$($variant:ident => $text:literal),+ $(,)?]) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseModeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(ParseModeError::new($kind, other)),
                }
            }
        }
    };
}

string_enum!(Capturing, "capturing", [None => "None", Ondemand => "Ondemand", Always => "Always"]);
string_enum!(Analysing, "analysing", [None => "None", Always => "Always"]);
string_enum!(RecordingMode, "recording", [None => "None", OnMotion => "OnMotion", Always => "Always"]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubModes {
    pub capturing: Capturing,
    pub analysing: Analysing,
    pub recording: RecordingMode,
}

impl SubModes {
    pub fn new(capturing: Capturing, analysing: Analysing, recording: RecordingMode) -> Self {
        Self {
            capturing,
            analysing,
            recording,
        }
    }

    pub fn parse(
        capturing: Option<&str>,
        analysing: Option<&str>,
        recording: Option<&str>,
    ) -> Option<Self> {
        Some(Self {
            capturing: capturing?.parse().ok()?,
            analysing: analysing?.parse().ok()?,
            recording: recording?.parse().ok()?,
        })
    }
}

impl fmt::Display for SubModes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.capturing, self.analysing, self.recording)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimePeriod {
    All,
    Hour,
    Day,
    Week,
    Month,
}

impl TimePeriod {
    pub const ALL: [TimePeriod; 5] = [
        TimePeriod::All,
        TimePeriod::Hour,
        TimePeriod::Day,
        TimePeriod::Week,
        TimePeriod::Month,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            TimePeriod::All => "all",
            TimePeriod::Hour => "hour",
            TimePeriod::Day => "day",
            TimePeriod::Week => "week",
            TimePeriod::Month => "month",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            TimePeriod::All => "Events",
            TimePeriod::Hour => "Events Last Hour",
            TimePeriod::Day => "Events Last Day",
            TimePeriod::Week => "Events Last Week",
            TimePeriod::Month => "Events Last Month",
        }
    }

    // Interval expression understood by the console-events endpoint.
    pub fn interval(&self) -> &'static str {
        match self {
            TimePeriod::All => "100 year",
            TimePeriod::Hour => "1 hour",
            TimePeriod::Day => "1 day",
            TimePeriod::Week => "1 week",
            TimePeriod::Month => "1 month",
        }
    }
}

impl FromStr for TimePeriod {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TimePeriod::ALL
            .into_iter()
            .find(|p| p.key() == s)
            .ok_or_else(|| ParseModeError::new("time period", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub name: String,
    pub active: bool,
}

impl RunState {
    pub fn new(name: impl Into<String>, active: bool) -> Self {
        Self {
            name: name.into(),
            active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiShape {
    Classic,
    Extended,
}

impl ApiShape {
    pub fn from_version(version: Option<&str>) -> Self {
        match version.and_then(ServerVersion::parse) {
            Some(v) if v >= ServerVersion::new(1, 37, 0) => ApiShape::Extended,
            _ => ApiShape::Classic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses `1.36.33`, `1.37` or `1.38.0-rc1`; missing components default to zero.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.trim().split('.').map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u32>().ok()
        });
        let major = parts.next().flatten()?;
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);
        Some(Self::new(major, minor, patch))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PtzCommand {
    Up,
    Down,
    Left,
    Right,
    UpLeft,
    UpRight,
    DownLeft,
    DownRight,
    Stop,
    Home,
    Preset(u8),
}

impl PtzCommand {
    pub fn control(&self) -> String {
        match self {
            PtzCommand::Up => "moveConUp".to_string(),
            PtzCommand::Down => "moveConDown".to_string(),
            PtzCommand::Left => "moveConLeft".to_string(),
            PtzCommand::Right => "moveConRight".to_string(),
            PtzCommand::UpLeft => "moveConUpLeft".to_string(),
            PtzCommand::UpRight => "moveConUpRight".to_string(),
            PtzCommand::DownLeft => "moveConDownLeft".to_string(),
            PtzCommand::DownRight => "moveConDownRight".to_string(),
            PtzCommand::Stop => "moveStop".to_string(),
            PtzCommand::Home => "presetHome".to_string(),
            PtzCommand::Preset(n) => format!("presetGoto{n}"),
        }
    }
}

impl FromStr for PtzCommand {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cmd = match s.to_ascii_lowercase().as_str() {
            "up" => PtzCommand::Up,
            "down" => PtzCommand::Down,
            "left" => PtzCommand::Left,
            "right" => PtzCommand::Right,
            "up-left" | "upleft" => PtzCommand::UpLeft,
            "up-right" | "upright" => PtzCommand::UpRight,
            "down-left" | "downleft" => PtzCommand::DownLeft,
            "down-right" | "downright" => PtzCommand::DownRight,
            "stop" => PtzCommand::Stop,
            "home" => PtzCommand::Home,
            other => {
                let preset = other
                    .strip_prefix("preset")
                    .map(|n| n.trim_start_matches([':', '-']))
                    .and_then(|n| n.parse::<u8>().ok())
                    .ok_or_else(|| ParseModeError::new("ptz command", s))?;
                PtzCommand::Preset(preset)
            }
        };
        Ok(cmd)
    }
}
