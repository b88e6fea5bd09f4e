use serde::{Deserialize, Serialize};

use crate::temperature::SensorReading;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValvePosition {
    Regular,
    Solar,
}

impl ValvePosition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Solar => "solar",
        }
    }

    /// Anything that is not `solar` selects the regular circuit.
    pub fn from_command(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("solar") {
            Self::Solar
        } else {
            Self::Regular
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValveState {
    Idle,
    Switching,
}

impl ValveState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Switching => "SWITCHING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusState {
    Ok,
    Error,
}

/// Free-form status line published on the base topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub state: StatusState,
    pub message: String,
}

impl StatusMessage {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            state: StatusState::Ok,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            state: StatusState::Error,
            message: message.into(),
        }
    }

    pub fn announcement() -> Self {
        Self::ok("Pool Control is active and listening...")
    }

    pub fn to_json(&self) -> String {
        // Two plain fields; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValveStatePayload {
    pub state: &'static str,
    pub position: Option<ValvePosition>,
    pub target: Option<ValvePosition>,
    #[serde(rename = "switchingMs")]
    pub switching_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub valve: ValveStatePayload,
    pub sensors: Vec<SensorReading>,
    #[serde(rename = "lastReadingAgeMs")]
    pub last_reading_age_ms: Option<u64>,
    #[serde(rename = "wifiConnected")]
    pub wifi_connected: bool,
    #[serde(rename = "mqttConnected")]
    pub mqtt_connected: bool,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValveRequest {
    pub position: String,
}
