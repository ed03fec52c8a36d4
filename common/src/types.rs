use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    #[default]
    Unknown,
    Starting,
    Configuring,
    Idle,
    Connecting,
    Listening,
    Speaking,
    Upgrading,
    Activating,
    AudioTesting,
    FatalError,
}

impl DeviceState {
    const ALL: [Self; 11] = [
        Self::Unknown,
        Self::Starting,
        Self::Configuring,
        Self::Idle,
        Self::Connecting,
        Self::Listening,
        Self::Speaking,
        Self::Upgrading,
        Self::Activating,
        Self::AudioTesting,
        Self::FatalError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Configuring => "configuring",
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Speaking => "speaking",
            Self::Upgrading => "upgrading",
            Self::Activating => "activating",
            Self::AudioTesting => "audio_testing",
            Self::FatalError => "fatal_error",
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        Self::ALL
            .get(raw as usize)
            .copied()
            .unwrap_or(Self::Unknown)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListeningMode {
    #[default]
    AutoStop,
    ManualStop,
    Realtime,
}

impl ListeningMode {
    /// Wire name used in `listen` control messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoStop => "auto",
            Self::ManualStop => "manual",
            Self::Realtime => "realtime",
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::ManualStop,
            2 => Self::Realtime,
            _ => Self::AutoStop,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AecMode {
    #[default]
    Off,
    OnDeviceSide,
    OnServerSide,
}

impl AecMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::OnDeviceSide => "device",
            Self::OnServerSide => "server",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Some(Self::Off),
            "device" | "on_device_side" => Some(Self::OnDeviceSide),
            "server" | "on_server_side" => Some(Self::OnServerSide),
            _ => None,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::OnDeviceSide,
            2 => Self::OnServerSide,
            _ => Self::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    None,
    WakeWordDetected,
}

impl AbortReason {
    /// Wire name, `None` when the abort message carries no reason field.
    pub fn as_wire(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::WakeWordDetected => Some("wake_word_detected"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub state: &'static str,
    #[serde(rename = "listeningMode")]
    pub listening_mode: &'static str,
    #[serde(rename = "aecMode")]
    pub aec_mode: &'static str,
    #[serde(rename = "channelOpen")]
    pub channel_open: bool,
    #[serde(rename = "sleepReady")]
    pub sleep_ready: bool,
    #[serde(rename = "weatherCity")]
    pub weather_city: Option<String>,
    #[serde(rename = "weatherTempC")]
    pub weather_temp_c: Option<f32>,
}
