//! Collaborator contracts consumed by the device core.
//!
//! Every collaborator is injected through [`Services`]; nothing in the core
//! reaches for a global instance.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, FixedOffset};
use serde_json::Value;

use crate::{
    error::{HttpError, OtaError, SettingsError},
    idle::IdleCard,
    types::{AbortReason, DeviceState, ListeningMode},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sound {
    Exclamation,
    Upgrade,
    Activation,
    Success,
    Popup,
    Vibration,
    Digit(u8),
}

impl fmt::Display for Sound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exclamation => f.write_str("exclamation"),
            Self::Upgrade => f.write_str("upgrade"),
            Self::Activation => f.write_str("activation"),
            Self::Success => f.write_str("success"),
            Self::Popup => f.write_str("popup"),
            Self::Vibration => f.write_str("vibration"),
            Self::Digit(digit) => write!(f, "digit_{digit}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    pub timestamp: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeProgress {
    pub percent: u8,
    pub bytes_per_sec: usize,
}

impl fmt::Display for UpgradeProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}% {}KB/s", self.percent, self.bytes_per_sec / 1024)
    }
}

pub trait Display: Send + Sync {
    fn set_status(&self, status: &str);
    fn set_emotion(&self, emotion: &str);
    fn set_chat_message(&self, role: &str, content: &str);
    fn show_notification(&self, text: &str, duration: Duration);
    fn update_status_bar(&self, update_all: bool);
    fn show_idle_card(&self, card: &IdleCard);
    fn hide_idle_card(&self);
    fn show_audio_player(&self, _title: &str) {}
    fn hide_audio_player(&self) {}
}

/// Producers installed into the audio pipeline; each fires from an audio thread.
pub struct AudioCallbacks {
    pub on_send_queue_available: Box<dyn Fn() + Send + Sync>,
    pub on_wake_word_detected: Box<dyn Fn(&str) + Send + Sync>,
    pub on_vad_change: Box<dyn Fn(bool) + Send + Sync>,
}

pub trait AudioService: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn set_callbacks(&self, callbacks: AudioCallbacks);
    fn enable_voice_processing(&self, enable: bool);
    fn enable_wake_word_detection(&self, enable: bool);
    fn enable_device_aec(&self, enable: bool);
    fn enable_audio_testing(&self, enable: bool);
    fn is_audio_processor_running(&self) -> bool;
    fn is_idle(&self) -> bool;
    /// Whether the wake-word detector can keep running during playback.
    fn is_afe_wake_word(&self) -> bool;
    fn encode_wake_word(&self);
    fn pop_wake_word_packet(&self) -> Option<AudioPacket>;
    fn last_wake_word(&self) -> String;
    fn pop_packet_from_send_queue(&self) -> Option<AudioPacket>;
    fn push_packet_to_decode_queue(&self, packet: AudioPacket);
    fn reset_decoder(&self);
    fn play_sound(&self, sound: Sound);
}

pub trait Board: Send + Sync {
    /// Blocks until the network is usable.
    fn start_network(&self);
    fn set_power_save_mode(&self, enabled: bool);
    /// Status indicator refresh (LED), also driven by voice activity.
    fn on_state_changed(&self, state: DeviceState);
    fn user_agent(&self) -> String;
    fn restart(&self);
}

pub trait Settings: Send + Sync {
    fn get_string(&self, namespace: &str, key: &str) -> Option<String>;
    fn set_string(&self, namespace: &str, key: &str, value: &str) -> Result<(), SettingsError>;
    fn erase_key(&self, namespace: &str, key: &str) -> Result<(), SettingsError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            body: Some(body.into()),
            ..Self::get(url)
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

pub trait HttpClient: Send + Sync {
    /// Non-2xx statuses come back as responses; only transport failures are errors.
    fn request(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationStatus {
    Activated,
    Pending,
    Failed,
}

pub trait Ota: Send + Sync {
    fn check_version(&self) -> Result<(), OtaError>;
    fn has_new_version(&self) -> bool;
    fn firmware_version(&self) -> String;
    fn firmware_url(&self) -> String;
    fn current_version(&self) -> String;
    fn check_version_url(&self) -> String;
    fn mark_current_version_valid(&self);
    fn has_activation_code(&self) -> bool;
    fn has_activation_challenge(&self) -> bool;
    fn activation_code(&self) -> String;
    fn activation_message(&self) -> String;
    fn activate(&self) -> ActivationStatus;
    fn start_upgrade_from_url(
        &self,
        url: &str,
        progress: &mut dyn FnMut(UpgradeProgress),
    ) -> Result<(), OtaError>;
    fn has_mqtt_config(&self) -> bool;
    fn has_websocket_config(&self) -> bool;
}

/// Platform side of the OTA flow: streams an image into the inactive slot.
pub trait FirmwareUpdater: Send + Sync {
    fn flash_from_url(
        &self,
        url: &str,
        progress: &mut dyn FnMut(UpgradeProgress),
    ) -> Result<(), OtaError>;
    fn mark_running_valid(&self);
}

pub trait Assets: Send + Sync {
    fn partition_valid(&self) -> bool;
    fn download(
        &self,
        url: &str,
        progress: &mut dyn FnMut(UpgradeProgress),
    ) -> Result<(), OtaError>;
    fn apply(&self);
}

pub trait ToolServer: Send + Sync {
    fn parse_message(&self, payload: &Value);
}

pub trait WallClock: Send + Sync {
    /// Local time, `None` until the clock has been synchronized.
    fn now(&self) -> Option<DateTime<FixedOffset>>;
}

/// Callbacks a transport fires from its own threads.
pub struct TransportCallbacks {
    pub on_connected: Box<dyn Fn() + Send + Sync>,
    pub on_network_error: Box<dyn Fn(String) + Send + Sync>,
    pub on_incoming_audio: Box<dyn Fn(AudioPacket) + Send + Sync>,
    pub on_incoming_json: Box<dyn Fn(Value) + Send + Sync>,
    pub on_audio_channel_opened: Box<dyn Fn() + Send + Sync>,
    pub on_audio_channel_closed: Box<dyn Fn() + Send + Sync>,
}

pub trait Transport: Send {
    fn set_callbacks(&mut self, callbacks: TransportCallbacks);
    fn start(&mut self) -> bool;
    fn open_audio_channel(&mut self) -> bool;
    fn close_audio_channel(&mut self);
    fn is_audio_channel_opened(&self) -> bool;
    fn send_start_listening(&mut self, mode: ListeningMode);
    fn send_stop_listening(&mut self);
    fn send_abort_speaking(&mut self, reason: AbortReason);
    fn send_wake_word_detected(&mut self, wake_word: &str);
    fn send_audio(&mut self, packet: AudioPacket) -> bool;
    fn send_mcp_message(&mut self, payload: &str);
    fn server_sample_rate(&self) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Mqtt,
    Websocket,
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, kind: TransportKind) -> Box<dyn Transport>;
}

#[derive(Clone)]
pub struct Services {
    pub display: Arc<dyn Display>,
    pub audio: Arc<dyn AudioService>,
    pub board: Arc<dyn Board>,
    pub settings: Arc<dyn Settings>,
    pub http: Arc<dyn HttpClient>,
    pub ota: Arc<dyn Ota>,
    pub assets: Arc<dyn Assets>,
    pub tools: Arc<dyn ToolServer>,
    pub clock: Arc<dyn WallClock>,
    pub transports: Arc<dyn TransportFactory>,
}
