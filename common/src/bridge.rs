//! Transport callbacks and server message handling.
//!
//! Transport threads never touch the device directly: every callback
//! marshals its reaction onto the scheduler.

use std::sync::Arc;

use log::{info, warn};
use serde_json::Value;

use crate::{
    device::Device,
    error::MessageError,
    scheduler::Scheduler,
    services::{AudioPacket, Sound, TransportCallbacks},
    types::{DeviceState, ListeningMode},
};

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    TtsStart,
    TtsStop,
    TtsSentence(String),
    Stt(String),
    Emotion(String),
    Mcp(Value),
    Reboot,
    Alert {
        status: String,
        message: String,
        emotion: String,
    },
    Custom(Value),
}

impl ServerMessage {
    /// Validates a message tagged by its `type` field. Anything malformed is
    /// rejected whole so no partial reaction is scheduled.
    pub fn parse(root: &Value, accept_custom: bool) -> Result<Self, MessageError> {
        let kind = root
            .get("type")
            .and_then(Value::as_str)
            .ok_or(MessageError::MissingType)?;

        let text = |kind: &'static str, field: &'static str| {
            root.get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(MessageError::MissingField { kind, field })
        };
        let object = |kind: &'static str| {
            root.get("payload")
                .filter(|payload| payload.is_object())
                .cloned()
                .ok_or(MessageError::PayloadNotObject(kind))
        };

        match kind {
            "tts" => match text("tts", "state")?.as_str() {
                "start" => Ok(Self::TtsStart),
                "stop" => Ok(Self::TtsStop),
                "sentence_start" => Ok(Self::TtsSentence(text("tts", "text")?)),
                other => Err(MessageError::UnknownTtsState(other.to_string())),
            },
            "stt" => Ok(Self::Stt(text("stt", "text")?)),
            "llm" => Ok(Self::Emotion(text("llm", "emotion")?)),
            "mcp" => Ok(Self::Mcp(object("mcp")?)),
            "system" => match text("system", "command")?.as_str() {
                "reboot" => Ok(Self::Reboot),
                other => Err(MessageError::UnknownSystemCommand(other.to_string())),
            },
            "alert" => Ok(Self::Alert {
                status: text("alert", "status")?,
                message: text("alert", "message")?,
                emotion: text("alert", "emotion")?,
            }),
            "custom" if accept_custom => Ok(Self::Custom(object("custom")?)),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

pub fn transport_callbacks(scheduler: &Scheduler<Device>, accept_custom: bool) -> TransportCallbacks {
    let connected = scheduler.clone();
    let network_error = scheduler.clone();
    let audio = scheduler.clone();
    let json = scheduler.clone();
    let opened = scheduler.clone();
    let closed = scheduler.clone();

    TransportCallbacks {
        on_connected: Box::new(move || connected.schedule(|device: &mut Device| device.dismiss_alert())),
        on_network_error: Box::new(move |message| network_error.raise_network_error(message)),
        on_incoming_audio: Box::new(move |packet| {
            audio.schedule(move |device: &mut Device| device.on_incoming_audio(packet))
        }),
        on_incoming_json: Box::new(move |root| match ServerMessage::parse(&root, accept_custom) {
            Ok(message) => {
                json.schedule(move |device: &mut Device| device.handle_server_message(message))
            }
            Err(err) => warn!("dropping server message: {err}"),
        }),
        on_audio_channel_opened: Box::new(move || {
            opened.schedule(|device: &mut Device| device.on_audio_channel_opened())
        }),
        on_audio_channel_closed: Box::new(move || {
            closed.schedule(|device: &mut Device| device.on_audio_channel_closed())
        }),
    }
}

impl Device {
    pub fn handle_server_message(&mut self, message: ServerMessage) {
        let display = Arc::clone(&self.services.display);
        match message {
            ServerMessage::TtsStart => {
                self.set_aborted(false);
                if matches!(self.state(), DeviceState::Idle | DeviceState::Listening) {
                    self.set_device_state(DeviceState::Speaking);
                }
            }
            ServerMessage::TtsStop => {
                if self.state() == DeviceState::Speaking {
                    if self.listening_mode() == ListeningMode::ManualStop {
                        self.set_device_state(DeviceState::Idle);
                    } else {
                        self.set_device_state(DeviceState::Listening);
                    }
                }
            }
            ServerMessage::TtsSentence(text) => {
                info!("<< {text}");
                display.set_chat_message("assistant", &text);
            }
            ServerMessage::Stt(text) => {
                info!(">> {text}");
                display.set_chat_message("user", &text);
            }
            ServerMessage::Emotion(emotion) => display.set_emotion(&emotion),
            ServerMessage::Mcp(payload) => self.services.tools.parse_message(&payload),
            ServerMessage::Reboot => {
                info!("system command: reboot");
                self.reboot();
            }
            ServerMessage::Alert {
                status,
                message,
                emotion,
            } => self.alert(&status, &message, &emotion, Some(Sound::Vibration)),
            ServerMessage::Custom(payload) => {
                info!("custom message: {payload}");
                display.set_chat_message("system", &payload.to_string());
            }
        }
    }

    /// Frames from a superseded turn are dropped.
    pub fn on_incoming_audio(&mut self, packet: AudioPacket) {
        if self.state() == DeviceState::Speaking {
            self.services.audio.push_packet_to_decode_queue(packet);
        }
    }

    pub fn on_audio_channel_opened(&mut self) {
        self.services.board.set_power_save_mode(false);
        let server_rate = self
            .transport
            .as_ref()
            .map(|transport| transport.server_sample_rate())
            .unwrap_or_default();
        if server_rate != self.config.output_sample_rate {
            warn!(
                "server sample rate {server_rate} does not match device output sample rate {}, resampling may cause distortion",
                self.config.output_sample_rate
            );
        }
    }

    pub fn on_audio_channel_closed(&mut self) {
        self.services.board.set_power_save_mode(true);
        self.services.display.set_chat_message("system", "");
        self.set_device_state(DeviceState::Idle);
    }
}
