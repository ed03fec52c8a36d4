//! Collaborators for boards without a screen or codec: everything the device
//! would show or play is written to the log instead.

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::{debug, info, warn};
use serde_json::Value;

use voicebox_common::{
    error::OtaError,
    idle::IdleCard,
    services::{
        Assets, AudioCallbacks, AudioPacket, AudioService, Display, Sound, ToolServer,
        UpgradeProgress,
    },
};

#[derive(Debug, Default)]
pub struct LogDisplay {
    last_status: Mutex<String>,
}

impl Display for LogDisplay {
    fn set_status(&self, status: &str) {
        let mut last = self.last_status.lock().unwrap_or_else(PoisonError::into_inner);
        if *last != status {
            info!("[display] status: {status}");
            *last = status.to_string();
        }
    }

    fn set_emotion(&self, emotion: &str) {
        debug!("[display] emotion: {emotion}");
    }

    fn set_chat_message(&self, role: &str, content: &str) {
        if !content.is_empty() {
            info!("[display] {role}: {content}");
        }
    }

    fn show_notification(&self, text: &str, duration: Duration) {
        info!("[display] notification ({}ms): {text}", duration.as_millis());
    }

    fn update_status_bar(&self, update_all: bool) {
        debug!("[display] status bar refresh (all={update_all})");
    }

    fn show_idle_card(&self, card: &IdleCard) {
        debug!(
            "[display] idle {} {} {} {}",
            card.time_text, card.city, card.temperature_text, card.description_text
        );
    }

    fn hide_idle_card(&self) {}
}

#[derive(Debug)]
struct AudioState {
    running: bool,
    voice_processing: bool,
    testing: bool,
    decoded_frames: u64,
}

/// Audio pipeline stand-in: tracks the switches the device flips and counts
/// the frames the server sends back. It never produces microphone audio.
pub struct SimulatedAudio {
    wake_word: String,
    state: Mutex<AudioState>,
}

impl SimulatedAudio {
    pub fn new(wake_word: impl Into<String>) -> Self {
        Self {
            wake_word: wake_word.into(),
            state: Mutex::new(AudioState {
                running: false,
                voice_processing: false,
                testing: false,
                decoded_frames: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, AudioState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AudioService for SimulatedAudio {
    fn start(&self) {
        self.state().running = true;
        info!("audio service started (simulated)");
    }

    fn stop(&self) {
        let mut state = self.state();
        state.running = false;
        info!("audio service stopped ({} frames played)", state.decoded_frames);
    }

    fn set_callbacks(&self, _callbacks: AudioCallbacks) {
        debug!("no capture hardware, audio callbacks will never fire");
    }

    fn enable_voice_processing(&self, enable: bool) {
        self.state().voice_processing = enable;
        debug!("voice processing {}", if enable { "on" } else { "off" });
    }

    fn enable_wake_word_detection(&self, enable: bool) {
        debug!("wake word detection {}", if enable { "on" } else { "off" });
    }

    fn enable_device_aec(&self, enable: bool) {
        info!("device AEC {}", if enable { "on" } else { "off" });
    }

    fn enable_audio_testing(&self, enable: bool) {
        self.state().testing = enable;
        info!("audio testing {}", if enable { "on" } else { "off" });
    }

    fn is_audio_processor_running(&self) -> bool {
        let state = self.state();
        state.running && state.voice_processing
    }

    fn is_idle(&self) -> bool {
        !self.state().testing
    }

    fn is_afe_wake_word(&self) -> bool {
        false
    }

    fn encode_wake_word(&self) {}

    fn pop_wake_word_packet(&self) -> Option<AudioPacket> {
        None
    }

    fn last_wake_word(&self) -> String {
        self.wake_word.clone()
    }

    fn pop_packet_from_send_queue(&self) -> Option<AudioPacket> {
        None
    }

    fn push_packet_to_decode_queue(&self, packet: AudioPacket) {
        let mut state = self.state();
        state.decoded_frames += 1;
        if state.decoded_frames % 50 == 1 {
            debug!(
                "playing server audio: {} frames so far ({} Hz)",
                state.decoded_frames, packet.sample_rate
            );
        }
    }

    fn reset_decoder(&self) {
        debug!("decoder reset");
    }

    fn play_sound(&self, sound: Sound) {
        info!("[sound] {sound}");
    }
}

#[derive(Debug, Default)]
pub struct LoggingTools;

impl ToolServer for LoggingTools {
    fn parse_message(&self, payload: &Value) {
        let method = payload
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("<response>");
        info!("mcp message: {method}");
        debug!("mcp payload: {payload}");
    }
}

/// Boards without an assets partition.
#[derive(Debug, Default)]
pub struct NoAssets;

impl Assets for NoAssets {
    fn partition_valid(&self) -> bool {
        false
    }

    fn download(
        &self,
        url: &str,
        _progress: &mut dyn FnMut(UpgradeProgress),
    ) -> Result<(), OtaError> {
        warn!("ignoring assets download from {url}: no assets partition");
        Err(OtaError::Unsupported)
    }

    fn apply(&self) {}
}
