//! In-memory collaborators for unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, FixedOffset, TimeZone};
use serde_json::Value;

use crate::{
    config::{DeviceConfig, WeatherConfig},
    device::Device,
    error::{HttpError, OtaError, SettingsError},
    idle::IdleCard,
    services::{
        ActivationStatus, Assets, AudioCallbacks, AudioPacket, AudioService, Board, Display,
        HttpClient, HttpRequest, HttpResponse, Ota, Services, Settings, Sound, ToolServer,
        Transport, TransportCallbacks, TransportFactory, TransportKind, UpgradeProgress,
        WallClock,
    },
    types::{AbortReason, DeviceState, ListeningMode},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

pub fn packet(timestamp: u32) -> AudioPacket {
    AudioPacket {
        sample_rate: 16_000,
        frame_duration_ms: 60,
        timestamp,
        payload: vec![0; 4],
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisplayCall {
    Status(String),
    Emotion(String),
    Chat(String, String),
    Notification(String),
    StatusBar(bool),
    ShowIdleCard(IdleCard),
    HideIdleCard,
}

#[derive(Default)]
pub struct RecordingDisplay {
    calls: Mutex<Vec<DisplayCall>>,
}

impl RecordingDisplay {
    pub fn calls(&self) -> Vec<DisplayCall> {
        lock(&self.calls).clone()
    }

    pub fn chat_messages(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DisplayCall::Chat(role, content) => Some((role, content)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.calls).clear();
    }

    fn push(&self, call: DisplayCall) {
        lock(&self.calls).push(call);
    }
}

impl Display for RecordingDisplay {
    fn set_status(&self, status: &str) {
        self.push(DisplayCall::Status(status.to_string()));
    }

    fn set_emotion(&self, emotion: &str) {
        self.push(DisplayCall::Emotion(emotion.to_string()));
    }

    fn set_chat_message(&self, role: &str, content: &str) {
        self.push(DisplayCall::Chat(role.to_string(), content.to_string()));
    }

    fn show_notification(&self, text: &str, _duration: Duration) {
        self.push(DisplayCall::Notification(text.to_string()));
    }

    fn update_status_bar(&self, update_all: bool) {
        self.push(DisplayCall::StatusBar(update_all));
    }

    fn show_idle_card(&self, card: &IdleCard) {
        self.push(DisplayCall::ShowIdleCard(card.clone()));
    }

    fn hide_idle_card(&self) {
        self.push(DisplayCall::HideIdleCard);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioCall {
    Start,
    Stop,
    VoiceProcessing(bool),
    WakeWordDetection(bool),
    DeviceAec(bool),
    AudioTesting(bool),
    EncodeWakeWord,
    ResetDecoder,
}

struct AudioState {
    calls: Vec<AudioCall>,
    sounds: Vec<Sound>,
    decoded: Vec<AudioPacket>,
    wake_word_packets: VecDeque<AudioPacket>,
    outgoing: VecDeque<AudioPacket>,
    last_wake_word: String,
    processor_running: bool,
    afe_wake_word: bool,
    idle: bool,
}

pub struct FakeAudio {
    state: Mutex<AudioState>,
    callbacks: Mutex<Option<AudioCallbacks>>,
}

impl Default for FakeAudio {
    fn default() -> Self {
        Self {
            state: Mutex::new(AudioState {
                calls: Vec::new(),
                sounds: Vec::new(),
                decoded: Vec::new(),
                wake_word_packets: VecDeque::new(),
                outgoing: VecDeque::new(),
                last_wake_word: "hi".to_string(),
                processor_running: false,
                afe_wake_word: false,
                idle: true,
            }),
            callbacks: Mutex::new(None),
        }
    }
}

impl FakeAudio {
    pub fn calls(&self) -> Vec<AudioCall> {
        lock(&self.state).calls.clone()
    }

    pub fn sounds(&self) -> Vec<Sound> {
        lock(&self.state).sounds.clone()
    }

    pub fn decoded(&self) -> Vec<AudioPacket> {
        lock(&self.state).decoded.clone()
    }

    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.calls.clear();
        state.sounds.clear();
        state.decoded.clear();
    }

    pub fn set_processor_running(&self, running: bool) {
        lock(&self.state).processor_running = running;
    }

    pub fn set_afe_wake_word(&self, afe: bool) {
        lock(&self.state).afe_wake_word = afe;
    }

    pub fn set_idle(&self, idle: bool) {
        lock(&self.state).idle = idle;
    }

    pub fn set_last_wake_word(&self, word: &str) {
        lock(&self.state).last_wake_word = word.to_string();
    }

    pub fn queue_wake_word_packets(&self, count: u32) {
        let mut state = lock(&self.state);
        state.wake_word_packets.extend((0..count).map(packet));
    }

    pub fn queue_outgoing_packets(&self, count: u32) {
        let mut state = lock(&self.state);
        state.outgoing.extend((0..count).map(packet));
    }

    pub fn outgoing_left(&self) -> usize {
        lock(&self.state).outgoing.len()
    }

    pub fn has_callbacks(&self) -> bool {
        lock(&self.callbacks).is_some()
    }

    /// Fires the installed wake word callback as the audio pipeline would.
    pub fn trigger_wake_word(&self, word: &str) {
        self.set_last_wake_word(word);
        if let Some(callbacks) = lock(&self.callbacks).as_ref() {
            (callbacks.on_wake_word_detected)(word);
        }
    }

    fn record(&self, call: AudioCall) {
        lock(&self.state).calls.push(call);
    }
}

impl AudioService for FakeAudio {
    fn start(&self) {
        self.record(AudioCall::Start);
    }

    fn stop(&self) {
        self.record(AudioCall::Stop);
    }

    fn set_callbacks(&self, callbacks: AudioCallbacks) {
        *lock(&self.callbacks) = Some(callbacks);
    }

    fn enable_voice_processing(&self, enable: bool) {
        self.record(AudioCall::VoiceProcessing(enable));
    }

    fn enable_wake_word_detection(&self, enable: bool) {
        self.record(AudioCall::WakeWordDetection(enable));
    }

    fn enable_device_aec(&self, enable: bool) {
        self.record(AudioCall::DeviceAec(enable));
    }

    fn enable_audio_testing(&self, enable: bool) {
        self.record(AudioCall::AudioTesting(enable));
    }

    fn is_audio_processor_running(&self) -> bool {
        lock(&self.state).processor_running
    }

    fn is_idle(&self) -> bool {
        lock(&self.state).idle
    }

    fn is_afe_wake_word(&self) -> bool {
        lock(&self.state).afe_wake_word
    }

    fn encode_wake_word(&self) {
        self.record(AudioCall::EncodeWakeWord);
    }

    fn pop_wake_word_packet(&self) -> Option<AudioPacket> {
        lock(&self.state).wake_word_packets.pop_front()
    }

    fn last_wake_word(&self) -> String {
        lock(&self.state).last_wake_word.clone()
    }

    fn pop_packet_from_send_queue(&self) -> Option<AudioPacket> {
        lock(&self.state).outgoing.pop_front()
    }

    fn push_packet_to_decode_queue(&self, packet: AudioPacket) {
        lock(&self.state).decoded.push(packet);
    }

    fn reset_decoder(&self) {
        self.record(AudioCall::ResetDecoder);
    }

    fn play_sound(&self, sound: Sound) {
        lock(&self.state).sounds.push(sound);
    }
}

#[derive(Default)]
pub struct FakeBoard {
    indicator: Mutex<Vec<DeviceState>>,
    power_save: Mutex<Vec<bool>>,
    restarts: Mutex<u32>,
    network_started: Mutex<bool>,
}

impl FakeBoard {
    pub fn indicator_states(&self) -> Vec<DeviceState> {
        lock(&self.indicator).clone()
    }

    pub fn power_save_history(&self) -> Vec<bool> {
        lock(&self.power_save).clone()
    }

    pub fn restarts(&self) -> u32 {
        *lock(&self.restarts)
    }

    pub fn network_started(&self) -> bool {
        *lock(&self.network_started)
    }

    pub fn clear(&self) {
        lock(&self.indicator).clear();
        lock(&self.power_save).clear();
    }
}

impl Board for FakeBoard {
    fn start_network(&self) {
        *lock(&self.network_started) = true;
    }

    fn set_power_save_mode(&self, enabled: bool) {
        lock(&self.power_save).push(enabled);
    }

    fn on_state_changed(&self, state: DeviceState) {
        lock(&self.indicator).push(state);
    }

    fn user_agent(&self) -> String {
        "voicebox-test/1.0.0".to_string()
    }

    fn restart(&self) {
        *lock(&self.restarts) += 1;
    }
}

#[derive(Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<(String, String), String>>,
}

impl MemorySettings {
    pub fn insert(&self, namespace: &str, key: &str, value: &str) {
        lock(&self.values).insert((namespace.to_string(), key.to_string()), value.to_string());
    }
}

impl Settings for MemorySettings {
    fn get_string(&self, namespace: &str, key: &str) -> Option<String> {
        lock(&self.values)
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }

    fn set_string(&self, namespace: &str, key: &str, value: &str) -> Result<(), SettingsError> {
        self.insert(namespace, key, value);
        Ok(())
    }

    fn erase_key(&self, namespace: &str, key: &str) -> Result<(), SettingsError> {
        lock(&self.values).remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }
}

/// Replays queued responses in order; an exhausted script fails like a dead link.
#[derive(Default)]
pub struct ScriptedHttp {
    responses: Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedHttp {
    pub fn push_ok(&self, status: u16, body: &str) {
        lock(&self.responses).push_back(Ok(HttpResponse {
            status,
            body: body.to_string(),
        }));
    }

    pub fn push_err(&self, message: &str) {
        lock(&self.responses).push_back(Err(HttpError::Transport {
            url: "scripted".to_string(),
            message: message.to_string(),
        }));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }
}

impl HttpClient for ScriptedHttp {
    fn request(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        lock(&self.requests).push(request.clone());
        lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| {
                Err(HttpError::Transport {
                    url: request.url.clone(),
                    message: "no scripted response".to_string(),
                })
            })
    }
}

struct OtaScript {
    checks: VecDeque<Result<(), OtaError>>,
    activation_rounds: u32,
    needs_activation: bool,
    activations: VecDeque<ActivationStatus>,
    new_version: Option<(String, String)>,
    upgrade_error: Option<OtaError>,
    check_calls: u32,
    activate_calls: u32,
    marked_valid: u32,
    upgrade_urls: Vec<String>,
    mqtt: bool,
    websocket: bool,
}

/// Check-in collaborator driven by a script. Checks succeed once the
/// scripted results run out.
pub struct ScriptedOta {
    script: Mutex<OtaScript>,
}

impl Default for ScriptedOta {
    fn default() -> Self {
        Self {
            script: Mutex::new(OtaScript {
                checks: VecDeque::new(),
                activation_rounds: 0,
                needs_activation: false,
                activations: VecDeque::new(),
                new_version: None,
                upgrade_error: None,
                check_calls: 0,
                activate_calls: 0,
                marked_valid: 0,
                upgrade_urls: Vec::new(),
                mqtt: true,
                websocket: false,
            }),
        }
    }
}

impl ScriptedOta {
    pub fn fail_checks(&self, count: usize) {
        let mut script = lock(&self.script);
        for _ in 0..count {
            script
                .checks
                .push_back(Err(OtaError::Malformed("scripted failure".to_string())));
        }
    }

    /// The next `rounds` successful checks report that activation is required.
    pub fn require_activation(&self, rounds: u32) {
        lock(&self.script).activation_rounds = rounds;
    }

    pub fn push_activation(&self, status: ActivationStatus) {
        lock(&self.script).activations.push_back(status);
    }

    pub fn offer_version(&self, version: &str, url: &str) {
        lock(&self.script).new_version = Some((version.to_string(), url.to_string()));
    }

    pub fn fail_upgrade(&self) {
        lock(&self.script).upgrade_error = Some(OtaError::Download("scripted".to_string()));
    }

    pub fn set_protocols(&self, mqtt: bool, websocket: bool) {
        let mut script = lock(&self.script);
        script.mqtt = mqtt;
        script.websocket = websocket;
    }

    pub fn check_calls(&self) -> u32 {
        lock(&self.script).check_calls
    }

    pub fn activate_calls(&self) -> u32 {
        lock(&self.script).activate_calls
    }

    pub fn marked_valid(&self) -> u32 {
        lock(&self.script).marked_valid
    }

    pub fn upgrade_urls(&self) -> Vec<String> {
        lock(&self.script).upgrade_urls.clone()
    }
}

impl Ota for ScriptedOta {
    fn check_version(&self) -> Result<(), OtaError> {
        let mut script = lock(&self.script);
        script.check_calls += 1;
        let result = script.checks.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            script.needs_activation = script.activation_rounds > 0;
            script.activation_rounds = script.activation_rounds.saturating_sub(1);
        }
        result
    }

    fn has_new_version(&self) -> bool {
        lock(&self.script).new_version.is_some()
    }

    fn firmware_version(&self) -> String {
        lock(&self.script)
            .new_version
            .as_ref()
            .map(|(version, _)| version.clone())
            .unwrap_or_default()
    }

    fn firmware_url(&self) -> String {
        lock(&self.script)
            .new_version
            .as_ref()
            .map(|(_, url)| url.clone())
            .unwrap_or_default()
    }

    fn current_version(&self) -> String {
        "1.0.0".to_string()
    }

    fn check_version_url(&self) -> String {
        "https://ota.test/check".to_string()
    }

    fn mark_current_version_valid(&self) {
        lock(&self.script).marked_valid += 1;
    }

    fn has_activation_code(&self) -> bool {
        lock(&self.script).needs_activation
    }

    fn has_activation_challenge(&self) -> bool {
        lock(&self.script).needs_activation
    }

    fn activation_code(&self) -> String {
        "2048".to_string()
    }

    fn activation_message(&self) -> String {
        "Enter 2048 in the console".to_string()
    }

    fn activate(&self) -> ActivationStatus {
        let mut script = lock(&self.script);
        script.activate_calls += 1;
        script
            .activations
            .pop_front()
            .unwrap_or(ActivationStatus::Activated)
    }

    fn start_upgrade_from_url(
        &self,
        url: &str,
        progress: &mut dyn FnMut(UpgradeProgress),
    ) -> Result<(), OtaError> {
        let error = {
            let mut script = lock(&self.script);
            script.upgrade_urls.push(url.to_string());
            script.upgrade_error.take()
        };
        progress(UpgradeProgress {
            percent: 50,
            bytes_per_sec: 64 * 1024,
        });
        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn has_mqtt_config(&self) -> bool {
        lock(&self.script).mqtt
    }

    fn has_websocket_config(&self) -> bool {
        lock(&self.script).websocket
    }
}

#[derive(Default)]
pub struct FakeAssets {
    pub valid: Mutex<bool>,
    pub fail_download: Mutex<bool>,
    pub downloads: Mutex<Vec<String>>,
    pub applied: Mutex<u32>,
}

impl Assets for FakeAssets {
    fn partition_valid(&self) -> bool {
        *lock(&self.valid)
    }

    fn download(
        &self,
        url: &str,
        progress: &mut dyn FnMut(UpgradeProgress),
    ) -> Result<(), OtaError> {
        lock(&self.downloads).push(url.to_string());
        progress(UpgradeProgress {
            percent: 100,
            bytes_per_sec: 1024,
        });
        if *lock(&self.fail_download) {
            return Err(OtaError::Download("scripted".to_string()));
        }
        Ok(())
    }

    fn apply(&self) {
        *lock(&self.applied) += 1;
    }
}

#[derive(Default)]
pub struct RecordingTools {
    messages: Mutex<Vec<Value>>,
}

impl RecordingTools {
    pub fn messages(&self) -> Vec<Value> {
        lock(&self.messages).clone()
    }
}

impl ToolServer for RecordingTools {
    fn parse_message(&self, payload: &Value) {
        lock(&self.messages).push(payload.clone());
    }
}

pub struct FixedClock(pub Option<DateTime<FixedOffset>>);

impl Default for FixedClock {
    fn default() -> Self {
        let offset = FixedOffset::east_opt(7 * 3600).unwrap();
        Self(offset.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).single())
    }
}

impl WallClock for FixedClock {
    fn now(&self) -> Option<DateTime<FixedOffset>> {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Start,
    OpenAudioChannel,
    CloseAudioChannel,
    StartListening(ListeningMode),
    StopListening,
    AbortSpeaking(AbortReason),
    WakeWordDetected(String),
    SendAudio,
    Mcp(String),
}

#[derive(Default)]
struct TransportLog {
    calls: Vec<TransportCall>,
    opened: bool,
    fail_open: bool,
    fail_start: bool,
    audio_budget: Option<usize>,
    callbacks: Option<Arc<TransportCallbacks>>,
}

/// Test-side view of a [`FakeTransport`] owned by the device.
#[derive(Clone, Default)]
pub struct TransportProbe {
    log: Arc<Mutex<TransportLog>>,
}

impl TransportProbe {
    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.log).calls.clone()
    }

    pub fn clear(&self) {
        lock(&self.log).calls.clear();
    }

    pub fn fail_open(&self, fail: bool) {
        lock(&self.log).fail_open = fail;
    }

    pub fn fail_start(&self, fail: bool) {
        lock(&self.log).fail_start = fail;
    }

    /// Sends beyond the next `count` are refused.
    pub fn refuse_audio_after(&self, count: usize) {
        lock(&self.log).audio_budget = Some(count);
    }

    pub fn is_opened(&self) -> bool {
        lock(&self.log).opened
    }

    fn callbacks(&self) -> Arc<TransportCallbacks> {
        lock(&self.log)
            .callbacks
            .clone()
            .expect("transport callbacks not installed")
    }

    pub fn deliver_json(&self, text: &str) {
        let value: Value = serde_json::from_str(text).unwrap();
        (self.callbacks().on_incoming_json)(value);
    }

    pub fn deliver_audio(&self, packet: AudioPacket) {
        (self.callbacks().on_incoming_audio)(packet);
    }

    pub fn deliver_network_error(&self, message: &str) {
        (self.callbacks().on_network_error)(message.to_string());
    }

    pub fn deliver_connected(&self) {
        (self.callbacks().on_connected)();
    }

    pub fn deliver_channel_opened(&self) {
        (self.callbacks().on_audio_channel_opened)();
    }

    pub fn deliver_channel_closed(&self) {
        lock(&self.log).opened = false;
        (self.callbacks().on_audio_channel_closed)();
    }
}

pub struct FakeTransport {
    probe: TransportProbe,
    sample_rate: u32,
}

impl FakeTransport {
    pub fn new(probe: TransportProbe) -> Self {
        Self {
            probe,
            sample_rate: 24_000,
        }
    }

    fn record(&self, call: TransportCall) {
        lock(&self.probe.log).calls.push(call);
    }
}

impl Transport for FakeTransport {
    fn set_callbacks(&mut self, callbacks: TransportCallbacks) {
        lock(&self.probe.log).callbacks = Some(Arc::new(callbacks));
    }

    fn start(&mut self) -> bool {
        self.record(TransportCall::Start);
        !lock(&self.probe.log).fail_start
    }

    fn open_audio_channel(&mut self) -> bool {
        let mut log = lock(&self.probe.log);
        log.calls.push(TransportCall::OpenAudioChannel);
        log.opened = !log.fail_open;
        log.opened
    }

    fn close_audio_channel(&mut self) {
        let mut log = lock(&self.probe.log);
        log.calls.push(TransportCall::CloseAudioChannel);
        log.opened = false;
    }

    fn is_audio_channel_opened(&self) -> bool {
        lock(&self.probe.log).opened
    }

    fn send_start_listening(&mut self, mode: ListeningMode) {
        self.record(TransportCall::StartListening(mode));
    }

    fn send_stop_listening(&mut self) {
        self.record(TransportCall::StopListening);
    }

    fn send_abort_speaking(&mut self, reason: AbortReason) {
        self.record(TransportCall::AbortSpeaking(reason));
    }

    fn send_wake_word_detected(&mut self, wake_word: &str) {
        self.record(TransportCall::WakeWordDetected(wake_word.to_string()));
    }

    fn send_audio(&mut self, _packet: AudioPacket) -> bool {
        let mut log = lock(&self.probe.log);
        log.calls.push(TransportCall::SendAudio);
        match log.audio_budget.as_mut() {
            Some(0) => false,
            Some(budget) => {
                *budget -= 1;
                true
            }
            None => true,
        }
    }

    fn send_mcp_message(&mut self, payload: &str) {
        self.record(TransportCall::Mcp(payload.to_string()));
    }

    fn server_sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[derive(Default)]
pub struct FakeTransportFactory {
    probe: TransportProbe,
    kinds: Mutex<Vec<TransportKind>>,
}

impl FakeTransportFactory {
    pub fn kinds(&self) -> Vec<TransportKind> {
        lock(&self.kinds).clone()
    }
}

impl TransportFactory for FakeTransportFactory {
    fn create(&self, kind: TransportKind) -> Box<dyn Transport> {
        lock(&self.kinds).push(kind);
        Box::new(FakeTransport::new(self.probe.clone()))
    }
}

/// A device wired to fakes, with every pause shortened to zero.
pub struct TestRig {
    pub device: Device,
    pub display: Arc<RecordingDisplay>,
    pub audio: Arc<FakeAudio>,
    pub board: Arc<FakeBoard>,
    pub settings: Arc<MemorySettings>,
    pub http: Arc<ScriptedHttp>,
    pub ota: Arc<ScriptedOta>,
    pub assets: Arc<FakeAssets>,
    pub tools: Arc<RecordingTools>,
    pub transports: Arc<FakeTransportFactory>,
    pub transport: TransportProbe,
}

impl TestRig {
    pub fn fast_config() -> DeviceConfig {
        DeviceConfig {
            wait_step_ms: 0,
            alert_pause_ms: 0,
            settle_ms: 0,
            notification_ms: 0,
            ..DeviceConfig::default()
        }
    }

    pub fn new() -> Self {
        Self::with_config(Self::fast_config())
    }

    pub fn with_transport() -> Self {
        let mut rig = Self::new();
        rig.install_transport();
        rig
    }

    pub fn with_config(config: DeviceConfig) -> Self {
        let display = Arc::new(RecordingDisplay::default());
        let audio = Arc::new(FakeAudio::default());
        let board = Arc::new(FakeBoard::default());
        let settings = Arc::new(MemorySettings::default());
        let http = Arc::new(ScriptedHttp::default());
        let ota = Arc::new(ScriptedOta::default());
        let assets = Arc::new(FakeAssets::default());
        let tools = Arc::new(RecordingTools::default());
        let transports = Arc::new(FakeTransportFactory::default());
        let transport = transports.probe.clone();

        let services = Services {
            display: display.clone(),
            audio: audio.clone(),
            board: board.clone(),
            settings: settings.clone(),
            http: http.clone(),
            ota: ota.clone(),
            assets: assets.clone(),
            tools: tools.clone(),
            clock: Arc::new(FixedClock::default()),
            transports: transports.clone(),
        };
        let device = Device::new(config, WeatherConfig::default(), services);

        Self {
            device,
            display,
            audio,
            board,
            settings,
            http,
            ota,
            assets,
            tools,
            transports,
            transport,
        }
    }

    pub fn install_transport(&mut self) {
        let transport = FakeTransport::new(self.transport.clone());
        self.device.attach_transport(Box::new(transport));
        self.transport.clear();
    }

    pub fn clear_logs(&self) {
        self.display.clear();
        self.audio.clear();
        self.board.clear();
        self.transport.clear();
    }

    /// Runs every wake cycle that is already pending.
    pub fn drain(&mut self) {
        while self.device.run_once(Some(Duration::ZERO)) {}
    }
}
