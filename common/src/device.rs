use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        mpsc, Arc,
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use crate::{
    bridge,
    config::{DeviceConfig, WeatherConfig},
    idle::build_idle_card,
    scheduler::{Pending, Scheduler, WakeFlag},
    services::{AudioCallbacks, Display, Services, Sound, Transport, TransportKind, UpgradeProgress},
    strings,
    types::{AbortReason, AecMode, DeviceState, DeviceStatus, ListeningMode},
    weather::WeatherService,
};

pub type StateObserver = Box<dyn Fn(DeviceState, DeviceState) + Send>;

/// Lock-free mirror of the session fields for readers off the scheduler thread.
#[derive(Debug, Default)]
struct StatusCell {
    state: AtomicU8,
    listening_mode: AtomicU8,
    aec_mode: AtomicU8,
}

/// Owns all session state. Every method runs on the scheduler thread.
pub struct Device {
    pub(crate) config: DeviceConfig,
    pub(crate) services: Services,
    pub(crate) scheduler: Scheduler<Device>,
    pub(crate) weather: Arc<WeatherService>,
    pub(crate) transport: Option<Box<dyn Transport>>,
    state: DeviceState,
    listening_mode: ListeningMode,
    aec_mode: AecMode,
    clock_ticks: u64,
    aborted: bool,
    status: Arc<StatusCell>,
    observers: Vec<StateObserver>,
}

impl Device {
    pub fn new(config: DeviceConfig, weather: WeatherConfig, services: Services) -> Self {
        let weather = Arc::new(WeatherService::new(
            weather,
            Arc::clone(&services.http),
            Arc::clone(&services.settings),
            services.board.user_agent(),
        ));
        let scheduler = Scheduler::new();
        scheduler.bind_current_thread();

        let device = Self {
            aec_mode: config.aec_mode,
            config,
            services,
            scheduler,
            weather,
            transport: None,
            state: DeviceState::Unknown,
            listening_mode: ListeningMode::AutoStop,
            clock_ticks: 0,
            aborted: false,
            status: Arc::new(StatusCell::default()),
            observers: Vec::new(),
        };
        device.status.aec_mode.store(device.aec_mode.as_u8(), Ordering::Relaxed);
        device
    }

    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            scheduler: self.scheduler.clone(),
            status: Arc::clone(&self.status),
        }
    }

    pub fn add_state_observer(&mut self, observer: StateObserver) {
        self.observers.push(observer);
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn listening_mode(&self) -> ListeningMode {
        self.listening_mode
    }

    pub fn aec_mode(&self) -> AecMode {
        self.aec_mode
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn is_audio_channel_opened(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|transport| transport.is_audio_channel_opened())
    }

    pub fn status(&self) -> DeviceStatus {
        let weather = self.weather.snapshot();
        DeviceStatus {
            state: self.state.as_str(),
            listening_mode: self.listening_mode.as_str(),
            aec_mode: self.aec_mode.as_str(),
            channel_open: self.is_audio_channel_opened(),
            sleep_ready: self.can_enter_sleep_mode(),
            weather_city: weather.as_ref().map(|weather| weather.city.clone()),
            weather_temp_c: weather.as_ref().map(|weather| weather.temperature_c),
        }
    }

    /// Boot sequence: audio, network, assets, check-in, transport, then Idle.
    pub fn start(&mut self) {
        self.scheduler.bind_current_thread();
        self.set_device_state(DeviceState::Starting);

        let display = Arc::clone(&self.services.display);
        let audio = Arc::clone(&self.services.audio);
        let board = Arc::clone(&self.services.board);

        display.set_chat_message("system", &board.user_agent());
        audio.start();
        audio.set_callbacks(self.audio_callbacks());

        if let Err(err) = self
            .scheduler
            .spawn_clock(Duration::from_millis(self.config.clock_tick_ms))
        {
            error!("failed to start clock tick thread: {err}");
        }

        board.start_network();
        display.update_status_bar(true);

        self.check_assets_version();
        let outcome = self.check_new_version();
        info!("check-in finished: {outcome:?}");

        display.set_status(strings::LOADING_PROTOCOL);
        let ota = Arc::clone(&self.services.ota);
        let kind = if ota.has_mqtt_config() {
            TransportKind::Mqtt
        } else if ota.has_websocket_config() {
            TransportKind::Websocket
        } else {
            warn!("no protocol in check-in response, using MQTT");
            TransportKind::Mqtt
        };
        let transport = self.services.transports.create(kind);
        let started = self.attach_transport(transport);

        self.set_device_state(DeviceState::Idle);
        self.request_weather_update(true);

        if started {
            let message = format!("{}{}", strings::VERSION, ota.current_version());
            display.show_notification(
                &message,
                Duration::from_millis(self.config.notification_ms),
            );
            display.set_chat_message("system", "");
            audio.play_sound(Sound::Success);
        }
    }

    /// Installs the bridge callbacks and starts the transport.
    pub fn attach_transport(&mut self, mut transport: Box<dyn Transport>) -> bool {
        transport.set_callbacks(bridge::transport_callbacks(
            &self.scheduler,
            self.config.receive_custom_messages,
        ));
        let started = transport.start();
        if !started {
            warn!("transport failed to start");
        }
        self.transport = Some(transport);
        started
    }

    fn audio_callbacks(&self) -> AudioCallbacks {
        let send_ready = self.scheduler.clone();
        let wake_word = self.scheduler.clone();
        let vad = self.scheduler.clone();
        AudioCallbacks {
            on_send_queue_available: Box::new(move || send_ready.raise(WakeFlag::AudioSendReady)),
            on_wake_word_detected: Box::new(move |_| wake_word.raise(WakeFlag::WakeWordDetected)),
            on_vad_change: Box::new(move |_| vad.raise(WakeFlag::VoiceActivityChanged)),
        }
    }

    /// Steady-state loop; never returns.
    pub fn run(&mut self) {
        self.scheduler.bind_current_thread();
        loop {
            self.run_once(None);
        }
    }

    /// Waits for one wake cycle and services it. Returns false on timeout.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> bool {
        let pending = self.scheduler.wait(timeout);
        if pending.is_empty() {
            return false;
        }
        self.dispatch(pending);
        true
    }

    pub fn dispatch(&mut self, mut pending: Pending) {
        let flags: Vec<WakeFlag> = pending.flags().collect();
        for flag in flags {
            match flag {
                WakeFlag::NetworkError => {
                    let message = pending.take_network_error().unwrap_or_default();
                    self.on_network_error(&message);
                }
                WakeFlag::AudioSendReady => self.flush_send_queue(),
                WakeFlag::WakeWordDetected => self.on_wake_word_detected(),
                WakeFlag::VoiceActivityChanged => {
                    if self.state == DeviceState::Listening {
                        self.services.board.on_state_changed(self.state);
                    }
                }
                WakeFlag::WorkPending => {
                    for task in self.scheduler.take_tasks() {
                        task(self);
                    }
                }
                WakeFlag::ClockTick => self.on_clock_tick(),
            }
        }
    }

    /// Services scheduled work for up to `budget` while a boot-time flow blocks.
    pub(crate) fn pump(&mut self, budget: Duration) {
        let deadline = Instant::now() + budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let pending = self.scheduler.wait(Some(remaining));
            if pending.is_empty() {
                return;
            }
            self.dispatch(pending);
            if remaining.is_zero() {
                return;
            }
        }
    }

    pub(crate) fn pause(&mut self, ms: u64) {
        self.pump(Duration::from_millis(ms));
    }

    /// Waits `seconds` one-second steps; returns true if the device was forced to Idle.
    pub(crate) fn wait_unless_idle(&mut self, seconds: u64) -> bool {
        for _ in 0..seconds {
            self.pump(Duration::from_millis(self.config.wait_step_ms));
            if self.state == DeviceState::Idle {
                return true;
            }
        }
        false
    }

    pub fn set_device_state(&mut self, state: DeviceState) {
        debug_assert!(
            self.scheduler.is_scheduler_thread(),
            "device state changed off the scheduler thread"
        );
        if self.state == state {
            return;
        }

        self.clock_ticks = 0;
        let previous = self.state;
        self.state = state;
        self.status.state.store(state.as_u8(), Ordering::Relaxed);
        info!("STATE: {}", state.as_str());

        for observer in &self.observers {
            observer(previous, state);
        }

        let display = Arc::clone(&self.services.display);
        let audio = Arc::clone(&self.services.audio);
        self.services.board.on_state_changed(state);
        if state != DeviceState::Idle {
            display.hide_idle_card();
        }

        match state {
            DeviceState::Idle => {
                display.set_status(strings::STANDBY);
                display.set_emotion("neutral");
                audio.enable_voice_processing(false);
                audio.enable_wake_word_detection(true);
                self.request_weather_update(false);
                self.update_idle_display();
            }
            DeviceState::Connecting => {
                display.set_status(strings::CONNECTING);
                display.set_emotion("neutral");
                display.set_chat_message("system", "");
            }
            DeviceState::Listening => {
                display.set_status(strings::LISTENING);
                display.set_emotion("neutral");
                if !audio.is_audio_processor_running() {
                    if let Some(transport) = self.transport.as_mut() {
                        transport.send_start_listening(self.listening_mode);
                    }
                    audio.enable_voice_processing(true);
                    audio.enable_wake_word_detection(false);
                }
            }
            DeviceState::Speaking => {
                display.set_status(strings::SPEAKING);
                if self.listening_mode != ListeningMode::Realtime {
                    audio.enable_voice_processing(false);
                    audio.enable_wake_word_detection(audio.is_afe_wake_word());
                }
                audio.reset_decoder();
            }
            _ => {}
        }
    }

    pub fn set_listening_mode(&mut self, mode: ListeningMode) {
        self.listening_mode = mode;
        self.status
            .listening_mode
            .store(mode.as_u8(), Ordering::Relaxed);
        self.set_device_state(DeviceState::Listening);
    }

    fn conversation_mode(&self) -> ListeningMode {
        if self.aec_mode == AecMode::Off {
            ListeningMode::AutoStop
        } else {
            ListeningMode::Realtime
        }
    }

    /// Opens the audio channel if needed, passing through Connecting.
    /// Falls back to Idle when the open fails.
    fn ensure_audio_channel(&mut self) -> bool {
        let opened = match self.transport.as_ref() {
            Some(transport) => transport.is_audio_channel_opened(),
            None => return false,
        };
        if opened {
            return true;
        }

        self.set_device_state(DeviceState::Connecting);
        let opened = self
            .transport
            .as_mut()
            .is_some_and(|transport| transport.open_audio_channel());
        if !opened {
            warn!("failed to open audio channel");
            self.set_device_state(DeviceState::Idle);
        }
        opened
    }

    fn close_audio_channel(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            if transport.is_audio_channel_opened() {
                transport.close_audio_channel();
            }
        }
    }

    pub fn toggle_chat_state(&mut self) {
        match self.state {
            DeviceState::Activating => {
                self.set_device_state(DeviceState::Idle);
                return;
            }
            DeviceState::Configuring => {
                self.services.audio.enable_audio_testing(true);
                self.set_device_state(DeviceState::AudioTesting);
                return;
            }
            DeviceState::AudioTesting => {
                self.services.audio.enable_audio_testing(false);
                self.set_device_state(DeviceState::Configuring);
                return;
            }
            _ => {}
        }

        if self.transport.is_none() {
            error!("protocol not initialized");
            return;
        }

        match self.state {
            DeviceState::Idle => {
                if self.ensure_audio_channel() {
                    self.set_listening_mode(self.conversation_mode());
                }
            }
            DeviceState::Speaking => self.abort_speaking(AbortReason::None),
            DeviceState::Listening => self.close_audio_channel(),
            _ => {}
        }
    }

    /// Push-to-talk press.
    pub fn start_listening(&mut self) {
        match self.state {
            DeviceState::Activating => {
                self.set_device_state(DeviceState::Idle);
                return;
            }
            DeviceState::Configuring => {
                self.services.audio.enable_audio_testing(true);
                self.set_device_state(DeviceState::AudioTesting);
                return;
            }
            _ => {}
        }

        if self.transport.is_none() {
            error!("protocol not initialized");
            return;
        }

        match self.state {
            DeviceState::Idle => {
                if self.ensure_audio_channel() {
                    self.set_listening_mode(ListeningMode::ManualStop);
                }
            }
            DeviceState::Speaking => {
                self.abort_speaking(AbortReason::None);
                self.set_listening_mode(ListeningMode::ManualStop);
            }
            _ => {}
        }
    }

    /// Push-to-talk release.
    pub fn stop_listening(&mut self) {
        if self.state == DeviceState::AudioTesting {
            self.services.audio.enable_audio_testing(false);
            self.set_device_state(DeviceState::Configuring);
            return;
        }

        if self.state == DeviceState::Listening {
            if let Some(transport) = self.transport.as_mut() {
                transport.send_stop_listening();
            }
            self.set_device_state(DeviceState::Idle);
        }
    }

    pub fn on_wake_word_detected(&mut self) {
        if self.transport.is_none() {
            return;
        }

        match self.state {
            DeviceState::Idle => {
                let wake_word = self.services.audio.last_wake_word();
                self.begin_wake_word_session(&wake_word);
            }
            DeviceState::Speaking => self.abort_speaking(AbortReason::WakeWordDetected),
            DeviceState::Activating => self.set_device_state(DeviceState::Idle),
            _ => {}
        }
    }

    /// Wake word supplied from outside the audio pipeline.
    pub fn wake_word_invoke(&mut self, wake_word: &str) {
        if self.transport.is_none() {
            return;
        }

        match self.state {
            DeviceState::Idle => self.begin_wake_word_session(wake_word),
            DeviceState::Speaking => self.abort_speaking(AbortReason::None),
            DeviceState::Listening => self.close_audio_channel(),
            _ => {}
        }
    }

    fn begin_wake_word_session(&mut self, wake_word: &str) {
        let audio = Arc::clone(&self.services.audio);
        audio.encode_wake_word();

        if !self.ensure_audio_channel() {
            audio.enable_wake_word_detection(true);
            return;
        }

        info!("wake word detected: {wake_word}");
        let mode = self.conversation_mode();
        if self.config.send_wake_word_data {
            if let Some(transport) = self.transport.as_mut() {
                while let Some(packet) = audio.pop_wake_word_packet() {
                    transport.send_audio(packet);
                }
                transport.send_wake_word_detected(wake_word);
            }
            self.set_listening_mode(mode);
        } else {
            self.set_listening_mode(mode);
            audio.play_sound(Sound::Popup);
        }
    }

    pub fn abort_speaking(&mut self, reason: AbortReason) {
        info!("abort speaking");
        self.aborted = true;
        if let Some(transport) = self.transport.as_mut() {
            transport.send_abort_speaking(reason);
        }
    }

    pub(crate) fn set_aborted(&mut self, aborted: bool) {
        self.aborted = aborted;
    }

    pub fn set_aec_mode(&mut self, mode: AecMode) {
        self.aec_mode = mode;
        self.status.aec_mode.store(mode.as_u8(), Ordering::Relaxed);

        let audio = &self.services.audio;
        let notification = match mode {
            AecMode::Off => {
                audio.enable_device_aec(false);
                strings::RTC_MODE_OFF
            }
            AecMode::OnServerSide => {
                audio.enable_device_aec(false);
                strings::RTC_MODE_ON
            }
            AecMode::OnDeviceSide => {
                audio.enable_device_aec(true);
                strings::RTC_MODE_ON
            }
        };
        self.services.display.show_notification(
            notification,
            Duration::from_millis(self.config.notification_ms),
        );

        // Channel parameters were negotiated for the previous mode.
        self.close_audio_channel();
    }

    pub fn alert(&self, status: &str, message: &str, emotion: &str, sound: Option<Sound>) {
        warn!("Alert [{emotion}] {status}: {message}");
        let display = &self.services.display;
        display.set_status(status);
        display.set_emotion(emotion);
        display.set_chat_message("system", message);
        if let Some(sound) = sound {
            self.services.audio.play_sound(sound);
        }
    }

    pub fn dismiss_alert(&self) {
        if self.state == DeviceState::Idle {
            let display = &self.services.display;
            display.set_status(strings::STANDBY);
            display.set_emotion("neutral");
            display.set_chat_message("system", "");
        }
    }

    pub fn send_mcp_message(&mut self, payload: &str) {
        if let Some(transport) = self.transport.as_mut() {
            transport.send_mcp_message(payload);
        }
    }

    pub fn can_enter_sleep_mode(&self) -> bool {
        self.state == DeviceState::Idle
            && !self.is_audio_channel_opened()
            && self.services.audio.is_idle()
    }

    pub fn reboot(&mut self) {
        info!("rebooting");
        self.close_audio_channel();
        self.transport = None;
        self.services.audio.stop();
        self.pause(self.config.settle_ms);
        self.services.board.restart();
    }

    pub fn request_weather_update(&self, force: bool) {
        let scheduler = self.scheduler.clone();
        self.weather.request_update(force, move || {
            scheduler.schedule(|device: &mut Device| {
                if device.state == DeviceState::Idle {
                    device.update_idle_display();
                }
            });
        });
    }

    /// Leaving Idle hides the card in `set_device_state`; other states leave it alone.
    pub fn update_idle_display(&self) {
        if self.state != DeviceState::Idle {
            return;
        }

        let snapshot = self.weather.snapshot();
        let card = build_idle_card(
            self.services.clock.now(),
            snapshot.as_ref(),
            self.weather.default_city(),
        );
        self.services.display.show_idle_card(&card);
    }

    fn on_network_error(&mut self, message: &str) {
        self.set_device_state(DeviceState::Idle);
        self.alert(strings::ERROR, message, "circle_xmark", Some(Sound::Exclamation));
    }

    fn flush_send_queue(&mut self) {
        let audio = Arc::clone(&self.services.audio);
        while let Some(packet) = audio.pop_packet_from_send_queue() {
            if let Some(transport) = self.transport.as_mut() {
                if !transport.send_audio(packet) {
                    break;
                }
            }
        }
    }

    fn on_clock_tick(&mut self) {
        self.clock_ticks += 1;
        self.update_idle_display();
        self.services.display.update_status_bar(false);

        if self.clock_ticks % self.config.weather_refresh_ticks == 0 {
            self.request_weather_update(false);
        }
        if self.clock_ticks % self.config.heartbeat_ticks == 0 {
            debug!(
                "heartbeat: state={} ticks_in_state={}",
                self.state.as_str(),
                self.clock_ticks
            );
        }
    }

    pub fn clock_ticks(&self) -> u64 {
        self.clock_ticks
    }
}

/// Renders download progress off the calling thread.
pub(crate) fn report_progress(display: &Arc<dyn Display>, progress: UpgradeProgress) {
    let display = Arc::clone(display);
    let spawned = thread::Builder::new()
        .name("progress".into())
        .stack_size(3 * 1024)
        .spawn(move || display.set_chat_message("system", &progress.to_string()));
    if let Err(err) = spawned {
        warn!("failed to spawn progress reporter: {err}");
    }
}

/// Cross-thread entry points. Everything that touches session state is
/// marshalled onto the scheduler thread.
#[derive(Clone)]
pub struct DeviceHandle {
    scheduler: Scheduler<Device>,
    status: Arc<StatusCell>,
}

impl DeviceHandle {
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce(&mut Device) + Send + 'static,
    {
        self.scheduler.schedule(task);
    }

    /// Runs `query` on the scheduler thread and waits for its answer.
    pub fn query<R, F>(&self, query: F, timeout: Duration) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Device) -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        self.scheduler.schedule(move |device: &mut Device| {
            let _ = tx.send(query(device));
        });
        rx.recv_timeout(timeout).ok()
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.status.state.load(Ordering::Relaxed))
    }

    pub fn listening_mode(&self) -> ListeningMode {
        ListeningMode::from_u8(self.status.listening_mode.load(Ordering::Relaxed))
    }

    pub fn aec_mode(&self) -> AecMode {
        AecMode::from_u8(self.status.aec_mode.load(Ordering::Relaxed))
    }

    pub fn toggle_chat_state(&self) {
        self.schedule(Device::toggle_chat_state);
    }

    pub fn start_listening(&self) {
        self.schedule(Device::start_listening);
    }

    pub fn stop_listening(&self) {
        self.schedule(Device::stop_listening);
    }

    pub fn wake_word_invoke(&self, wake_word: String) {
        self.schedule(move |device: &mut Device| device.wake_word_invoke(&wake_word));
    }

    pub fn set_aec_mode(&self, mode: AecMode) {
        self.schedule(move |device: &mut Device| device.set_aec_mode(mode));
    }

    pub fn send_mcp_message(&self, payload: String) {
        self.schedule(move |device: &mut Device| device.send_mcp_message(&payload));
    }

    pub fn request_weather_update(&self, force: bool) {
        self.schedule(move |device: &mut Device| device.request_weather_update(force));
    }
}
