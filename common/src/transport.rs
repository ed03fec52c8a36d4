//! MQTT-framed session transport.
//!
//! Control messages are JSON on the publish topic; audio frames travel on the
//! `<topic>/audio` sub-topic as a 4-byte big-endian timestamp followed by the
//! encoded payload. The broker client itself is abstracted as [`MqttLink`].

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::{info, warn};
use serde_json::{json, Value};

use crate::{
    config::NetworkConfig,
    services::{AudioPacket, Settings, Transport, TransportCallbacks},
    strings,
    types::{AbortReason, ListeningMode},
};

pub const DEFAULT_SERVER_SAMPLE_RATE: u32 = 24_000;
const FRAME_DURATION_MS: u32 = 60;

/// Broker connection details, persisted by the check-in under `mqtt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub publish_topic: String,
    pub subscribe_topic: String,
}

impl MqttEndpoint {
    pub fn from_settings(settings: &dyn Settings, network: &NetworkConfig) -> Self {
        let get = |key: &str| {
            settings
                .get_string("mqtt", key)
                .filter(|value| !value.is_empty())
        };

        // `endpoint` may carry its own port as `host:port`.
        let (host, port) = match get("endpoint") {
            Some(endpoint) => match endpoint.rsplit_once(':') {
                Some((host, port)) => match port.parse() {
                    Ok(port) => (host.to_string(), port),
                    Err(_) => (endpoint.clone(), network.mqtt_port),
                },
                None => (endpoint, network.mqtt_port),
            },
            None => (network.mqtt_host.clone(), network.mqtt_port),
        };
        let port = get("port").and_then(|port| port.parse().ok()).unwrap_or(port);
        let client_id = get("client_id").unwrap_or_else(|| {
            if network.client_id.is_empty() {
                "voicebox".to_string()
            } else {
                network.client_id.clone()
            }
        });

        Self {
            host,
            port,
            username: get("username").unwrap_or_else(|| network.mqtt_user.clone()),
            password: get("password").unwrap_or_else(|| network.mqtt_pass.clone()),
            publish_topic: get("publish_topic").unwrap_or_else(|| "device-server".to_string()),
            subscribe_topic: get("subscribe_topic")
                .unwrap_or_else(|| format!("devices/{client_id}")),
            client_id,
        }
    }
}

/// Broker client. Incoming traffic is delivered to the inbox from the
/// link's own receive thread.
pub trait MqttLink: Send {
    fn connect(&mut self, inbox: Arc<MqttInbox>) -> Result<(), String>;
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), String>;
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Default)]
struct Session {
    id: Option<String>,
    hello_received: bool,
    opened: bool,
    server_sample_rate: u32,
}

/// Receive side shared between the transport and the link's receive thread.
#[derive(Default)]
pub struct MqttInbox {
    callbacks: Mutex<Option<Arc<TransportCallbacks>>>,
    session: Mutex<Session>,
    hello: Condvar,
}

impl MqttInbox {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks(&self) -> Option<Arc<TransportCallbacks>> {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_callbacks(&self, callbacks: TransportCallbacks) {
        *self.callbacks.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callbacks));
    }

    pub fn on_connected(&self) {
        info!("mqtt connected");
        if let Some(callbacks) = self.callbacks() {
            (callbacks.on_connected)();
        }
    }

    pub fn on_connection_lost(&self, reason: &str) {
        warn!("mqtt connection lost: {reason}");
        let was_open = std::mem::take(&mut self.session().opened);
        if was_open {
            if let Some(callbacks) = self.callbacks() {
                (callbacks.on_audio_channel_closed)();
            }
        }
    }

    pub fn on_publish(&self, topic: &str, payload: &[u8]) {
        if topic.ends_with("/audio") {
            self.on_audio(payload);
            return;
        }

        let root: Value = match serde_json::from_slice(payload) {
            Ok(root) => root,
            Err(err) => {
                warn!("dropping non-JSON message on {topic}: {err}");
                return;
            }
        };

        match root.get("type").and_then(Value::as_str) {
            Some("hello") => self.on_server_hello(&root),
            Some("goodbye") => self.on_goodbye(&root),
            _ => {
                if let Some(callbacks) = self.callbacks() {
                    (callbacks.on_incoming_json)(root);
                }
            }
        }
    }

    fn on_server_hello(&self, root: &Value) {
        {
            let mut session = self.session();
            session.id = root
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            session.server_sample_rate = root
                .pointer("/audio_params/sample_rate")
                .and_then(Value::as_u64)
                .and_then(|rate| u32::try_from(rate).ok())
                .unwrap_or(DEFAULT_SERVER_SAMPLE_RATE);
            session.hello_received = true;
        }
        self.hello.notify_all();
    }

    fn on_goodbye(&self, root: &Value) {
        let closed = {
            let mut session = self.session();
            let id = root.get("session_id").and_then(Value::as_str);
            let matches = id.is_none() || id == session.id.as_deref();
            if matches && session.opened {
                session.opened = false;
                true
            } else {
                false
            }
        };
        if closed {
            info!("server closed the session");
            if let Some(callbacks) = self.callbacks() {
                (callbacks.on_audio_channel_closed)();
            }
        }
    }

    fn on_audio(&self, payload: &[u8]) {
        let (opened, sample_rate) = {
            let session = self.session();
            (session.opened, session.server_sample_rate)
        };
        if !opened || payload.len() < 4 {
            return;
        }
        let (header, data) = payload.split_at(4);
        let mut timestamp = [0u8; 4];
        timestamp.copy_from_slice(header);
        let packet = AudioPacket {
            sample_rate,
            frame_duration_ms: FRAME_DURATION_MS,
            timestamp: u32::from_be_bytes(timestamp),
            payload: data.to_vec(),
        };
        if let Some(callbacks) = self.callbacks() {
            (callbacks.on_incoming_audio)(packet);
        }
    }
}

pub struct MqttTransport<L> {
    link: L,
    inbox: Arc<MqttInbox>,
    publish_topic: String,
    hello_timeout: Duration,
}

impl<L: MqttLink> MqttTransport<L> {
    pub fn new(link: L, publish_topic: impl Into<String>, hello_timeout: Duration) -> Self {
        Self {
            link,
            inbox: Arc::new(MqttInbox::default()),
            publish_topic: publish_topic.into(),
            hello_timeout,
        }
    }

    fn network_error(&self, message: &str) {
        if let Some(callbacks) = self.inbox.callbacks() {
            (callbacks.on_network_error)(message.to_string());
        }
    }

    fn session_id(&self) -> String {
        self.inbox.session().id.clone().unwrap_or_default()
    }

    fn send_json(&mut self, message: Value) -> bool {
        let text = message.to_string();
        match self.link.publish(&self.publish_topic, text.as_bytes()) {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to publish control message: {err}");
                self.network_error(strings::SERVER_NOT_CONNECTED);
                false
            }
        }
    }

    fn connect(&mut self) -> bool {
        match self.link.connect(Arc::clone(&self.inbox)) {
            Ok(()) => true,
            Err(err) => {
                warn!("mqtt connect failed: {err}");
                self.network_error(strings::SERVER_NOT_CONNECTED);
                false
            }
        }
    }
}

impl<L: MqttLink> Transport for MqttTransport<L> {
    fn set_callbacks(&mut self, callbacks: TransportCallbacks) {
        self.inbox.set_callbacks(callbacks);
    }

    fn start(&mut self) -> bool {
        self.connect()
    }

    fn open_audio_channel(&mut self) -> bool {
        if !self.link.is_connected() && !self.connect() {
            return false;
        }

        {
            let mut session = self.inbox.session();
            session.hello_received = false;
            session.id = None;
        }

        let hello = json!({
            "type": "hello",
            "version": 3,
            "transport": "mqtt",
            "features": {"mcp": true},
            "audio_params": {
                "format": "opus",
                "sample_rate": 16000,
                "channels": 1,
                "frame_duration": FRAME_DURATION_MS,
            },
        });
        if !self.send_json(hello) {
            return false;
        }

        let session = self.inbox.session();
        let (mut session, _) = self
            .inbox
            .hello
            .wait_timeout_while(session, self.hello_timeout, |session| !session.hello_received)
            .unwrap_or_else(PoisonError::into_inner);
        if !session.hello_received {
            drop(session);
            warn!("no server hello within {:?}", self.hello_timeout);
            self.network_error(strings::SERVER_TIMEOUT);
            return false;
        }
        session.opened = true;
        drop(session);

        if let Some(callbacks) = self.inbox.callbacks() {
            (callbacks.on_audio_channel_opened)();
        }
        true
    }

    fn close_audio_channel(&mut self) {
        let session_id = self.session_id();
        self.send_json(json!({"session_id": session_id, "type": "goodbye"}));

        let was_open = std::mem::take(&mut self.inbox.session().opened);
        if was_open {
            if let Some(callbacks) = self.inbox.callbacks() {
                (callbacks.on_audio_channel_closed)();
            }
        }
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.inbox.session().opened
    }

    fn send_start_listening(&mut self, mode: ListeningMode) {
        let session_id = self.session_id();
        self.send_json(json!({
            "session_id": session_id,
            "type": "listen",
            "state": "start",
            "mode": mode.as_str(),
        }));
    }

    fn send_stop_listening(&mut self) {
        let session_id = self.session_id();
        self.send_json(json!({"session_id": session_id, "type": "listen", "state": "stop"}));
    }

    fn send_abort_speaking(&mut self, reason: AbortReason) {
        let mut message = json!({"session_id": self.session_id(), "type": "abort"});
        if let Some(reason) = reason.as_wire() {
            message["reason"] = Value::from(reason);
        }
        self.send_json(message);
    }

    fn send_wake_word_detected(&mut self, wake_word: &str) {
        let session_id = self.session_id();
        self.send_json(json!({
            "session_id": session_id,
            "type": "listen",
            "state": "detect",
            "text": wake_word,
        }));
    }

    fn send_audio(&mut self, packet: AudioPacket) -> bool {
        if !self.is_audio_channel_opened() {
            return false;
        }
        let mut frame = Vec::with_capacity(4 + packet.payload.len());
        frame.extend_from_slice(&packet.timestamp.to_be_bytes());
        frame.extend_from_slice(&packet.payload);
        let topic = format!("{}/audio", self.publish_topic);
        match self.link.publish(&topic, &frame) {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to publish audio frame: {err}");
                false
            }
        }
    }

    fn send_mcp_message(&mut self, payload: &str) {
        let payload: Value = match serde_json::from_str(payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("dropping invalid mcp payload: {err}");
                return;
            }
        };
        let session_id = self.session_id();
        self.send_json(json!({"session_id": session_id, "type": "mcp", "payload": payload}));
    }

    fn server_sample_rate(&self) -> u32 {
        match self.inbox.session().server_sample_rate {
            0 => DEFAULT_SERVER_SAMPLE_RATE,
            rate => rate,
        }
    }
}
