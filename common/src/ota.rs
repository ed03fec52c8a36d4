use std::{
    cmp::Ordering,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{
    config::NetworkConfig,
    error::{HttpError, OtaError},
    services::{
        ActivationStatus, FirmwareUpdater, HttpClient, HttpRequest, Ota, Settings,
        UpgradeProgress,
    },
};

#[derive(Debug, Default, Deserialize)]
struct CheckInResponse {
    #[serde(default)]
    firmware: Option<FirmwareSection>,
    #[serde(default)]
    activation: Option<ActivationSection>,
    #[serde(default)]
    mqtt: Option<Map<String, Value>>,
    #[serde(default)]
    websocket: Option<Map<String, Value>>,
    #[serde(default)]
    server_time: Option<ServerTime>,
}

#[derive(Debug, Deserialize)]
struct FirmwareSection {
    version: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    force: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ActivationSection {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    challenge: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ServerTime {
    timestamp: i64,
    #[serde(default)]
    timezone_offset: i32,
}

#[derive(Debug, Default)]
struct CheckInState {
    firmware_version: String,
    firmware_url: String,
    force_upgrade: bool,
    activation: ActivationSection,
    has_mqtt: bool,
    has_websocket: bool,
}

/// HTTP check-in against the OTA server. Connection details returned by the
/// server are persisted through [`Settings`] for the transport to pick up.
pub struct OtaClient {
    network: NetworkConfig,
    current_version: String,
    user_agent: String,
    http: Arc<dyn HttpClient>,
    settings: Arc<dyn Settings>,
    updater: Arc<dyn FirmwareUpdater>,
    state: Mutex<CheckInState>,
}

impl OtaClient {
    pub fn new(
        network: NetworkConfig,
        current_version: impl Into<String>,
        user_agent: impl Into<String>,
        http: Arc<dyn HttpClient>,
        settings: Arc<dyn Settings>,
        updater: Arc<dyn FirmwareUpdater>,
    ) -> Self {
        Self {
            network,
            current_version: current_version.into(),
            user_agent: user_agent.into(),
            http,
            settings,
            updater,
            state: Mutex::new(CheckInState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, CheckInState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request(&self, url: String, body: String) -> HttpRequest {
        HttpRequest::post(url, body)
            .header("Device-Id", self.network.device_id.as_str())
            .header("Client-Id", self.network.client_id.as_str())
            .header("User-Agent", self.user_agent.as_str())
            .header("Content-Type", "application/json")
    }

    fn system_info(&self) -> String {
        json!({
            "version": 2,
            "uuid": self.network.client_id,
            "mac_address": self.network.device_id,
            "application": {
                "name": env!("CARGO_PKG_NAME"),
                "version": self.current_version,
            },
            "board": {
                "name": self.user_agent,
            },
        })
        .to_string()
    }

    /// Copies string-ish fields of a connection section into `namespace`.
    fn store_section(&self, namespace: &str, section: &Map<String, Value>) {
        for (key, value) in section {
            let value = match value {
                Value::String(text) => text.clone(),
                Value::Number(number) => number.to_string(),
                Value::Bool(flag) => flag.to_string(),
                _ => continue,
            };
            if self.settings.get_string(namespace, key).as_deref() == Some(value.as_str()) {
                continue;
            }
            if let Err(err) = self.settings.set_string(namespace, key, &value) {
                warn!("failed to store {namespace}.{key}: {err}");
            }
        }
    }
}

impl Ota for OtaClient {
    fn check_version(&self) -> Result<(), OtaError> {
        let url = self.check_version_url();
        info!("checking version at {url}");

        let response = self.http.request(&self.request(url, self.system_info()))?;
        if response.status != 200 {
            return Err(HttpError::Status {
                status: response.status,
            }
            .into());
        }

        let parsed: CheckInResponse = serde_json::from_str(&response.body)
            .map_err(|err| OtaError::Malformed(err.to_string()))?;

        if let Some(mqtt) = parsed.mqtt.as_ref() {
            self.store_section("mqtt", mqtt);
        }
        if let Some(websocket) = parsed.websocket.as_ref() {
            self.store_section("websocket", websocket);
        }
        if let Some(time) = parsed.server_time.as_ref() {
            info!(
                "server time {} ms (offset {} min)",
                time.timestamp, time.timezone_offset
            );
        }

        let mut state = self.state();
        state.has_mqtt = parsed.mqtt.is_some();
        state.has_websocket = parsed.websocket.is_some();
        state.activation = parsed.activation.unwrap_or_default();
        match parsed.firmware {
            Some(firmware) => {
                state.force_upgrade = firmware
                    .force
                    .as_ref()
                    .is_some_and(|force| force.as_bool() == Some(true) || force.as_i64() == Some(1));
                state.firmware_version = firmware.version;
                state.firmware_url = firmware.url;
            }
            None => {
                warn!("no firmware section in check-in response");
                state.firmware_version.clear();
                state.firmware_url.clear();
                state.force_upgrade = false;
            }
        }
        info!(
            "current version {}, server version {}",
            self.current_version, state.firmware_version
        );
        Ok(())
    }

    fn has_new_version(&self) -> bool {
        let state = self.state();
        if state.firmware_url.is_empty() {
            return false;
        }
        state.force_upgrade
            || compare_versions(&state.firmware_version, &self.current_version) == Ordering::Greater
    }

    fn firmware_version(&self) -> String {
        self.state().firmware_version.clone()
    }

    fn firmware_url(&self) -> String {
        self.state().firmware_url.clone()
    }

    fn current_version(&self) -> String {
        self.current_version.clone()
    }

    fn check_version_url(&self) -> String {
        self.settings
            .get_string("wifi", "ota_url")
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| self.network.ota_url.clone())
    }

    fn mark_current_version_valid(&self) {
        self.updater.mark_running_valid();
    }

    fn has_activation_code(&self) -> bool {
        !self.state().activation.code.is_empty()
    }

    fn has_activation_challenge(&self) -> bool {
        !self.state().activation.challenge.is_empty()
    }

    fn activation_code(&self) -> String {
        self.state().activation.code.clone()
    }

    fn activation_message(&self) -> String {
        self.state().activation.message.clone()
    }

    fn activate(&self) -> ActivationStatus {
        let (challenge, timeout_ms) = {
            let state = self.state();
            (state.activation.challenge.clone(), state.activation.timeout_ms)
        };
        if challenge.is_empty() {
            warn!("no activation challenge from server");
            return ActivationStatus::Failed;
        }

        let url = format!("{}/activate", self.check_version_url().trim_end_matches('/'));
        let body = json!({
            "serial_number": self.network.device_id,
            "challenge": challenge,
        })
        .to_string();
        let mut request = self.request(url, body);
        if let Some(timeout_ms) = timeout_ms {
            request = request.timeout(std::time::Duration::from_millis(timeout_ms));
        }

        match self.http.request(&request) {
            Ok(response) if response.status == 200 => {
                info!("activation succeeded");
                ActivationStatus::Activated
            }
            Ok(response) if response.status == 202 => ActivationStatus::Pending,
            Ok(response) => {
                warn!("activation failed with status {}: {}", response.status, response.body);
                ActivationStatus::Failed
            }
            Err(err) => {
                warn!("activation request failed: {err}");
                ActivationStatus::Failed
            }
        }
    }

    fn start_upgrade_from_url(
        &self,
        url: &str,
        progress: &mut dyn FnMut(UpgradeProgress),
    ) -> Result<(), OtaError> {
        self.updater.flash_from_url(url, progress)
    }

    fn has_mqtt_config(&self) -> bool {
        self.state().has_mqtt
    }

    fn has_websocket_config(&self) -> bool {
        self.state().has_websocket
    }
}

/// Compares dotted numeric versions; missing or non-numeric parts count as 0.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let parts = |version: &str| -> Vec<u32> {
        version
            .trim_start_matches('v')
            .split('.')
            .map(|part| part.trim().parse().unwrap_or(0))
            .collect()
    };
    let (left, right) = (parts(left), parts(right));
    let len = left.len().max(right.len());
    for index in 0..len {
        let a = left.get(index).copied().unwrap_or(0);
        let b = right.get(index).copied().unwrap_or(0);
        match a.cmp(&b) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
