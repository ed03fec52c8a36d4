//! Desktop implementations of the board-level collaborators.

use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tracing::{debug, info, warn};

use voicebox_common::{
    error::{HttpError, OtaError, SettingsError},
    services::{
        Board, FirmwareUpdater, HttpClient, HttpMethod, HttpRequest, HttpResponse, Settings,
        Transport, TransportFactory, TransportKind, UpgradeProgress,
    },
    DeviceState, MqttEndpoint, MqttTransport, NetworkConfig,
};

use crate::mqtt::RumqttLink;

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct HostBoard {
    user_agent: String,
}

impl HostBoard {
    pub fn new() -> Self {
        Self {
            user_agent: format!("voicebox-host/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Board for HostBoard {
    fn start_network(&self) {
        info!("using host network stack");
    }

    fn set_power_save_mode(&self, enabled: bool) {
        debug!("power save {}", if enabled { "on" } else { "off" });
    }

    fn on_state_changed(&self, state: DeviceState) {
        debug!("indicator: {}", state.as_str());
    }

    fn user_agent(&self) -> String {
        self.user_agent.clone()
    }

    fn restart(&self) {
        warn!("restart requested, exiting");
        std::process::exit(0);
    }
}

pub struct UreqHttp {
    agent: ureq::Agent,
}

impl UreqHttp {
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout_connect(Duration::from_secs(10))
                .build(),
        }
    }
}

impl HttpClient for UreqHttp {
    fn request(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        let method = match request.method {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        };
        let mut call = self
            .agent
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            call = call.set(name, value);
        }

        let result = match &request.body {
            Some(body) => call.send_string(body),
            None => call.call(),
        };
        let response = match result {
            Ok(response) | Err(ureq::Error::Status(_, response)) => response,
            Err(err) => {
                return Err(HttpError::Transport {
                    url: request.url.clone(),
                    message: err.to_string(),
                })
            }
        };

        let status = response.status();
        let body = response
            .into_string()
            .map_err(|err| HttpError::Transport {
                url: request.url.clone(),
                message: err.to_string(),
            })?;
        Ok(HttpResponse { status, body })
    }
}

/// Desktop builds never flash themselves.
#[derive(Debug, Default)]
pub struct HostFirmwareUpdater;

impl FirmwareUpdater for HostFirmwareUpdater {
    fn flash_from_url(
        &self,
        url: &str,
        _progress: &mut dyn FnMut(UpgradeProgress),
    ) -> Result<(), OtaError> {
        warn!("firmware image {url} offered, host builds cannot be flashed");
        Err(OtaError::Unsupported)
    }

    fn mark_running_valid(&self) {}
}

/// One pretty-printed JSON object per namespace under the settings directory.
pub struct FileSettings {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileSettings {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    fn path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.json"))
    }

    fn load(&self, path: &Path) -> Result<BTreeMap<String, String>, String> {
        match fs::read(path) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|err| err.to_string()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.to_string()),
        }
    }

    fn update<F>(&self, namespace: &str, change: F) -> Result<(), SettingsError>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> bool,
    {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let failed = |message: String| SettingsError {
            namespace: namespace.to_string(),
            message,
        };

        let path = self.path(namespace);
        let mut values = self.load(&path).map_err(failed)?;
        if !change(&mut values) {
            return Ok(());
        }

        fs::create_dir_all(&self.dir).map_err(|err| failed(err.to_string()))?;
        let payload = serde_json::to_vec_pretty(&values).map_err(|err| failed(err.to_string()))?;
        fs::write(&path, payload).map_err(|err| failed(err.to_string()))
    }
}

impl Settings for FileSettings {
    fn get_string(&self, namespace: &str, key: &str) -> Option<String> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.load(&self.path(namespace)) {
            Ok(mut values) => values.remove(key),
            Err(err) => {
                warn!("failed to read settings `{namespace}`: {err}");
                None
            }
        }
    }

    fn set_string(&self, namespace: &str, key: &str, value: &str) -> Result<(), SettingsError> {
        self.update(namespace, |values| {
            values.insert(key.to_string(), value.to_string()).as_deref() != Some(value)
        })
    }

    fn erase_key(&self, namespace: &str, key: &str) -> Result<(), SettingsError> {
        self.update(namespace, |values| values.remove(key).is_some())
    }
}

/// Builds MQTT transports from whatever the last check-in stored.
pub struct HostTransports {
    settings: Arc<dyn Settings>,
    network: NetworkConfig,
}

impl HostTransports {
    pub fn new(settings: Arc<dyn Settings>, network: NetworkConfig) -> Self {
        Self { settings, network }
    }
}

impl TransportFactory for HostTransports {
    fn create(&self, kind: TransportKind) -> Box<dyn Transport> {
        if kind == TransportKind::Websocket {
            warn!("websocket transport is not available on host builds, using MQTT");
        }
        let endpoint = MqttEndpoint::from_settings(self.settings.as_ref(), &self.network);
        let publish_topic = endpoint.publish_topic.clone();
        Box::new(MqttTransport::new(
            RumqttLink::new(endpoint),
            publish_topic,
            HELLO_TIMEOUT,
        ))
    }
}
