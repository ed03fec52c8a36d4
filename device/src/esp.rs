use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use voicebox_common::{
    config::NetworkConfig,
    error::{HttpError, OtaError, SettingsError},
    services::{
        Board, FirmwareUpdater, HttpClient as DeviceHttpClient, HttpMethod, HttpRequest,
        HttpResponse, Services, Settings, Transport, TransportFactory, TransportKind,
        UpgradeProgress,
    },
    Device, DeviceState, MqttEndpoint, MqttInbox, MqttLink, MqttTransport, OtaClient,
    RuntimeConfig, TimezoneClock,
};

use crate::console::{LogDisplay, LoggingTools, NoAssets, SimulatedAudio};

const NVS_NAMESPACE: &str = "voicebox";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_VALUE_BYTES: usize = 4096;
const MAX_HTTP_BODY: usize = 16 * 1024;
const OTA_CHUNK_SIZE: usize = 4096;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const WAKE_WORD: &str = "hi voicebox";

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);

    info!(
        "NVS config loaded: ssid=`{}`, ota=`{}`, mqtt=`{}:{}`",
        runtime.network.wifi_ssid,
        runtime.network.ota_url,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = connect_wifi(modem, sys_loop, nvs_partition.clone(), &runtime.network)
        .context("wifi startup failed")?;
    let mac = wifi.sta_netif().get_mac()?;
    ensure_identity(&mut runtime.network, mac);

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    let settings: Arc<dyn Settings> = Arc::new(NvsSettings {
        partition: nvs_partition,
        lock: Arc::new(Mutex::new(())),
    });
    let board = Arc::new(EspBoard {
        user_agent: format!("voicebox-esp32/{}", env!("CARGO_PKG_VERSION")),
    });
    let http: Arc<dyn DeviceHttpClient> = Arc::new(EspHttp);
    let ota = OtaClient::new(
        runtime.network.clone(),
        env!("CARGO_PKG_VERSION"),
        board.user_agent(),
        Arc::clone(&http),
        Arc::clone(&settings),
        Arc::new(EspFirmwareUpdater),
    );

    let services = Services {
        display: Arc::new(LogDisplay::default()),
        audio: Arc::new(SimulatedAudio::new(WAKE_WORD)),
        board,
        settings: Arc::clone(&settings),
        http,
        ota: Arc::new(ota),
        assets: Arc::new(NoAssets),
        tools: Arc::new(LoggingTools),
        clock: Arc::new(TimezoneClock::new(&runtime.timezone)),
        transports: Arc::new(EspTransports {
            settings,
            network: runtime.network.clone(),
        }),
    };

    // Keep the wifi driver alive for the program lifetime.
    let _wifi = wifi;

    let mut device = Device::new(runtime.device.clone(), runtime.weather.clone(), services);
    device.start();
    device.run();
    Ok(())
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn ensure_identity(network: &mut NetworkConfig, mac: [u8; 6]) {
    if network.device_id.is_empty() {
        network.device_id = mac
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<Vec<_>>()
            .join(":");
    }
    if network.client_id.is_empty() {
        let suffix: String = mac.iter().map(|byte| format!("{byte:02x}")).collect();
        network.client_id = format!("voicebox-{suffix}");
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.is_empty() {
        return Err(anyhow!("wifi credentials missing"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => {
            drop(wifi);
            Ok(esp_wifi)
        }
        Some(err) => Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}"
        )),
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; NVS_VALUE_BYTES];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

/// Key-value settings, one NVS namespace per settings namespace.
struct NvsSettings {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsSettings {
    fn open(&self, namespace: &str) -> Result<EspNvs<esp_idf_svc::nvs::NvsDefault>, SettingsError> {
        EspNvs::new(self.partition.clone(), namespace, true).map_err(|err| SettingsError {
            namespace: namespace.to_string(),
            message: format!("{err:?}"),
        })
    }
}

impl Settings for NvsSettings {
    fn get_string(&self, namespace: &str, key: &str) -> Option<String> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = self.open(namespace).ok()?;
        let mut buffer = vec![0_u8; NVS_VALUE_BYTES];
        match nvs.get_str(key, &mut buffer) {
            Ok(value) => value.map(str::to_string),
            Err(err) => {
                warn!("failed to read {namespace}.{key} from NVS: {err:?}");
                None
            }
        }
    }

    fn set_string(&self, namespace: &str, key: &str, value: &str) -> Result<(), SettingsError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = self.open(namespace)?;
        nvs.set_str(key, value).map_err(|err| SettingsError {
            namespace: namespace.to_string(),
            message: format!("set `{key}`: {err:?}"),
        })
    }

    fn erase_key(&self, namespace: &str, key: &str) -> Result<(), SettingsError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = self.open(namespace)?;
        nvs.remove(key).map(|_| ()).map_err(|err| SettingsError {
            namespace: namespace.to_string(),
            message: format!("erase `{key}`: {err:?}"),
        })
    }
}

struct EspBoard {
    user_agent: String,
}

impl Board for EspBoard {
    fn start_network(&self) {
        // Station is connected before the device starts.
    }

    fn set_power_save_mode(&self, enabled: bool) {
        let mode = if enabled {
            esp_idf_svc::sys::wifi_ps_type_t_WIFI_PS_MIN_MODEM
        } else {
            esp_idf_svc::sys::wifi_ps_type_t_WIFI_PS_NONE
        };
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(mode) };
        if rc != esp_idf_svc::sys::ESP_OK {
            warn!("failed to set wifi power save: esp_err_t={rc}");
        }
    }

    fn on_state_changed(&self, _state: DeviceState) {}

    fn user_agent(&self) -> String {
        self.user_agent.clone()
    }

    fn restart(&self) {
        info!("restarting");
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

struct EspHttp;

impl EspHttp {
    fn execute(&self, request: &HttpRequest) -> anyhow::Result<HttpResponse> {
        let http_conf = HttpClientConfiguration {
            timeout: Some(request.timeout),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);

        let content_length = request.body.as_ref().map(|body| body.len().to_string());
        let mut headers: Vec<(&str, &str)> = request
            .headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        if let Some(length) = content_length.as_deref() {
            headers.push(("Content-Length", length));
        }

        let method = match request.method {
            HttpMethod::Get => Method::Get,
            HttpMethod::Post => Method::Post,
        };
        let mut outgoing = client.request(method, &request.url, &headers)?;
        if let Some(body) = request.body.as_deref() {
            outgoing.write_all(body.as_bytes())?;
            outgoing.flush()?;
        }
        let mut response = outgoing.submit().map_err(|e| anyhow!("{e:?}"))?;

        let status = response.status();
        let mut body = Vec::new();
        let mut chunk = [0_u8; 1024];
        loop {
            let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
            if read == 0 {
                break;
            }
            if body.len() + read > MAX_HTTP_BODY {
                return Err(anyhow!("response body exceeds {MAX_HTTP_BODY} bytes"));
            }
            body.extend_from_slice(&chunk[..read]);
        }

        Ok(HttpResponse {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

impl DeviceHttpClient for EspHttp {
    fn request(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        self.execute(request).map_err(|err| HttpError::Transport {
            url: request.url.clone(),
            message: format!("{err:#}"),
        })
    }
}

struct EspFirmwareUpdater;

impl EspFirmwareUpdater {
    fn flash(
        &self,
        url: &str,
        progress: &mut dyn FnMut(UpgradeProgress),
    ) -> Result<(), OtaError> {
        let http_conf = HttpClientConfiguration {
            timeout: Some(Duration::from_secs(30)),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&http_conf)
            .map_err(|err| OtaError::Download(format!("{err:?}")))?;
        let mut client = HttpClient::wrap(connection);
        let request = client
            .request(Method::Get, url, &[])
            .map_err(|err| OtaError::Download(format!("{err:?}")))?;
        let mut response = request
            .submit()
            .map_err(|err| OtaError::Download(format!("{err:?}")))?;

        let status = response.status();
        if !(200..300).contains(&status) {
            return Err(OtaError::Download(format!("HTTP {status}")));
        }
        let content_length = response
            .header("content-length")
            .or_else(|| response.header("Content-Length"))
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|length| *length > 0);

        let mut ota = EspOta::new().map_err(|err| OtaError::Flash(format!("{err:?}")))?;
        let mut update = ota
            .initiate_update()
            .map_err(|err| OtaError::Flash(format!("{err:?}")))?;

        let mut chunk = [0_u8; OTA_CHUNK_SIZE];
        let mut total_written = 0_usize;
        let mut window_bytes = 0_usize;
        let mut window_start = Instant::now();
        loop {
            let read = response
                .read(&mut chunk)
                .map_err(|err| OtaError::Download(format!("{err:?}")))?;
            if read == 0 {
                break;
            }
            update
                .write(&chunk[..read])
                .map_err(|err| OtaError::Flash(format!("{err:?}")))?;
            total_written += read;
            window_bytes += read;

            let elapsed = window_start.elapsed();
            if elapsed >= Duration::from_secs(1) {
                let percent = content_length
                    .map(|total| (total_written * 100 / total).min(100))
                    .unwrap_or(0);
                progress(UpgradeProgress {
                    percent: percent as u8,
                    bytes_per_sec: (window_bytes as u128 * 1000 / elapsed.as_millis().max(1))
                        as usize,
                });
                window_bytes = 0;
                window_start = Instant::now();
            }
        }

        if total_written == 0 {
            return Err(OtaError::Download("firmware body is empty".to_string()));
        }
        update
            .complete()
            .map_err(|err| OtaError::Flash(format!("{err:?}")))?;
        info!("firmware image written: {total_written} bytes");
        Ok(())
    }
}

impl FirmwareUpdater for EspFirmwareUpdater {
    fn flash_from_url(
        &self,
        url: &str,
        progress: &mut dyn FnMut(UpgradeProgress),
    ) -> Result<(), OtaError> {
        self.flash(url, progress)
    }

    fn mark_running_valid(&self) {
        match EspOta::new() {
            Ok(mut ota) => {
                if let Err(err) = ota.mark_running_slot_valid() {
                    warn!("failed to mark running OTA slot valid: {err:?}");
                }
            }
            Err(err) => warn!("failed to acquire OTA: {err:?}"),
        }
    }
}

struct EspTransports {
    settings: Arc<dyn Settings>,
    network: NetworkConfig,
}

impl TransportFactory for EspTransports {
    fn create(&self, kind: TransportKind) -> Box<dyn Transport> {
        if kind == TransportKind::Websocket {
            warn!("websocket transport is not built in, using MQTT");
        }
        let endpoint = MqttEndpoint::from_settings(self.settings.as_ref(), &self.network);
        let publish_topic = endpoint.publish_topic.clone();
        Box::new(MqttTransport::new(
            EspMqttLink {
                endpoint,
                client: None,
                connected: Arc::new(AtomicBool::new(false)),
            },
            publish_topic,
            HELLO_TIMEOUT,
        ))
    }
}

struct EspMqttLink {
    endpoint: MqttEndpoint,
    client: Option<EspMqttClient<'static>>,
    connected: Arc<AtomicBool>,
}

impl MqttLink for EspMqttLink {
    fn connect(&mut self, inbox: Arc<MqttInbox>) -> Result<(), String> {
        self.client = None;
        self.connected.store(false, Ordering::Relaxed);

        let endpoint = &self.endpoint;
        let url = format!("mqtt://{}:{}", endpoint.host, endpoint.port);
        let conf = MqttClientConfiguration {
            client_id: Some(endpoint.client_id.as_str()),
            username: (!endpoint.username.is_empty()).then_some(endpoint.username.as_str()),
            password: (!endpoint.password.is_empty()).then_some(endpoint.password.as_str()),
            keep_alive_interval: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let (mut client, connection) =
            EspMqttClient::new(url.as_str(), &conf).map_err(|err| format!("{err:?}"))?;

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let connected = Arc::clone(&self.connected);
        thread::Builder::new()
            .name("mqtt-rx".into())
            .stack_size(8 * 1024)
            .spawn(move || receive_loop(connection, inbox, connected, ready_tx))
            .map_err(|err| format!("failed to spawn mqtt receiver: {err}"))?;

        if ready_rx.recv_timeout(MQTT_CONNECT_TIMEOUT).is_err() {
            return Err(format!("timed out connecting to {url}"));
        }

        let topic = endpoint.subscribe_topic.trim_end_matches('/');
        for topic in [topic.to_string(), format!("{topic}/audio")] {
            client
                .subscribe(&topic, QoS::AtMostOnce)
                .map_err(|err| format!("subscribe {topic}: {err:?}"))?;
        }
        self.client = Some(client);
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), String> {
        let Some(client) = self.client.as_mut() else {
            return Err("not connected".to_string());
        };
        client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .map(|_| ())
            .map_err(|err| format!("{err:?}"))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

fn receive_loop(
    mut connection: EspMqttConnection,
    inbox: Arc<MqttInbox>,
    connected: Arc<AtomicBool>,
    ready: mpsc::SyncSender<()>,
) {
    // Ends when the owning client is dropped.
    while let Ok(event) = connection.next() {
        match event.payload() {
            EventPayload::Connected(_) => {
                connected.store(true, Ordering::Relaxed);
                let _ = ready.try_send(());
                inbox.on_connected();
            }
            EventPayload::Disconnected => {
                if connected.swap(false, Ordering::Relaxed) {
                    inbox.on_connection_lost("disconnected");
                }
            }
            EventPayload::Received {
                topic: Some(topic),
                data,
                details: Details::Complete,
                ..
            } => inbox.on_publish(topic, data),
            EventPayload::Error(err) => warn!("mqtt error: {err:?}"),
            _ => {}
        }
    }
    connected.store(false, Ordering::Relaxed);
    info!("mqtt receiver stopped");
}
