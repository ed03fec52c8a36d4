use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    net::TcpListener,
    sync::{oneshot, Mutex},
};
use tracing::{info, warn};

use voicebox_common::{
    services::{Board, HttpClient, Services, Settings},
    AecMode, Device, DeviceHandle, OtaClient, RuntimeConfig, TimezoneClock,
};

use crate::{
    console::{LogDisplay, LoggingTools, NoAssets, SimulatedAudio},
    desktop::{FileSettings, HostBoard, HostFirmwareUpdater, HostTransports, UreqHttp},
};

const QUERY_TIMEOUT: Duration = Duration::from_secs(2);
const WAKE_WORD: &str = "hi voicebox";

#[derive(Clone)]
struct AppState {
    device: DeviceHandle,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    settings_dir: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct CommandAck {
    command: &'static str,
    state: &'static str,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    if !tokio::fs::try_exists(store.runtime_path.as_ref())
        .await
        .unwrap_or(false)
    {
        if let Err(err) = store.save_runtime_config(&RuntimeConfig::default()).await {
            warn!("failed to write default runtime config: {err:#}");
        }
    }
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime, |name| std::env::var(name).ok());
    runtime.sanitize();

    if runtime.network.device_id.is_empty() {
        warn!("no device id configured, the OTA server may reject check-in");
    }
    info!(
        "runtime config loaded: ota=`{}`, mqtt=`{}:{}`, timezone={}",
        runtime.network.ota_url,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
        runtime.timezone,
    );

    let settings = Arc::new(FileSettings::new(store.settings_dir.as_ref().clone()));
    let services = build_services(&runtime, settings);
    let device = spawn_device(&runtime, services)?
        .await
        .context("device loop exited before it was ready")?;

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/chat/toggle", post(handle_chat_toggle))
        .route("/api/listen/start", post(handle_listen_start))
        .route("/api/listen/stop", post(handle_listen_stop))
        .route("/api/wake", post(handle_wake))
        .route("/api/aec", post(handle_set_aec))
        .route("/api/weather/refresh", post(handle_weather_refresh))
        .route("/api/mcp", post(handle_mcp))
        .with_state(AppState { device });

    let port = std::env::var("DEVICE_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind device server at {addr}"))?;

    info!("device control listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn apply_env_overrides<F>(runtime: &mut RuntimeConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let network = &mut runtime.network;
    if let Some(url) = lookup("OTA_URL") {
        network.ota_url = url;
    }
    if let Some(host) = lookup("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = lookup("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        network.mqtt_port = port;
    }
    if let Some(user) = lookup("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Some(pass) = lookup("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
    if let Some(key) = lookup("WEATHER_API_KEY") {
        runtime.weather.api_key = key;
    }
}

fn build_services(runtime: &RuntimeConfig, settings: Arc<FileSettings>) -> Services {
    let settings: Arc<dyn Settings> = settings;
    let board = Arc::new(HostBoard::new());
    let http: Arc<dyn HttpClient> = Arc::new(UreqHttp::new());
    let ota = OtaClient::new(
        runtime.network.clone(),
        env!("CARGO_PKG_VERSION"),
        board.user_agent(),
        Arc::clone(&http),
        Arc::clone(&settings),
        Arc::new(HostFirmwareUpdater),
    );

    Services {
        display: Arc::new(LogDisplay::default()),
        audio: Arc::new(SimulatedAudio::new(WAKE_WORD)),
        board,
        settings: Arc::clone(&settings),
        http,
        ota: Arc::new(ota),
        assets: Arc::new(NoAssets),
        tools: Arc::new(LoggingTools),
        clock: Arc::new(TimezoneClock::new(&runtime.timezone)),
        transports: Arc::new(HostTransports::new(settings, runtime.network.clone())),
    }
}

/// Runs the device on its own thread; the handle arrives once the scheduler
/// is bound, before the boot sequence starts.
fn spawn_device(
    runtime: &RuntimeConfig,
    services: Services,
) -> anyhow::Result<oneshot::Receiver<DeviceHandle>> {
    let config = runtime.device.clone();
    let weather = runtime.weather.clone();
    let (ready, handle) = oneshot::channel();

    thread::Builder::new()
        .name("main-loop".into())
        .spawn(move || {
            let mut device = Device::new(config, weather, services);
            if ready.send(device.handle()).is_err() {
                return;
            }
            device.start();
            device.run();
        })
        .context("failed to spawn device main loop")?;

    Ok(handle)
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let device = state.device.clone();
    let status = tokio::task::spawn_blocking(move || {
        device.query(|device: &mut Device| device.status(), QUERY_TIMEOUT)
    })
    .await;

    match status {
        Ok(Some(status)) => Json(status).into_response(),
        Ok(None) => error_response(StatusCode::SERVICE_UNAVAILABLE, "Device loop is busy"),
        Err(err) => {
            warn!("status query task failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Status query failed")
        }
    }
}

async fn handle_chat_toggle(State(state): State<AppState>) -> impl IntoResponse {
    state.device.toggle_chat_state();
    accepted(&state, "toggle")
}

async fn handle_listen_start(State(state): State<AppState>) -> impl IntoResponse {
    state.device.start_listening();
    accepted(&state, "listen_start")
}

async fn handle_listen_stop(State(state): State<AppState>) -> impl IntoResponse {
    state.device.stop_listening();
    accepted(&state, "listen_stop")
}

async fn handle_wake(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(word) = params.get("word") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'word' parameter");
    };
    let word = word.trim();
    if word.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Wake word must not be empty");
    }

    state.device.wake_word_invoke(word.to_string());
    accepted(&state, "wake")
}

async fn handle_set_aec(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(mode) = AecMode::parse(value) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid AEC mode (expected off, device or server)",
        );
    };

    state.device.set_aec_mode(mode);
    accepted(&state, "aec")
}

async fn handle_weather_refresh(State(state): State<AppState>) -> impl IntoResponse {
    state.device.request_weather_update(true);
    accepted(&state, "weather_refresh")
}

async fn handle_mcp(State(state): State<AppState>, body: String) -> impl IntoResponse {
    if !matches!(serde_json::from_str::<Value>(&body), Ok(Value::Object(_))) {
        return error_response(StatusCode::BAD_REQUEST, "Body must be a JSON object");
    }

    state.device.send_mcp_message(body);
    accepted(&state, "mcp")
}

fn accepted(state: &AppState, command: &'static str) -> axum::response::Response {
    (
        StatusCode::ACCEPTED,
        Json(CommandAck {
            command,
            state: state.device.state().as_str(),
        }),
    )
        .into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("VOICEBOX_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.voicebox"));
        Self::with_dir(data_dir)
    }

    fn with_dir(data_dir: PathBuf) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            settings_dir: Arc::new(data_dir.join("settings")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state(dir: &tempfile::TempDir) -> (Device, AppState) {
        let runtime = RuntimeConfig::default();
        let settings = Arc::new(FileSettings::new(dir.path().join("settings")));
        let device = Device::new(
            runtime.device.clone(),
            runtime.weather.clone(),
            build_services(&runtime, settings),
        );
        let state = AppState {
            device: device.handle(),
        };
        (device, state)
    }

    fn query(pairs: &[(&str, &str)]) -> Query<HashMap<String, String>> {
        Query(
            pairs
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn runtime_config_round_trips_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppStore::with_dir(dir.path().to_path_buf());

        let missing = store.load_runtime_config().await.unwrap();
        assert_eq!(missing.timezone, RuntimeConfig::default().timezone);

        let mut runtime = RuntimeConfig::default();
        runtime.timezone = "Europe/Berlin".to_string();
        runtime.network.mqtt_port = 8883;
        store.save_runtime_config(&runtime).await.unwrap();

        let loaded = store.load_runtime_config().await.unwrap();
        assert_eq!(loaded.timezone, "Europe/Berlin");
        assert_eq!(loaded.network.mqtt_port, 8883);
    }

    #[test]
    fn env_overrides_replace_network_and_weather_settings() {
        let env: HashMap<&str, &str> = [
            ("OTA_URL", "http://ota.lan/check"),
            ("MQTT_PORT", "not-a-port"),
            ("MQTT_USER", "box"),
            ("WEATHER_API_KEY", "k-123"),
        ]
        .into_iter()
        .collect();

        let mut runtime = RuntimeConfig::default();
        apply_env_overrides(&mut runtime, |name| env.get(name).map(|v| v.to_string()));

        assert_eq!(runtime.network.ota_url, "http://ota.lan/check");
        assert_eq!(runtime.network.mqtt_port, 1883);
        assert_eq!(runtime.network.mqtt_user, "box");
        assert_eq!(runtime.weather.api_key, "k-123");
        assert_eq!(runtime.network.mqtt_host, "192.168.1.100");
    }

    #[tokio::test]
    async fn aec_endpoint_rejects_unknown_modes() {
        let dir = tempfile::tempdir().unwrap();
        let (_device, state) = test_state(&dir);

        let response = handle_set_aec(State(state.clone()), query(&[("value", "loud")]))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = handle_set_aec(State(state), query(&[("value", "server")]))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn wake_endpoint_requires_a_word() {
        let dir = tempfile::tempdir().unwrap();
        let (_device, state) = test_state(&dir);

        let response = handle_wake(State(state.clone()), query(&[]))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = handle_wake(State(state), query(&[("word", "  ")]))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn mcp_endpoint_accepts_only_objects() {
        let dir = tempfile::tempdir().unwrap();
        let (_device, state) = test_state(&dir);

        let response = handle_mcp(State(state.clone()), "[1,2]".to_string())
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = r#"{"jsonrpc":"2.0","method":"tools/list","id":1}"#.to_string();
        let response = handle_mcp(State(state), body).await.into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}
