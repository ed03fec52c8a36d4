use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use log::{error, info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::{
    clock::monotonic_ms,
    config::WeatherConfig,
    error::{HttpError, WeatherError},
    idle::capitalize_words,
    services::{HttpClient, HttpRequest, Settings},
};

const SETTINGS_NAMESPACE: &str = "weather";
const FETCH_STACK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherSnapshot {
    pub city: String,
    pub temperature_c: f32,
    pub feels_like_c: f32,
    pub humidity: u32,
    pub wind_speed: f32,
    pub wind_deg: Option<i32>,
    pub pressure: u32,
    pub temp_min_c: f32,
    pub temp_max_c: f32,
    pub sunrise_epoch: Option<i64>,
    pub sunset_epoch: Option<i64>,
    pub description: String,
    pub icon: String,
    pub fetched_at_epoch: i64,
}

impl WeatherSnapshot {
    /// Accepts a current-weather response as long as `name` and `main.temp` are present.
    pub fn from_response(root: &Value, fetched_at_epoch: i64) -> Result<Self, WeatherError> {
        let city = root
            .get("name")
            .and_then(Value::as_str)
            .ok_or(WeatherError::MissingField("name"))?;
        let main = root
            .get("main")
            .filter(|main| main.is_object())
            .ok_or(WeatherError::MissingField("main"))?;
        let temperature_c = number(main, "temp").ok_or(WeatherError::MissingField("main.temp"))?;

        let wind = root.get("wind");
        let sys = root.get("sys");
        let conditions = root
            .get("weather")
            .and_then(Value::as_array)
            .and_then(|items| items.first());

        Ok(Self {
            city: city.to_string(),
            temperature_c,
            feels_like_c: number(main, "feels_like").unwrap_or(temperature_c),
            humidity: integer(main, "humidity")
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(0),
            wind_speed: wind.and_then(|wind| number(wind, "speed")).unwrap_or(0.0),
            wind_deg: wind
                .and_then(|wind| integer(wind, "deg"))
                .and_then(|value| i32::try_from(value).ok()),
            pressure: integer(main, "pressure")
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(0),
            temp_min_c: number(main, "temp_min").unwrap_or(temperature_c),
            temp_max_c: number(main, "temp_max").unwrap_or(temperature_c),
            sunrise_epoch: sys.and_then(|sys| integer(sys, "sunrise")),
            sunset_epoch: sys.and_then(|sys| integer(sys, "sunset")),
            description: conditions
                .and_then(|item| item.get("description"))
                .and_then(Value::as_str)
                .map(capitalize_words)
                .unwrap_or_default(),
            icon: conditions
                .and_then(|item| item.get("icon"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            fetched_at_epoch,
        })
    }
}

fn number(object: &Value, key: &str) -> Option<f32> {
    object.get(key).and_then(Value::as_f64).map(|value| value as f32)
}

fn integer(object: &Value, key: &str) -> Option<i64> {
    object.get(key).and_then(Value::as_f64).map(|value| value as i64)
}

/// Single-flight bookkeeping around the last snapshot. Times are monotonic ms.
#[derive(Debug, Default)]
pub struct WeatherCache {
    snapshot: Option<WeatherSnapshot>,
    in_progress: bool,
    last_request_ms: Option<u64>,
    last_success_ms: Option<u64>,
}

impl WeatherCache {
    /// Claims the fetch slot. Returns false when a fetch is running or, for
    /// non-forced requests, when either the success TTL or the retry interval
    /// has not elapsed.
    pub fn try_begin(&mut self, force: bool, now_ms: u64, policy: &WeatherConfig) -> bool {
        if self.in_progress {
            if force {
                warn!("weather update already running");
            }
            return false;
        }

        if !force {
            let within = |since: Option<u64>, window_ms: u64| {
                since.is_some_and(|at| now_ms.saturating_sub(at) < window_ms)
            };
            if within(self.last_request_ms, policy.retry_interval_ms) {
                return false;
            }
            if self.snapshot.is_some() && within(self.last_success_ms, policy.success_ttl_ms) {
                return false;
            }
        }

        self.in_progress = true;
        self.last_request_ms = Some(now_ms);
        true
    }

    /// Releases the fetch slot; the snapshot is only replaced on success.
    pub fn finish(&mut self, snapshot: Option<WeatherSnapshot>, now_ms: u64) {
        self.in_progress = false;
        if let Some(snapshot) = snapshot {
            self.snapshot = Some(snapshot);
            self.last_success_ms = Some(now_ms);
        }
    }

    pub fn snapshot(&self) -> Option<&WeatherSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn is_fetching(&self) -> bool {
        self.in_progress
    }
}

pub struct WeatherService {
    config: WeatherConfig,
    http: Arc<dyn HttpClient>,
    settings: Arc<dyn Settings>,
    user_agent: String,
    cache: Mutex<WeatherCache>,
}

impl WeatherService {
    pub fn new(
        config: WeatherConfig,
        http: Arc<dyn HttpClient>,
        settings: Arc<dyn Settings>,
        user_agent: String,
    ) -> Self {
        Self {
            config,
            http,
            settings,
            user_agent,
            cache: Mutex::new(WeatherCache::default()),
        }
    }

    pub fn default_city(&self) -> &str {
        &self.config.default_city
    }

    pub fn snapshot(&self) -> Option<WeatherSnapshot> {
        self.cache().snapshot().cloned()
    }

    /// Starts a background fetch unless the cache policy suppresses it.
    /// `on_updated` runs on the worker thread after a successful refresh.
    pub fn request_update<F>(self: &Arc<Self>, force: bool, on_updated: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.cache().try_begin(force, monotonic_ms(), &self.config) {
            return false;
        }

        info!("scheduling weather update");
        let service = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("weather-fetch".into())
            .stack_size(FETCH_STACK_SIZE)
            .spawn(move || service.run_fetch(on_updated));

        if let Err(err) = spawned {
            error!("failed to spawn weather fetch thread: {err}");
            self.cache().finish(None, monotonic_ms());
            return false;
        }
        true
    }

    fn run_fetch<F: FnOnce()>(&self, on_updated: F) {
        let result = self.fetch();
        let succeeded = result.is_ok();
        match result {
            Ok(snapshot) => {
                self.cache().finish(Some(snapshot), monotonic_ms());
                info!("weather updated successfully");
            }
            Err(err) => {
                self.cache().finish(None, monotonic_ms());
                error!("weather update failed: {err}");
            }
        }

        if succeeded {
            on_updated();
        }
    }

    /// Blocking fetch of current conditions for the configured city.
    pub fn fetch(&self) -> Result<WeatherSnapshot, WeatherError> {
        let city = self
            .settings
            .get_string(SETTINGS_NAMESPACE, "city")
            .filter(|city| !city.is_empty())
            .unwrap_or_else(|| self.config.default_city.clone());
        let api_key = self
            .settings
            .get_string(SETTINGS_NAMESPACE, "api_key")
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| self.config.api_key.clone());
        if api_key.is_empty() {
            return Err(WeatherError::MissingApiKey);
        }

        let url = format!(
            "{}?q={}&appid={}&units={}&lang={}",
            self.config.endpoint,
            urlencoding::encode(&city),
            urlencoding::encode(&api_key),
            self.config.units,
            self.config.lang,
        );
        info!("fetching weather for `{city}`");

        let request = HttpRequest::get(url)
            .header("Accept", "application/json")
            .header("User-Agent", self.user_agent.as_str())
            .timeout(Duration::from_millis(self.config.http_timeout_ms));
        let response = self.http.request(&request)?;
        if response.status != 200 {
            return Err(HttpError::Status {
                status: response.status,
            }
            .into());
        }

        let root: Value = serde_json::from_str(&response.body).map_err(HttpError::from)?;
        WeatherSnapshot::from_response(&root, chrono::Utc::now().timestamp())
    }

    fn cache(&self) -> MutexGuard<'_, WeatherCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
