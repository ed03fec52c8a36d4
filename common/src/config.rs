use serde::{Deserialize, Serialize};

use crate::types::AecMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub checkin_max_attempts: u32,
    pub checkin_initial_delay_secs: u64,
    pub activation_attempts: u32,
    pub activation_timeout_wait_secs: u64,
    pub activation_error_wait_secs: u64,
    /// Granularity of interruptible boot-time waits.
    pub wait_step_ms: u64,
    pub clock_tick_ms: u64,
    pub weather_refresh_ticks: u64,
    pub heartbeat_ticks: u64,
    pub output_sample_rate: u32,
    pub aec_mode: AecMode,
    pub send_wake_word_data: bool,
    pub receive_custom_messages: bool,
    pub alert_pause_ms: u64,
    pub settle_ms: u64,
    pub notification_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            checkin_max_attempts: 10,
            checkin_initial_delay_secs: 10,
            activation_attempts: 10,
            activation_timeout_wait_secs: 3,
            activation_error_wait_secs: 10,
            wait_step_ms: 1_000,
            clock_tick_ms: 1_000,
            weather_refresh_ticks: 60,
            heartbeat_ticks: 10,
            output_sample_rate: 24_000,
            aec_mode: AecMode::Off,
            send_wake_word_data: true,
            receive_custom_messages: false,
            alert_pause_ms: 3_000,
            settle_ms: 1_000,
            notification_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    pub default_city: String,
    pub api_key: String,
    pub endpoint: String,
    pub success_ttl_ms: u64,
    pub retry_interval_ms: u64,
    pub http_timeout_ms: u64,
    pub units: String,
    pub lang: String,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            default_city: "Hanoi".to_string(),
            api_key: String::new(),
            endpoint: "https://api.openweathermap.org/data/2.5/weather".to_string(),
            success_ttl_ms: 30 * 60_000,
            retry_interval_ms: 5 * 60_000,
            http_timeout_ms: 5_000,
            units: "metric".to_string(),
            lang: "en".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub ota_url: String,
    pub device_id: String,
    pub client_id: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            ota_url: "https://api.tenclass.net/xiaozhi/ota/".to_string(),
            device_id: String::new(),
            client_id: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub device: DeviceConfig,
    #[serde(default)]
    pub weather: WeatherConfig,
    pub timezone: String,
    pub network: NetworkConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            weather: WeatherConfig::default(),
            timezone: "Asia/Ho_Chi_Minh".to_string(),
            network: NetworkConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.device.sanitize();
        self.weather.sanitize();
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            self.timezone = Self::default().timezone;
        }
    }
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        self.checkin_max_attempts = self.checkin_max_attempts.clamp(1, 20);
        self.checkin_initial_delay_secs = self.checkin_initial_delay_secs.min(600);
        self.activation_attempts = self.activation_attempts.clamp(1, 60);
        self.wait_step_ms = self.wait_step_ms.clamp(1, 60_000);
        self.clock_tick_ms = self.clock_tick_ms.clamp(100, 60_000);
        if self.weather_refresh_ticks == 0 {
            self.weather_refresh_ticks = 60;
        }
        if self.heartbeat_ticks == 0 {
            self.heartbeat_ticks = 10;
        }
        if !matches!(self.output_sample_rate, 8_000 | 16_000 | 24_000 | 48_000) {
            self.output_sample_rate = 24_000;
        }
    }
}

impl WeatherConfig {
    pub fn sanitize(&mut self) {
        if self.default_city.trim().is_empty() {
            self.default_city = Self::default().default_city;
        }
        self.success_ttl_ms = self.success_ttl_ms.max(60_000);
        self.retry_interval_ms = self.retry_interval_ms.max(10_000);
        self.http_timeout_ms = self.http_timeout_ms.clamp(1_000, 30_000);
    }
}
