pub mod bridge;
pub mod checkin;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod idle;
pub mod ota;
pub mod scheduler;
pub mod services;
pub mod strings;
pub mod transport;
pub mod types;
pub mod weather;

#[cfg(test)]
pub(crate) mod testing;

pub use checkin::{CheckInOutcome, RetryBackoff, RetryDecision};
pub use clock::TimezoneClock;
pub use config::{DeviceConfig, NetworkConfig, RuntimeConfig, WeatherConfig};
pub use device::{Device, DeviceHandle};
pub use ota::OtaClient;
pub use scheduler::{Scheduler, WakeFlag};
pub use services::Services;
pub use transport::{MqttEndpoint, MqttInbox, MqttLink, MqttTransport};
pub use types::{AbortReason, AecMode, DeviceState, DeviceStatus, ListeningMode};
pub use weather::{WeatherService, WeatherSnapshot};
