//! User-facing text (English).

pub const STANDBY: &str = "Standby";
pub const CONNECTING: &str = "Connecting...";
pub const LISTENING: &str = "Listening...";
pub const SPEAKING: &str = "Speaking...";
pub const ERROR: &str = "Error";
pub const CHECKING_NEW_VERSION: &str = "Checking for new version...";
pub const ACTIVATION: &str = "Activation";
pub const LOADING_PROTOCOL: &str = "Logging in...";
pub const OTA_UPGRADE: &str = "OTA Upgrade";
pub const UPGRADING: &str = "System is upgrading...";
pub const UPGRADE_FAILED: &str = "Upgrade failed";
pub const UPGRADE_REBOOTING: &str = "Upgrade successful, rebooting...";
pub const NEW_VERSION: &str = "New version ";
pub const VERSION: &str = "Version ";
pub const LOADING_ASSETS: &str = "Loading assets...";
pub const PLEASE_WAIT: &str = "Please wait...";
pub const DOWNLOAD_ASSETS_FAILED: &str = "Failed to download assets";
pub const RTC_MODE_OFF: &str = "AEC Off";
pub const RTC_MODE_ON: &str = "AEC On";
pub const SERVER_TIMEOUT: &str = "Server response timed out";
pub const SERVER_NOT_CONNECTED: &str = "Unable to connect to service";
pub const GREETING: &str = "Hello";

pub fn check_new_version_failed(delay_secs: u64, url: &str) -> String {
    format!("Check new version failed, will retry in {delay_secs} seconds: {url}")
}

pub fn found_new_assets(url: &str) -> String {
    format!("Found new assets: {url}")
}
