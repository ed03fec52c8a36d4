use std::sync::Arc;

use log::{error, info, warn};

use crate::{
    device::{report_progress, Device},
    services::{ActivationStatus, Sound},
    strings,
    types::DeviceState,
};

const ASSETS_NAMESPACE: &str = "assets";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay_secs: u64 },
    GiveUp { attempts: u32 },
}

/// Doubling retry delay with a bounded attempt count.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    max_attempts: u32,
    initial_delay_secs: u64,
    failures: u32,
    delay_secs: u64,
}

impl RetryBackoff {
    pub fn new(max_attempts: u32, initial_delay_secs: u64) -> Self {
        Self {
            max_attempts,
            initial_delay_secs,
            failures: 0,
            delay_secs: initial_delay_secs,
        }
    }

    pub fn record_failure(&mut self) -> RetryDecision {
        self.failures += 1;
        if self.failures >= self.max_attempts {
            return RetryDecision::GiveUp {
                attempts: self.failures,
            };
        }
        let delay_secs = self.delay_secs;
        self.delay_secs = self.delay_secs.saturating_mul(2);
        RetryDecision::Retry {
            attempt: self.failures,
            delay_secs,
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.delay_secs = self.initial_delay_secs;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckInOutcome {
    /// Server identity confirmed and no activation pending.
    Ready,
    /// Activation was cancelled from the device.
    Cancelled,
    /// Firmware was flashed and a restart requested.
    Upgraded,
    GaveUp { attempts: u32 },
}

impl Device {
    /// Boot-time version check and activation. Blocks the scheduler thread,
    /// servicing queued work between waits.
    pub fn check_new_version(&mut self) -> CheckInOutcome {
        let ota = Arc::clone(&self.services.ota);
        let display = Arc::clone(&self.services.display);
        let mut backoff = RetryBackoff::new(
            self.config.checkin_max_attempts,
            self.config.checkin_initial_delay_secs,
        );

        loop {
            self.set_device_state(DeviceState::Activating);
            display.set_status(strings::CHECKING_NEW_VERSION);

            if let Err(err) = ota.check_version() {
                warn!("version check failed: {err}");
                match backoff.record_failure() {
                    RetryDecision::GiveUp { attempts } => {
                        error!("too many retries, exit version check");
                        return CheckInOutcome::GaveUp { attempts };
                    }
                    RetryDecision::Retry {
                        attempt,
                        delay_secs,
                    } => {
                        let message =
                            strings::check_new_version_failed(delay_secs, &ota.check_version_url());
                        self.alert(strings::ERROR, &message, "cloud_slash", Some(Sound::Exclamation));
                        warn!(
                            "check new version failed, retry in {delay_secs} seconds ({attempt}/{})",
                            self.config.checkin_max_attempts
                        );
                        self.wait_unless_idle(delay_secs);
                        continue;
                    }
                }
            }
            backoff.reset();

            if ota.has_new_version() && self.upgrade_firmware(None) {
                return CheckInOutcome::Upgraded;
            }

            ota.mark_current_version_valid();
            if !ota.has_activation_code() && !ota.has_activation_challenge() {
                return CheckInOutcome::Ready;
            }

            display.set_status(strings::ACTIVATION);
            if ota.has_activation_code() {
                self.show_activation_code(&ota.activation_code(), &ota.activation_message());
            }
            if self.poll_activation() {
                return CheckInOutcome::Cancelled;
            }
        }
    }

    /// Returns true when the user cancelled activation.
    fn poll_activation(&mut self) -> bool {
        let ota = Arc::clone(&self.services.ota);
        let attempts = self.config.activation_attempts;
        for attempt in 1..=attempts {
            info!("activating... {attempt}/{attempts}");
            let wait_secs = match ota.activate() {
                ActivationStatus::Activated => return false,
                ActivationStatus::Pending => self.config.activation_timeout_wait_secs,
                ActivationStatus::Failed => self.config.activation_error_wait_secs,
            };
            if self.wait_unless_idle(wait_secs) || self.state() == DeviceState::Idle {
                info!("activation cancelled");
                return true;
            }
        }
        false
    }

    pub fn show_activation_code(&mut self, code: &str, message: &str) {
        self.alert(strings::ACTIVATION, message, "link", Some(Sound::Activation));
        let audio = &self.services.audio;
        for digit in code.chars().filter_map(|ch| ch.to_digit(10)) {
            audio.play_sound(Sound::Digit(digit as u8));
        }
    }

    /// Flashes `url`, or the version offered by the last check-in when `None`.
    /// Returns false when the upgrade failed and the device keeps running.
    pub fn upgrade_firmware(&mut self, url: Option<&str>) -> bool {
        let ota = Arc::clone(&self.services.ota);
        let display = Arc::clone(&self.services.display);
        let audio = Arc::clone(&self.services.audio);
        let board = Arc::clone(&self.services.board);

        let (upgrade_url, version_info) = match url {
            Some(url) => (url.to_string(), "(Manual upgrade)".to_string()),
            None => (ota.firmware_url(), ota.firmware_version()),
        };

        if let Some(transport) = self.transport.as_mut() {
            if transport.is_audio_channel_opened() {
                info!("closing audio channel before firmware upgrade");
                transport.close_audio_channel();
            }
        }
        info!("starting firmware upgrade from {upgrade_url}");

        let previous = self.state();
        self.alert(strings::OTA_UPGRADE, strings::UPGRADING, "download", Some(Sound::Upgrade));
        self.pause(self.config.alert_pause_ms);

        self.set_device_state(DeviceState::Upgrading);
        display.set_chat_message("system", &format!("{}{version_info}", strings::NEW_VERSION));
        board.set_power_save_mode(false);
        audio.stop();
        self.pause(self.config.settle_ms);

        let result = ota.start_upgrade_from_url(&upgrade_url, &mut |progress| {
            report_progress(&display, progress)
        });

        if let Err(err) = result {
            error!("firmware upgrade failed: {err}, continuing on current firmware");
            audio.start();
            board.set_power_save_mode(true);
            self.alert(
                strings::ERROR,
                strings::UPGRADE_FAILED,
                "circle_xmark",
                Some(Sound::Exclamation),
            );
            self.pause(self.config.alert_pause_ms);
            self.set_device_state(previous);
            return false;
        }

        info!("firmware upgrade successful, rebooting");
        display.set_chat_message("system", strings::UPGRADE_REBOOTING);
        self.pause(self.config.settle_ms);
        self.reboot();
        true
    }

    /// Downloads assets staged by a previous check-in, then applies them.
    pub fn check_assets_version(&mut self) {
        let assets = Arc::clone(&self.services.assets);
        let settings = Arc::clone(&self.services.settings);
        let display = Arc::clone(&self.services.display);
        let board = Arc::clone(&self.services.board);

        if !assets.partition_valid() {
            warn!("assets partition is disabled for this board");
            return;
        }

        let download_url = settings
            .get_string(ASSETS_NAMESPACE, "download_url")
            .filter(|url| !url.is_empty());
        if let Some(url) = download_url {
            if let Err(err) = settings.erase_key(ASSETS_NAMESPACE, "download_url") {
                warn!("failed to clear assets download url: {err}");
            }

            self.alert(
                strings::LOADING_ASSETS,
                &strings::found_new_assets(&url),
                "cloud_arrow_down",
                Some(Sound::Upgrade),
            );
            self.pause(self.config.alert_pause_ms);
            self.set_device_state(DeviceState::Upgrading);
            board.set_power_save_mode(false);
            display.set_chat_message("system", strings::PLEASE_WAIT);

            let result = assets.download(&url, &mut |progress| report_progress(&display, progress));

            board.set_power_save_mode(true);
            self.pause(self.config.settle_ms);

            if let Err(err) = result {
                error!("assets download failed: {err}");
                self.alert(
                    strings::ERROR,
                    strings::DOWNLOAD_ASSETS_FAILED,
                    "circle_xmark",
                    Some(Sound::Exclamation),
                );
                self.pause(self.config.alert_pause_ms);
                return;
            }
        }

        assets.apply();
        display.set_chat_message("system", "");
        display.set_emotion("microchip_ai");
    }
}
