use std::{
    sync::OnceLock,
    time::Instant,
};

use chrono::{DateTime, Datelike, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use log::warn;

use crate::services::WallClock;

/// Wall clocks earlier than this are treated as never synchronized.
const MIN_SYNCED_YEAR: i32 = 2025;

#[derive(Debug, Clone)]
pub struct TimezoneClock {
    timezone: Tz,
}

impl TimezoneClock {
    pub fn new(timezone: &str) -> Self {
        let timezone = timezone.parse().unwrap_or_else(|_| {
            warn!("unknown timezone `{timezone}`, using UTC");
            Tz::UTC
        });
        Self { timezone }
    }

    pub fn at(&self, utc: DateTime<Utc>) -> Option<DateTime<FixedOffset>> {
        let local = utc.with_timezone(&self.timezone);
        if local.year() < MIN_SYNCED_YEAR {
            return None;
        }
        Some(local.with_timezone(&local.offset().fix()))
    }
}

impl WallClock for TimezoneClock {
    fn now(&self) -> Option<DateTime<FixedOffset>> {
        self.at(Utc::now())
    }
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn unsynchronized_clock_reports_none() {
        let clock = TimezoneClock::new("Asia/Ho_Chi_Minh");
        let boot_epoch = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 5).unwrap();
        assert!(clock.at(boot_epoch).is_none());
    }

    #[test]
    fn converts_into_configured_timezone() {
        let clock = TimezoneClock::new("Asia/Ho_Chi_Minh");
        let utc = Utc.with_ymd_and_hms(2025, 6, 1, 1, 30, 0).unwrap();
        let local = clock.at(utc).unwrap();
        assert_eq!(local.hour(), 8);
        assert_eq!(local.offset().local_minus_utc(), 7 * 3600);
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let clock = TimezoneClock::new("Nowhere/Special");
        let utc = Utc.with_ymd_and_hms(2025, 6, 1, 1, 30, 0).unwrap();
        assert_eq!(clock.at(utc).unwrap().hour(), 1);
    }
}
