use chrono::{DateTime, FixedOffset, Offset, TimeZone, Utc};

use crate::{strings, weather::WeatherSnapshot};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WeatherIcon {
    Sun,
    CloudSun,
    #[default]
    Cloud,
    CloudRain,
    CloudBolt,
    Snowflake,
    Smog,
}

impl WeatherIcon {
    /// Maps an OpenWeatherMap icon code such as `10d` onto a display glyph.
    pub fn from_code(code: &str) -> Self {
        match code.get(..2) {
            Some("01") => Self::Sun,
            Some("02") | Some("03") => Self::CloudSun,
            Some("09") | Some("10") => Self::CloudRain,
            Some("11") => Self::CloudBolt,
            Some("13") => Self::Snowflake,
            Some("50") => Self::Smog,
            _ => Self::Cloud,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sun => "sun",
            Self::CloudSun => "cloud_sun",
            Self::Cloud => "cloud",
            Self::CloudRain => "cloud_rain",
            Self::CloudBolt => "cloud_bolt",
            Self::Snowflake => "snowflake",
            Self::Smog => "smog",
        }
    }
}

/// Content of the at-rest screen. Empty strings are not rendered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdleCard {
    pub greeting: String,
    pub time_text: String,
    pub day_text: String,
    pub date_text: String,
    pub city: String,
    pub temperature_text: String,
    pub humidity_text: String,
    pub feels_like_text: String,
    pub wind_text: String,
    pub pressure_text: String,
    pub description_text: String,
    pub sunrise_text: String,
    pub sunset_text: String,
    pub ticker_text: String,
    pub icon: WeatherIcon,
}

pub fn build_idle_card(
    now: Option<DateTime<FixedOffset>>,
    weather: Option<&WeatherSnapshot>,
    default_city: &str,
) -> IdleCard {
    let mut card = IdleCard {
        greeting: strings::GREETING.to_string(),
        ..IdleCard::default()
    };

    match now {
        Some(now) => {
            card.time_text = now.format("%H:%M:%S").to_string();
            card.day_text = now.format("%A").to_string();
            card.date_text = now.format("%m-%d").to_string();
        }
        None => card.time_text = "--:--:--".to_string(),
    }

    let Some(weather) = weather else {
        card.city = default_city.to_string();
        card.ticker_text = strings::STANDBY.to_string();
        card.description_text = strings::STANDBY.to_string();
        card.icon = WeatherIcon::Cloud;
        return card;
    };

    let offset = now.map(|now| *now.offset()).unwrap_or_else(|| Utc.fix());

    card.city = if weather.city.is_empty() {
        default_city.to_string()
    } else {
        capitalize_words(&weather.city)
    };
    card.temperature_text = format!("{}°C", round(weather.temperature_c));
    if weather.humidity > 0 {
        card.humidity_text = format!("Hum {}%", weather.humidity);
    }
    if weather.feels_like_c != 0.0 {
        card.feels_like_text = format!("Feels {}°C", round(weather.feels_like_c));
    }
    if weather.wind_speed > 0.01 {
        card.wind_text = match weather.wind_deg.map(wind_direction) {
            Some(direction) => format!("Wind {:.1} m/s {direction}", weather.wind_speed),
            None => format!("Wind {:.1} m/s", weather.wind_speed),
        };
    }
    if weather.pressure > 0 {
        card.pressure_text = format!("Pres {} hPa", weather.pressure);
    }
    card.description_text = weather.description.clone();
    if let Some(sunrise) = weather.sunrise_epoch.and_then(|ts| hhmm(ts, &offset)) {
        card.sunrise_text = format!("Rise {sunrise}");
    }
    if let Some(sunset) = weather.sunset_epoch.and_then(|ts| hhmm(ts, &offset)) {
        card.sunset_text = format!("Set {sunset}");
    }
    card.ticker_text = format!(
        "Lo {}°C / Hi {}°C",
        round(weather.temp_min_c),
        round(weather.temp_max_c)
    );
    card.icon = WeatherIcon::from_code(&weather.icon);
    card
}

/// Eight-point compass sector for a bearing in degrees.
pub fn wind_direction(deg: i32) -> &'static str {
    const DIRECTIONS: [&str; 8] = ["N", "NE", "E", "SE", "S", "SW", "W", "NW"];
    let normalized = deg.rem_euclid(360);
    DIRECTIONS[(((normalized + 22) / 45) % 8) as usize]
}

pub fn capitalize_words(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut new_word = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            new_word = true;
            result.push(ch);
        } else if new_word {
            result.extend(ch.to_uppercase());
            new_word = false;
        } else {
            result.extend(ch.to_lowercase());
        }
    }
    result
}

fn round(value: f32) -> i32 {
    value.round() as i32
}

fn hhmm(epoch_secs: i64, offset: &FixedOffset) -> Option<String> {
    if epoch_secs <= 0 {
        return None;
    }
    let time = offset.timestamp_opt(epoch_secs, 0).single()?;
    Some(time.format("%H:%M").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn snapshot() -> WeatherSnapshot {
        WeatherSnapshot {
            city: "ho chi minh city".to_string(),
            temperature_c: 31.6,
            feels_like_c: 36.2,
            humidity: 70,
            wind_speed: 3.14,
            wind_deg: Some(225),
            pressure: 1009,
            temp_min_c: 29.4,
            temp_max_c: 32.5,
            sunrise_epoch: Some(1_748_730_000),
            sunset_epoch: None,
            description: "Scattered Clouds".to_string(),
            icon: "03d".to_string(),
            fetched_at_epoch: 1_748_750_000,
        }
    }

    fn local_now() -> DateTime<FixedOffset> {
        let offset = FixedOffset::east_opt(7 * 3600).unwrap();
        Utc.with_ymd_and_hms(2025, 6, 2, 2, 3, 4)
            .unwrap()
            .with_timezone(&offset)
    }

    #[test]
    fn card_without_clock_or_weather_is_a_placeholder() {
        let card = build_idle_card(None, None, "Hanoi");
        assert_eq!(card.time_text, "--:--:--");
        assert_eq!(card.city, "Hanoi");
        assert_eq!(card.ticker_text, "Standby");
        assert_eq!(card.description_text, "Standby");
        assert_eq!(card.icon, WeatherIcon::Cloud);
        assert!(card.temperature_text.is_empty());
    }

    #[test]
    fn card_renders_weather_snapshot() {
        let weather = snapshot();
        let card = build_idle_card(Some(local_now()), Some(&weather), "Hanoi");

        assert_eq!(card.time_text, "09:03:04");
        assert_eq!(card.day_text, "Monday");
        assert_eq!(card.date_text, "06-02");
        assert_eq!(card.city, "Ho Chi Minh City");
        assert_eq!(card.temperature_text, "32°C");
        assert_eq!(card.humidity_text, "Hum 70%");
        assert_eq!(card.feels_like_text, "Feels 36°C");
        assert_eq!(card.wind_text, "Wind 3.1 m/s SW");
        assert_eq!(card.pressure_text, "Pres 1009 hPa");
        assert_eq!(card.sunrise_text, "Rise 05:20");
        assert!(card.sunset_text.is_empty());
        assert_eq!(card.ticker_text, "Lo 29°C / Hi 33°C");
        assert_eq!(card.icon, WeatherIcon::CloudSun);
    }

    #[test]
    fn wind_direction_covers_all_sectors() {
        assert_eq!(wind_direction(0), "N");
        assert_eq!(wind_direction(22), "N");
        assert_eq!(wind_direction(23), "NE");
        assert_eq!(wind_direction(180), "S");
        assert_eq!(wind_direction(338), "N");
        assert_eq!(wind_direction(-90), "W");
        assert_eq!(wind_direction(720 + 90), "E");
    }

    #[test]
    fn icon_codes_map_by_prefix() {
        assert_eq!(WeatherIcon::from_code("01n"), WeatherIcon::Sun);
        assert_eq!(WeatherIcon::from_code("04d"), WeatherIcon::Cloud);
        assert_eq!(WeatherIcon::from_code("09d"), WeatherIcon::CloudRain);
        assert_eq!(WeatherIcon::from_code("11d"), WeatherIcon::CloudBolt);
        assert_eq!(WeatherIcon::from_code("13d"), WeatherIcon::Snowflake);
        assert_eq!(WeatherIcon::from_code("50d"), WeatherIcon::Smog);
        assert_eq!(WeatherIcon::from_code("7"), WeatherIcon::Cloud);
    }

    #[test]
    fn capitalize_words_normalizes_case() {
        assert_eq!(capitalize_words("lIGHT  rain"), "Light  Rain");
        assert_eq!(capitalize_words(""), "");
    }
}
