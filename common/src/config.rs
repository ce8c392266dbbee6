use std::{borrow::Cow, fmt};

use serde::{Deserialize, Serialize};

use crate::{
    error::CommandError,
    hardware::{HardwareProfile, OutputChannel},
    schedule::ScheduleTable,
};

pub const SSID_LEN: usize = 64;
pub const PASSWORD_LEN: usize = 64;
pub const TIMEZONE_LEN: usize = 8;

pub const DEFAULT_TIMEZONE: &str = "UTC";
// Longest SSID a WiFi station can join.
pub const STATION_SSID_MAX: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchTiming {
    pub debounce_ms: u64,
    pub settle_delay_ms: u64,
    pub tick_interval_ms: u64,
    pub time_valid_threshold_secs: i64,
    pub time_resync_interval_ms: u64,
    pub wifi_retry_interval_ms: u64,
}

impl Default for SwitchTiming {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            settle_delay_ms: 500,
            tick_interval_ms: 10,
            time_valid_threshold_secs: 100_000,
            time_resync_interval_ms: 3_600_000,
            wifi_retry_interval_ms: 60_000,
        }
    }
}

impl SwitchTiming {
    pub fn is_clock_valid(&self, now_secs: i64) -> bool {
        now_secs >= self.time_valid_threshold_secs
    }

    pub fn wifi_retry_due(&self, last_attempt_ms: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(last_attempt_ms) >= self.wifi_retry_interval_ms
    }
}

pub fn check_station_ssid(ssid: &str) -> Result<(), CommandError> {
    if ssid.len() > STATION_SSID_MAX {
        return Err(CommandError::InvalidLength {
            field: "ssid",
            max: STATION_SSID_MAX,
        });
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FixedText<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> FixedText<N> {
    pub const CAPACITY: usize = N - 1;

    pub fn empty() -> Self {
        Self {
            bytes: [0; N],
            len: 0,
        }
    }

    pub fn new(value: &str) -> Option<Self> {
        let raw = value.as_bytes();
        if raw.len() > Self::CAPACITY || raw.contains(&0) {
            return None;
        }
        let mut bytes = [0; N];
        bytes[..raw.len()].copy_from_slice(raw);
        Some(Self {
            bytes,
            len: raw.len(),
        })
    }

    pub fn from_raw(raw: &[u8]) -> Self {
        let window = &raw[..raw.len().min(N)];
        let len = window.iter().position(|b| *b == 0).unwrap_or(window.len());
        let mut bytes = [0; N];
        bytes[..len].copy_from_slice(&window[..len]);
        Self { bytes, len }
    }

    pub fn raw(&self) -> &[u8; N] {
        &self.bytes
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<const N: usize> Default for FixedText<N> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const N: usize> fmt::Debug for FixedText<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputState {
    pub power: bool,
    pub usb: bool,
}

impl OutputState {
    pub fn get(&self, channel: OutputChannel) -> bool {
        match channel {
            OutputChannel::Power => self.power,
            OutputChannel::Usb => self.usb,
        }
    }

    pub fn set(&mut self, channel: OutputChannel, on: bool) {
        match channel {
            OutputChannel::Power => self.power = on,
            OutputChannel::Usb => self.usb = on,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub ssid: FixedText<SSID_LEN>,
    pub password: FixedText<PASSWORD_LEN>,
    pub timezone: FixedText<TIMEZONE_LEN>,
    pub last_time: i32,
    pub requested_voltage: u8,
    pub schedules: ScheduleTable,
    pub outputs: OutputState,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ssid: FixedText::empty(),
            password: FixedText::empty(),
            timezone: FixedText::new(DEFAULT_TIMEZONE).unwrap_or_default(),
            last_time: 0,
            requested_voltage: 9,
            schedules: ScheduleTable::default(),
            outputs: OutputState::default(),
        }
    }
}

impl DeviceConfig {
    pub fn defaults_for(profile: &HardwareProfile) -> Self {
        Self {
            requested_voltage: profile.default_voltage,
            ..Self::default()
        }
    }

    pub fn has_wifi_credentials(&self) -> bool {
        !self.ssid.is_empty()
    }

    pub fn set_wifi_credentials(&mut self, ssid: &str, password: &str) -> Result<(), CommandError> {
        let ssid = FixedText::new(ssid)
            .filter(|text| !text.is_empty())
            .ok_or(CommandError::InvalidLength {
                field: "ssid",
                max: FixedText::<SSID_LEN>::CAPACITY,
            })?;
        let password = FixedText::new(password).ok_or(CommandError::InvalidLength {
            field: "password",
            max: FixedText::<PASSWORD_LEN>::CAPACITY,
        })?;

        self.ssid = ssid;
        self.password = password;
        Ok(())
    }

    pub fn set_timezone(&mut self, code: &str) -> Result<(), CommandError> {
        let normalized = code.trim().to_ascii_uppercase();
        let timezone = FixedText::new(&normalized)
            .filter(|text| !text.is_empty())
            .ok_or(CommandError::InvalidLength {
                field: "timezone",
                max: FixedText::<TIMEZONE_LEN>::CAPACITY,
            })?;

        self.timezone = timezone;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn full_width_text_decodes_without_terminator() {
        let raw = [b'a'; SSID_LEN];
        let text = FixedText::<SSID_LEN>::from_raw(&raw);

        assert_eq!(text.len(), SSID_LEN);
        assert_eq!(text.as_bytes(), &raw[..]);
    }

    #[test]
    fn decoded_text_drops_bytes_after_terminator() {
        let mut raw = [0xEE; TIMEZONE_LEN];
        raw[..3].copy_from_slice(b"PST");
        raw[3] = 0;
        let text = FixedText::<TIMEZONE_LEN>::from_raw(&raw);

        assert_eq!(text, FixedText::new("PST").unwrap());
        assert_eq!(&text.raw()[3..], &[0u8; 5]);
    }

    #[test]
    fn wifi_credentials_respect_capacity() {
        let mut config = DeviceConfig::default();
        let longest = "s".repeat(63);

        assert_eq!(config.set_wifi_credentials(&longest, ""), Ok(()));
        assert_eq!(config.ssid.len(), 63);
        assert!(config.has_wifi_credentials());

        let too_long = "s".repeat(64);
        assert_eq!(
            config.set_wifi_credentials("home", &too_long),
            Err(CommandError::InvalidLength {
                field: "password",
                max: 63
            })
        );
        assert_eq!(
            config.set_wifi_credentials("", "secret"),
            Err(CommandError::InvalidLength {
                field: "ssid",
                max: 63
            })
        );
        assert_eq!(config.ssid.len(), 63);
    }

    #[test]
    fn wifi_retry_waits_a_full_interval() {
        let timing = SwitchTiming::default();

        assert!(!timing.wifi_retry_due(10_000, 69_999));
        assert!(timing.wifi_retry_due(10_000, 70_000));
        assert!(!timing.wifi_retry_due(10_000, 5_000));
    }

    #[test]
    fn station_ssid_limit_is_tighter_than_storage() {
        let stored_only = "s".repeat(33);
        let mut config = DeviceConfig::default();

        assert_eq!(check_station_ssid(&"s".repeat(32)), Ok(()));
        assert_eq!(
            check_station_ssid(&stored_only),
            Err(CommandError::InvalidLength {
                field: "ssid",
                max: 32
            })
        );
        assert_eq!(config.set_wifi_credentials(&stored_only, ""), Ok(()));
    }

    #[test]
    fn timezone_is_normalized_and_bounded() {
        let mut config = DeviceConfig::default();

        assert_eq!(config.set_timezone(" utc+8 "), Ok(()));
        assert_eq!(config.timezone.to_string_lossy(), "UTC+8");

        assert!(config.set_timezone("UTC+10:30").is_err());
        assert!(config.set_timezone("   ").is_err());
        assert_eq!(config.timezone.to_string_lossy(), "UTC+8");
    }

    #[test]
    fn defaults_follow_profile() {
        let config = DeviceConfig::defaults_for(&HardwareProfile::SINGLE_OUTPUT);

        assert_eq!(config.timezone.to_string_lossy(), "UTC");
        assert_eq!(config.requested_voltage, 9);
        assert!(config.schedules.is_empty());
        assert_eq!(config.outputs, OutputState::default());
    }
}
