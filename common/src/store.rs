//! Fixed-layout configuration record.
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 1    | validity marker (`0xAB`)                |
//! | 1      | 64   | WiFi SSID                               |
//! | 65     | 64   | WiFi password                           |
//! | 129    | 8    | timezone code                           |
//! | 133    | 4    | last synced time, big-endian `i32`      |
//! | 141    | 1    | requested PD voltage                    |
//! | 142    | 1    | schedule count                          |
//! | 143    | 30   | 10 x (time `u16` BE, action `u8`)       |
//! | 173    | 1    | power output flag (optional extension)  |
//! | 174    | 1    | USB output flag (optional extension)    |
//!
//! The layout must stay bit-exact across firmware updates.

use log::info;

use crate::{
    config::{DeviceConfig, FixedText, OutputState, PASSWORD_LEN, SSID_LEN, TIMEZONE_LEN},
    hardware::HardwareProfile,
    schedule::{ScheduleEntry, ScheduleTable, MAX_SCHEDULES},
};

pub const RECORD_MAGIC: u8 = 0xAB;
pub const STORAGE_SIZE: usize = 512;

const ADDR_MAGIC: usize = 0;
const ADDR_SSID: usize = 1;
const ADDR_PASSWORD: usize = 65;
const ADDR_TIMEZONE: usize = 129;
const ADDR_LAST_TIME: usize = 133;
const ADDR_PD_VOLTAGE: usize = 141;
const ADDR_SCHEDULE_COUNT: usize = 142;
const ADDR_SCHEDULES: usize = 143;
const SCHEDULE_SLOT_LEN: usize = 3;
const ADDR_POWER_STATE: usize = ADDR_SCHEDULES + MAX_SCHEDULES * SCHEDULE_SLOT_LEN;
const ADDR_USB_STATE: usize = ADDR_POWER_STATE + 1;

pub const BASE_RECORD_LEN: usize = ADDR_POWER_STATE;
pub const EXTENDED_RECORD_LEN: usize = ADDR_USB_STATE + 1;

pub trait Storage {
    type Error: std::error::Error + Send + Sync + 'static;

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), Self::Error>;

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Self::Error>;

    fn commit(&mut self) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Valid(DeviceConfig),
    Absent,
}

impl LoadOutcome {
    pub fn unwrap_or_defaults(self, profile: &HardwareProfile) -> DeviceConfig {
        match self {
            Self::Valid(config) => config,
            Self::Absent => DeviceConfig::defaults_for(profile),
        }
    }
}

pub fn encode_record(config: &DeviceConfig, with_output_state: bool) -> Vec<u8> {
    let len = if with_output_state {
        EXTENDED_RECORD_LEN
    } else {
        BASE_RECORD_LEN
    };
    let mut record = vec![0_u8; len];

    record[ADDR_MAGIC] = RECORD_MAGIC;
    record[ADDR_SSID..ADDR_SSID + SSID_LEN].copy_from_slice(config.ssid.raw());
    record[ADDR_PASSWORD..ADDR_PASSWORD + PASSWORD_LEN].copy_from_slice(config.password.raw());
    record[ADDR_TIMEZONE..ADDR_TIMEZONE + TIMEZONE_LEN].copy_from_slice(config.timezone.raw());
    record[ADDR_LAST_TIME..ADDR_LAST_TIME + 4].copy_from_slice(&config.last_time.to_be_bytes());
    record[ADDR_PD_VOLTAGE] = config.requested_voltage;
    record[ADDR_SCHEDULE_COUNT] = config.schedules.len() as u8;

    for (slot, entry) in config.schedules.entries().iter().enumerate() {
        let addr = ADDR_SCHEDULES + slot * SCHEDULE_SLOT_LEN;
        record[addr..addr + 2].copy_from_slice(&entry.time.to_be_bytes());
        record[addr + 2] = u8::from(entry.action);
    }

    if with_output_state {
        record[ADDR_POWER_STATE] = u8::from(config.outputs.power);
        record[ADDR_USB_STATE] = u8::from(config.outputs.usb);
    }

    record
}

pub fn decode_record(record: &[u8], with_output_state: bool) -> LoadOutcome {
    if record.len() < BASE_RECORD_LEN || record[ADDR_MAGIC] != RECORD_MAGIC {
        return LoadOutcome::Absent;
    }

    let mut count = record[ADDR_SCHEDULE_COUNT] as usize;
    if count > MAX_SCHEDULES {
        count = 0;
    }
    let slots: Vec<ScheduleEntry> = (0..count)
        .map(|slot| {
            let addr = ADDR_SCHEDULES + slot * SCHEDULE_SLOT_LEN;
            ScheduleEntry {
                time: u16::from_be_bytes([record[addr], record[addr + 1]]),
                action: record[addr + 2] == 1,
            }
        })
        .collect();

    let outputs = if with_output_state && record.len() >= EXTENDED_RECORD_LEN {
        OutputState {
            power: record[ADDR_POWER_STATE] == 1,
            usb: record[ADDR_USB_STATE] == 1,
        }
    } else {
        OutputState::default()
    };

    let mut last_time = [0_u8; 4];
    last_time.copy_from_slice(&record[ADDR_LAST_TIME..ADDR_LAST_TIME + 4]);

    LoadOutcome::Valid(DeviceConfig {
        ssid: FixedText::from_raw(&record[ADDR_SSID..ADDR_SSID + SSID_LEN]),
        password: FixedText::from_raw(&record[ADDR_PASSWORD..ADDR_PASSWORD + PASSWORD_LEN]),
        timezone: FixedText::from_raw(&record[ADDR_TIMEZONE..ADDR_TIMEZONE + TIMEZONE_LEN]),
        last_time: i32::from_be_bytes(last_time),
        requested_voltage: record[ADDR_PD_VOLTAGE],
        schedules: ScheduleTable::from_slots(&slots),
        outputs,
    })
}

pub struct ConfigStore<S> {
    storage: S,
    with_output_state: bool,
}

impl<S: Storage> ConfigStore<S> {
    pub fn new(storage: S, profile: &HardwareProfile) -> Self {
        Self {
            storage,
            with_output_state: profile.persists_output_state,
        }
    }

    pub fn record_len(&self) -> usize {
        if self.with_output_state {
            EXTENDED_RECORD_LEN
        } else {
            BASE_RECORD_LEN
        }
    }

    pub fn load(&mut self) -> Result<LoadOutcome, S::Error> {
        let mut record = vec![0_u8; self.record_len()];
        self.storage.read(0, &mut record)?;
        let outcome = decode_record(&record, self.with_output_state);
        match outcome {
            LoadOutcome::Valid(_) => info!("config loaded from storage"),
            LoadOutcome::Absent => info!("no valid config found, using defaults"),
        }
        Ok(outcome)
    }

    pub fn save(&mut self, config: &DeviceConfig) -> Result<(), S::Error> {
        // Not atomic: a power cut mid-write leaves a marker-valid, partly updated record.
        let record = encode_record(config, self.with_output_state);
        self.storage.write(0, &record)?;
        self.storage.commit()?;
        info!("config saved to storage");
        Ok(())
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStorage;
    use pretty_assertions::assert_eq;

    fn populated_config() -> DeviceConfig {
        let mut config = DeviceConfig::default();
        config.set_wifi_credentials("workshop", "hunter22").unwrap();
        config.set_timezone("PST").unwrap();
        config.last_time = 1_767_600_000;
        config.requested_voltage = 15;
        config.schedules.add(730, true).unwrap();
        config.schedules.add(2315, false).unwrap();
        config.outputs.power = true;
        config
    }

    #[test]
    fn round_trips_every_field() {
        let mut store = ConfigStore::new(MemoryStorage::new(), &HardwareProfile::DUAL_OUTPUT);
        let config = populated_config();

        store.save(&config).unwrap();

        assert_eq!(store.load().unwrap(), LoadOutcome::Valid(config));
        assert_eq!(store.storage().commits(), 1);
    }

    #[test]
    fn round_trips_full_width_credentials_and_table() {
        let mut store = ConfigStore::new(MemoryStorage::new(), &HardwareProfile::DUAL_OUTPUT);
        let mut config = populated_config();
        config
            .set_wifi_credentials(&"n".repeat(63), &"p".repeat(63))
            .unwrap();
        config.set_timezone("UTC-10").unwrap();
        config.last_time = -1;
        config.outputs.usb = true;
        for minute in 0..8 {
            config.schedules.add(1200 + minute, minute % 2 == 0).unwrap();
        }

        store.save(&config).unwrap();

        assert_eq!(store.load().unwrap(), LoadOutcome::Valid(config));
    }

    #[test]
    fn writes_fields_at_fixed_offsets() {
        let mut config = populated_config();
        config.outputs.usb = true;
        let record = encode_record(&config, true);

        assert_eq!(record.len(), 175);
        assert_eq!(record[0], 0xAB);
        assert_eq!(&record[1..9], b"workshop");
        assert_eq!(record[9], 0);
        assert_eq!(&record[65..73], b"hunter22");
        assert_eq!(&record[129..133], b"PST\0");
        assert_eq!(&record[133..137], &1_767_600_000_i32.to_be_bytes());
        assert_eq!(record[141], 15);
        assert_eq!(record[142], 2);
        assert_eq!(&record[143..149], &[0x02, 0xDA, 1, 0x09, 0x0B, 0]);
        assert_eq!(&record[149..173], &[0_u8; 24]);
        assert_eq!(&record[173..175], &[1, 1]);
    }

    #[test]
    fn base_layout_omits_output_state() {
        let mut store = ConfigStore::new(MemoryStorage::new(), &HardwareProfile::SINGLE_OUTPUT);
        let mut config = populated_config();
        config.outputs = OutputState::default();

        store.save(&config).unwrap();

        assert_eq!(store.record_len(), 173);
        assert_eq!(store.storage().bytes()[173], 0xFF);
        assert_eq!(store.load().unwrap(), LoadOutcome::Valid(config));
    }

    #[test]
    fn blank_storage_is_absent() {
        let mut store = ConfigStore::new(MemoryStorage::new(), &HardwareProfile::DUAL_OUTPUT);
        let outcome = store.load().unwrap();

        assert_eq!(outcome, LoadOutcome::Absent);
        let config = outcome.unwrap_or_defaults(&HardwareProfile::DUAL_OUTPUT);
        assert_eq!(config.timezone.to_string_lossy(), "UTC");
        assert_eq!(config.requested_voltage, 9);
        assert!(config.schedules.is_empty());
        assert!(!config.outputs.power && !config.outputs.usb);
    }

    #[test]
    fn oversized_schedule_count_reads_as_empty_table() {
        let mut record = encode_record(&populated_config(), true);
        record[142] = 11;

        let LoadOutcome::Valid(config) = decode_record(&record, true) else {
            panic!("marker was intact");
        };
        assert!(config.schedules.is_empty());
        assert_eq!(config.requested_voltage, 15);
    }

    #[test]
    fn marker_valid_record_is_accepted_with_garbage_fields() {
        let mut record = encode_record(&populated_config(), true);
        record[141] = 42;
        record[143] = 0xFF;

        let LoadOutcome::Valid(config) = decode_record(&record, true) else {
            panic!("marker was intact");
        };
        assert_eq!(config.requested_voltage, 42);
        assert_eq!(config.schedules.entries()[0].time, 0xFFDA);
    }
}
