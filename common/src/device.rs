use std::time::Duration;

use chrono::FixedOffset;
use log::{info, warn};

use crate::{
    buttons::ButtonInputMonitor,
    clock,
    config::{DeviceConfig, SwitchTiming},
    error::CommandError,
    hardware::{Board, ButtonAction, HardwareProfile, OutputChannel, SenseChannel},
    output::{PowerOutputController, VoltageChange},
    schedule::{ScheduleEngine, ScheduleEntry},
    sensor::VoltageSensor,
    store::{ConfigStore, Storage},
    types::DeviceStatus,
};

#[derive(Debug, Clone)]
pub(crate) struct DeviceState {
    pub config: DeviceConfig,
    buttons: ButtonInputMonitor,
    schedules: ScheduleEngine,
    offset: FixedOffset,
}

impl DeviceState {
    fn new(config: DeviceConfig, timing: &SwitchTiming) -> Self {
        let offset = clock::utc_offset(&config.timezone.to_string_lossy());
        Self {
            config,
            buttons: ButtonInputMonitor::new(timing.debounce_ms),
            schedules: ScheduleEngine::new(),
            offset,
        }
    }
}

pub struct Device<B, S> {
    profile: &'static HardwareProfile,
    timing: SwitchTiming,
    board: B,
    store: ConfigStore<S>,
    state: DeviceState,
}

impl<B: Board, S: Storage> Device<B, S> {
    pub fn new(
        profile: &'static HardwareProfile,
        board: B,
        storage: S,
        timing: SwitchTiming,
    ) -> Self {
        let mut store = ConfigStore::new(storage, profile);
        let config = match store.load() {
            Ok(outcome) => outcome.unwrap_or_defaults(profile),
            Err(err) => {
                warn!("failed to read config from storage: {err}");
                DeviceConfig::defaults_for(profile)
            }
        };
        let state = DeviceState::new(config, &timing);

        Self {
            profile,
            timing,
            board,
            store,
            state,
        }
    }

    pub fn profile(&self) -> &'static HardwareProfile {
        self.profile
    }

    pub fn timing(&self) -> &SwitchTiming {
        &self.timing
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.state.config
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn storage(&self) -> &S {
        self.store.storage()
    }

    pub fn into_parts(self) -> (B, S) {
        (self.board, self.store.into_storage())
    }

    pub fn restore(&mut self) {
        self.outputs().restore();
        info!(
            "{} restored: power {}, PD {}V",
            self.profile.name,
            if self.state.config.outputs.power { "ON" } else { "OFF" },
            self.state.config.requested_voltage
        );
    }

    pub fn tick(&mut self, now_ms: u64, now_secs: i64) {
        self.poll_buttons(now_ms);
        self.check_schedules(now_secs);
    }

    pub fn poll_buttons(&mut self, now_ms: u64) -> Vec<ButtonAction> {
        let actions = self
            .state
            .buttons
            .poll(now_ms, &mut self.board, self.profile.buttons);
        for action in &actions {
            info!("button: {action:?}");
            self.outputs().apply(*action);
        }
        actions
    }

    pub fn check_schedules(&mut self, now_secs: i64) -> Option<ScheduleEntry> {
        if !self.timing.is_clock_valid(now_secs) {
            return None;
        }
        let local = clock::local_time(now_secs, self.state.offset)?;
        let entry = self
            .state
            .schedules
            .check(local, &self.state.config.schedules)?;

        self.set_all_outputs(entry.action);
        Some(entry)
    }

    pub fn set_output(&mut self, channel: OutputChannel, on: bool) {
        self.outputs().set_output(channel, on);
    }

    pub fn set_all_outputs(&mut self, on: bool) {
        self.outputs().set_all(on);
    }

    pub fn set_requested_voltage(&mut self, volts: u8) -> Result<VoltageChange, CommandError> {
        self.outputs().set_requested_voltage(volts)
    }

    pub fn add_schedule(&mut self, time: u16, action: bool) -> Result<(), CommandError> {
        self.state.config.schedules.add(time, action)?;
        info!("schedule added: {}", ScheduleEntry { time, action });
        self.persist();
        Ok(())
    }

    pub fn list_schedules(&self) -> &[ScheduleEntry] {
        self.state.config.schedules.entries()
    }

    pub fn remove_schedule(&mut self, index: i32) -> Result<(), CommandError> {
        self.state.config.schedules.remove(index)?;
        if index == -1 {
            info!("all schedules cleared");
        } else {
            info!("schedule {index} removed");
        }
        self.persist();
        Ok(())
    }

    pub fn set_wifi_credentials(&mut self, ssid: &str, password: &str) -> Result<(), CommandError> {
        self.state.config.set_wifi_credentials(ssid, password)?;
        info!("wifi credentials updated for {ssid:?}");
        self.persist();
        Ok(())
    }

    pub fn set_timezone(&mut self, code: &str) -> Result<(), CommandError> {
        self.state.config.set_timezone(code)?;
        let stored = self.state.config.timezone.to_string_lossy().into_owned();
        self.state.offset = clock::utc_offset(&stored);
        info!("timezone set to {stored}");
        self.persist();
        Ok(())
    }

    pub fn record_time_sync(&mut self, now_secs: i64) -> bool {
        if !self.timing.is_clock_valid(now_secs) {
            return false;
        }
        let Ok(secs) = i32::try_from(now_secs) else {
            warn!("time {now_secs} does not fit the stored field");
            return false;
        };

        self.state.config.last_time = secs;
        info!("time synced: {now_secs}");
        self.persist();
        true
    }

    pub fn fallback_clock(&self) -> Option<i64> {
        (self.state.config.last_time > 0).then_some(i64::from(self.state.config.last_time))
    }

    pub fn status(&mut self, now_secs: i64) -> DeviceStatus {
        let sensor = VoltageSensor::new(self.profile);
        let measured_vbus = sensor
            .read(&mut self.board, SenseChannel::Vbus)
            .map(|reading| reading.volts);
        let measured_vout = sensor
            .read(&mut self.board, SenseChannel::Vout)
            .map(|reading| reading.volts);

        let config = &self.state.config;
        let time_synced = self.timing.is_clock_valid(now_secs);
        let time = clock::local_time(now_secs, self.state.offset)
            .filter(|_| time_synced)
            .map(|local| local.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "Not synced".to_string());

        DeviceStatus {
            variant: self.profile.name,
            power: config.outputs.power,
            usb: self
                .profile
                .has_output(OutputChannel::Usb)
                .then_some(config.outputs.usb),
            pd_voltage: config.requested_voltage,
            measured_vbus,
            measured_vout,
            timezone: config.timezone.to_string_lossy().into_owned(),
            time,
            time_synced,
            last_sync: config.last_time,
            wifi_configured: config.has_wifi_credentials(),
            schedule_count: config.schedules.len(),
        }
    }

    fn outputs(&mut self) -> PowerOutputController<'_, B, S> {
        PowerOutputController::new(
            self.profile,
            &mut self.board,
            &mut self.store,
            &mut self.state.config,
            Duration::from_millis(self.timing.settle_delay_ms),
        )
    }

    fn persist(&mut self) {
        if let Err(err) = self.store.save(&self.state.config) {
            warn!("failed to save config: {err}");
        }
    }
}
