use std::time::Duration;

use log::{info, warn};

use crate::{
    config::DeviceConfig,
    error::CommandError,
    hardware::{
        AnalogInputs, ButtonAction, HardwareProfile, Line, OutputChannel, OutputLines, SettleDelay,
    },
    sensor::{VoltageReading, VoltageSensor},
    store::{ConfigStore, Storage},
};

pub fn pd_code(volts: u8) -> Option<[bool; 3]> {
    match volts {
        5 => Some([true, false, false]),
        9 => Some([false, false, false]),
        12 => Some([false, false, true]),
        15 => Some([false, true, true]),
        20 => Some([false, true, false]),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoltageChange {
    pub volts: u8,
    pub readings: Vec<VoltageReading>,
}

#[derive(Debug, Clone, Copy)]
pub struct SettleProbe<'p> {
    sensor: VoltageSensor<'p>,
    delay: Duration,
}

impl<'p> SettleProbe<'p> {
    pub fn new(profile: &'p HardwareProfile, delay: Duration) -> Self {
        Self {
            sensor: VoltageSensor::new(profile),
            delay,
        }
    }

    pub fn confirm<B>(&self, board: &mut B) -> Vec<VoltageReading>
    where
        B: AnalogInputs + SettleDelay + ?Sized,
    {
        board.settle(self.delay);
        let readings = self.sensor.read_all(board);
        for reading in &readings {
            info!("{} measured: {:.2}V", reading.channel.as_str(), reading.volts);
        }
        readings
    }
}

pub struct PowerOutputController<'a, B: ?Sized, S> {
    profile: &'a HardwareProfile,
    board: &'a mut B,
    store: &'a mut ConfigStore<S>,
    config: &'a mut DeviceConfig,
    probe: SettleProbe<'a>,
}

impl<'a, B, S> PowerOutputController<'a, B, S>
where
    B: OutputLines + AnalogInputs + SettleDelay + ?Sized,
    S: Storage,
{
    pub fn new(
        profile: &'a HardwareProfile,
        board: &'a mut B,
        store: &'a mut ConfigStore<S>,
        config: &'a mut DeviceConfig,
        settle_delay: Duration,
    ) -> Self {
        Self {
            profile,
            board,
            store,
            config,
            probe: SettleProbe::new(profile, settle_delay),
        }
    }

    pub fn set_output(&mut self, channel: OutputChannel, on: bool) {
        let Some(polarity) = self.profile.polarity(channel) else {
            warn!("{} output not present on {}", channel.as_str(), self.profile.name);
            return;
        };

        self.board.drive(Line::Output(channel), polarity.level(on));
        self.config.outputs.set(channel, on);
        info!("{} output: {}", channel.as_str(), if on { "ON" } else { "OFF" });
        self.persist();
    }

    pub fn toggle(&mut self, channel: OutputChannel) {
        let on = !self.config.outputs.get(channel);
        self.set_output(channel, on);
    }

    pub fn set_all(&mut self, on: bool) {
        for channel in self.profile.channels() {
            self.set_output(channel, on);
        }
    }

    pub fn set_requested_voltage(&mut self, volts: u8) -> Result<VoltageChange, CommandError> {
        let code = pd_code(volts)
            .filter(|_| self.profile.supports_voltage(volts))
            .ok_or(CommandError::InvalidVoltage(volts))?;

        self.drive_pd_lines(code);
        self.config.requested_voltage = volts;
        info!("PD voltage set to {volts}V");
        self.persist();

        let readings = self.probe.confirm(&mut *self.board);
        Ok(VoltageChange { volts, readings })
    }

    pub fn cycle_voltage(&mut self) -> Result<VoltageChange, CommandError> {
        let next = self.profile.next_voltage(self.config.requested_voltage);
        self.set_requested_voltage(next)
    }

    pub fn apply(&mut self, action: ButtonAction) {
        match action {
            ButtonAction::Toggle(channel) => self.toggle(channel),
            ButtonAction::AllOn => self.set_all(true),
            ButtonAction::CycleVoltage => {
                if let Err(err) = self.cycle_voltage() {
                    warn!("voltage cycle rejected: {err}");
                }
            }
        }
    }

    pub fn restore(&mut self) {
        for binding in self.profile.outputs {
            let on = self.config.outputs.get(binding.channel);
            self.board
                .drive(Line::Output(binding.channel), binding.polarity.level(on));
        }

        let requested = self.config.requested_voltage;
        let code = match pd_code(requested).filter(|_| self.profile.supports_voltage(requested)) {
            Some(code) => code,
            None => {
                warn!(
                    "stored PD voltage {requested}V not supported, requesting {}V",
                    self.profile.default_voltage
                );
                pd_code(self.profile.default_voltage).unwrap_or([false; 3])
            }
        };
        self.drive_pd_lines(code);
    }

    fn drive_pd_lines(&mut self, code: [bool; 3]) {
        for line in self.profile.pd_lines {
            self.board.drive(Line::Pd(*line), code[line.index()]);
        }
    }

    fn persist(&mut self) {
        if let Err(err) = self.store.save(self.config) {
            warn!("failed to save config: {err}");
        }
    }
}
