use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const MAX_BUTTONS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutputChannel {
    Power,
    Usb,
}

impl OutputChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Power => "POWER",
            Self::Usb => "USB",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    pub fn level(self, on: bool) -> bool {
        match self {
            Self::ActiveHigh => on,
            Self::ActiveLow => !on,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PdLine {
    Cfg1,
    Cfg2,
    Cfg3,
}

impl PdLine {
    pub fn index(self) -> usize {
        match self {
            Self::Cfg1 => 0,
            Self::Cfg2 => 1,
            Self::Cfg3 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Line {
    Output(OutputChannel),
    Pd(PdLine),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SenseChannel {
    Vbus,
    Vout,
}

impl SenseChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vbus => "VBUS",
            Self::Vout => "VOUT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdcCalibration {
    pub adc_max: u16,
    pub vref: f32,
    pub divider_ratio: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    Toggle(OutputChannel),
    CycleVoltage,
    AllOn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputBinding {
    pub channel: OutputChannel,
    pub polarity: Polarity,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SenseBinding {
    pub channel: SenseChannel,
    pub calibration: AdcCalibration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HardwareProfile {
    pub name: &'static str,
    pub voltages: &'static [u8],
    pub default_voltage: u8,
    pub outputs: &'static [OutputBinding],
    pub pd_lines: &'static [PdLine],
    pub sense: &'static [SenseBinding],
    pub buttons: &'static [ButtonAction],
    pub persists_output_state: bool,
}

// 47k / 5.1k resistive divider on both sense inputs.
const SENSE_DIVIDER_RATIO: f32 = 10.216;

const ESP32_ADC: AdcCalibration = AdcCalibration {
    adc_max: 4095,
    vref: 3.3,
    divider_ratio: SENSE_DIVIDER_RATIO,
};

const ESP8266_ADC: AdcCalibration = AdcCalibration {
    adc_max: 1023,
    vref: 3.3,
    divider_ratio: SENSE_DIVIDER_RATIO,
};

impl HardwareProfile {
    pub const DUAL_OUTPUT: HardwareProfile = HardwareProfile {
        name: "dual-output",
        voltages: &[5, 9, 12, 15, 20],
        default_voltage: 9,
        outputs: &[
            OutputBinding {
                channel: OutputChannel::Power,
                polarity: Polarity::ActiveHigh,
            },
            OutputBinding {
                channel: OutputChannel::Usb,
                polarity: Polarity::ActiveLow,
            },
        ],
        pd_lines: &[PdLine::Cfg1, PdLine::Cfg2, PdLine::Cfg3],
        sense: &[
            SenseBinding {
                channel: SenseChannel::Vbus,
                calibration: ESP32_ADC,
            },
            SenseBinding {
                channel: SenseChannel::Vout,
                calibration: ESP32_ADC,
            },
        ],
        buttons: &[
            ButtonAction::Toggle(OutputChannel::Power),
            ButtonAction::Toggle(OutputChannel::Usb),
            ButtonAction::CycleVoltage,
            ButtonAction::AllOn,
        ],
        persists_output_state: true,
    };

    pub const SINGLE_OUTPUT: HardwareProfile = HardwareProfile {
        name: "single-output",
        voltages: &[9, 12, 15, 20],
        default_voltage: 9,
        outputs: &[OutputBinding {
            channel: OutputChannel::Power,
            polarity: Polarity::ActiveHigh,
        }],
        pd_lines: &[PdLine::Cfg2, PdLine::Cfg3],
        sense: &[SenseBinding {
            channel: SenseChannel::Vbus,
            calibration: ESP8266_ADC,
        }],
        buttons: &[
            ButtonAction::Toggle(OutputChannel::Power),
            ButtonAction::CycleVoltage,
        ],
        persists_output_state: false,
    };

    pub fn supports_voltage(&self, volts: u8) -> bool {
        self.voltages.contains(&volts)
    }

    pub fn next_voltage(&self, current: u8) -> u8 {
        match self.voltages.iter().position(|v| *v == current) {
            Some(index) => self.voltages[(index + 1) % self.voltages.len()],
            None => self.default_voltage,
        }
    }

    pub fn polarity(&self, channel: OutputChannel) -> Option<Polarity> {
        self.outputs
            .iter()
            .find(|binding| binding.channel == channel)
            .map(|binding| binding.polarity)
    }

    pub fn has_output(&self, channel: OutputChannel) -> bool {
        self.polarity(channel).is_some()
    }

    pub fn channels(&self) -> impl Iterator<Item = OutputChannel> + '_ {
        self.outputs.iter().map(|binding| binding.channel)
    }

    pub fn calibration(&self, channel: SenseChannel) -> Option<AdcCalibration> {
        self.sense
            .iter()
            .find(|binding| binding.channel == channel)
            .map(|binding| binding.calibration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HardwareVariant {
    DualOutput,
    SingleOutput,
}

impl HardwareVariant {
    pub fn profile(self) -> &'static HardwareProfile {
        match self {
            Self::DualOutput => &HardwareProfile::DUAL_OUTPUT,
            Self::SingleOutput => &HardwareProfile::SINGLE_OUTPUT,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "dual" | "dual-output" | "esp32c6" => Some(Self::DualOutput),
            "single" | "single-output" | "esp8266" => Some(Self::SingleOutput),
            _ => None,
        }
    }
}

pub trait OutputLines {
    fn drive(&mut self, line: Line, high: bool);
}

pub trait ButtonInputs {
    fn is_high(&mut self, index: usize) -> bool;
}

pub trait AnalogInputs {
    fn read_raw(&mut self, channel: SenseChannel) -> u16;
}

pub trait SettleDelay {
    fn settle(&mut self, duration: Duration);
}

pub trait Board: OutputLines + ButtonInputs + AnalogInputs + SettleDelay {}

impl<T: OutputLines + ButtonInputs + AnalogInputs + SettleDelay> Board for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dual_output_cycles_through_full_range() {
        let profile = HardwareVariant::DualOutput.profile();
        let mut observed = Vec::new();
        let mut volts = 5;
        for _ in 0..5 {
            volts = profile.next_voltage(volts);
            observed.push(volts);
        }

        assert_eq!(observed, vec![9, 12, 15, 20, 5]);
    }

    #[test]
    fn single_output_wraps_to_nine_and_restarts_unknown_values() {
        let profile = HardwareVariant::SingleOutput.profile();

        assert_eq!(profile.next_voltage(20), 9);
        assert_eq!(profile.next_voltage(5), 9);
        assert_eq!(profile.next_voltage(0), 9);
        assert_eq!(profile.next_voltage(12), 15);
    }

    #[test]
    fn polarity_maps_logical_state_to_level() {
        let profile = HardwareVariant::DualOutput.profile();

        assert_eq!(profile.polarity(OutputChannel::Power), Some(Polarity::ActiveHigh));
        assert_eq!(profile.polarity(OutputChannel::Usb), Some(Polarity::ActiveLow));
        assert!(Polarity::ActiveLow.level(false));
        assert!(!Polarity::ActiveLow.level(true));
        assert!(!HardwareVariant::SingleOutput
            .profile()
            .has_output(OutputChannel::Usb));
    }

    #[test]
    fn variant_names_parse() {
        assert_eq!(
            HardwareVariant::from_name(" Dual "),
            Some(HardwareVariant::DualOutput)
        );
        assert_eq!(
            HardwareVariant::from_name("esp8266"),
            Some(HardwareVariant::SingleOutput)
        );
        assert_eq!(HardwareVariant::from_name("triple"), None);
    }
}
