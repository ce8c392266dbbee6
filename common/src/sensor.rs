use serde::Serialize;

use crate::hardware::{AdcCalibration, AnalogInputs, HardwareProfile, SenseChannel};

pub fn convert(raw: u16, calibration: &AdcCalibration) -> f32 {
    let adc_volts = raw as f32 * calibration.vref / calibration.adc_max as f32;
    adc_volts * calibration.divider_ratio
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VoltageReading {
    pub channel: SenseChannel,
    pub volts: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct VoltageSensor<'p> {
    profile: &'p HardwareProfile,
}

impl<'p> VoltageSensor<'p> {
    pub fn new(profile: &'p HardwareProfile) -> Self {
        Self { profile }
    }

    pub fn read<A: AnalogInputs + ?Sized>(
        &self,
        inputs: &mut A,
        channel: SenseChannel,
    ) -> Option<VoltageReading> {
        let calibration = self.profile.calibration(channel)?;
        let raw = inputs.read_raw(channel);
        Some(VoltageReading {
            channel,
            volts: convert(raw, &calibration),
        })
    }

    pub fn read_all<A: AnalogInputs + ?Sized>(&self, inputs: &mut A) -> Vec<VoltageReading> {
        self.profile
            .sense
            .iter()
            .map(|binding| VoltageReading {
                channel: binding.channel,
                volts: convert(inputs.read_raw(binding.channel), &binding.calibration),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBoard;

    #[test]
    fn converts_with_reference_and_divider() {
        let calibration = AdcCalibration {
            adc_max: 4095,
            vref: 3.3,
            divider_ratio: 10.216,
        };

        for raw in [0_u16, 1, 1024, 2047, 4095] {
            let expected = raw as f32 * 3.3 / 4095.0 * 10.216;
            assert!((convert(raw, &calibration) - expected).abs() < 1e-4);
        }
        assert!((convert(4095, &calibration) - 33.7128).abs() < 1e-3);
    }

    #[test]
    fn reads_only_wired_channels() {
        let mut board = MockBoard::new();
        board.set_adc(SenseChannel::Vbus, 1023);
        board.set_adc(SenseChannel::Vout, 1023);
        let sensor = VoltageSensor::new(&HardwareProfile::SINGLE_OUTPUT);

        let vbus = sensor.read(&mut board, SenseChannel::Vbus).unwrap();
        assert!((vbus.volts - 3.3 * 10.216).abs() < 1e-3);
        assert!(sensor.read(&mut board, SenseChannel::Vout).is_none());
        assert_eq!(sensor.read_all(&mut board).len(), 1);
    }
}
