pub mod buttons;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod hardware;
pub mod output;
pub mod schedule;
pub mod sensor;
pub mod store;
pub mod testing;
pub mod types;

pub use buttons::ButtonInputMonitor;
pub use config::{DeviceConfig, SwitchTiming};
pub use device::Device;
pub use error::CommandError;
pub use hardware::{
    Board, ButtonAction, HardwareProfile, HardwareVariant, Line, OutputChannel, PdLine,
    SenseChannel,
};
pub use output::{PowerOutputController, VoltageChange};
pub use schedule::{ScheduleEngine, ScheduleEntry, ScheduleTable};
pub use sensor::{VoltageReading, VoltageSensor};
pub use store::{ConfigStore, LoadOutcome, Storage};
pub use types::{DeviceStatus, ScheduleList};
