use serde::Serialize;

use crate::schedule::ScheduleEntry;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub variant: &'static str,
    pub power: bool,
    pub usb: Option<bool>,
    #[serde(rename = "pdVoltage")]
    pub pd_voltage: u8,
    #[serde(rename = "measuredVbus")]
    pub measured_vbus: Option<f32>,
    #[serde(rename = "measuredVout")]
    pub measured_vout: Option<f32>,
    pub timezone: String,
    pub time: String,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    #[serde(rename = "lastSync")]
    pub last_sync: i32,
    #[serde(rename = "wifiConfigured")]
    pub wifi_configured: bool,
    #[serde(rename = "scheduleCount")]
    pub schedule_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleList {
    pub schedules: Vec<ScheduleEntry>,
}
