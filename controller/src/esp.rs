use std::{
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    gpio::{AnyInputPin, AnyOutputPin, Gpio2, Gpio3, Input, Output, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::{EspSntp, SyncStatus},
    sys::EspError,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use powerswitch_common::{
    clock::FallbackClock,
    config::{check_station_ssid, STATION_SSID_MAX},
    hardware::{AnalogInputs, ButtonInputs, OutputLines, SettleDelay, MAX_BUTTONS},
    schedule::{parse_action, parse_time},
    store::{Storage, STORAGE_SIZE},
    CommandError, Device, DeviceConfig, HardwareVariant, Line, OutputChannel, ScheduleList,
    SenseChannel, SwitchTiming,
};

const NVS_NAMESPACE: &str = "powerswitch";
const NVS_RECORD_KEY: &str = "config_rec";
const MAX_HTTP_BODY: usize = 1024;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const RESTART_DELAY_MS: u64 = 1_000;

type EspDevice = Device<EspBoard, NvsStorage>;

#[derive(Clone)]
struct SharedState {
    device: Arc<Mutex<EspDevice>>,
    clock: Arc<Mutex<FallbackClock>>,
}

#[derive(Debug, Serialize)]
struct SuccessBody {
    success: bool,
}

#[derive(Debug, Deserialize)]
struct PowerRequest {
    state: bool,
    #[serde(default)]
    channel: Option<OutputChannel>,
}

#[derive(Debug, Deserialize)]
struct PdRequest {
    voltage: u8,
}

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    time: String,
    action: String,
}

#[derive(Debug, Deserialize)]
struct TimezoneRequest {
    timezone: String,
}

#[derive(Debug, Deserialize)]
struct WifiRequest {
    ssid: String,
    #[serde(default)]
    password: String,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { pins, modem, adc1, .. } = Peripherals::take()?;

    let profile = HardwareVariant::DualOutput.profile();
    let board = EspBoard::new(
        BoardPins {
            power: pins.gpio11.downgrade_output(),
            usb: pins.gpio10.downgrade_output(),
            cfg: [
                pins.gpio18.downgrade_output(),
                pins.gpio19.downgrade_output(),
                pins.gpio20.downgrade_output(),
            ],
            buttons: [
                pins.gpio4.downgrade_input(),
                pins.gpio5.downgrade_input(),
                pins.gpio6.downgrade_input(),
                pins.gpio7.downgrade_input(),
            ],
        },
        adc1,
        pins.gpio2,
        pins.gpio3,
    )
    .context("failed to initialize board I/O")?;
    let storage = NvsStorage::open(nvs_partition.clone()).context("failed to open NVS")?;

    let timing = SwitchTiming::default();
    let mut device = Device::new(profile, board, storage, timing);
    device.restore();

    let mut fallback = FallbackClock::new();
    if let Some(last_time) = device.fallback_clock() {
        fallback.anchor(last_time, monotonic_ms());
    }

    let network = Network::start(modem, sys_loop, nvs_partition, device.config())
        .unwrap_or_else(|err| {
            warn!("wifi unavailable, running offline: {err:#}");
            None
        });

    let state = SharedState {
        device: Arc::new(Mutex::new(device)),
        clock: Arc::new(Mutex::new(fallback)),
    };

    let server = create_http_server(state.clone())?;
    spawn_control_loop(state, network);

    // Keep the server alive for the program lifetime.
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn spawn_control_loop(state: SharedState, mut network: Option<Network>) {
    let spawned = thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            let timing = lock(&state.device).timing().clone();
            let mut last_resync_ms: Option<u64> = None;

            loop {
                let now_ms = monotonic_ms();
                let now_secs = wall_clock_secs(&state, &timing);
                let synced = network.as_ref().is_some_and(Network::time_synced);

                {
                    let mut device = lock(&state.device);
                    device.tick(now_ms, now_secs);

                    let resync_due = last_resync_ms.map_or(true, |last| {
                        now_ms.saturating_sub(last) >= timing.time_resync_interval_ms
                    });
                    if resync_due && synced {
                        let system_secs = system_epoch_secs();
                        if device.record_time_sync(system_secs) {
                            last_resync_ms = Some(now_ms);
                            lock(&state.clock).anchor(system_secs, now_ms);
                        }
                    }
                }

                if let Some(network) = network.as_mut() {
                    network.maintain(now_ms, &timing);
                }

                thread::sleep(Duration::from_millis(timing.tick_interval_ms));
            }
        });

    if let Err(err) = spawned {
        warn!("failed to spawn control loop thread: {err}");
    }
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let timing = lock(&state.device).timing().clone();
            let now_secs = wall_clock_secs(&state, &timing);
            let status = lock(&state.device).status(now_secs);
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/schedules", Method::Get, move |req| {
            let schedules = lock(&state.device).list_schedules().to_vec();
            write_json(req, &ScheduleList { schedules })
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/power", Method::Post, move |mut req| {
            let Ok(request) = read_json::<PowerRequest>(&mut req) else {
                return write_error(req, 400, "Invalid JSON");
            };
            let mut device = lock(&state.device);
            match request.channel {
                Some(channel) if !device.profile().has_output(channel) => {
                    drop(device);
                    return write_error(req, 400, "Output not present on this board");
                }
                Some(channel) => device.set_output(channel, request.state),
                None => device.set_all_outputs(request.state),
            }
            drop(device);
            write_json(req, &SuccessBody { success: true })
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/pd", Method::Post, move |mut req| {
            let Ok(request) = read_json::<PdRequest>(&mut req) else {
                return write_error(req, 400, "Invalid JSON");
            };
            let result = lock(&state.device)
                .set_requested_voltage(request.voltage)
                .map(|_| ());
            write_command_result(req, result)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/schedule", Method::Post, move |mut req| {
            let Ok(request) = read_json::<ScheduleRequest>(&mut req) else {
                return write_error(req, 400, "Invalid JSON");
            };
            let result = parse_time(&request.time)
                .and_then(|time| parse_action(&request.action).map(|action| (time, action)))
                .and_then(|(time, action)| lock(&state.device).add_schedule(time, action));
            write_command_result(req, result)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/schedule/*", Method::Delete, move |req| {
            let index = req
                .uri()
                .rsplit('/')
                .next()
                .and_then(|segment| segment.parse::<i32>().ok());
            let Some(index) = index else {
                return write_error(req, 400, "Invalid schedule index");
            };
            let result = lock(&state.device).remove_schedule(index);
            write_command_result(req, result)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/timezone", Method::Post, move |mut req| {
            let Ok(request) = read_json::<TimezoneRequest>(&mut req) else {
                return write_error(req, 400, "Invalid JSON");
            };
            let result = lock(&state.device).set_timezone(&request.timezone);
            write_command_result(req, result)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/wifi", Method::Post, move |mut req| {
            let Ok(request) = read_json::<WifiRequest>(&mut req) else {
                return write_error(req, 400, "Invalid JSON");
            };
            if let Err(err) = check_station_ssid(&request.ssid) {
                return write_error(req, 400, &err.to_string());
            }
            let result =
                lock(&state.device).set_wifi_credentials(&request.ssid, &request.password);
            let accepted = result.is_ok();
            write_command_result(req, result)?;
            if accepted {
                schedule_restart();
            }
            Ok(())
        })?;
    }

    Ok(server)
}

fn read_json<T: serde::de::DeserializeOwned>(
    req: &mut Request<&mut EspHttpConnection<'_>>,
) -> anyhow::Result<T> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(serde_json::from_slice(&body)?)
}

fn write_json<T: Serialize>(
    req: Request<&mut EspHttpConnection<'_>>,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: Request<&mut EspHttpConnection<'_>>,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_command_result(
    req: Request<&mut EspHttpConnection<'_>>,
    result: Result<(), CommandError>,
) -> anyhow::Result<()> {
    match result {
        Ok(()) => write_json(req, &SuccessBody { success: true }),
        Err(err) => write_error(req, 400, &err.to_string()),
    }
}

struct Network {
    wifi: BlockingWifi<EspWifi<'static>>,
    sntp: Option<EspSntp<'static>>,
    last_attempt_ms: u64,
}

impl Network {
    // Ok(None) when no credentials are stored.
    fn start(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
        config: &DeviceConfig,
    ) -> anyhow::Result<Option<Self>> {
        if !config.has_wifi_credentials() {
            warn!("wifi credentials missing, skipping network startup");
            return Ok(None);
        }
        let ssid = config.ssid.to_string_lossy();
        let password = config.password.to_string_lossy();

        let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
        let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: ssid
                .as_ref()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid longer than {STATION_SSID_MAX} bytes"))?,
            password: password
                .as_ref()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        }))?;

        wifi.start()?;
        info!("wifi started, connecting to `{ssid}`");

        let mut network = Self {
            wifi,
            sntp: None,
            last_attempt_ms: monotonic_ms(),
        };
        for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
            if network.connect() {
                break;
            }
            if attempt < WIFI_CONNECT_ATTEMPTS {
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            } else {
                warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed, retrying in background");
            }
        }
        Ok(Some(network))
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    fn connect(&mut self) -> bool {
        self.last_attempt_ms = monotonic_ms();
        match self.wifi.connect().and_then(|()| self.wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected");
                self.start_sntp();
                true
            }
            Err(err) => {
                warn!("wifi connect failed: {err}");
                let _ = self.wifi.disconnect();
                false
            }
        }
    }

    fn start_sntp(&mut self) {
        if self.sntp.is_some() {
            return;
        }
        match EspSntp::new_default() {
            Ok(sntp) => {
                info!("SNTP initialized");
                self.sntp = Some(sntp);
            }
            Err(err) => warn!("failed to start SNTP: {err}"),
        }
    }

    fn maintain(&mut self, now_ms: u64, timing: &SwitchTiming) {
        if self.is_connected() || !timing.wifi_retry_due(self.last_attempt_ms, now_ms) {
            return;
        }
        info!("wifi offline, reconnecting");
        self.connect();
    }

    fn time_synced(&self) -> bool {
        self.sntp
            .as_ref()
            .is_some_and(|sntp| sntp.get_sync_status() == SyncStatus::Completed)
    }
}

fn schedule_restart() {
    info!("restarting to apply wifi settings");
    let spawned = thread::Builder::new()
        .name("restart".into())
        .stack_size(4 * 1024)
        .spawn(|| {
            thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
            esp_idf_svc::hal::reset::restart();
        });
    if let Err(err) = spawned {
        warn!("failed to schedule restart: {err}");
    }
}

struct BoardPins {
    power: AnyOutputPin,
    usb: AnyOutputPin,
    cfg: [AnyOutputPin; 3],
    buttons: [AnyInputPin; MAX_BUTTONS],
}

type SenseAdc = AdcDriver<'static, ADC1>;

struct EspBoard {
    power: PinDriver<'static, AnyOutputPin, Output>,
    usb: PinDriver<'static, AnyOutputPin, Output>,
    cfg: [PinDriver<'static, AnyOutputPin, Output>; 3],
    buttons: Vec<PinDriver<'static, AnyInputPin, Input>>,
    adc: &'static SenseAdc,
    vbus: AdcChannelDriver<'static, Gpio2, &'static SenseAdc>,
    vout: AdcChannelDriver<'static, Gpio3, &'static SenseAdc>,
}

impl EspBoard {
    fn new(pins: BoardPins, adc1: ADC1, vbus: Gpio2, vout: Gpio3) -> anyhow::Result<Self> {
        let [cfg1, cfg2, cfg3] = pins.cfg;
        let mut buttons = Vec::with_capacity(MAX_BUTTONS);
        for pin in pins.buttons {
            let mut driver = PinDriver::input(pin)?;
            driver.set_pull(Pull::Up)?;
            buttons.push(driver);
        }

        // The channel drivers borrow the ADC for the program lifetime.
        let adc: &'static SenseAdc = Box::leak(Box::new(AdcDriver::new(adc1)?));
        let channel_config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };

        Ok(Self {
            power: PinDriver::output(pins.power)?,
            usb: PinDriver::output(pins.usb)?,
            cfg: [
                PinDriver::output(cfg1)?,
                PinDriver::output(cfg2)?,
                PinDriver::output(cfg3)?,
            ],
            buttons,
            adc,
            vbus: AdcChannelDriver::new(adc, vbus, &channel_config)?,
            vout: AdcChannelDriver::new(adc, vout, &channel_config)?,
        })
    }
}

impl OutputLines for EspBoard {
    fn drive(&mut self, line: Line, high: bool) {
        let pin = match line {
            Line::Output(OutputChannel::Power) => &mut self.power,
            Line::Output(OutputChannel::Usb) => &mut self.usb,
            Line::Pd(cfg) => &mut self.cfg[cfg.index()],
        };
        if let Err(err) = pin.set_level(high.into()) {
            warn!("failed to drive {line:?}: {err}");
        }
    }
}

impl ButtonInputs for EspBoard {
    fn is_high(&mut self, index: usize) -> bool {
        self.buttons.get(index).map_or(true, |pin| pin.is_high())
    }
}

impl AnalogInputs for EspBoard {
    fn read_raw(&mut self, channel: SenseChannel) -> u16 {
        let result = match channel {
            SenseChannel::Vbus => self.adc.read_raw(&mut self.vbus),
            SenseChannel::Vout => self.adc.read_raw(&mut self.vout),
        };
        result.unwrap_or_else(|err| {
            warn!("failed to sample {}: {err}", channel.as_str());
            0
        })
    }
}

impl SettleDelay for EspBoard {
    fn settle(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

struct NvsStorage {
    nvs: EspNvs<NvsDefault>,
    image: Vec<u8>,
}

impl NvsStorage {
    fn open(partition: EspDefaultNvsPartition) -> Result<Self, EspError> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)?;
        let mut image = vec![0xFF_u8; STORAGE_SIZE];
        let mut buffer = vec![0_u8; STORAGE_SIZE];
        if let Some(stored) = nvs.get_raw(NVS_RECORD_KEY, &mut buffer)? {
            let len = stored.len().min(STORAGE_SIZE);
            image[..len].copy_from_slice(&stored[..len]);
        }
        Ok(Self { nvs, image })
    }
}

#[derive(Debug, thiserror::Error)]
enum NvsStorageError {
    #[error("{len} bytes at offset {offset} exceed the record region")]
    OutOfRange { offset: usize, len: usize },
    #[error(transparent)]
    Nvs(#[from] EspError),
}

impl Storage for NvsStorage {
    type Error = NvsStorageError;

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), Self::Error> {
        let end = offset
            .checked_add(buf.len())
            .filter(|end| *end <= self.image.len())
            .ok_or(NvsStorageError::OutOfRange {
                offset,
                len: buf.len(),
            })?;
        buf.copy_from_slice(&self.image[offset..end]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Self::Error> {
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= self.image.len())
            .ok_or(NvsStorageError::OutOfRange {
                offset,
                len: data.len(),
            })?;
        self.image[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Self::Error> {
        self.nvs.set_raw(NVS_RECORD_KEY, &self.image)?;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn wall_clock_secs(state: &SharedState, timing: &SwitchTiming) -> i64 {
    let system_secs = system_epoch_secs();
    if timing.is_clock_valid(system_secs) {
        return system_secs;
    }
    lock(&state.clock).now(monotonic_ms())
}

fn system_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
