use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{debug, info, warn};

use powerswitch_common::{
    config::check_station_ssid,
    hardware::{AnalogInputs, ButtonInputs, OutputLines, SettleDelay},
    output::pd_code,
    schedule::{parse_action, parse_time},
    store::{Storage, STORAGE_SIZE},
    testing::MockBoard,
    CommandError, Device, HardwareProfile, HardwareVariant, Line, OutputChannel, PdLine,
    ScheduleList, SenseChannel, SwitchTiming,
};

type HostDevice = Device<SimulatedBoard, FileStorage>;

#[derive(Clone)]
struct AppState {
    device: Arc<Mutex<HostDevice>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
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

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let variant = std::env::var("POWERSWITCH_VARIANT")
        .ok()
        .and_then(|name| {
            let variant = HardwareVariant::from_name(&name);
            if variant.is_none() {
                warn!("unknown POWERSWITCH_VARIANT {name:?}, using dual-output");
            }
            variant
        })
        .unwrap_or(HardwareVariant::DualOutput);
    let profile = variant.profile();

    let data_dir = std::env::var("POWERSWITCH_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.powerswitch"));
    let storage = FileStorage::open(data_dir.join("config.bin")).unwrap_or_else(|err| {
        warn!("failed to read stored config image: {err:#}");
        FileStorage::blank(data_dir.join("config.bin"))
    });

    let timing = SwitchTiming::default();
    let mut device = Device::new(profile, SimulatedBoard::new(profile), storage, timing);
    device.restore();
    device.record_time_sync(Utc::now().timestamp());

    let app_state = AppState {
        device: Arc::new(Mutex::new(device)),
    };

    spawn_control_loop(app_state.clone());

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/schedules", get(handle_get_schedules))
        .route("/api/power", post(handle_set_power))
        .route("/api/pd", post(handle_set_pd))
        .route("/api/schedule", post(handle_add_schedule))
        .route("/api/schedule/{index}", delete(handle_delete_schedule))
        .route("/api/timezone", post(handle_set_timezone))
        .route("/api/wifi", post(handle_set_wifi))
        .route("/api/sim/button/{index}", post(handle_press_button))
        .with_state(app_state);

    let port = std::env::var("POWERSWITCH_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind powerswitch server at {addr}"))?;

    info!("{} simulator listening on http://{addr}", profile.name);
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        let (tick_ms, resync_ms) = {
            let device = app_state.device.lock().await;
            let timing = device.timing();
            (timing.tick_interval_ms, timing.time_resync_interval_ms)
        };
        let mut interval = tokio::time::interval(Duration::from_millis(tick_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_resync_ms = monotonic_ms();

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();
            let now_secs = Utc::now().timestamp();

            let mut device = app_state.device.lock().await;
            device.tick(now_ms, now_secs);

            if now_ms.saturating_sub(last_resync_ms) >= resync_ms {
                last_resync_ms = now_ms;
                device.record_time_sync(now_secs);
            }
        }
    });
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.device.lock().await.status(Utc::now().timestamp());
    Json(status)
}

async fn handle_get_schedules(State(state): State<AppState>) -> impl IntoResponse {
    let schedules = state.device.lock().await.list_schedules().to_vec();
    Json(ScheduleList { schedules })
}

async fn handle_set_power(
    State(state): State<AppState>,
    Json(request): Json<PowerRequest>,
) -> Response {
    let mut device = state.device.lock().await;
    match request.channel {
        Some(channel) if !device.profile().has_output(channel) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("{} output not present on this board", channel.as_str()),
            );
        }
        Some(channel) => device.set_output(channel, request.state),
        None => device.set_all_outputs(request.state),
    }
    success_response()
}

async fn handle_set_pd(State(state): State<AppState>, Json(request): Json<PdRequest>) -> Response {
    let result = state
        .device
        .lock()
        .await
        .set_requested_voltage(request.voltage)
        .map(|_| ());
    command_response(result)
}

async fn handle_add_schedule(
    State(state): State<AppState>,
    Json(request): Json<ScheduleRequest>,
) -> Response {
    let parsed = parse_time(&request.time)
        .and_then(|time| parse_action(&request.action).map(|action| (time, action)));
    let result = match parsed {
        Ok((time, action)) => state.device.lock().await.add_schedule(time, action),
        Err(err) => Err(err),
    };
    command_response(result)
}

async fn handle_delete_schedule(
    State(state): State<AppState>,
    Path(index): Path<i32>,
) -> Response {
    let result = state.device.lock().await.remove_schedule(index);
    command_response(result)
}

async fn handle_set_timezone(
    State(state): State<AppState>,
    Json(request): Json<TimezoneRequest>,
) -> Response {
    let result = state.device.lock().await.set_timezone(&request.timezone);
    command_response(result)
}

async fn handle_set_wifi(
    State(state): State<AppState>,
    Json(request): Json<WifiRequest>,
) -> Response {
    if let Err(err) = check_station_ssid(&request.ssid) {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }
    let result = state
        .device
        .lock()
        .await
        .set_wifi_credentials(&request.ssid, &request.password);
    command_response(result)
}

async fn handle_press_button(
    State(state): State<AppState>,
    Path(index): Path<usize>,
) -> Response {
    let (bound, hold_ms) = {
        let device = state.device.lock().await;
        (
            index < device.profile().buttons.len(),
            device.timing().debounce_ms * 3,
        )
    };
    if !bound {
        return error_response(StatusCode::BAD_REQUEST, "Invalid button index");
    }

    state.device.lock().await.board_mut().press(index);
    tokio::time::sleep(Duration::from_millis(hold_ms)).await;
    state.device.lock().await.board_mut().release(index);
    success_response()
}

fn command_response(result: Result<(), CommandError>) -> Response {
    match result {
        Ok(()) => success_response(),
        Err(err) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

fn success_response() -> Response {
    Json(SuccessBody { success: true }).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
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

struct FileStorage {
    path: PathBuf,
    image: Vec<u8>,
}

impl FileStorage {
    fn open(path: PathBuf) -> std::io::Result<Self> {
        match std::fs::read(&path) {
            Ok(mut image) => {
                image.resize(STORAGE_SIZE, 0xFF);
                Ok(Self { path, image })
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::blank(path)),
            Err(err) => Err(err),
        }
    }

    fn blank(path: PathBuf) -> Self {
        Self {
            path,
            image: vec![0xFF; STORAGE_SIZE],
        }
    }

    fn range(&self, offset: usize, len: usize) -> std::io::Result<std::ops::Range<usize>> {
        offset
            .checked_add(len)
            .filter(|end| *end <= self.image.len())
            .map(|end| offset..end)
            .ok_or_else(|| {
                std::io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("{len} bytes at offset {offset} exceed the storage image"),
                )
            })
    }
}

impl Storage for FileStorage {
    type Error = std::io::Error;

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.image[range]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, data.len())?;
        self.image[range].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Self::Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, &self.image)
    }
}

struct SimulatedBoard {
    profile: &'static HardwareProfile,
    pins: MockBoard,
}

impl SimulatedBoard {
    fn new(profile: &'static HardwareProfile) -> Self {
        Self {
            profile,
            pins: MockBoard::new(),
        }
    }

    fn press(&mut self, index: usize) {
        self.pins.press(index);
    }

    fn release(&mut self, index: usize) {
        self.pins.release(index);
    }

    fn requested_volts(&self) -> f32 {
        let level = |line: PdLine| self.pins.level(Line::Pd(line)).unwrap_or(false);
        let lines = [level(PdLine::Cfg1), level(PdLine::Cfg2), level(PdLine::Cfg3)];
        self.profile
            .voltages
            .iter()
            .find(|volts| pd_code(**volts) == Some(lines))
            .map(|volts| f32::from(*volts))
            .unwrap_or(0.0)
    }

    fn output_on(&self) -> bool {
        self.profile.outputs.iter().any(|binding| {
            self.pins.level(Line::Output(binding.channel)) == Some(binding.polarity.level(true))
        })
    }
}

impl OutputLines for SimulatedBoard {
    fn drive(&mut self, line: Line, high: bool) {
        debug!("line {line:?} -> {}", if high { "HIGH" } else { "LOW" });
        self.pins.drive(line, high);
    }
}

impl ButtonInputs for SimulatedBoard {
    fn is_high(&mut self, index: usize) -> bool {
        self.pins.is_high(index)
    }
}

impl AnalogInputs for SimulatedBoard {
    fn read_raw(&mut self, channel: SenseChannel) -> u16 {
        let Some(calibration) = self.profile.calibration(channel) else {
            return 0;
        };
        let volts = match channel {
            SenseChannel::Vbus => self.requested_volts(),
            SenseChannel::Vout if self.output_on() => self.requested_volts(),
            SenseChannel::Vout => 0.0,
        };
        let adc_max = f32::from(calibration.adc_max);
        let raw = volts / calibration.divider_ratio / calibration.vref * adc_max;
        raw.round().clamp(0.0, adc_max) as u16
    }
}

impl SettleDelay for SimulatedBoard {
    fn settle(&mut self, duration: Duration) {
        debug!("settle {}ms (simulated)", duration.as_millis());
    }
}
