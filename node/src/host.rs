use std::{
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock, PoisonError,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use tokio::{net::TcpListener, runtime::Handle};
use tracing::{debug, info};

use envmon_common::{
    ports::render_lines, ConfigBackend, ConfigStore, DeviceReading, DisplayDriver, LedDriver,
    NetworkCredentials, NodeConfig, NodeError, Peripherals, Radio, RadioError, RenderableState,
    ScannedNetwork, Scheduler, SensorReader, StorageError,
};

use crate::{
    http::{self, PortalSlot},
    mqtt::MqttTransport,
};

/// Simulated association delay after `begin_station`.
const SIM_ASSOCIATE_MS: u64 = 1_000;
const SIM_SCAN_MS: u64 = 300;
/// Simulated ambient light flips every this many readings.
const SIM_LIGHT_PERIOD: u64 = 150;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("ENVMON_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.envmon"));
    let portal = PortalSlot::default();
    let shutdown = Arc::new(AtomicBool::new(false));

    let port = std::env::var("ENVMON_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind portal server at {addr}"))?;
    info!("portal listening on http://{addr}");

    let app = http::router(portal.clone());
    let server = async move { axum::serve(listener, app).await };

    let runtime = Handle::current();
    let node_shutdown = shutdown.clone();
    let node = tokio::task::spawn_blocking(move || {
        run_node(data_dir, runtime, portal, node_shutdown);
    });

    tokio::select! {
        result = server => result.context("portal server failed")?,
        result = node => result.context("node loop panicked")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    shutdown.store(true, Ordering::Relaxed);
    Ok(())
}

/// Runs the scheduler on a blocking thread. A provisioning restart rebuilds
/// every component from the stored config, like a reboot would.
fn run_node(data_dir: PathBuf, runtime: Handle, portal: PortalSlot, shutdown: Arc<AtomicBool>) {
    let config_path = data_dir.join("config.json");

    loop {
        let mut store = ConfigStore::load(Box::new(FileBackend::new(config_path.clone())));
        store.overlay(|config| apply_overrides(config, |key| std::env::var(key).ok()));

        let peripherals = Peripherals {
            sensor: Box::new(SimSensor::default()),
            display: Some(Box::new(LogDisplay)),
            led: Box::new(LogLed),
        };
        let mut scheduler = Scheduler::new(
            store,
            SimRadio::new(),
            MqttTransport::new(runtime.clone()),
            peripherals,
            monotonic_ms(),
        );
        *portal.lock().unwrap_or_else(PoisonError::into_inner) = Some(scheduler.portal_handle());
        info!("node started");

        loop {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            let report = scheduler.tick(monotonic_ms());
            if report.restart_requested {
                break;
            }
            match scheduler.idle_delay_ms(report) {
                0 => std::thread::yield_now(),
                delay => std::thread::sleep(Duration::from_millis(delay)),
            }
        }

        *portal.lock().unwrap_or_else(PoisonError::into_inner) = None;
        info!("restarting node");
    }
}

/// Settings from the environment win over the stored document for this run
/// only. A `WIFI_SSID` override therefore also suppresses AP mode.
fn apply_overrides(config: &mut NodeConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(ssid) = lookup("WIFI_SSID") {
        config.wifi.ssid = ssid;
        config.wifi.password = lookup("WIFI_PASS").unwrap_or_default();
    }
    if let Some(host) = lookup("MQTT_HOST") {
        config.mqtt.broker = host;
    }
    if let Some(port) = lookup("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.mqtt.port = port;
    }
    if let Some(user) = lookup("MQTT_USER") {
        config.mqtt.username = user;
        config.mqtt.password = lookup("MQTT_PASS").unwrap_or_default();
    }
    if let Some(edge_id) = lookup("ENVMON_EDGE_ID") {
        config.mqtt.edge_id = edge_id;
    }
}

struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ConfigBackend for FileBackend {
    fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        match std::fs::read(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Io(err.to_string())),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| StorageError::Io(err.to_string()))?;
        }
        std::fs::write(&self.path, bytes).map_err(|err| StorageError::Io(err.to_string()))
    }
}

/// Pretends to be a WiFi radio: any non-empty SSID associates after a short
/// delay, and scans return a fixed list after a short delay.
struct SimRadio {
    station_since_ms: Option<u64>,
    scan_since_ms: Option<u64>,
}

impl SimRadio {
    fn new() -> Self {
        Self {
            station_since_ms: None,
            scan_since_ms: None,
        }
    }

    fn associated(&self) -> bool {
        self.station_since_ms
            .is_some_and(|since| monotonic_ms().saturating_sub(since) >= SIM_ASSOCIATE_MS)
    }
}

impl Radio for SimRadio {
    fn begin_station(&mut self, credentials: &NetworkCredentials) -> Result<(), RadioError> {
        if !credentials.is_configured() {
            return Err(RadioError::Driver("empty ssid".to_string()));
        }
        debug!("sim radio: associating with '{}'", credentials.ssid);
        self.station_since_ms = Some(monotonic_ms());
        Ok(())
    }

    fn start_access_point(&mut self, ssid: &str) -> Result<(), RadioError> {
        debug!("sim radio: access point '{ssid}' up");
        self.station_since_ms = None;
        Ok(())
    }

    fn is_associated(&mut self) -> bool {
        self.associated()
    }

    fn disconnect(&mut self) {
        self.station_since_ms = None;
    }

    fn start_scan(&mut self) -> Result<(), RadioError> {
        self.scan_since_ms = Some(monotonic_ms());
        Ok(())
    }

    fn poll_scan(&mut self) -> Option<Result<Vec<ScannedNetwork>, RadioError>> {
        let since = self.scan_since_ms?;
        if monotonic_ms().saturating_sub(since) < SIM_SCAN_MS {
            return None;
        }
        self.scan_since_ms = None;
        Some(Ok(vec![
            ScannedNetwork {
                ssid: "HomeNet".into(),
                rssi_dbm: -52,
                is_open: false,
                is_enterprise: false,
            },
            ScannedNetwork {
                ssid: "Office-8021X".into(),
                rssi_dbm: -67,
                is_open: false,
                is_enterprise: true,
            },
            ScannedNetwork {
                ssid: "Guest".into(),
                rssi_dbm: -80,
                is_open: true,
                is_enterprise: false,
            },
        ]))
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.associated().then_some(Ipv4Addr::LOCALHOST)
    }

    fn mac_address(&self) -> [u8; 6] {
        [0x02, 0x45, 0x4e, 0x56, 0x00, 0x01]
    }
}

#[derive(Default)]
struct SimSensor {
    reads: u64,
    lowest_free: Option<u32>,
}

impl SensorReader for SimSensor {
    fn read(&mut self) -> Result<DeviceReading, NodeError> {
        self.reads = self.reads.saturating_add(1);
        let step = self.reads / 50;

        let free = 180_000 - (self.reads % 16) as u32 * 64;
        let lowest = self.lowest_free.map_or(free, |lowest| lowest.min(free));
        self.lowest_free = Some(lowest);

        Ok(DeviceReading {
            temperature_c: 22.0 + (step % 10) as f32 * 0.1,
            humidity_pct: 45.0 + (step % 6) as f32 * 0.5,
            light_raw: if (self.reads / SIM_LIGHT_PERIOD) % 2 == 0 {
                1_800
            } else {
                400
            },
            led_on: false,
            free_memory_bytes: free,
            lowest_free_memory_bytes: lowest,
        })
    }
}

struct LogDisplay;

impl DisplayDriver for LogDisplay {
    fn show(&mut self, state: &RenderableState) {
        let stamp = chrono::Local::now().format("%H:%M:%S");
        debug!("display [{stamp}] {}", render_lines(state).join(" | "));
    }
}

struct LogLed;

impl LedDriver for LogLed {
    fn set(&mut self, on: bool) {
        info!("led {}", if on { "on" } else { "off" });
    }
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
