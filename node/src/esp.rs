use std::{
    net::Ipv4Addr,
    sync::{
        mpsc::{self, Receiver, Sender},
        OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context};
use dht_sensor::dht11;
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, Gpio39, InputOutput, Output, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals as Board},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    ipv4::{Configuration as IpConfiguration, Mask, RouterConfiguration, Subnet},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::EspError,
    wifi::{config::ScanConfig, EspWifi},
};
use log::{debug, info, warn};
use serde::Serialize;

use envmon_common::{
    link::AP_ADDRESS,
    pages::{portal_page, reset_page, status_page, submitted_page, CAPTIVE_PROBE_PATHS},
    portal::Responder,
    ports::render_lines,
    BrokerIdentity, BrokerTransport, ConfigBackend, ConfigStore, CredentialForm, DeviceReading,
    DisplayDriver, LedDriver, MemoryBackend, NetworkCredentials, NodeError, Peripherals,
    PortalHandle, PortalRequest, ProvisioningError, Radio, RadioError, RenderableState,
    ScannedNetwork, Scheduler, SensorConfig, SensorReader, StorageError, TransportError,
    TransportEvent,
};

const NVS_NAMESPACE: &str = "envmon";
const NVS_CONFIG_KEY: &str = "config_json";
const MAX_CONFIG_BYTES: usize = 4096;

const MAX_HTTP_BODY: usize = 4096;
const PORTAL_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(15);
/// The DHT11 needs about a second between conversions.
const DHT_MIN_INTERVAL_MS: u64 = 2_000;
const PHOTORESISTOR_GPIO: i32 = 39;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = match EspDefaultNvsPartition::take() {
        Ok(partition) => Some(partition),
        Err(err) => {
            warn!(
                "{}; settings will not survive a restart",
                NodeError::ConfigReadFailed(format!("nvs unavailable: {err}"))
            );
            None
        }
    };

    let backend: Box<dyn ConfigBackend> = match nvs_partition.clone() {
        Some(partition) => Box::new(NvsBackend { partition }),
        None => Box::new(MemoryBackend::default()),
    };
    let store = ConfigStore::load(backend);
    let sensor_config = store.config().sensor.clone();

    let Board {
        modem, pins, adc1, ..
    } = Board::take()?;

    let radio = EspRadio::new(modem, sys_loop, nvs_partition).context("wifi init failed")?;
    let sensor = EnvSensor::new(&sensor_config, adc1, pins.gpio39)
        .context("failed to initialize sensors")?;
    let led = GpioLed::new(sensor_config.led_pin)
        .with_context(|| format!("failed to initialize LED on GPIO{}", sensor_config.led_pin))?;

    let peripherals = Peripherals {
        sensor: Box::new(sensor),
        display: Some(Box::new(LogDisplay)),
        led: Box::new(led),
    };

    let mut scheduler = Scheduler::new(
        store,
        radio,
        EspTransport::default(),
        peripherals,
        monotonic_ms(),
    );

    // Keep the server alive for the program lifetime.
    let _server = create_http_server(scheduler.portal_handle())?;

    loop {
        let report = scheduler.tick(monotonic_ms());
        if report.restart_requested {
            info!("restarting");
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
        // Always yield at least one tick so the idle task can feed the watchdog.
        let delay = scheduler.idle_delay_ms(report).max(1);
        thread::sleep(Duration::from_millis(delay));
    }
}

struct EspRadio {
    wifi: EspWifi<'static>,
}

impl EspRadio {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: Option<EspDefaultNvsPartition>,
    ) -> anyhow::Result<Self> {
        let mut wifi = EspWifi::new(modem, sys_loop, nvs_partition)?;

        let ap_netif = EspNetif::new_with_conf(&NetifConfiguration {
            ip_configuration: Some(IpConfiguration::Router(RouterConfiguration {
                subnet: Subnet {
                    gateway: AP_ADDRESS,
                    mask: Mask(24),
                },
                dhcp_enabled: true,
                dns: Some(AP_ADDRESS),
                secondary_dns: None,
            })),
            ..NetifConfiguration::wifi_default_router()
        })
        .context("failed to create access point netif")?;
        wifi.swap_netif_ap(ap_netif)
            .context("failed to apply access point netif")?;

        Ok(Self { wifi })
    }

    fn restart_with(&mut self, configuration: &Configuration) -> Result<(), RadioError> {
        if self.wifi.is_started().unwrap_or(false) {
            self.wifi.stop().map_err(driver_error)?;
        }
        self.wifi
            .set_configuration(configuration)
            .map_err(driver_error)?;
        self.wifi.start().map_err(driver_error)
    }
}

impl Radio for EspRadio {
    fn begin_station(&mut self, credentials: &NetworkCredentials) -> Result<(), RadioError> {
        let enterprise = credentials.is_enterprise();
        let auth_method = if enterprise {
            AuthMethod::WPA2Enterprise
        } else if credentials.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        let password = if enterprise {
            Default::default()
        } else {
            credentials
                .password
                .as_str()
                .try_into()
                .map_err(|_| RadioError::Driver("wifi password too long".to_string()))?
        };

        self.restart_with(&Configuration::Client(ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| RadioError::Driver("wifi ssid too long".to_string()))?,
            password,
            auth_method,
            ..Default::default()
        }))?;

        if let Some(username) = credentials.enterprise_username.as_deref() {
            enable_enterprise(username, &credentials.password)?;
        }

        // Non-blocking: association is observed through `is_associated`.
        self.wifi.connect().map_err(driver_error)
    }

    fn start_access_point(&mut self, ssid: &str) -> Result<(), RadioError> {
        // Mixed mode keeps the station interface around for scanning.
        self.restart_with(&Configuration::Mixed(
            ClientConfiguration::default(),
            AccessPointConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| RadioError::Driver("access point ssid too long".to_string()))?,
                auth_method: AuthMethod::None,
                channel: 1,
                ..Default::default()
            },
        ))
    }

    fn is_associated(&mut self) -> bool {
        is_wifi_station_connected() && self.wifi.sta_netif().is_up().unwrap_or(false)
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.wifi.disconnect() {
            debug!("wifi disconnect: {err}");
        }
        if let Err(err) = self.wifi.stop() {
            debug!("wifi stop: {err}");
        }
    }

    fn start_scan(&mut self) -> Result<(), RadioError> {
        self.wifi
            .start_scan(&ScanConfig::default(), false)
            .map_err(driver_error)
    }

    fn poll_scan(&mut self) -> Option<Result<Vec<ScannedNetwork>, RadioError>> {
        match self.wifi.is_scan_done() {
            Ok(false) => return None,
            Ok(true) => {}
            Err(err) => return Some(Err(driver_error(err))),
        }
        let found = match self.wifi.get_scan_result() {
            Ok(found) => found,
            Err(err) => return Some(Err(driver_error(err))),
        };
        Some(Ok(found
            .into_iter()
            .map(|ap| ScannedNetwork {
                ssid: ap.ssid.to_string(),
                rssi_dbm: i32::from(ap.signal_strength),
                is_open: matches!(ap.auth_method, None | Some(AuthMethod::None)),
                is_enterprise: matches!(ap.auth_method, Some(AuthMethod::WPA2Enterprise)),
            })
            .collect()))
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.wifi
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
    }

    fn mac_address(&self) -> [u8; 6] {
        self.wifi.sta_netif().get_mac().unwrap_or_default()
    }
}

fn driver_error(err: EspError) -> RadioError {
    RadioError::Driver(err.to_string())
}

fn enable_enterprise(username: &str, password: &str) -> Result<(), RadioError> {
    let len = |value: &str| i32::try_from(value.len()).unwrap_or(i32::MAX);
    unsafe {
        EspError::convert(esp_idf_svc::sys::esp_eap_client_set_identity(
            username.as_ptr(),
            len(username),
        ))
        .map_err(driver_error)?;
        EspError::convert(esp_idf_svc::sys::esp_eap_client_set_username(
            username.as_ptr(),
            len(username),
        ))
        .map_err(driver_error)?;
        EspError::convert(esp_idf_svc::sys::esp_eap_client_set_password(
            password.as_ptr(),
            len(password),
        ))
        .map_err(driver_error)?;
        EspError::convert(esp_idf_svc::sys::esp_wifi_sta_enterprise_enable()).map_err(driver_error)
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

/// ESP-IDF MQTT client. The connection is drained on its own thread and
/// events are forwarded through a channel that `poll` reads without blocking.
#[derive(Default)]
struct EspTransport {
    client: Option<EspMqttClient<'static>>,
    events: Option<Receiver<TransportEvent>>,
}

impl EspTransport {
    fn client(&mut self) -> Result<&mut EspMqttClient<'static>, TransportError> {
        self.client.as_mut().ok_or(TransportError::NotConnected)
    }
}

impl BrokerTransport for EspTransport {
    fn begin_connect(&mut self, identity: &BrokerIdentity) -> Result<(), TransportError> {
        self.disconnect();

        let url = format!("mqtt://{}:{}", identity.host, identity.port);
        let conf = MqttClientConfiguration {
            client_id: Some(identity.client_id.as_str()),
            username: if identity.username.is_empty() {
                None
            } else {
                Some(identity.username.as_str())
            },
            password: if identity.password.is_empty() {
                None
            } else {
                Some(identity.password.as_str())
            },
            keep_alive_interval: Some(MQTT_KEEP_ALIVE),
            ..Default::default()
        };

        let (client, conn) = EspMqttClient::new(&url, &conf)
            .map_err(|err| TransportError::Io(format!("mqtt client: {err}")))?;

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("mqtt-rx".into())
            .stack_size(12 * 1024)
            .spawn(move || receive_loop(conn, tx))
            .map_err(|err| TransportError::Io(format!("mqtt thread: {err}")))?;

        self.client = Some(client);
        self.events = Some(rx);
        Ok(())
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        self.events.as_ref()?.try_recv().ok()
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), TransportError> {
        self.client()?
            .enqueue(topic, QoS::AtMostOnce, retain, payload)
            .map(|_| ())
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    fn disconnect(&mut self) {
        // Dropping the client closes the connection and ends the rx thread.
        self.client = None;
        self.events = None;
    }
}

fn receive_loop(mut conn: EspMqttConnection, tx: Sender<TransportEvent>) {
    loop {
        let event = match conn.next() {
            Ok(event) => match event.payload() {
                EventPayload::Connected(_) => TransportEvent::Connected,
                EventPayload::Disconnected => TransportEvent::Disconnected,
                EventPayload::Received {
                    topic: Some(topic),
                    data,
                    details: Details::Complete,
                    ..
                } => TransportEvent::Message {
                    topic: topic.to_string(),
                    payload: data.to_vec(),
                },
                _ => continue,
            },
            Err(err) => {
                debug!("mqtt connection closed: {err:?}");
                let _ = tx.send(TransportEvent::Disconnected);
                return;
            }
        };
        if tx.send(event).is_err() {
            return;
        }
    }
}

struct NvsBackend {
    partition: EspDefaultNvsPartition,
}

impl NvsBackend {
    fn open(&self) -> Result<EspNvs<esp_idf_svc::nvs::NvsDefault>, StorageError> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| StorageError::Unavailable(err.to_string()))
    }
}

impl ConfigBackend for NvsBackend {
    fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        let nvs = self.open()?;
        let mut buffer = vec![0_u8; MAX_CONFIG_BYTES];
        match nvs.get_str(NVS_CONFIG_KEY, &mut buffer) {
            Ok(value) => Ok(value.map(|text| text.as_bytes().to_vec())),
            Err(err) => Err(StorageError::Io(err.to_string())),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        let text = core::str::from_utf8(bytes).map_err(|err| StorageError::Io(err.to_string()))?;
        let mut nvs = self.open()?;
        nvs.set_str(NVS_CONFIG_KEY, text)
            .map_err(|err| StorageError::Io(err.to_string()))
    }
}

/// DHT11 for temperature/humidity, photoresistor on ADC1, heap counters for
/// the memory figures.
struct EnvSensor {
    dht_pin: PinDriver<'static, AnyIOPin, InputOutput>,
    light: AdcChannelDriver<'static, Gpio39, AdcDriver<'static, ADC1>>,
    delay: Ets,
    climate: Option<(f32, f32)>,
    last_dht_ms: Option<u64>,
}

impl EnvSensor {
    fn new(config: &SensorConfig, adc1: ADC1, light_pin: Gpio39) -> anyhow::Result<Self> {
        if config.dht_type != 11 {
            warn!("dht type {} is not supported, reading as DHT11", config.dht_type);
        }
        if config.photoresister_pin != PHOTORESISTOR_GPIO {
            warn!(
                "photoresistor is wired to GPIO{PHOTORESISTOR_GPIO}, ignoring configured GPIO{}",
                config.photoresister_pin
            );
        }

        let mut dht_pin = PinDriver::input_output_od(unsafe { AnyIOPin::new(config.dht_pin) })?;
        dht_pin.set_pull(Pull::Up)?;
        dht_pin.set_high()?;

        let adc = AdcDriver::new(adc1)?;
        let light = AdcChannelDriver::new(
            adc,
            light_pin,
            &AdcChannelConfig {
                attenuation: DB_11,
                ..Default::default()
            },
        )?;

        Ok(Self {
            dht_pin,
            light,
            delay: Ets,
            climate: None,
            last_dht_ms: None,
        })
    }

    fn read_climate(&mut self) -> Result<(f32, f32), NodeError> {
        let now = monotonic_ms();
        let due = self
            .last_dht_ms
            .map_or(true, |last| now.saturating_sub(last) >= DHT_MIN_INTERVAL_MS);
        if let (false, Some(climate)) = (due, self.climate) {
            return Ok(climate);
        }
        self.last_dht_ms = Some(now);

        self.dht_pin
            .set_high()
            .map_err(|err| NodeError::SensorReadFailed(format!("dht line: {err}")))?;
        let reading = dht11::blocking::read(&mut self.delay, &mut self.dht_pin)
            .map_err(|err| NodeError::SensorReadFailed(format!("dht11: {err:?}")))?;

        let climate = (
            f32::from(reading.temperature),
            f32::from(reading.relative_humidity),
        );
        self.climate = Some(climate);
        Ok(climate)
    }
}

impl SensorReader for EnvSensor {
    fn read(&mut self) -> Result<DeviceReading, NodeError> {
        let (temperature_c, humidity_pct) = self.read_climate()?;
        let light_raw = self
            .light
            .read_raw()
            .map_err(|err| NodeError::SensorReadFailed(format!("photoresistor: {err}")))?;

        Ok(DeviceReading {
            temperature_c,
            humidity_pct,
            light_raw: i32::from(light_raw),
            led_on: false,
            free_memory_bytes: unsafe { esp_idf_svc::sys::esp_get_free_heap_size() },
            lowest_free_memory_bytes: unsafe {
                esp_idf_svc::sys::esp_get_minimum_free_heap_size()
            },
        })
    }
}

struct GpioLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl GpioLed {
    fn new(pin: i32) -> anyhow::Result<Self> {
        let mut pin = PinDriver::output(unsafe { AnyOutputPin::new(pin) })?;
        pin.set_low()?;
        Ok(Self { pin })
    }
}

impl LedDriver for GpioLed {
    fn set(&mut self, on: bool) {
        let result = if on {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        if let Err(err) = result {
            warn!("led write failed: {err}");
        }
    }
}

/// No panel driver on this board revision; frames go to the log.
struct LogDisplay;

impl DisplayDriver for LogDisplay {
    fn show(&mut self, state: &RenderableState) {
        debug!("display: {}", render_lines(state).join(" | "));
    }
}

fn create_http_server(portal: PortalHandle) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for path in std::iter::once("/").chain(CAPTIVE_PROBE_PATHS.iter().copied()) {
        let portal = portal.clone();
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            match ask(&portal, PortalRequest::PortalPage)? {
                Some(networks) => write_html(req, 200, &portal_page(&networks)),
                None => {
                    let status = ask(&portal, PortalRequest::Status)?;
                    write_html(req, 200, &status_page(&status))
                }
            }
        })?;
    }

    {
        let portal = portal.clone();
        server.fn_handler::<anyhow::Error, _>("/scan", Method::Get, move |req| {
            match ask(&portal, PortalRequest::ListNetworks)? {
                Ok(networks) => write_json(req, &networks),
                Err(err) => write_provisioning_error(req, &err),
            }
        })?;
    }

    {
        let portal = portal.clone();
        server.fn_handler::<anyhow::Error, _>("/configure", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let form = parse_form(&body)?;
            let reply = ask(&portal, |respond| PortalRequest::SubmitCredentials {
                form,
                respond,
            })?;
            match reply {
                Ok(ssid) => write_html(req, 200, &submitted_page(&ssid)),
                Err(err) => write_provisioning_error(req, &err),
            }
        })?;
    }

    {
        let portal = portal.clone();
        server.fn_handler::<anyhow::Error, _>("/status", Method::Get, move |req| {
            let status = ask(&portal, PortalRequest::Status)?;
            let json = req.uri().contains("format=json")
                || req
                    .header("Accept")
                    .is_some_and(|accept| accept.contains("application/json"));
            if json {
                write_json(req, &status)
            } else {
                write_html(req, 200, &status_page(&status))
            }
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/reset", Method::Post, move |req| {
        match ask(&portal, PortalRequest::FactoryReset)? {
            Ok(()) => write_html(req, 200, reset_page()),
            Err(err) => write_provisioning_error(req, &err),
        }
    })?;

    Ok(server)
}

/// Hands a request to the scheduler and blocks the HTTP task until it answers.
fn ask<T, F>(portal: &PortalHandle, build: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(Responder<T>) -> PortalRequest,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let request = build(Box::new(move |value| {
        let _ = tx.send(value);
    }));
    if !portal.send(request) {
        bail!("scheduler is not running");
    }
    rx.recv_timeout(PORTAL_REPLY_TIMEOUT)
        .context("scheduler did not answer in time")
}

fn parse_form(body: &[u8]) -> anyhow::Result<CredentialForm> {
    let fields: serde_json::Map<String, serde_json::Value> = url::form_urlencoded::parse(body)
        .map(|(key, value)| (key.into_owned(), serde_json::Value::String(value.into_owned())))
        .collect();
    serde_json::from_value(serde_json::Value::Object(fields)).context("invalid setup form")
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_html(
    req: Request<&mut EspHttpConnection<'_>>,
    status: u16,
    html: &str,
) -> anyhow::Result<()> {
    req.into_response(status, None, &[("Content-Type", "text/html; charset=utf-8")])?
        .write_all(html.as_bytes())?;
    Ok(())
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

fn write_provisioning_error(
    req: Request<&mut EspHttpConnection<'_>>,
    err: &ProvisioningError,
) -> anyhow::Result<()> {
    warn!("portal: {err}");
    let body = serde_json::to_vec(&serde_json::json!({ "error": err.to_string() }))?;
    req.into_response(
        err.status_code(),
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
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
