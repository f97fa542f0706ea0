//! Provisioning surface: scan, credential submission, status, factory reset.
//!
//! HTTP handlers run on their own event source and never touch the state
//! machines. They enqueue a [`PortalRequest`] through a [`PortalHandle`]; the
//! scheduler drains the queue during its portal step and answers through the
//! request's responder.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use log::{info, warn};
use serde::Deserialize;

use crate::arbiter::Arbiter;
use crate::broker::BrokerSession;
use crate::config::DEFAULT_MQTT_PORT;
use crate::error::ProvisioningError;
use crate::link::LinkManager;
use crate::ports::{BrokerTransport, Radio};
use crate::store::ConfigStore;
use crate::topics::{control_topic, data_topic};
use crate::types::{format_mac, BrokerIdentity, NetworkCredentials, ScannedNetwork, StatusSnapshot};

/// Delay between a successful submission and the restart it triggers.
pub const RESTART_DELAY_MS: u64 = 500;
/// A scan still running after this long is abandoned. Shorter than the HTTP
/// reply timeout so waiting callers get an answer.
pub const SCAN_TIMEOUT_MS: u64 = 4_000;
const MAX_REQUESTS_PER_TICK: usize = 8;

/// Fields posted by the setup page. Everything is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CredentialForm {
    pub ssid: String,
    pub ssid_manual: String,
    pub password: String,
    pub username: String,
    #[serde(rename = "edgeId")]
    pub edge_id: String,
    #[serde(rename = "mqttHost")]
    pub mqtt_host: String,
    #[serde(rename = "mqttPort")]
    pub mqtt_port: String,
    #[serde(rename = "mqttUser")]
    pub mqtt_user: String,
    #[serde(rename = "mqttPassword")]
    pub mqtt_password: String,
}

impl CredentialForm {
    /// The manual field wins over the dropdown when both are filled.
    pub fn effective_ssid(&self) -> &str {
        let manual = self.ssid_manual.trim();
        if manual.is_empty() {
            self.ssid.trim()
        } else {
            manual
        }
    }

    pub fn credentials(&self) -> Result<NetworkCredentials, ProvisioningError> {
        let ssid = self.effective_ssid();
        if ssid.is_empty() {
            return Err(ProvisioningError::EmptySsid);
        }
        let username = self.username.trim();
        Ok(NetworkCredentials {
            ssid: ssid.to_string(),
            password: self.password.clone(),
            enterprise_username: (!username.is_empty()).then(|| username.to_string()),
        })
    }

    /// `Ok(None)` when the broker section was left blank.
    pub fn broker_identity(&self) -> Result<Option<BrokerIdentity>, ProvisioningError> {
        let edge_id = self.edge_id.trim();
        let host = self.mqtt_host.trim();
        match (edge_id.is_empty(), host.is_empty()) {
            (true, true) => return Ok(None),
            (false, false) => {}
            _ => return Err(ProvisioningError::IncompleteBrokerIdentity),
        }

        let port = match self.mqtt_port.trim() {
            "" => DEFAULT_MQTT_PORT,
            raw => match raw.parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => return Err(ProvisioningError::InvalidBrokerPort),
            },
        };

        Ok(Some(BrokerIdentity {
            host: host.to_string(),
            port,
            client_id: edge_id.to_string(),
            username: self.mqtt_user.trim().to_string(),
            password: self.mqtt_password.clone(),
        }))
    }
}

pub type Responder<T> = Box<dyn FnOnce(T) + Send>;

pub enum PortalRequest {
    ListNetworks(Responder<Result<Vec<ScannedNetwork>, ProvisioningError>>),
    SubmitCredentials {
        form: CredentialForm,
        respond: Responder<Result<String, ProvisioningError>>,
    },
    Status(Responder<StatusSnapshot>),
    PortalPage(Responder<Option<Vec<ScannedNetwork>>>),
    FactoryReset(Responder<Result<(), ProvisioningError>>),
}

/// Cloneable sending side handed to the HTTP backend.
#[derive(Clone)]
pub struct PortalHandle {
    tx: Sender<PortalRequest>,
}

impl PortalHandle {
    /// False once the scheduler side is gone.
    pub fn send(&self, request: PortalRequest) -> bool {
        self.tx.send(request).is_ok()
    }
}

/// Callers parked until the running scan finishes.
enum ScanWaiter {
    List(Responder<Result<Vec<ScannedNetwork>, ProvisioningError>>),
    Page(Responder<Option<Vec<ScannedNetwork>>>),
}

pub struct ProvisioningPortal {
    rx: Receiver<PortalRequest>,
    tx: Sender<PortalRequest>,
    boot_ms: u64,
    last_scan: Vec<ScannedNetwork>,
    scan_started_ms: Option<u64>,
    scan_waiters: Vec<ScanWaiter>,
    restart_at_ms: Option<u64>,
}

impl ProvisioningPortal {
    pub fn new(boot_ms: u64) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            rx,
            tx,
            boot_ms,
            last_scan: Vec::new(),
            scan_started_ms: None,
            scan_waiters: Vec::new(),
            restart_at_ms: None,
        }
    }

    pub fn handle(&self) -> PortalHandle {
        PortalHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn last_scan(&self) -> &[ScannedNetwork] {
        &self.last_scan
    }

    pub fn restart_requested(&self, now_ms: u64) -> bool {
        self.restart_at_ms.is_some_and(|at| now_ms >= at)
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_started_ms.is_some()
    }

    /// Starts a scan and answers `respond` once it completes. Scan order is
    /// preserved; nothing is deduplicated or sorted.
    pub fn list_networks<R: Radio>(
        &mut self,
        link: &mut LinkManager<R>,
        now_ms: u64,
        respond: Responder<Result<Vec<ScannedNetwork>, ProvisioningError>>,
    ) {
        match self.start_scan(link, now_ms) {
            Ok(()) => self.scan_waiters.push(ScanWaiter::List(respond)),
            Err(err) => respond(Err(err)),
        }
    }

    /// Joins a running scan rather than starting a second one.
    fn start_scan<R: Radio>(
        &mut self,
        link: &mut LinkManager<R>,
        now_ms: u64,
    ) -> Result<(), ProvisioningError> {
        if !link.is_in_ap_mode() {
            return Err(ProvisioningError::NotInApMode);
        }
        if self.scan_started_ms.is_some() {
            return Ok(());
        }
        link.start_scan()
            .map_err(|err| ProvisioningError::ScanFailed(err.to_string()))?;
        self.scan_started_ms = Some(now_ms);
        Ok(())
    }

    /// Collects a finished scan and answers everyone waiting on it.
    fn poll_scan<R: Radio>(&mut self, link: &mut LinkManager<R>, now_ms: u64) -> bool {
        let Some(started_ms) = self.scan_started_ms else {
            return false;
        };

        let result = if !link.is_in_ap_mode() {
            Err(ProvisioningError::NotInApMode)
        } else {
            match link.poll_scan() {
                Some(Ok(networks)) => {
                    info!("portal: scan found {} networks", networks.len());
                    self.last_scan = networks.clone();
                    Ok(networks)
                }
                Some(Err(err)) => Err(ProvisioningError::ScanFailed(err.to_string())),
                None if now_ms.saturating_sub(started_ms) >= SCAN_TIMEOUT_MS => {
                    Err(ProvisioningError::ScanFailed("timed out".to_string()))
                }
                None => return false,
            }
        };
        if let Err(err) = &result {
            warn!("portal: {err}");
        }

        self.scan_started_ms = None;
        for waiter in std::mem::take(&mut self.scan_waiters) {
            match waiter {
                ScanWaiter::List(respond) => respond(result.clone()),
                ScanWaiter::Page(respond) => {
                    let page = match &result {
                        Err(ProvisioningError::NotInApMode) => None,
                        _ => Some(self.last_scan.clone()),
                    };
                    respond(page);
                }
            }
        }
        true
    }

    /// Validates and persists the form. The link manager picks the change up
    /// on its next tick; a restart follows shortly after.
    pub fn submit_credentials<R: Radio>(
        &mut self,
        form: &CredentialForm,
        link: &LinkManager<R>,
        store: &mut ConfigStore,
        now_ms: u64,
    ) -> Result<String, ProvisioningError> {
        if !link.is_in_ap_mode() {
            return Err(ProvisioningError::NotInApMode);
        }
        let credentials = form.credentials()?;
        let identity = form.broker_identity()?;

        store.submit_provisioning(&credentials, identity.as_ref())?;

        info!(
            "portal: credentials accepted for '{}', restarting in {} ms",
            credentials.ssid, RESTART_DELAY_MS
        );
        self.restart_at_ms = Some(now_ms + RESTART_DELAY_MS);
        Ok(credentials.ssid)
    }

    pub fn factory_reset(
        &mut self,
        store: &mut ConfigStore,
        now_ms: u64,
    ) -> Result<(), ProvisioningError> {
        store.factory_reset()?;
        warn!("portal: factory reset, restarting in {RESTART_DELAY_MS} ms");
        self.restart_at_ms = Some(now_ms + RESTART_DELAY_MS);
        Ok(())
    }

    pub fn current_status<R: Radio, T: BrokerTransport>(
        &self,
        link: &LinkManager<R>,
        broker: &BrokerSession<T>,
        arbiter: &Arbiter,
        store: &ConfigStore,
        now_ms: u64,
    ) -> StatusSnapshot {
        let identity = broker
            .identity()
            .cloned()
            .unwrap_or_else(|| store.broker_identity());
        StatusSnapshot {
            link: link.status(),
            broker: broker.state(),
            control_mode: arbiter.mode(),
            light_on: arbiter.light_on(),
            reading: arbiter.last_reading().copied(),
            local_address: link.local_address(),
            ap_ssid: link.ap_ssid().map(str::to_string),
            mac_address: format_mac(link.mac_address()),
            uptime_secs: now_ms.saturating_sub(self.boot_ms) / 1_000,
            target_ssid: store.credentials().ssid,
            broker_host: identity.host,
            broker_port: identity.port,
            data_topic: data_topic(&identity.client_id),
            control_topic: control_topic(&identity.client_id),
            client_id: identity.client_id,
            broker_username: identity.username,
        }
    }

    /// Answers queued requests and collects scan results. Returns true if
    /// anything was answered.
    pub fn update<R: Radio, T: BrokerTransport>(
        &mut self,
        link: &mut LinkManager<R>,
        broker: &BrokerSession<T>,
        arbiter: &Arbiter,
        store: &mut ConfigStore,
        now_ms: u64,
    ) -> bool {
        let mut handled = false;
        for _ in 0..MAX_REQUESTS_PER_TICK {
            let request = match self.rx.try_recv() {
                Ok(request) => request,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            };
            handled = true;

            match request {
                PortalRequest::ListNetworks(respond) => self.list_networks(link, now_ms, respond),
                PortalRequest::SubmitCredentials { form, respond } => {
                    let result = self.submit_credentials(&form, link, store, now_ms);
                    if let Err(err) = &result {
                        warn!("portal: submission rejected: {err}");
                    }
                    respond(result);
                }
                PortalRequest::Status(respond) => {
                    respond(self.current_status(link, broker, arbiter, store, now_ms));
                }
                PortalRequest::PortalPage(respond) => {
                    if !link.is_in_ap_mode() {
                        respond(None);
                        continue;
                    }
                    if !self.last_scan.is_empty() {
                        respond(Some(self.last_scan.clone()));
                        continue;
                    }
                    match self.start_scan(link, now_ms) {
                        Ok(()) => self.scan_waiters.push(ScanWaiter::Page(respond)),
                        Err(err) => {
                            warn!("portal: {err}");
                            respond(Some(Vec::new()));
                        }
                    }
                }
                PortalRequest::FactoryReset(respond) => {
                    respond(self.factory_reset(store, now_ms));
                }
            }
        }
        handled |= self.poll_scan(link, now_ms);
        handled
    }
}
