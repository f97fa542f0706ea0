use std::net::Ipv4Addr;

use log::{debug, info, warn};

use crate::error::NodeError;
use crate::ports::{Radio, RadioError};
use crate::store::ConfigStore;
use crate::types::{LinkStatus, NetworkCredentials, ScannedNetwork};

pub const CONNECT_TIMEOUT_MS: u64 = 30_000;
pub const RETRY_DELAY_MS: u64 = 10_000;
pub const STATUS_LOG_INTERVAL_MS: u64 = 10_000;

pub const AP_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 7, 1);
pub const AP_NAME_PREFIX: &str = "EnvMonitor";

/// Unique access point name built from the last three MAC bytes.
pub fn access_point_name(mac: [u8; 6]) -> String {
    format!(
        "{AP_NAME_PREFIX}-{:02X}{:02X}{:02X}",
        mac[3], mac[4], mac[5]
    )
}

/// Owns station association, the fallback access point, and retry timing.
pub struct LinkManager<R: Radio> {
    radio: R,
    status: LinkStatus,
    credentials: Option<NetworkCredentials>,
    attempt_started_ms: u64,
    failed_at_ms: u64,
    ap_ssid: Option<String>,
    last_status_log_ms: u64,
}

impl<R: Radio> LinkManager<R> {
    pub fn new(radio: R) -> Self {
        Self {
            radio,
            status: LinkStatus::Disconnected,
            credentials: None,
            attempt_started_ms: 0,
            failed_at_ms: 0,
            ap_ssid: None,
            last_status_log_ms: 0,
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    /// Station link is up. AP mode does not count.
    pub fn is_connected(&self) -> bool {
        self.status == LinkStatus::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.status == LinkStatus::Connecting
    }

    pub fn is_in_ap_mode(&self) -> bool {
        self.status == LinkStatus::ApMode
    }

    pub fn local_address(&self) -> Option<Ipv4Addr> {
        match self.status {
            LinkStatus::ApMode => Some(AP_ADDRESS),
            LinkStatus::Connected => self.radio.local_address(),
            _ => None,
        }
    }

    pub fn ap_ssid(&self) -> Option<&str> {
        self.ap_ssid.as_deref()
    }

    pub fn target_ssid(&self) -> &str {
        self.credentials
            .as_ref()
            .map(|creds| creds.ssid.as_str())
            .unwrap_or_default()
    }

    pub fn mac_address(&self) -> [u8; 6] {
        self.radio.mac_address()
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn start_scan(&mut self) -> Result<(), RadioError> {
        self.radio.start_scan()
    }

    pub fn poll_scan(&mut self) -> Option<Result<Vec<ScannedNetwork>, RadioError>> {
        self.radio.poll_scan()
    }

    /// Starts the access point when no credentials exist, otherwise begins a
    /// station association. Never waits for the outcome.
    pub fn connect(&mut self, store: &ConfigStore, now_ms: u64) -> Result<(), NodeError> {
        if matches!(self.status, LinkStatus::Connecting | LinkStatus::ApMode) {
            return Ok(());
        }

        let credentials = self
            .credentials
            .get_or_insert_with(|| store.credentials())
            .clone();

        if !credentials.is_configured() {
            return self.enter_ap_mode(now_ms);
        }

        match self.radio.begin_station(&credentials) {
            Ok(()) => {
                info!("link: associating with '{}'", credentials.ssid);
                self.attempt_started_ms = now_ms;
                self.last_status_log_ms = now_ms;
                self.set_status(LinkStatus::Connecting);
                Ok(())
            }
            Err(err) => {
                self.fail(now_ms);
                Err(NodeError::LinkConnectFailed(err.to_string()))
            }
        }
    }

    /// Advances the state machine. Returns true when the status changed.
    pub fn update(&mut self, store: &mut ConfigStore, now_ms: u64) -> bool {
        let before = self.status;

        if store.take_credentials_changed() {
            info!("link: credentials changed, restarting association");
            self.credentials = None;
            if self.status != LinkStatus::Disconnected {
                self.radio.disconnect();
                self.ap_ssid = None;
                self.set_status(LinkStatus::Disconnected);
            }
        }

        match self.status {
            LinkStatus::Disconnected => {
                if let Err(err) = self.connect(store, now_ms) {
                    err.report();
                }
            }
            LinkStatus::Connecting => {
                if self.radio.is_associated() {
                    self.set_status(LinkStatus::Connected);
                    if let Some(addr) = self.radio.local_address() {
                        info!("link: address {addr}");
                    }
                } else if now_ms.saturating_sub(self.attempt_started_ms) >= CONNECT_TIMEOUT_MS {
                    NodeError::LinkConnectFailed(format!(
                        "no association after {} s",
                        CONNECT_TIMEOUT_MS / 1_000
                    ))
                    .report();
                    self.radio.disconnect();
                    self.fail(now_ms);
                } else if now_ms.saturating_sub(self.last_status_log_ms) >= STATUS_LOG_INTERVAL_MS {
                    self.last_status_log_ms = now_ms;
                    debug!(
                        "link: still connecting to '{}' ({} s)",
                        self.target_ssid(),
                        now_ms.saturating_sub(self.attempt_started_ms) / 1_000
                    );
                }
            }
            LinkStatus::Connected => {
                if !self.radio.is_associated() {
                    warn!("link: association lost");
                    self.set_status(LinkStatus::Disconnected);
                }
            }
            LinkStatus::Failed => {
                if now_ms.saturating_sub(self.failed_at_ms) >= RETRY_DELAY_MS {
                    self.set_status(LinkStatus::Disconnected);
                }
            }
            LinkStatus::ApMode => {}
        }

        self.status != before
    }

    fn enter_ap_mode(&mut self, now_ms: u64) -> Result<(), NodeError> {
        let ssid = access_point_name(self.radio.mac_address());
        match self.radio.start_access_point(&ssid) {
            Ok(()) => {
                info!("link: no credentials, access point '{ssid}' at {AP_ADDRESS}");
                self.ap_ssid = Some(ssid);
                self.set_status(LinkStatus::ApMode);
                Ok(())
            }
            Err(err) => {
                self.fail(now_ms);
                Err(NodeError::LinkConnectFailed(format!(
                    "access point start failed: {err}"
                )))
            }
        }
    }

    fn fail(&mut self, now_ms: u64) {
        self.failed_at_ms = now_ms;
        self.set_status(LinkStatus::Failed);
    }

    fn set_status(&mut self, next: LinkStatus) {
        if self.status != next {
            info!("link: {} -> {}", self.status.as_str(), next.as_str());
            self.status = next;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Default)]
    pub(crate) struct FakeRadio {
        pub associated: bool,
        pub associate_on_begin: bool,
        pub station_attempts: Vec<String>,
        pub access_points: Vec<String>,
        pub disconnects: usize,
        pub networks: Vec<ScannedNetwork>,
        pub fail_scan: bool,
        /// Keeps a started scan running until cleared.
        pub hold_scan: bool,
        pub scans_started: usize,
        pub scan_running: bool,
    }

    impl Radio for FakeRadio {
        fn begin_station(&mut self, credentials: &NetworkCredentials) -> Result<(), RadioError> {
            self.station_attempts.push(credentials.ssid.clone());
            if self.associate_on_begin {
                self.associated = true;
            }
            Ok(())
        }

        fn start_access_point(&mut self, ssid: &str) -> Result<(), RadioError> {
            self.access_points.push(ssid.to_string());
            Ok(())
        }

        fn is_associated(&mut self) -> bool {
            self.associated
        }

        fn disconnect(&mut self) {
            self.disconnects += 1;
            self.associated = false;
        }

        fn start_scan(&mut self) -> Result<(), RadioError> {
            if self.fail_scan {
                return Err(RadioError::Busy);
            }
            self.scans_started += 1;
            self.scan_running = true;
            Ok(())
        }

        fn poll_scan(&mut self) -> Option<Result<Vec<ScannedNetwork>, RadioError>> {
            if !self.scan_running || self.hold_scan {
                return None;
            }
            self.scan_running = false;
            Some(Ok(self.networks.clone()))
        }

        fn local_address(&self) -> Option<Ipv4Addr> {
            self.associated.then_some(Ipv4Addr::new(10, 0, 0, 42))
        }

        fn mac_address(&self) -> [u8; 6] {
            [0x24, 0xdc, 0xc3, 0xa7, 0x36, 0xec]
        }
    }

    pub(crate) fn store_with_ssid(ssid: &str) -> ConfigStore {
        let mut store = ConfigStore::load(Box::new(MemoryBackend::default()));
        if !ssid.is_empty() {
            store
                .submit_credentials(&NetworkCredentials {
                    ssid: ssid.to_string(),
                    password: "secret".to_string(),
                    enterprise_username: None,
                })
                .unwrap();
            store.take_credentials_changed();
        }
        store
    }

    #[test]
    fn ap_name_uses_last_three_mac_bytes() {
        assert_eq!(
            access_point_name([0x24, 0xdc, 0xc3, 0xa7, 0x36, 0xec]),
            "EnvMonitor-A736EC"
        );
    }

    #[test]
    fn empty_ssid_enters_ap_mode_and_never_associates() {
        let mut store = store_with_ssid("");
        let mut link = LinkManager::new(FakeRadio::default());

        link.connect(&store, 0).unwrap();
        assert!(link.is_in_ap_mode());

        for now in (0..300_000).step_by(500) {
            link.update(&mut store, now);
            assert!(link.is_in_ap_mode());
        }

        assert!(link.radio().station_attempts.is_empty());
        assert_eq!(link.radio().access_points, vec!["EnvMonitor-A736EC".to_string()]);
        assert_eq!(link.local_address(), Some(AP_ADDRESS));
        assert!(!link.is_connected());
    }

    #[test]
    fn timeouts_always_lead_to_another_attempt() {
        let mut store = store_with_ssid("HomeNet");
        let mut link = LinkManager::new(FakeRadio::default());
        link.connect(&store, 0).unwrap();

        let mut failed_since: Option<u64> = None;
        for now in (0..=400_000).step_by(250) {
            link.update(&mut store, now);
            match (link.status(), failed_since) {
                (LinkStatus::Failed, None) => failed_since = Some(now),
                (LinkStatus::Failed, Some(since)) => {
                    assert!(now - since <= RETRY_DELAY_MS, "stuck in Failed since {since}");
                }
                _ => failed_since = None,
            }
        }

        // 30 s timeout + 10 s backoff per cycle.
        assert!(link.radio().station_attempts.len() >= 9);
        assert!(link
            .radio()
            .station_attempts
            .iter()
            .all(|ssid| ssid == "HomeNet"));
    }

    #[test]
    fn association_within_timeout_connects() {
        let mut store = store_with_ssid("HomeNet");
        let mut link = LinkManager::new(FakeRadio::default());
        link.connect(&store, 1_000).unwrap();
        assert!(link.is_connecting());

        link.radio_mut().associated = true;
        assert!(link.update(&mut store, 5_000));

        assert!(link.is_connected());
        assert_eq!(link.local_address(), Some(Ipv4Addr::new(10, 0, 0, 42)));
    }

    #[test]
    fn connect_while_connecting_does_not_start_second_attempt() {
        let store = store_with_ssid("HomeNet");
        let mut link = LinkManager::new(FakeRadio::default());

        link.connect(&store, 0).unwrap();
        link.connect(&store, 10).unwrap();

        assert_eq!(link.radio().station_attempts.len(), 1);
    }

    #[test]
    fn association_loss_reconnects() {
        let mut store = store_with_ssid("HomeNet");
        let mut link = LinkManager::new(FakeRadio {
            associate_on_begin: true,
            ..Default::default()
        });
        link.connect(&store, 0).unwrap();
        link.update(&mut store, 10);
        assert!(link.is_connected());

        link.radio_mut().associated = false;
        link.update(&mut store, 20);
        assert_eq!(link.status(), LinkStatus::Disconnected);

        link.update(&mut store, 30);
        link.update(&mut store, 40);
        assert!(link.is_connected());
        assert_eq!(link.radio().station_attempts.len(), 2);
    }

    #[test]
    fn credential_change_drops_access_point_and_retries_station() {
        let mut store = store_with_ssid("");
        let mut link = LinkManager::new(FakeRadio::default());
        link.connect(&store, 0).unwrap();
        assert!(link.is_in_ap_mode());

        store
            .submit_credentials(&NetworkCredentials {
                ssid: "HomeNet".into(),
                password: "secret".into(),
                enterprise_username: None,
            })
            .unwrap();
        link.update(&mut store, 100);

        assert!(link.is_connecting());
        assert_eq!(link.radio().disconnects, 1);
        assert_eq!(link.radio().station_attempts, vec!["HomeNet".to_string()]);
        assert_eq!(link.ap_ssid(), None);
    }
}
