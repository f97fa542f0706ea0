use log::info;

use crate::arbiter::{Arbiter, ArbiterAction};
use crate::broker::BrokerSession;
use crate::link::LinkManager;
use crate::portal::{PortalHandle, ProvisioningPortal};
use crate::ports::{BrokerTransport, DisplayDriver, LedDriver, Radio, SensorReader};
use crate::store::ConfigStore;
use crate::types::StatusSnapshot;

pub const HEARTBEAT_INTERVAL_MS: u64 = 60_000;
pub const IDLE_DELAY_MS: u64 = 50;
pub const AP_IDLE_DELAY_MS: u64 = 10;

/// Local peripherals. A missing display means the node runs headless.
pub struct Peripherals {
    pub sensor: Box<dyn SensorReader>,
    pub display: Option<Box<dyn DisplayDriver>>,
    pub led: Box<dyn LedDriver>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub activity: bool,
    pub restart_requested: bool,
}

/// Cooperative loop body. Polls Link, Portal, Broker, then Arbiter.
pub struct Scheduler<R: Radio, T: BrokerTransport> {
    store: ConfigStore,
    link: LinkManager<R>,
    portal: ProvisioningPortal,
    broker: BrokerSession<T>,
    arbiter: Arbiter,
    peripherals: Peripherals,

    reading_interval_ms: u64,
    last_sensor_poll_ms: Option<u64>,
    last_heartbeat_ms: u64,
    sensor_failing: bool,
}

impl<R: Radio, T: BrokerTransport> Scheduler<R, T> {
    pub fn new(
        store: ConfigStore,
        radio: R,
        transport: T,
        mut peripherals: Peripherals,
        now_ms: u64,
    ) -> Self {
        let sensor_config = store.config().sensor.clone();
        peripherals.led.set(false);

        let mut link = LinkManager::new(radio);
        if let Err(err) = link.connect(&store, now_ms) {
            err.report();
        }

        if peripherals.display.is_none() {
            info!("scheduler: running headless");
        }

        Self {
            store,
            link,
            portal: ProvisioningPortal::new(now_ms),
            broker: BrokerSession::new(transport),
            arbiter: Arbiter::new(&sensor_config),
            peripherals,
            reading_interval_ms: sensor_config.sensor_reading_interval,
            last_sensor_poll_ms: None,
            last_heartbeat_ms: now_ms,
            sensor_failing: false,
        }
    }

    pub fn portal_handle(&self) -> PortalHandle {
        self.portal.handle()
    }

    pub fn link(&self) -> &LinkManager<R> {
        &self.link
    }

    pub fn broker(&self) -> &BrokerSession<T> {
        &self.broker
    }

    pub fn arbiter(&self) -> &Arbiter {
        &self.arbiter
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn status(&self, now_ms: u64) -> StatusSnapshot {
        self.portal
            .current_status(&self.link, &self.broker, &self.arbiter, &self.store, now_ms)
    }

    pub fn tick(&mut self, now_ms: u64) -> TickReport {
        let mut activity = self.link.update(&mut self.store, now_ms);

        activity |= self.portal.update(
            &mut self.link,
            &self.broker,
            &self.arbiter,
            &mut self.store,
            now_ms,
        );

        let before = self.broker.state();
        let commands = self
            .broker
            .update(self.link.is_connected(), &self.store, now_ms);
        activity |= before != self.broker.state() || !commands.is_empty();

        for command in commands {
            let actions = self.arbiter.on_command(command, now_ms);
            self.apply(actions);
        }
        activity |= self.poll_sensor(now_ms);
        let timer_actions = self.arbiter.tick(now_ms);
        activity |= !timer_actions.is_empty();
        self.apply(timer_actions);

        self.heartbeat(now_ms);

        TickReport {
            activity,
            restart_requested: self.portal.restart_requested(now_ms),
        }
    }

    /// How long the caller should sleep after a tick.
    pub fn idle_delay_ms(&self, report: TickReport) -> u64 {
        if report.activity {
            0
        } else if self.link.is_in_ap_mode() {
            AP_IDLE_DELAY_MS
        } else {
            IDLE_DELAY_MS
        }
    }

    fn poll_sensor(&mut self, now_ms: u64) -> bool {
        let due = self
            .last_sensor_poll_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= self.reading_interval_ms);
        if !due {
            return false;
        }
        self.last_sensor_poll_ms = Some(now_ms);

        match self.peripherals.sensor.read() {
            Ok(reading) => {
                if self.sensor_failing {
                    info!("scheduler: sensor recovered");
                    self.sensor_failing = false;
                }
                let actions = self.arbiter.on_reading(reading, now_ms);
                let any = !actions.is_empty();
                self.apply(actions);
                any
            }
            Err(err) => {
                if !self.sensor_failing {
                    err.report();
                    self.sensor_failing = true;
                }
                false
            }
        }
    }

    fn apply(&mut self, actions: Vec<ArbiterAction>) {
        for action in actions {
            match action {
                ArbiterAction::SetLight(on) => self.peripherals.led.set(on),
                ArbiterAction::Notify { on } => {
                    info!(
                        "night-light {} ({})",
                        if on { "on" } else { "off" },
                        self.arbiter.mode().as_str()
                    );
                }
                ArbiterAction::Show(state) => {
                    if let Some(display) = self.peripherals.display.as_mut() {
                        display.show(&state);
                    }
                }
                ArbiterAction::Publish(reading) => {
                    if !self.broker.is_connected() {
                        continue;
                    }
                    if let Err(err) = self.broker.publish(&reading) {
                        err.report();
                    }
                }
            }
        }
    }

    fn heartbeat(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.last_heartbeat_ms) < HEARTBEAT_INTERVAL_MS {
            return;
        }
        self.last_heartbeat_ms = now_ms;
        let status = self.status(now_ms);
        let free = status
            .reading
            .map(|reading| reading.free_memory_bytes.to_string())
            .unwrap_or_else(|| "-".to_string());
        info!(
            "heartbeat: uptime={}s link={} broker={} mode={} free_mem={}",
            status.uptime_secs,
            status.link.as_str(),
            status.broker.as_str(),
            status.control_mode.as_str(),
            free
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::broker::tests::FakeTransport;
    use crate::error::NodeError;
    use crate::link::tests::{store_with_ssid, FakeRadio};
    use crate::ports::{RenderableState, TransportEvent};
    use crate::types::{BrokerSessionState, ControlMode, DeviceReading, LinkStatus};
    use pretty_assertions::assert_eq;

    #[derive(Clone, Default)]
    struct Script(Arc<Mutex<Vec<Result<DeviceReading, NodeError>>>>);

    impl SensorReader for Script {
        fn read(&mut self) -> Result<DeviceReading, NodeError> {
            let mut queue = self.0.lock().unwrap();
            if queue.len() > 1 {
                queue.remove(0)
            } else {
                queue
                    .first()
                    .cloned()
                    .unwrap_or(Err(NodeError::SensorReadFailed("empty".into())))
            }
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        led: Arc<Mutex<Vec<bool>>>,
        shown: Arc<Mutex<Vec<RenderableState>>>,
    }

    impl LedDriver for Recorder {
        fn set(&mut self, on: bool) {
            self.led.lock().unwrap().push(on);
        }
    }

    impl DisplayDriver for Recorder {
        fn show(&mut self, state: &RenderableState) {
            self.shown.lock().unwrap().push(state.clone());
        }
    }

    fn reading(light: i32) -> DeviceReading {
        DeviceReading {
            temperature_c: 22.0,
            humidity_pct: 40.0,
            light_raw: light,
            led_on: false,
            free_memory_bytes: 150_000,
            lowest_free_memory_bytes: 120_000,
        }
    }

    fn scheduler(
        ssid: &str,
        script: Script,
        recorder: Recorder,
        headless: bool,
    ) -> Scheduler<FakeRadio, FakeTransport> {
        let display: Option<Box<dyn DisplayDriver>> = if headless {
            None
        } else {
            Some(Box::new(recorder.clone()))
        };
        Scheduler::new(
            store_with_ssid(ssid),
            FakeRadio {
                associate_on_begin: true,
                ..Default::default()
            },
            FakeTransport {
                accept: true,
                ..Default::default()
            },
            Peripherals {
                sensor: Box::new(script),
                display,
                led: Box::new(recorder),
            },
            0,
        )
    }

    #[test]
    fn boot_to_publishing_in_a_few_ticks() {
        let script = Script(Arc::new(Mutex::new(vec![Ok(reading(900))])));
        let mut node = scheduler("HomeNet", script, Recorder::default(), false);

        node.tick(10);
        assert_eq!(node.link().status(), LinkStatus::Connected);
        node.tick(20);
        node.tick(5_100);

        assert_eq!(node.broker().state(), BrokerSessionState::Connected);
        let published = &node.broker().transport().published;
        assert!(published
            .iter()
            .any(|(topic, _, _)| topic == "Advantech/24dcc3a736ec/data"));
    }

    #[test]
    fn unconfigured_node_stays_in_ap_mode_without_broker() {
        let script = Script(Arc::new(Mutex::new(vec![Ok(reading(900))])));
        let mut node = scheduler("", script, Recorder::default(), false);

        for now in (0..60_000).step_by(50) {
            let report = node.tick(now);
            if !report.activity {
                assert_eq!(node.idle_delay_ms(report), AP_IDLE_DELAY_MS);
            }
        }

        assert!(node.link().is_in_ap_mode());
        assert_eq!(node.broker().transport().connect_calls, 0);
        assert_eq!(node.broker().state(), BrokerSessionState::Idle);
    }

    #[test]
    fn remote_commands_drive_led_through_arbiter() {
        let script = Script(Arc::new(Mutex::new(vec![Ok(reading(900))])));
        let recorder = Recorder::default();
        let mut node = scheduler("HomeNet", script, recorder.clone(), false);
        node.tick(0);
        node.tick(1);
        node.tick(2);
        assert!(node.broker().is_connected());

        node.broker
            .transport_mut()
            .events
            .push_back(TransportEvent::Message {
                topic: "Advantech/24dcc3a736ec/led".into(),
                payload: b"on".to_vec(),
            });
        node.tick(300);

        assert_eq!(node.arbiter().mode(), ControlMode::Manual);
        assert_eq!(recorder.led.lock().unwrap().last(), Some(&true));
        assert!(recorder
            .shown
            .lock()
            .unwrap()
            .contains(&RenderableState::LedBanner { on: true }));
    }

    #[test]
    fn sensor_failure_skips_decisions_and_keeps_running() {
        let script = Script(Arc::new(Mutex::new(vec![Err(NodeError::SensorReadFailed(
            "checksum".into(),
        ))])));
        let recorder = Recorder::default();
        let mut node = scheduler("HomeNet", script, recorder.clone(), true);

        for now in (0..2_000).step_by(100) {
            node.tick(now);
        }

        assert!(node.arbiter().last_reading().is_none());
        // Only the boot-time LED reset.
        assert_eq!(*recorder.led.lock().unwrap(), vec![false]);
        assert!(node.broker().is_connected());
    }

    #[test]
    fn headless_node_still_controls_led() {
        let script = Script(Arc::new(Mutex::new(vec![Ok(reading(900)), Ok(reading(100))])));
        let recorder = Recorder::default();
        let mut node = scheduler("HomeNet", script, recorder.clone(), true);

        node.tick(0);
        node.tick(300);

        assert_eq!(*recorder.led.lock().unwrap(), vec![false, true]);
        assert!(recorder.shown.lock().unwrap().is_empty());
    }

    #[test]
    fn portal_submission_requests_restart() {
        let script = Script::default();
        let mut node = scheduler("", script, Recorder::default(), true);
        let handle = node.portal_handle();
        handle.send(crate::portal::PortalRequest::SubmitCredentials {
            form: crate::portal::CredentialForm {
                ssid: "HomeNet".into(),
                password: "secret".into(),
                ..Default::default()
            },
            respond: Box::new(|_| {}),
        });

        let report = node.tick(1_000);
        assert!(report.activity);
        assert!(!report.restart_requested);
        assert!(node.tick(1_500).restart_requested);
        assert_eq!(node.store().credentials().ssid, "HomeNet");
    }
}
