use log::info;

use crate::config::SensorConfig;
use crate::ports::RenderableState;
use crate::types::{ControlMode, DeviceReading, LightCommand};

/// How long an LED banner keeps sensor snapshots off the display.
pub const BANNER_HOLD_MS: u64 = 3_000;

#[derive(Debug, Clone, PartialEq)]
pub enum ArbiterAction {
    SetLight(bool),
    /// The night-light changed state.
    Notify { on: bool },
    Show(RenderableState),
    Publish(DeviceReading),
}

/// Resolves automatic (light sensor) versus remotely commanded control of
/// the night-light, and decides what reaches the display and the broker.
#[derive(Debug, Clone)]
pub struct Arbiter {
    threshold: i32,
    upload_interval_ms: u64,
    night_light_ms: u64,

    mode: ControlMode,
    light_on: bool,
    manual_off_at_ms: Option<u64>,

    last_reading: Option<DeviceReading>,
    last_forwarded: Option<DeviceReading>,
    last_publish_ms: Option<u64>,
    banner_until_ms: Option<u64>,
    last_countdown_secs: Option<u64>,
}

impl Arbiter {
    pub fn new(config: &SensorConfig) -> Self {
        Self {
            threshold: config.photoresister_threshold,
            upload_interval_ms: config.upload_frequency,
            night_light_ms: config.night_light_duration,
            mode: ControlMode::Automatic,
            light_on: false,
            manual_off_at_ms: None,
            last_reading: None,
            last_forwarded: None,
            last_publish_ms: None,
            banner_until_ms: None,
            last_countdown_secs: None,
        }
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    pub fn light_on(&self) -> bool {
        self.light_on
    }

    pub fn last_reading(&self) -> Option<&DeviceReading> {
        self.last_reading.as_ref()
    }

    /// Milliseconds until the manual auto-off fires, if armed.
    pub fn manual_remaining_ms(&self, now_ms: u64) -> Option<u64> {
        self.manual_off_at_ms
            .map(|off_at| off_at.saturating_sub(now_ms))
    }

    pub fn on_reading(&mut self, mut reading: DeviceReading, now_ms: u64) -> Vec<ArbiterAction> {
        let mut actions = Vec::new();

        if self.mode == ControlMode::Automatic {
            let should_be_on = reading.light_raw < self.threshold;
            if should_be_on != self.light_on {
                self.light_on = should_be_on;
                actions.push(ArbiterAction::SetLight(should_be_on));
                reading.led_on = self.light_on;
                self.last_reading = Some(reading);
                self.notify(now_ms, &mut actions);
            }
        }
        reading.led_on = self.light_on;
        self.last_reading = Some(reading);

        let changed = self
            .last_forwarded
            .map_or(true, |previous| reading.environment_changed(&previous));
        if changed && self.snapshot_allowed(now_ms) {
            self.last_forwarded = Some(reading);
            actions.push(ArbiterAction::Show(RenderableState::SensorSnapshot(reading)));
        }

        let publish_due = self
            .last_publish_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= self.upload_interval_ms);
        if publish_due {
            self.last_publish_ms = Some(now_ms);
            actions.push(ArbiterAction::Publish(reading));
        }

        actions
    }

    pub fn on_command(&mut self, command: LightCommand, now_ms: u64) -> Vec<ArbiterAction> {
        let mut actions = Vec::new();
        match command {
            LightCommand::On => {
                self.mode = ControlMode::Manual;
                self.light_on = true;
                self.manual_off_at_ms = (self.night_light_ms > 0)
                    .then(|| now_ms.saturating_add(self.night_light_ms));
                self.last_countdown_secs = None;
                info!(
                    "arbiter: manual on{}",
                    if self.night_light_ms > 0 {
                        format!(", auto-off in {} s", self.night_light_ms / 1_000)
                    } else {
                        String::new()
                    }
                );
                actions.push(ArbiterAction::SetLight(true));
            }
            LightCommand::Off => {
                self.mode = ControlMode::Automatic;
                self.light_on = false;
                self.manual_off_at_ms = None;
                info!("arbiter: manual off, back to automatic");
                actions.push(ArbiterAction::SetLight(false));
            }
        }
        self.notify(now_ms, &mut actions);
        actions
    }

    /// Timer work that does not depend on a new reading.
    pub fn tick(&mut self, now_ms: u64) -> Vec<ArbiterAction> {
        let mut actions = Vec::new();

        if let Some(off_at) = self.manual_off_at_ms {
            if now_ms >= off_at {
                // Mode stays Manual until an explicit "off".
                info!("arbiter: night-light timer expired");
                self.manual_off_at_ms = None;
                self.last_countdown_secs = None;
                self.light_on = false;
                actions.push(ArbiterAction::SetLight(false));
                self.notify(now_ms, &mut actions);
                return actions;
            }
        }

        if self.banner_until_ms.is_some_and(|until| now_ms >= until) {
            self.banner_until_ms = None;
            if self.manual_off_at_ms.is_none() {
                if let Some(reading) = self.last_reading {
                    self.last_forwarded = Some(reading);
                    actions.push(ArbiterAction::Show(RenderableState::SensorSnapshot(reading)));
                }
            }
        }

        if self.banner_until_ms.is_none() {
            if let Some(remaining_ms) = self.manual_remaining_ms(now_ms) {
                let remaining_secs = remaining_ms.div_ceil(1_000);
                if self.last_countdown_secs != Some(remaining_secs) {
                    self.last_countdown_secs = Some(remaining_secs);
                    actions.push(ArbiterAction::Show(RenderableState::Countdown { remaining_secs }));
                }
            }
        }

        actions
    }

    fn snapshot_allowed(&self, now_ms: u64) -> bool {
        let banner_active = self.banner_until_ms.is_some_and(|until| now_ms < until);
        !banner_active && self.manual_off_at_ms.is_none()
    }

    fn notify(&mut self, now_ms: u64, actions: &mut Vec<ArbiterAction>) {
        let on = self.light_on;
        actions.push(ArbiterAction::Notify { on });
        actions.push(ArbiterAction::Show(RenderableState::LedBanner { on }));
        self.banner_until_ms = Some(now_ms.saturating_add(BANNER_HOLD_MS));

        if let Some(mut reading) = self.last_reading {
            reading.led_on = on;
            self.last_reading = Some(reading);
            self.last_publish_ms = Some(now_ms);
            actions.push(ArbiterAction::Publish(reading));
        }
    }
}
