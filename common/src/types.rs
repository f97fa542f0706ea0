use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
    ApMode,
}

impl LinkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Failed => "FAILED",
            Self::ApMode => "AP_MODE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerSessionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

impl BrokerSessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMode {
    Automatic,
    Manual,
}

impl ControlMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automatic => "AUTOMATIC",
            Self::Manual => "MANUAL",
        }
    }
}

/// Station credentials. An empty ssid means the node is unconfigured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkCredentials {
    pub ssid: String,
    pub password: String,
    pub enterprise_username: Option<String>,
}

impl NetworkCredentials {
    pub fn is_configured(&self) -> bool {
        !self.ssid.trim().is_empty()
    }

    pub fn is_enterprise(&self) -> bool {
        self.enterprise_username
            .as_deref()
            .is_some_and(|user| !user.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerIdentity {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedNetwork {
    pub ssid: String,
    #[serde(rename = "rssiDbm")]
    pub rssi_dbm: i32,
    #[serde(rename = "isOpen")]
    pub is_open: bool,
    #[serde(rename = "isEnterprise")]
    pub is_enterprise: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceReading {
    #[serde(rename = "temperatureC")]
    pub temperature_c: f32,
    #[serde(rename = "humidityPct")]
    pub humidity_pct: f32,
    #[serde(rename = "lightRaw")]
    pub light_raw: i32,
    #[serde(rename = "ledOn")]
    pub led_on: bool,
    #[serde(rename = "freeMemoryBytes")]
    pub free_memory_bytes: u32,
    #[serde(rename = "lowestFreeMemoryBytes")]
    pub lowest_free_memory_bytes: u32,
}

impl DeviceReading {
    /// Whether the environmental fields differ from `previous`. Exact comparison.
    #[allow(clippy::float_cmp)]
    pub fn environment_changed(&self, previous: &DeviceReading) -> bool {
        self.temperature_c != previous.temperature_c
            || self.humidity_pct != previous.humidity_pct
            || self.light_raw != previous.light_raw
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightState {
    On,
    Off,
}

impl From<bool> for LightState {
    fn from(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

/// Remote command received on the control topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightCommand {
    On,
    Off,
}

impl LightCommand {
    pub fn parse(payload: &str) -> Option<Self> {
        let trimmed = payload.trim();
        if trimmed.eq_ignore_ascii_case("on") {
            Some(Self::On)
        } else if trimmed.eq_ignore_ascii_case("off") {
            Some(Self::Off)
        } else {
            None
        }
    }
}

/// Telemetry document published on `Advantech/{edgeId}/data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub temp: f32,
    pub humi: f32,
    pub photoresister: i32,
    #[serde(rename = "ledState")]
    pub led_state: LightState,
    #[serde(rename = "freeMemory")]
    pub free_memory: u32,
    #[serde(rename = "lowestMemory")]
    pub lowest_memory: u32,
}

impl From<&DeviceReading> for TelemetryPayload {
    fn from(reading: &DeviceReading) -> Self {
        Self {
            temp: reading.temperature_c,
            humi: reading.humidity_pct,
            photoresister: reading.light_raw,
            led_state: reading.led_on.into(),
            free_memory: reading.free_memory_bytes,
            lowest_memory: reading.lowest_free_memory_bytes,
        }
    }
}

/// Read-only snapshot served by the status and portal surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub link: LinkStatus,
    pub broker: BrokerSessionState,
    #[serde(rename = "controlMode")]
    pub control_mode: ControlMode,
    #[serde(rename = "lightOn")]
    pub light_on: bool,
    pub reading: Option<DeviceReading>,
    #[serde(rename = "localAddress")]
    pub local_address: Option<Ipv4Addr>,
    #[serde(rename = "apSsid")]
    pub ap_ssid: Option<String>,
    #[serde(rename = "macAddress")]
    pub mac_address: String,
    #[serde(rename = "uptimeSecs")]
    pub uptime_secs: u64,
    #[serde(rename = "targetSsid")]
    pub target_ssid: String,
    #[serde(rename = "brokerHost")]
    pub broker_host: String,
    #[serde(rename = "brokerPort")]
    pub broker_port: u16,
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "brokerUsername")]
    pub broker_username: String,
    #[serde(rename = "dataTopic")]
    pub data_topic: String,
    #[serde(rename = "controlTopic")]
    pub control_topic: String,
}

pub fn format_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn reading(temp: f32, humi: f32, light: i32) -> DeviceReading {
        DeviceReading {
            temperature_c: temp,
            humidity_pct: humi,
            light_raw: light,
            led_on: false,
            free_memory_bytes: 200_000,
            lowest_free_memory_bytes: 180_000,
        }
    }

    #[test]
    fn commands_parse_case_insensitively() {
        assert_eq!(LightCommand::parse("on"), Some(LightCommand::On));
        assert_eq!(LightCommand::parse(" OFF\n"), Some(LightCommand::Off));
        assert_eq!(LightCommand::parse("toggle"), None);
        assert_eq!(LightCommand::parse(""), None);
    }

    #[test]
    fn telemetry_wire_schema_round_trips_numeric_fields() {
        let mut sample = reading(21.5, 55.0, 700);
        sample.led_on = 700 < 800;

        let body = serde_json::to_string(&TelemetryPayload::from(&sample)).unwrap();
        let parsed: TelemetryPayload = serde_json::from_str(&body).unwrap();

        assert_eq!(parsed.temp, 21.5);
        assert_eq!(parsed.humi, 55.0);
        assert_eq!(parsed.photoresister, 700);
        assert_eq!(parsed.led_state, LightState::On);
        assert_eq!(parsed.free_memory, 200_000);
        assert_eq!(parsed.lowest_memory, 180_000);
    }

    #[test]
    fn telemetry_uses_wire_field_names() {
        let value = serde_json::to_value(TelemetryPayload::from(&reading(20.0, 40.0, 1))).unwrap();
        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();

        assert_eq!(
            keys,
            vec!["freeMemory", "humi", "ledState", "lowestMemory", "photoresister", "temp"]
        );
        assert_eq!(value["ledState"], "off");
    }

    #[test]
    fn environment_change_ignores_memory_and_led() {
        let base = reading(21.0, 50.0, 900);
        let mut other = base;
        other.free_memory_bytes = 1;
        other.led_on = true;
        assert!(!other.environment_changed(&base));

        other.light_raw = 899;
        assert!(other.environment_changed(&base));
    }

    #[test]
    fn empty_or_blank_ssid_is_unconfigured() {
        let mut creds = NetworkCredentials::default();
        assert!(!creds.is_configured());
        creds.ssid = "   ".to_string();
        assert!(!creds.is_configured());
        creds.ssid = "HomeNet".to_string();
        assert!(creds.is_configured());
    }

    #[test]
    fn mac_is_colon_separated_upper_hex() {
        assert_eq!(
            format_mac([0x24, 0xdc, 0xc3, 0xa7, 0x36, 0xec]),
            "24:DC:C3:A7:36:EC"
        );
    }
}
