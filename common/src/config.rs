use serde::{Deserialize, Serialize};

use crate::types::{BrokerIdentity, NetworkCredentials};

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const MIN_READING_INTERVAL_MS: u64 = 50;
pub const MIN_UPLOAD_FREQUENCY_MS: u64 = 1_000;
pub const MAX_ADC_VALUE: i32 = 4_095;
/// Longest manual night-light window accepted from the config document.
pub const MAX_NIGHT_LIGHT_DURATION_MS: u64 = 24 * 60 * 60 * 1_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WifiConfig {
    pub ssid: String,
    pub password: String,
    pub username: String,
    pub is_enterprise: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MqttConfig {
    pub broker: String,
    pub username: String,
    pub password: String,
    pub edge_id: String,
    pub port: u16,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "192.168.31.21".to_string(),
            username: "user".to_string(),
            password: "passwd".to_string(),
            edge_id: "24dcc3a736ec".to_string(),
            port: DEFAULT_MQTT_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SensorConfig {
    pub dht_pin: i32,
    pub dht_type: u8,
    pub photoresister_pin: i32,
    pub led_pin: i32,
    pub sda_pin: i32,
    pub scl_pin: i32,
    pub photoresister_threshold: i32,
    pub sensor_reading_interval: u64,
    pub upload_frequency: u64,
    /// Manual "on" auto-off window in milliseconds. Zero disables the timer.
    pub night_light_duration: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            dht_pin: 13,
            dht_type: 11,
            photoresister_pin: 39,
            led_pin: 25,
            sda_pin: 32,
            scl_pin: 33,
            photoresister_threshold: 800,
            sensor_reading_interval: 200,
            upload_frequency: 5_000,
            night_light_duration: 600_000,
        }
    }
}

impl SensorConfig {
    pub fn sanitize(&mut self) {
        self.photoresister_threshold = self.photoresister_threshold.clamp(0, MAX_ADC_VALUE);
        self.sensor_reading_interval = self.sensor_reading_interval.max(MIN_READING_INTERVAL_MS);
        self.upload_frequency = self.upload_frequency.max(MIN_UPLOAD_FREQUENCY_MS);
        self.night_light_duration = self.night_light_duration.min(MAX_NIGHT_LIGHT_DURATION_MS);
    }
}

/// The persisted node configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub wifi: WifiConfig,
    pub mqtt: MqttConfig,
    pub sensor: SensorConfig,
}

impl NodeConfig {
    pub fn sanitize(&mut self) {
        if self.mqtt.port == 0 {
            self.mqtt.port = DEFAULT_MQTT_PORT;
        }
        self.mqtt.broker = self.mqtt.broker.trim().to_string();
        self.mqtt.edge_id = self.mqtt.edge_id.trim().to_string();
        if !self.wifi.is_enterprise {
            self.wifi.username.clear();
        }
        self.sensor.sanitize();
    }

    /// Broker host and edge id are required; an empty ssid is the unconfigured sentinel.
    pub fn has_critical_fields(&self) -> bool {
        !self.mqtt.broker.trim().is_empty() && !self.mqtt.edge_id.trim().is_empty()
    }

    pub fn credentials(&self) -> NetworkCredentials {
        NetworkCredentials {
            ssid: self.wifi.ssid.clone(),
            password: self.wifi.password.clone(),
            enterprise_username: (self.wifi.is_enterprise && !self.wifi.username.is_empty())
                .then(|| self.wifi.username.clone()),
        }
    }

    pub fn set_credentials(&mut self, credentials: &NetworkCredentials) {
        self.wifi.ssid = credentials.ssid.clone();
        self.wifi.password = credentials.password.clone();
        match credentials.enterprise_username.as_deref() {
            Some(user) if !user.is_empty() => {
                self.wifi.username = user.to_string();
                self.wifi.is_enterprise = true;
            }
            _ => {
                self.wifi.username.clear();
                self.wifi.is_enterprise = false;
            }
        }
    }

    pub fn broker_identity(&self) -> BrokerIdentity {
        BrokerIdentity {
            host: self.mqtt.broker.clone(),
            port: self.mqtt.port,
            client_id: self.mqtt.edge_id.clone(),
            username: self.mqtt.username.clone(),
            password: self.mqtt.password.clone(),
        }
    }

    pub fn set_broker_identity(&mut self, identity: &BrokerIdentity) {
        self.mqtt.broker = identity.host.clone();
        self.mqtt.port = identity.port;
        self.mqtt.edge_id = identity.client_id.clone();
        self.mqtt.username = identity.username.clone();
        self.mqtt.password = identity.password.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_sections_take_defaults() {
        let parsed: NodeConfig =
            serde_json::from_str(r#"{"wifi":{"ssid":"HomeNet","password":"secret"}}"#).unwrap();

        assert_eq!(parsed.wifi.ssid, "HomeNet");
        assert_eq!(parsed.mqtt, MqttConfig::default());
        assert_eq!(parsed.sensor, SensorConfig::default());
    }

    #[test]
    fn serialized_keys_are_camel_case() {
        let value = serde_json::to_value(NodeConfig::default()).unwrap();

        assert_eq!(value["mqtt"]["edgeId"], "24dcc3a736ec");
        assert_eq!(value["wifi"]["isEnterprise"], false);
        assert_eq!(value["sensor"]["photoresisterThreshold"], 800);
        assert_eq!(value["sensor"]["nightLightDuration"], 600_000);
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut config = NodeConfig::default();
        config.mqtt.port = 0;
        config.sensor.sensor_reading_interval = 5;
        config.sensor.upload_frequency = 10;
        config.sensor.photoresister_threshold = 9_000;

        config.sanitize();

        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.sensor.sensor_reading_interval, 50);
        assert_eq!(config.sensor.upload_frequency, 1_000);
        assert_eq!(config.sensor.photoresister_threshold, 4_095);
    }

    #[test]
    fn huge_night_light_duration_is_capped() {
        let mut config: NodeConfig = serde_json::from_str(
            r#"{"sensor":{"nightLightDuration":18446744073709551615}}"#,
        )
        .unwrap();

        config.sanitize();

        assert_eq!(config.sensor.night_light_duration, MAX_NIGHT_LIGHT_DURATION_MS);
    }

    #[test]
    fn pins_are_plain_gpio_numbers() {
        let parsed: NodeConfig =
            serde_json::from_str(r#"{"sensor":{"ledPin":2,"dhtPin":4}}"#).unwrap();

        let led: i32 = parsed.sensor.led_pin;
        assert_eq!(led, 2);
        assert_eq!(parsed.sensor.dht_pin, 4);
        assert_eq!(parsed.sensor.photoresister_pin, 39);
    }

    #[test]
    fn critical_fields_are_broker_host_and_edge_id() {
        let mut config = NodeConfig::default();
        assert!(config.has_critical_fields());

        config.mqtt.edge_id = " ".to_string();
        assert!(!config.has_critical_fields());

        config = NodeConfig::default();
        config.mqtt.broker.clear();
        assert!(!config.has_critical_fields());
    }

    #[test]
    fn enterprise_username_only_surfaces_when_enabled() {
        let mut config = NodeConfig::default();
        config.wifi.ssid = "Corp".to_string();
        config.wifi.username = "alice".to_string();
        assert_eq!(config.credentials().enterprise_username, None);

        config.wifi.is_enterprise = true;
        assert_eq!(
            config.credentials().enterprise_username.as_deref(),
            Some("alice")
        );
    }

    #[test]
    fn set_credentials_round_trips_through_credentials() {
        let creds = NetworkCredentials {
            ssid: "Corp".to_string(),
            password: "pw".to_string(),
            enterprise_username: Some("bob".to_string()),
        };
        let mut config = NodeConfig::default();
        config.set_credentials(&creds);

        assert!(config.wifi.is_enterprise);
        assert_eq!(config.credentials(), creds);
    }
}
