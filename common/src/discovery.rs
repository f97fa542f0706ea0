//! Home Assistant MQTT discovery descriptors.
//!
//! One retained descriptor per telemetry field plus one for the night-light,
//! all sharing the same device block so the hub groups them together.

use serde::Serialize;

use crate::topics::{control_topic, data_topic, discovery_topic, PAYLOAD_OFF, PAYLOAD_ON};

pub const DEVICE_MODEL: &str = "ESP32 Environmental Monitor";
pub const DEVICE_MANUFACTURER: &str = "DIY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceBlock {
    pub identifiers: String,
    pub name: String,
    pub model: &'static str,
    pub manufacturer: &'static str,
}

impl DeviceBlock {
    pub fn for_edge(edge_id: &str) -> Self {
        Self {
            identifiers: edge_id.to_string(),
            name: format!("ESP32 Sensor {edge_id}"),
            model: DEVICE_MODEL,
            manufacturer: DEVICE_MANUFACTURER,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct SensorDescriptor<'a> {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'static str>,
    state_topic: &'a str,
    unit_of_measurement: &'static str,
    value_template: String,
    unique_id: String,
    device: &'a DeviceBlock,
}

#[derive(Debug, Clone, Serialize)]
struct LightDescriptor<'a> {
    name: String,
    state_topic: &'a str,
    command_topic: String,
    payload_on: &'static str,
    payload_off: &'static str,
    state_value_template: &'static str,
    optimistic: bool,
    unique_id: String,
    device: &'a DeviceBlock,
}

/// A retained message ready to hand to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryMessage {
    pub topic: String,
    pub payload: String,
}

struct SensorField {
    topic_field: &'static str,
    label: &'static str,
    json_key: &'static str,
    unique_suffix: &'static str,
    device_class: Option<&'static str>,
    unit: &'static str,
}

const SENSOR_FIELDS: [SensorField; 5] = [
    SensorField {
        topic_field: "temperature",
        label: "Temperature",
        json_key: "temp",
        unique_suffix: "temperature",
        device_class: Some("temperature"),
        unit: "°C",
    },
    SensorField {
        topic_field: "humidity",
        label: "Humidity",
        json_key: "humi",
        unique_suffix: "humidity",
        device_class: Some("humidity"),
        unit: "%",
    },
    SensorField {
        topic_field: "photoresister",
        label: "Light",
        json_key: "photoresister",
        unique_suffix: "photoresister",
        device_class: Some("illuminance"),
        unit: "lx",
    },
    SensorField {
        topic_field: "freeMemory",
        label: "Free Memory",
        json_key: "freeMemory",
        unique_suffix: "free_memory",
        device_class: None,
        unit: "bytes",
    },
    SensorField {
        topic_field: "lowestMemory",
        label: "Lowest Memory",
        json_key: "lowestMemory",
        unique_suffix: "lowest_memory",
        device_class: None,
        unit: "bytes",
    },
];

pub fn discovery_messages(edge_id: &str) -> Result<Vec<DiscoveryMessage>, serde_json::Error> {
    let device = DeviceBlock::for_edge(edge_id);
    let state_topic = data_topic(edge_id);
    let mut messages = Vec::with_capacity(SENSOR_FIELDS.len() + 1);

    for field in &SENSOR_FIELDS {
        let descriptor = SensorDescriptor {
            name: format!("{edge_id} {}", field.label),
            device_class: field.device_class,
            state_topic: &state_topic,
            unit_of_measurement: field.unit,
            value_template: format!("{{{{ value_json.{} }}}}", field.json_key),
            unique_id: format!("{edge_id}_{}", field.unique_suffix),
            device: &device,
        };
        messages.push(DiscoveryMessage {
            topic: discovery_topic("sensor", edge_id, field.topic_field),
            payload: serde_json::to_string(&descriptor)?,
        });
    }

    let light = LightDescriptor {
        name: format!("{edge_id} LED"),
        state_topic: &state_topic,
        command_topic: control_topic(edge_id),
        payload_on: PAYLOAD_ON,
        payload_off: PAYLOAD_OFF,
        state_value_template: "{{ value_json.ledState }}",
        optimistic: true,
        unique_id: format!("{edge_id}_led"),
        device: &device,
    };
    messages.push(DiscoveryMessage {
        topic: discovery_topic("light", edge_id, "led"),
        payload: serde_json::to_string(&light)?,
    });

    Ok(messages)
}
