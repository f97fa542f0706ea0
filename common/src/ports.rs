//! Capability traits for the hardware and transport collaborators.
//!
//! Every backend (host simulation, ESP-IDF) implements these; the state
//! machines in this crate only ever talk to the traits.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::error::NodeError;
use crate::types::{BrokerIdentity, DeviceReading, NetworkCredentials, ScannedNetwork};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("radio driver error: {0}")]
    Driver(String),
    #[error("radio is busy")]
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage io error: {0}")]
    Io(String),
}

/// WiFi radio. All calls return promptly; association is polled.
pub trait Radio {
    fn begin_station(&mut self, credentials: &NetworkCredentials) -> Result<(), RadioError>;
    fn start_access_point(&mut self, ssid: &str) -> Result<(), RadioError>;
    fn is_associated(&mut self) -> bool;
    fn disconnect(&mut self);
    /// Starts a background scan. Results are collected with `poll_scan`.
    fn start_scan(&mut self) -> Result<(), RadioError>;
    /// `None` while the scan started by `start_scan` is still running.
    fn poll_scan(&mut self) -> Option<Result<Vec<ScannedNetwork>, RadioError>>;
    fn local_address(&self) -> Option<Ipv4Addr>;
    fn mac_address(&self) -> [u8; 6];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
}

/// Broker transport. `begin_connect` starts a handshake whose outcome arrives
/// later through `poll`.
pub trait BrokerTransport {
    fn begin_connect(&mut self, identity: &BrokerIdentity) -> Result<(), TransportError>;
    fn poll(&mut self) -> Option<TransportEvent>;
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool)
        -> Result<(), TransportError>;
    fn disconnect(&mut self);
}

/// Raw storage for the serialized configuration document.
pub trait ConfigBackend {
    /// `Ok(None)` when nothing has been stored yet.
    fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError>;
    fn write(&mut self, bytes: &[u8]) -> Result<(), StorageError>;
}

pub trait SensorReader {
    fn read(&mut self) -> Result<DeviceReading, NodeError>;
}

pub trait LedDriver {
    fn set(&mut self, on: bool);
}

/// What the display is asked to show.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderableState {
    SensorSnapshot(DeviceReading),
    LedBanner { on: bool },
    Countdown { remaining_secs: u64 },
}

pub trait DisplayDriver {
    fn show(&mut self, state: &RenderableState);
}

impl From<StorageError> for NodeError {
    fn from(err: StorageError) -> Self {
        NodeError::ConfigWriteFailed(err.to_string())
    }
}

/// Text lines for a character-cell display.
pub fn render_lines(state: &RenderableState) -> Vec<String> {
    match state {
        RenderableState::SensorSnapshot(reading) => vec![
            format!("Temp: {:.1} C", reading.temperature_c),
            format!("Humi: {:.1} %", reading.humidity_pct),
            format!("Light: {}", reading.light_raw),
            format!("LED: {}", if reading.led_on { "ON" } else { "OFF" }),
        ],
        RenderableState::LedBanner { on } => {
            vec![format!("LED {}", if *on { "ON" } else { "OFF" })]
        }
        RenderableState::Countdown { remaining_secs } => vec![
            "Night light".to_string(),
            format!("off in {}:{:02}", remaining_secs / 60, remaining_secs % 60),
        ],
    }
}
