pub mod arbiter;
pub mod broker;
pub mod config;
pub mod discovery;
pub mod error;
pub mod link;
pub mod pages;
pub mod portal;
pub mod ports;
pub mod scheduler;
pub mod store;
pub mod topics;
pub mod types;

pub use arbiter::{Arbiter, ArbiterAction};
pub use broker::BrokerSession;
pub use config::{MqttConfig, NodeConfig, SensorConfig, WifiConfig};
pub use error::{NodeError, ProvisioningError};
pub use link::LinkManager;
pub use portal::{CredentialForm, PortalHandle, PortalRequest, ProvisioningPortal};
pub use ports::{
    BrokerTransport, ConfigBackend, DisplayDriver, LedDriver, Radio, RadioError, RenderableState,
    SensorReader, StorageError, TransportError, TransportEvent,
};
pub use scheduler::{Peripherals, Scheduler, TickReport};
pub use store::{ConfigStore, MemoryBackend};
pub use topics::*;
pub use types::{
    BrokerIdentity, BrokerSessionState, ControlMode, DeviceReading, LightCommand, LightState,
    LinkStatus, NetworkCredentials, ScannedNetwork, StatusSnapshot, TelemetryPayload,
};
