use log::{error, warn};
use thiserror::Error;

/// Failure taxonomy shared by every component of the node.
///
/// None of these abort the polling loop. Transient kinds are retried by the
/// owning state machine; the rest degrade a single subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("sensor read failed: {0}")]
    SensorReadFailed(String),
    #[error("display init failed: {0}")]
    DisplayInitFailed(String),
    #[error("link connect failed: {0}")]
    LinkConnectFailed(String),
    #[error("broker connect failed: {0}")]
    BrokerConnectFailed(String),
    #[error("broker publish failed: {0}")]
    BrokerPublishFailed(String),
    #[error("config read failed: {0}")]
    ConfigReadFailed(String),
    #[error("config write failed: {0}")]
    ConfigWriteFailed(String),
}

impl NodeError {
    /// Transient conditions are part of normal operation and only warrant a log line.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LinkConnectFailed(_) | Self::BrokerConnectFailed(_) | Self::BrokerPublishFailed(_)
        )
    }

    /// Logs the failure at a level matching its kind.
    pub fn report(&self) {
        if self.is_transient() {
            warn!("{self}");
        } else {
            error!("{self}");
        }
    }
}

/// Errors reported back to the operator by the provisioning surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisioningError {
    #[error("ssid cannot be empty")]
    EmptySsid,
    #[error("provisioning is only available while the access point is up")]
    NotInApMode,
    #[error("network scan failed: {0}")]
    ScanFailed(String),
    #[error("mqttPort must be between 1 and 65535")]
    InvalidBrokerPort,
    #[error("edgeId and mqttHost must both be set to change the broker identity")]
    IncompleteBrokerIdentity,
    #[error(transparent)]
    Persist(#[from] NodeError),
}

impl ProvisioningError {
    /// HTTP status the portal answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::EmptySsid | Self::InvalidBrokerPort | Self::IncompleteBrokerIdentity => 400,
            Self::NotInApMode => 409,
            Self::ScanFailed(_) | Self::Persist(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_failures_are_transient() {
        assert!(NodeError::LinkConnectFailed("timeout".into()).is_transient());
        assert!(NodeError::BrokerPublishFailed("closed".into()).is_transient());
        assert!(!NodeError::ConfigWriteFailed("disk full".into()).is_transient());
        assert!(!NodeError::DisplayInitFailed("no ack".into()).is_transient());
    }

    #[test]
    fn persist_errors_keep_their_message() {
        let err = ProvisioningError::from(NodeError::ConfigWriteFailed("read-only".into()));
        assert_eq!(err.to_string(), "config write failed: read-only");
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn operator_mistakes_are_client_errors() {
        assert_eq!(ProvisioningError::EmptySsid.status_code(), 400);
        assert_eq!(ProvisioningError::InvalidBrokerPort.status_code(), 400);
        assert_eq!(ProvisioningError::NotInApMode.status_code(), 409);
    }
}
