use log::{debug, info, warn};

use crate::discovery::discovery_messages;
use crate::error::NodeError;
use crate::ports::{BrokerTransport, TransportEvent};
use crate::store::ConfigStore;
use crate::topics::{control_topic, data_topic, MAX_CONTROL_PAYLOAD_BYTES};
use crate::types::{BrokerIdentity, BrokerSessionState, DeviceReading, LightCommand, TelemetryPayload};

pub const RETRY_INTERVAL_MS: u64 = 5_000;
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const STATUS_LOG_INTERVAL_MS: u64 = 15_000;
const MAX_EVENTS_PER_TICK: usize = 16;

/// Broker connection lifecycle layered on top of the station link.
pub struct BrokerSession<T: BrokerTransport> {
    transport: T,
    state: BrokerSessionState,
    identity: Option<BrokerIdentity>,
    data_topic: String,
    control_topic: String,
    last_attempt_ms: Option<u64>,
    attempt_started_ms: u64,
    last_status_log_ms: u64,
}

impl<T: BrokerTransport> BrokerSession<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: BrokerSessionState::Idle,
            identity: None,
            data_topic: String::new(),
            control_topic: String::new(),
            last_attempt_ms: None,
            attempt_started_ms: 0,
            last_status_log_ms: 0,
        }
    }

    pub fn state(&self) -> BrokerSessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == BrokerSessionState::Connected
    }

    /// Identity used by the current or most recent session.
    pub fn identity(&self) -> Option<&BrokerIdentity> {
        self.identity.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Drives the session. Does nothing toward the broker unless `link_up`.
    /// Returns control commands received this tick, in arrival order.
    pub fn update(&mut self, link_up: bool, store: &ConfigStore, now_ms: u64) -> Vec<LightCommand> {
        let mut commands = Vec::new();

        if !link_up {
            match self.state {
                BrokerSessionState::Connected | BrokerSessionState::Connecting => {
                    self.transport.disconnect();
                    self.set_state(BrokerSessionState::Disconnected);
                }
                BrokerSessionState::Disconnected => self.set_state(BrokerSessionState::Idle),
                BrokerSessionState::Idle => {}
            }
            return commands;
        }

        for _ in 0..MAX_EVENTS_PER_TICK {
            let Some(event) = self.transport.poll() else {
                break;
            };
            self.handle_event(event, &mut commands);
        }

        match self.state {
            BrokerSessionState::Idle => {
                let due = self
                    .last_attempt_ms
                    .map_or(true, |last| now_ms.saturating_sub(last) >= RETRY_INTERVAL_MS);
                if due {
                    self.connect(store, now_ms);
                } else if now_ms.saturating_sub(self.last_status_log_ms) >= STATUS_LOG_INTERVAL_MS {
                    self.last_status_log_ms = now_ms;
                    debug!("broker: not connected, waiting to retry");
                }
            }
            BrokerSessionState::Connecting => {
                if now_ms.saturating_sub(self.attempt_started_ms) >= CONNECT_TIMEOUT_MS {
                    NodeError::BrokerConnectFailed("handshake timed out".to_string()).report();
                    self.transport.disconnect();
                    self.set_state(BrokerSessionState::Idle);
                }
            }
            BrokerSessionState::Disconnected => self.set_state(BrokerSessionState::Idle),
            BrokerSessionState::Connected => {}
        }

        commands
    }

    /// Publishes one telemetry document. Rate limiting is the caller's job.
    pub fn publish(&mut self, reading: &DeviceReading) -> Result<(), NodeError> {
        if self.state != BrokerSessionState::Connected {
            return Err(NodeError::BrokerPublishFailed(format!(
                "session is {}",
                self.state.as_str()
            )));
        }
        let body = serde_json::to_vec(&TelemetryPayload::from(reading))
            .map_err(|err| NodeError::BrokerPublishFailed(err.to_string()))?;
        self.transport
            .publish(&self.data_topic, &body, false)
            .map_err(|err| NodeError::BrokerPublishFailed(err.to_string()))
    }

    pub fn data_topic(&self) -> &str {
        &self.data_topic
    }

    pub fn control_topic(&self) -> &str {
        &self.control_topic
    }

    fn connect(&mut self, store: &ConfigStore, now_ms: u64) {
        let identity = store.broker_identity();
        self.data_topic = data_topic(&identity.client_id);
        self.control_topic = control_topic(&identity.client_id);
        self.last_attempt_ms = Some(now_ms);

        match self.transport.begin_connect(&identity) {
            Ok(()) => {
                info!(
                    "broker: connecting to {}:{} as '{}'",
                    identity.host, identity.port, identity.client_id
                );
                self.attempt_started_ms = now_ms;
                self.last_status_log_ms = now_ms;
                self.set_state(BrokerSessionState::Connecting);
            }
            Err(err) => NodeError::BrokerConnectFailed(err.to_string()).report(),
        }
        self.identity = Some(identity);
    }

    fn handle_event(&mut self, event: TransportEvent, commands: &mut Vec<LightCommand>) {
        match event {
            TransportEvent::Connected => {
                if self.state == BrokerSessionState::Connecting {
                    self.on_connected();
                }
            }
            TransportEvent::Disconnected => match self.state {
                BrokerSessionState::Connecting => {
                    NodeError::BrokerConnectFailed("refused".to_string()).report();
                    self.set_state(BrokerSessionState::Idle);
                }
                BrokerSessionState::Connected => {
                    warn!("broker: connection lost");
                    self.set_state(BrokerSessionState::Disconnected);
                }
                _ => {}
            },
            TransportEvent::Message { topic, payload } => {
                if self.state != BrokerSessionState::Connected || topic != self.control_topic {
                    debug!("broker: ignoring message on {topic}");
                    return;
                }
                if let Some(command) = parse_control_payload(&payload) {
                    info!("broker: received {command:?}");
                    commands.push(command);
                }
            }
        }
    }

    fn on_connected(&mut self) {
        if let Err(err) = self.transport.subscribe(&self.control_topic) {
            NodeError::BrokerConnectFailed(format!("subscribe failed: {err}")).report();
            self.transport.disconnect();
            self.set_state(BrokerSessionState::Idle);
            return;
        }
        self.set_state(BrokerSessionState::Connected);

        let client_id = self
            .identity
            .as_ref()
            .map(|identity| identity.client_id.clone())
            .unwrap_or_default();
        match discovery_messages(&client_id) {
            Ok(messages) => {
                for message in messages {
                    if let Err(err) =
                        self.transport
                            .publish(&message.topic, message.payload.as_bytes(), true)
                    {
                        warn!("broker: discovery publish to {} failed: {err}", message.topic);
                    }
                }
            }
            Err(err) => warn!("broker: discovery encoding failed: {err}"),
        }
    }

    fn set_state(&mut self, next: BrokerSessionState) {
        if self.state != next {
            info!("broker: {} -> {}", self.state.as_str(), next.as_str());
            self.state = next;
        }
    }
}

fn parse_control_payload(payload: &[u8]) -> Option<LightCommand> {
    if payload.len() > MAX_CONTROL_PAYLOAD_BYTES {
        warn!("broker: dropping {} byte control payload", payload.len());
        return None;
    }
    let Ok(text) = std::str::from_utf8(payload) else {
        warn!("broker: dropping non-utf8 control payload");
        return None;
    };
    let command = LightCommand::parse(text);
    if command.is_none() {
        warn!("broker: unknown control payload '{}'", text.trim());
    }
    command
}
