use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, Incoming, MqttOptions, QoS};
use tokio::{
    runtime::Handle,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, warn};

use envmon_common::{BrokerIdentity, BrokerTransport, TransportError, TransportEvent};

const KEEP_ALIVE_SECS: u64 = 15;
const REQUEST_CAPACITY: usize = 32;

/// `rumqttc` session driven on the shared tokio runtime. Events are handed to
/// the scheduler thread through an unbounded channel and drained with
/// `try_recv`, so `poll` never blocks.
pub struct MqttTransport {
    runtime: Handle,
    client: Option<AsyncClient>,
    task: Option<JoinHandle<()>>,
    events: Option<UnboundedReceiver<TransportEvent>>,
}

impl MqttTransport {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            client: None,
            task: None,
            events: None,
        }
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.client.as_ref().ok_or(TransportError::NotConnected)
    }
}

pub fn mqtt_options(identity: &BrokerIdentity) -> MqttOptions {
    let mut options = MqttOptions::new(&identity.client_id, &identity.host, identity.port);
    options.set_keep_alive(Duration::from_secs(KEEP_ALIVE_SECS));
    options.set_clean_session(true);
    if !identity.username.is_empty() {
        options.set_credentials(&identity.username, &identity.password);
    }
    options
}

async fn drive(mut eventloop: rumqttc::EventLoop, tx: UnboundedSender<TransportEvent>) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    TransportEvent::Connected
                } else {
                    warn!("mqtt connection refused: {:?}", ack.code);
                    let _ = tx.send(TransportEvent::Disconnected);
                    return;
                }
            }
            Ok(Event::Incoming(Incoming::Publish(message))) => TransportEvent::Message {
                topic: message.topic,
                payload: message.payload.to_vec(),
            },
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                let _ = tx.send(TransportEvent::Disconnected);
                return;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!("mqtt poll error: {err}");
                let _ = tx.send(TransportEvent::Disconnected);
                return;
            }
        };
        if tx.send(event).is_err() {
            return;
        }
    }
}

impl BrokerTransport for MqttTransport {
    fn begin_connect(&mut self, identity: &BrokerIdentity) -> Result<(), TransportError> {
        self.disconnect();

        let (client, eventloop) = AsyncClient::new(mqtt_options(identity), REQUEST_CAPACITY);
        let (tx, rx) = unbounded_channel();
        self.task = Some(self.runtime.spawn(drive(eventloop, tx)));
        self.client = Some(client);
        self.events = Some(rx);
        debug!("mqtt eventloop started for {}:{}", identity.host, identity.port);
        Ok(())
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        self.events.as_mut()?.try_recv().ok()
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), TransportError> {
        self.client()?
            .try_publish(topic, QoS::AtMostOnce, retain, payload.to_vec())
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.try_disconnect();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.events = None;
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn identity(username: &str) -> BrokerIdentity {
        BrokerIdentity {
            host: "10.0.0.2".into(),
            port: 1884,
            client_id: "node1".into(),
            username: username.into(),
            password: "pw".into(),
        }
    }

    #[test]
    fn options_carry_identity() {
        let options = mqtt_options(&identity("user"));

        assert_eq!(options.client_id(), "node1");
        assert_eq!(options.broker_address(), ("10.0.0.2".to_string(), 1884));
        assert!(options.credentials().is_some());
        assert!(options.clean_session());
    }

    #[test]
    fn anonymous_identity_sends_no_credentials() {
        assert!(mqtt_options(&identity("")).credentials().is_none());
    }

    #[tokio::test]
    async fn idle_transport_reports_not_connected() {
        let mut transport = MqttTransport::new(Handle::current());

        assert_eq!(transport.poll(), None);
        assert_eq!(
            transport.publish("t", b"x", false),
            Err(TransportError::NotConnected)
        );
    }
}
