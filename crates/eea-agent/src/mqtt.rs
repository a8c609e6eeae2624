//! MQTT transport over rumqttc's synchronous client.

use crate::connectivity::{PublishOutcome, Transport, TransportEvent};
use eea_core::{AgentConfig, Error, OutboundPublish, QoS, Result};
use rumqttc::{
    Client, ClientError, ConnectReturnCode, Connection, ConnectionError, Event, MqttOptions,
    Packet, RecvTimeoutError,
};
use std::time::Duration;

/// Bundles arrive as a single publish, so incoming packets may be large.
const MAX_INCOMING_PACKET: usize = 4 * 1024 * 1024;
const MAX_OUTGOING_PACKET: usize = 256 * 1024;

pub struct RumqttTransport {
    client: Client,
    connection: Connection,
}

impl RumqttTransport {
    pub fn new(config: &AgentConfig) -> Self {
        let mut options = MqttOptions::new(
            config.device_id.clone(),
            config.broker.host.clone(),
            config.broker.port,
        );
        options
            .set_credentials(config.access_key.clone(), config.access_secret.clone())
            .set_keep_alive(config.broker.keep_alive())
            .set_clean_session(true)
            .set_max_packet_size(MAX_INCOMING_PACKET, MAX_OUTGOING_PACKET);

        let (client, connection) = Client::new(options, config.broker.request_capacity);
        Self { client, connection }
    }
}

fn mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

impl Transport for RumqttTransport {
    fn poll(&mut self, timeout: Duration) -> TransportEvent {
        match self.connection.recv_timeout(timeout) {
            Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                if ack.code == ConnectReturnCode::Success {
                    TransportEvent::Connected
                } else {
                    TransportEvent::ConnectionRefused(format!("{:?}", ack.code))
                }
            }
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => TransportEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            },
            Ok(Ok(_)) => TransportEvent::Idle,
            Ok(Err(ConnectionError::ConnectionRefused(code))) => {
                TransportEvent::ConnectionRefused(format!("{:?}", code))
            }
            Ok(Err(e)) => TransportEvent::Disconnected(e.to_string()),
            Err(RecvTimeoutError::Timeout) => TransportEvent::Idle,
            Err(RecvTimeoutError::Disconnected) => {
                TransportEvent::Disconnected("event loop closed".to_string())
            }
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.client
            .try_subscribe(topic, rumqttc::QoS::AtLeastOnce)
            .map_err(|e| Error::Transport(format!("subscribe {}: {}", topic, e)))
    }

    fn publish(&mut self, message: &OutboundPublish) -> Result<PublishOutcome> {
        match self.client.try_publish(
            message.topic.as_str(),
            mqtt_qos(message.qos),
            false,
            message.payload.as_bytes().to_vec(),
        ) {
            Ok(()) => Ok(PublishOutcome::Accepted),
            Err(ClientError::TryRequest(_)) => Ok(PublishOutcome::Busy),
            Err(e) => Err(Error::Transport(e.to_string())),
        }
    }

    fn disconnect(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!("Disconnect request not queued: {}", e);
        }
    }
}
