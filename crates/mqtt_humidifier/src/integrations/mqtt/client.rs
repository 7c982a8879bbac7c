use std::time::Duration;

use async_trait::async_trait;
use rumqttc::AsyncClient;
use rumqttc::Event;
use rumqttc::MqttOptions;
use rumqttc::Packet;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::MqttConfig;
use super::error::MqttError;

/// MQTT quality-of-service level, passed through to the broker unmodified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "u8")]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(format!("invalid QoS level {}, expected 0, 1 or 2", other)),
        }
    }
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// MQTT message received from a subscription
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// What the client reports from its broker connection
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Message(MqttMessage),
    /// The connection came back without its session; the broker no longer
    /// holds any of our subscriptions.
    Reconnected,
}

/// Stream of client events, handed out once by [`MqttClient::connect`]
pub type EventReceiver = mpsc::UnboundedReceiver<ClientEvent>;

/// Trait for MQTT client operations
///
/// This trait allows for mocking the MQTT client for testing purposes
#[async_trait]
pub trait MqttClient: Send + Sync {
    /// Connect to the MQTT broker, returning the inbound event stream
    async fn connect(&mut self) -> Result<EventReceiver, MqttError>;

    /// Subscribe to an MQTT topic filter
    async fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), MqttError>;

    /// Unsubscribe from an MQTT topic filter
    async fn unsubscribe(&mut self, topic: &str) -> Result<(), MqttError>;

    /// Publish a message to an MQTT topic
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
        retain: bool,
    ) -> Result<(), MqttError>;
}

/// A message recorded by the mock client
#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

#[cfg(test)]
impl Published {
    /// Decode the payload as JSON
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap()
    }
}

/// Mock MQTT client for testing
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockMqttClient {
    pub subscriptions: Vec<(String, Qos)>,
    pub unsubscriptions: Vec<String>,
    pub published: Vec<Published>,
    pub is_connected: bool,
    /// Subscribe and unsubscribe requests for these topics fail
    pub rejected_topics: Vec<String>,
    inbound: Option<mpsc::UnboundedSender<ClientEvent>>,
}

#[cfg(test)]
#[async_trait]
impl MqttClient for MockMqttClient {
    async fn connect(&mut self) -> Result<EventReceiver, MqttError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inbound = Some(tx);
        self.is_connected = true;
        Ok(rx)
    }

    async fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), MqttError> {
        if self.rejected_topics.iter().any(|t| t == topic) {
            return Err(MqttError::NotConnected);
        }
        self.subscriptions.push((topic.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), MqttError> {
        if self.rejected_topics.iter().any(|t| t == topic) {
            return Err(MqttError::NotConnected);
        }
        self.unsubscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.published.push(Published {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        });
        Ok(())
    }
}

#[cfg(test)]
impl MockMqttClient {
    /// Create a new mock MQTT client
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a message into the inbound stream, as if the broker delivered it
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        self.emit(ClientEvent::Message(MqttMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        }));
    }

    /// Simulate the broker dropping the session and the client reconnecting
    pub fn reconnect(&self) {
        self.emit(ClientEvent::Reconnected);
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(event);
        }
    }

    /// Number of SUBSCRIBE requests issued for a topic
    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.subscriptions.iter().filter(|(t, _)| t == topic).count()
    }
}

/// Real MQTT client implementation using rumqttc
pub struct RumqttcClient {
    /// MQTT connection options (stored for lazy initialization)
    mqtt_options: MqttOptions,

    /// AsyncClient (created in connect())
    client: Option<AsyncClient>,

    /// Background event loop task handle
    event_loop_task: Option<JoinHandle<()>>,
}

impl RumqttcClient {
    /// Create a new RumqttcClient from configuration
    pub fn new(config: &MqttConfig) -> anyhow::Result<Self> {
        let mut mqtt_options =
            MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);

        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        // Retained discovery payloads can be large
        mqtt_options.set_max_packet_size(2 * 1024 * 1024, 2 * 1024 * 1024);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        Ok(Self {
            mqtt_options,
            client: None,
            event_loop_task: None,
        })
    }

    fn connected(&self) -> Result<&AsyncClient, MqttError> {
        self.client.as_ref().ok_or(MqttError::NotConnected)
    }
}

#[async_trait]
impl MqttClient for RumqttcClient {
    async fn connect(&mut self) -> Result<EventReceiver, MqttError> {
        let (client, mut event_loop) = AsyncClient::new(self.mqtt_options.clone(), 10);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut connected_before = false;
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let msg = MqttMessage {
                            topic: publish.topic.to_string(),
                            payload: publish.payload.to_vec(),
                        };

                        // Send to channel; if receiver dropped, exit
                        if event_tx.send(ClientEvent::Message(msg)).is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        tracing::info!("Connected to MQTT broker");
                        if connected_before
                            && !ack.session_present
                            && event_tx.send(ClientEvent::Reconnected).is_err()
                        {
                            break;
                        }
                        connected_before = true;
                    }
                    Ok(_) => {
                        // Ignore other events (suback, puback, pings)
                    }
                    Err(e) => {
                        tracing::warn!("MQTT event loop error: {}", e);
                        // Sleep briefly before polling again, which reconnects
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            tracing::info!("MQTT event loop task exiting");
        });

        self.client = Some(client);
        self.event_loop_task = Some(task);

        Ok(event_rx)
    }

    async fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), MqttError> {
        self.connected()?
            .subscribe(topic, qos.into())
            .await
            .map_err(MqttError::Client)
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), MqttError> {
        self.connected()?
            .unsubscribe(topic)
            .await
            .map_err(MqttError::Client)
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.connected()?
            .publish(topic, qos.into(), retain, payload.to_vec())
            .await
            .map_err(MqttError::Client)
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop_task.take() {
            task.abort();
        }
    }
}
