use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::MqttConfig;
use super::client::ClientEvent;
use super::client::EventReceiver;
use super::client::MqttClient;
use super::client::MqttMessage;
use super::client::Qos;
use super::discovery::DiscoveryAction;
use super::discovery::DiscoveryData;
use super::discovery::DiscoveryRegistry;
use super::discovery::discovery_subscription_topics;
use super::discovery::expand_payload;
use super::discovery::parse_discovery_topic;
use super::dispatcher::Dispatcher;
use super::dispatcher::discovery_new_signal;
use super::error::MqttError;
use super::host::MqttHost;
use super::humidifier;
use super::humidifier::HumidifierPlatform;
use crate::engine::FromIntegrationMessage;
use crate::engine::FromIntegrationSender;
use crate::engine::Integration;
use crate::engine::IntegrationError;
use crate::engine::ToIntegrationMessage;

/// Everything the integration mutates, guarded by one lock so inbound
/// messages and commands never interleave.
struct Inner<C: MqttClient> {
    host: MqttHost<C>,
    config: MqttConfig,
    discovery: DiscoveryRegistry,
    dispatcher: Dispatcher<DiscoveryData>,
    humidifiers: HumidifierPlatform,
    to_engine: Option<FromIntegrationSender>,
}

type SharedInner<C> = Arc<Mutex<Inner<C>>>;

/// MQTT integration
///
/// Connects to the broker, listens for humidifier discovery messages, and
/// hosts statically configured and discovered humidifier entities.
pub struct MqttIntegration<C: MqttClient> {
    inner: SharedInner<C>,
    config: MqttConfig,
    /// Background tasks: inbound message loop and discovery platform
    tasks: Vec<JoinHandle<()>>,
}

fn boxed(e: MqttError) -> IntegrationError {
    Box::new(e)
}

impl<C: MqttClient + 'static> MqttIntegration<C> {
    /// Create a new MQTT integration
    pub fn new(client: C, config: &MqttConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                host: MqttHost::new(client),
                config: config.clone(),
                discovery: DiscoveryRegistry::new(),
                dispatcher: Dispatcher::new(),
                humidifiers: HumidifierPlatform::new(),
                to_engine: None,
            })),
            config: config.clone(),
            tasks: Vec::new(),
        }
    }

    /// Process client events until the client's stream ends
    async fn process_events_task(inner: SharedInner<C>, mut rx: EventReceiver) {
        while let Some(event) = rx.recv().await {
            let mut inner = inner.lock().await;
            match event {
                ClientEvent::Message(msg) => {
                    debug!("Received message on topic: {}", msg.topic);
                    if let Err(e) = inner.handle_mqtt_message(&msg).await {
                        warn!("Error handling message on {}: {}", msg.topic, e);
                    }
                }
                ClientEvent::Reconnected => {
                    info!("Broker session lost, subscribing again");
                    if let Err(e) = inner.resubscribe().await {
                        warn!("Failed to restore subscriptions: {}", e);
                    }
                }
            }
        }
        info!("MQTT event stream closed");
    }

    /// Humidifier platform side of discovery: set up entities announced on
    /// the discovery signal
    async fn discover_humidifiers_task(
        inner: SharedInner<C>,
        mut rx: mpsc::UnboundedReceiver<DiscoveryData>,
    ) {
        while let Some(data) = rx.recv().await {
            let mut inner = inner.lock().await;
            inner.discover_humidifier(data).await;
        }
    }
}

impl<C: MqttClient> Inner<C> {
    async fn handle_mqtt_message(&mut self, msg: &MqttMessage) -> Result<(), MqttError> {
        if self.config.discovery {
            if let Some(topic) = parse_discovery_topic(&msg.topic, &self.config.discovery_prefix) {
                if topic.component == humidifier::DOMAIN {
                    let data = DiscoveryData {
                        hash: topic.hash(),
                        topic: msg.topic.clone(),
                        payload: Default::default(),
                    };
                    return self.handle_discovery(data, &msg.payload).await;
                }
            }
        }

        let payload = std::str::from_utf8(&msg.payload).map_err(MqttError::PayloadEncoding)?;

        for listener in self.host.subscriptions.listeners(&msg.topic) {
            let Some(entity) = self.humidifiers.get_mut(&listener.owner) else {
                continue;
            };
            match entity.handle_message(&listener.role, payload) {
                Ok(true) => {
                    let state = entity.state();
                    self.report(FromIntegrationMessage::HumidifierStateChanged {
                        entity_id: listener.owner.clone(),
                        state,
                    })
                    .await;
                }
                Ok(false) => {}
                Err(e) => warn!(
                    "{}: failed to handle {} message: {}",
                    listener.owner, listener.role, e
                ),
            }
        }

        Ok(())
    }

    /// Handle a message on a humidifier discovery topic
    async fn handle_discovery(
        &mut self,
        mut data: DiscoveryData,
        payload: &[u8],
    ) -> Result<(), MqttError> {
        let payload = if payload.is_empty() {
            None
        } else {
            let value: Value = serde_json::from_slice(payload).map_err(MqttError::PayloadParse)?;
            Some(expand_payload(value)?)
        };

        match self.discovery.process(&data.hash, payload.as_ref()) {
            DiscoveryAction::Add => {
                info!("Discovered new humidifier: {}", data.hash);
                data.payload = payload.unwrap_or_default();
                let hash = data.hash.clone();
                let signal = discovery_new_signal(humidifier::DOMAIN);
                if self.dispatcher.send(&signal, data) == 0 {
                    warn!("No platform listening on {}, dropping {}", signal, hash);
                    self.discovery.clear(&hash);
                }
            }
            DiscoveryAction::Update { entity_id } => {
                info!("Updating {} from discovery", entity_id);
                let Some(entity) = self.humidifiers.get_mut(&entity_id) else {
                    return Err(MqttError::EntityNotFound(entity_id));
                };
                entity
                    .discovery_update(&mut self.host, payload.unwrap_or_default())
                    .await?;
                let info = entity.entity_info();
                let state = entity.state();
                self.report(FromIntegrationMessage::EntityDiscovered {
                    entity_id: entity_id.clone(),
                    integration_name: "mqtt".to_string(),
                    info,
                })
                .await;
                self.report(FromIntegrationMessage::HumidifierStateChanged { entity_id, state })
                    .await;
            }
            DiscoveryAction::Unchanged { entity_id } => {
                debug!("Ignoring unchanged discovery payload for {}", entity_id);
            }
            DiscoveryAction::Remove {
                entity_id: Some(entity_id),
            } => {
                self.remove_humidifier(&entity_id).await?;
            }
            DiscoveryAction::Remove { entity_id: None } => {
                debug!("Nothing to remove for {}", data.hash);
            }
        }

        Ok(())
    }

    async fn discover_humidifier(&mut self, data: DiscoveryData) {
        let hash = data.hash.clone();
        match self
            .humidifiers
            .discover(&mut self.host, &mut self.discovery, data)
            .await
        {
            Ok(entity_id) => self.announce(&entity_id).await,
            Err(e) => warn!("Failed to set up discovered humidifier {}: {}", hash, e),
        }
    }

    /// Register an entity with the engine and report its initial state
    async fn announce(&self, entity_id: &str) {
        let Some(entity) = self.humidifiers.get(entity_id) else {
            return;
        };
        debug!("{} ready (polled: {})", entity_id, entity.should_poll());
        let info = entity.entity_info();
        let state = entity.state();
        self.report(FromIntegrationMessage::EntityDiscovered {
            entity_id: entity_id.to_string(),
            integration_name: "mqtt".to_string(),
            info,
        })
        .await;
        self.report(FromIntegrationMessage::HumidifierStateChanged {
            entity_id: entity_id.to_string(),
            state,
        })
        .await;
    }

    async fn remove_humidifier(&mut self, entity_id: &str) -> Result<(), MqttError> {
        let hash = self
            .humidifiers
            .remove_entity(&mut self.host, entity_id)
            .await?;
        if let Some(hash) = hash {
            self.discovery.clear(&hash);
        }
        self.report(FromIntegrationMessage::EntityRemoved {
            entity_id: entity_id.to_string(),
        })
        .await;
        Ok(())
    }

    async fn subscribe_discovery(&mut self) -> Result<(), MqttError> {
        for topic in discovery_subscription_topics(&self.config.discovery_prefix, humidifier::DOMAIN)
        {
            info!("Subscribing to discovery topic: {}", topic);
            self.host.client.subscribe(&topic, Qos::AtMostOnce).await?;
        }
        Ok(())
    }

    /// Re-issue discovery filters and every entity subscription
    async fn resubscribe(&mut self) -> Result<(), MqttError> {
        if self.config.discovery {
            self.subscribe_discovery().await?;
        }
        self.host.restore_subscriptions().await
    }

    async fn handle_command(&mut self, msg: ToIntegrationMessage) -> Result<(), MqttError> {
        let entity = self
            .humidifiers
            .get(msg.entity_id())
            .ok_or_else(|| MqttError::EntityNotFound(msg.entity_id().to_string()))?;

        match msg {
            ToIntegrationMessage::HumidifierTurnOn {
                entity_id,
                humidity,
            } => {
                info!("Turning on {} (humidity {:?})", entity_id, humidity);
                entity.turn_on(&mut self.host, humidity).await
            }
            ToIntegrationMessage::HumidifierSetHumidity {
                entity_id,
                humidity,
            } => {
                info!("Setting humidity of {} to {}", entity_id, humidity);
                entity.set_humidity(&mut self.host, humidity).await
            }
        }
    }

    async fn report(&self, msg: FromIntegrationMessage) {
        let Some(tx) = &self.to_engine else {
            return;
        };
        if let Err(e) = tx.send(msg).await {
            warn!("Failed to report to engine: {}", e);
        }
    }
}

#[async_trait]
impl<C: MqttClient + 'static> Integration for MqttIntegration<C> {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn setup(&mut self, tx: FromIntegrationSender) -> Result<(), IntegrationError> {
        info!(
            "Connecting to MQTT broker at {}:{}",
            self.config.broker, self.config.port
        );

        let mut inner = self.inner.lock().await;
        inner.to_engine = Some(tx);
        let events = inner.host.client.connect().await.map_err(boxed)?;

        if self.config.discovery {
            // Connect the platform before subscribing, so retained discovery
            // payloads are never dispatched into the void
            let discovered = inner
                .dispatcher
                .connect(&discovery_new_signal(humidifier::DOMAIN));
            self.tasks.push(tokio::spawn(Self::discover_humidifiers_task(
                self.inner.clone(),
                discovered,
            )));

            inner.subscribe_discovery().await.map_err(boxed)?;
        }

        for config in &self.config.humidifiers {
            let Inner {
                host, humidifiers, ..
            } = &mut *inner;
            match humidifiers.add_entity(host, config.clone(), None).await {
                Ok(entity_id) => inner.announce(&entity_id).await,
                Err(e) => warn!("Failed to set up humidifier {:?}: {}", config.name, e),
            }
        }

        drop(inner);
        self.tasks.push(tokio::spawn(Self::process_events_task(
            self.inner.clone(),
            events,
        )));

        info!("MQTT integration ready to handle commands");
        Ok(())
    }

    async fn handle_command(
        &mut self,
        command: ToIntegrationMessage,
    ) -> Result<(), IntegrationError> {
        self.inner
            .lock()
            .await
            .handle_command(command)
            .await
            .map_err(boxed)
    }

    async fn shutdown(&mut self) -> Result<(), IntegrationError> {
        info!("MQTT integration shutting down");

        for task in self.tasks.drain(..) {
            task.abort();
        }

        let mut inner = self.inner.lock().await;
        for entity_id in inner.humidifiers.entity_ids() {
            if let Err(e) = inner.remove_humidifier(&entity_id).await {
                warn!("Failed to remove {}: {}", entity_id, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::engine::HumidifierState;
    use crate::integrations::mqtt::client::MockMqttClient;

    const DISCOVERY_TOPIC: &str = "homeassistant/humidifier/bedroom/config";

    fn config(toml_text: &str) -> MqttConfig {
        toml::from_str(toml_text).unwrap()
    }

    fn discovery_only() -> MqttConfig {
        config(
            r#"
            broker = "localhost"
            client_id = "test"
            "#,
        )
    }

    async fn setup(
        config: MqttConfig,
    ) -> (
        MqttIntegration<MockMqttClient>,
        mpsc::Receiver<FromIntegrationMessage>,
    ) {
        let mut integration = MqttIntegration::new(MockMqttClient::new(), &config);
        let (tx, rx) = mpsc::channel(64);
        integration.setup(tx).await.unwrap();
        (integration, rx)
    }

    /// Let the background tasks drain their queues
    async fn settle() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    async fn deliver(integration: &MqttIntegration<MockMqttClient>, topic: &str, payload: &str) {
        integration
            .inner
            .lock()
            .await
            .host
            .client
            .deliver(topic, payload.as_bytes());
        settle().await;
    }

    fn drain(rx: &mut mpsc::Receiver<FromIntegrationMessage>) -> Vec<FromIntegrationMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            messages.push(msg);
        }
        messages
    }

    fn last_state(messages: &[FromIntegrationMessage]) -> Option<HumidifierState> {
        messages.iter().rev().find_map(|m| match m {
            FromIntegrationMessage::HumidifierStateChanged { state, .. } => Some(state.clone()),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_setup_subscribes_discovery_topics() {
        let (integration, _rx) = setup(discovery_only()).await;

        let inner = integration.inner.lock().await;
        assert!(inner.host.client.is_connected);
        assert_eq!(
            inner.host.client.subscriptions,
            vec![
                ("homeassistant/humidifier/+/config".to_string(), Qos::AtMostOnce),
                ("homeassistant/humidifier/+/+/config".to_string(), Qos::AtMostOnce),
            ]
        );
    }

    #[tokio::test]
    async fn test_static_humidifier_receives_state() {
        let (integration, mut rx) = setup(config(
            r#"
            broker = "localhost"
            client_id = "test"
            discovery = false

            [[humidifier]]
            name = "Bedroom"
            command_topic = "h/cmd"
            state_topic = "h/state"
            "#,
        ))
        .await;

        let messages = drain(&mut rx);
        assert!(matches!(
            &messages[0],
            FromIntegrationMessage::EntityDiscovered { entity_id, .. } if entity_id == "humidifier.bedroom"
        ));

        deliver(&integration, "h/state", r#"{"state":"ON","humidity":55}"#).await;

        let state = last_state(&drain(&mut rx)).unwrap();
        assert!(state.is_on);
        assert_eq!(state.humidity, Some(json!(55)));
    }

    #[tokio::test]
    async fn test_malformed_state_is_not_reported() {
        let (integration, mut rx) = setup(config(
            r#"
            broker = "localhost"
            discovery = false

            [[humidifier]]
            command_topic = "h/cmd"
            state_topic = "h/state"
            "#,
        ))
        .await;
        drain(&mut rx);

        deliver(&integration, "h/state", "not-json").await;

        assert!(drain(&mut rx).is_empty());
        let inner = integration.inner.lock().await;
        assert!(!inner.humidifiers.get("humidifier.mqtt_humidifier").unwrap().is_on());
    }

    #[tokio::test]
    async fn test_discovery_creates_entity() {
        let (integration, mut rx) = setup(discovery_only()).await;

        deliver(
            &integration,
            DISCOVERY_TOPIC,
            r#"{"name": "Bedroom", "~": "home/bedroom", "cmd_t": "~/set", "stat_t": "~/state"}"#,
        )
        .await;

        let messages = drain(&mut rx);
        assert!(matches!(
            &messages[0],
            FromIntegrationMessage::EntityDiscovered { entity_id, .. } if entity_id == "humidifier.bedroom"
        ));

        {
            let inner = integration.inner.lock().await;
            assert!(inner.host.subscriptions.is_subscribed("home/bedroom/state"));
        }

        deliver(&integration, "home/bedroom/state", r#"{"state":"ON"}"#).await;
        assert!(last_state(&drain(&mut rx)).unwrap().is_on);
    }

    #[tokio::test]
    async fn test_discovery_update_resubscribes() {
        let (integration, mut rx) = setup(discovery_only()).await;
        deliver(
            &integration,
            DISCOVERY_TOPIC,
            r#"{"name": "Bedroom", "cmd_t": "h/cmd", "stat_t": "h/state"}"#,
        )
        .await;
        // Identical payload is ignored
        deliver(
            &integration,
            DISCOVERY_TOPIC,
            r#"{"name": "Bedroom", "cmd_t": "h/cmd", "stat_t": "h/state"}"#,
        )
        .await;
        deliver(
            &integration,
            DISCOVERY_TOPIC,
            r#"{"name": "Bedroom", "cmd_t": "h2/cmd", "stat_t": "h2/state"}"#,
        )
        .await;
        drain(&mut rx);

        let inner = integration.inner.lock().await;
        let client = &inner.host.client;
        assert_eq!(client.subscribe_count("h/state"), 1);
        assert_eq!(client.subscribe_count("h2/state"), 1);
        assert_eq!(client.unsubscriptions, vec!["h/state".to_string()]);
        assert_eq!(inner.humidifiers.len(), 1);
    }

    #[tokio::test]
    async fn test_back_to_back_discovery_payloads_apply_latest() {
        let (integration, mut rx) = setup(discovery_only()).await;
        {
            let inner = integration.inner.lock().await;
            inner.host.client.deliver(
                DISCOVERY_TOPIC,
                br#"{"name": "Bedroom", "cmd_t": "h/cmd", "stat_t": "h/state"}"#,
            );
            inner.host.client.deliver(
                DISCOVERY_TOPIC,
                br#"{"name": "Bedroom", "cmd_t": "h2/cmd", "stat_t": "h2/state"}"#,
            );
        }
        settle().await;
        drain(&mut rx);

        {
            let inner = integration.inner.lock().await;
            assert_eq!(inner.humidifiers.len(), 1);
            assert!(inner.host.subscriptions.is_subscribed("h2/state"));
            assert!(!inner.host.subscriptions.is_subscribed("h/state"));
        }

        // The latest payload is what the entity runs with
        deliver(&integration, "h2/state", r#"{"state":"ON"}"#).await;
        assert!(last_state(&drain(&mut rx)).unwrap().is_on);
    }

    #[tokio::test]
    async fn test_removal_with_failed_unsubscribe_forgets_hash() {
        let (integration, mut rx) = setup(discovery_only()).await;
        deliver(
            &integration,
            DISCOVERY_TOPIC,
            r#"{"name": "Bedroom", "cmd_t": "h/cmd", "stat_t": "h/state"}"#,
        )
        .await;
        integration
            .inner
            .lock()
            .await
            .host
            .client
            .rejected_topics
            .push("h/state".to_string());

        deliver(&integration, DISCOVERY_TOPIC, "").await;
        assert!(matches!(
            &drain(&mut rx)[..],
            [.., FromIntegrationMessage::EntityRemoved { .. }]
        ));

        // Rediscovered from scratch rather than routed to the removed entity
        deliver(
            &integration,
            DISCOVERY_TOPIC,
            r#"{"name": "Bedroom", "cmd_t": "h2/cmd"}"#,
        )
        .await;
        let messages = drain(&mut rx);
        assert!(matches!(
            &messages[0],
            FromIntegrationMessage::EntityDiscovered { entity_id, .. } if entity_id == "humidifier.bedroom"
        ));
        assert_eq!(integration.inner.lock().await.humidifiers.len(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_restores_subscriptions() {
        let (integration, _rx) = setup(config(
            r#"
            broker = "localhost"
            client_id = "test"

            [[humidifier]]
            command_topic = "h/cmd"
            state_topic = "h/state"
            "#,
        ))
        .await;
        integration
            .inner
            .lock()
            .await
            .host
            .client
            .subscriptions
            .clear();

        integration.inner.lock().await.host.client.reconnect();
        settle().await;

        let inner = integration.inner.lock().await;
        assert_eq!(
            inner.host.client.subscriptions,
            vec![
                ("homeassistant/humidifier/+/config".to_string(), Qos::AtMostOnce),
                ("homeassistant/humidifier/+/+/config".to_string(), Qos::AtMostOnce),
                ("h/state".to_string(), Qos::AtMostOnce),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_discovery_payload_removes_entity() {
        let (integration, mut rx) = setup(discovery_only()).await;
        deliver(
            &integration,
            DISCOVERY_TOPIC,
            r#"{"name": "Bedroom", "cmd_t": "h/cmd", "stat_t": "h/state"}"#,
        )
        .await;
        drain(&mut rx);

        deliver(&integration, DISCOVERY_TOPIC, "").await;

        let messages = drain(&mut rx);
        assert!(matches!(
            &messages[..],
            [FromIntegrationMessage::EntityRemoved { entity_id }] if entity_id == "humidifier.bedroom"
        ));
        let inner = integration.inner.lock().await;
        assert!(inner.humidifiers.is_empty());
        assert_eq!(inner.host.client.unsubscriptions, vec!["h/state".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_discovery_can_be_retried() {
        let (integration, mut rx) = setup(discovery_only()).await;

        deliver(&integration, DISCOVERY_TOPIC, r#"{"stat_t": "h/state"}"#).await;
        assert!(drain(&mut rx).is_empty());

        // Same hash again, now valid: treated as new because the hash was cleared
        deliver(&integration, DISCOVERY_TOPIC, r#"{"cmd_t": "h/cmd"}"#).await;
        assert!(!drain(&mut rx).is_empty());
        assert_eq!(integration.inner.lock().await.humidifiers.len(), 1);
    }

    #[tokio::test]
    async fn test_commands_publish_to_command_topic() {
        let (mut integration, _rx) = setup(config(
            r#"
            broker = "localhost"
            discovery = false

            [[humidifier]]
            name = "Bedroom"
            command_topic = "h/cmd"
            "#,
        ))
        .await;

        integration
            .handle_command(ToIntegrationMessage::HumidifierTurnOn {
                entity_id: "humidifier.bedroom".to_string(),
                humidity: Some(60),
            })
            .await
            .unwrap();
        integration
            .handle_command(ToIntegrationMessage::HumidifierSetHumidity {
                entity_id: "humidifier.bedroom".to_string(),
                humidity: 45,
            })
            .await
            .unwrap();

        let inner = integration.inner.lock().await;
        let payloads: Vec<_> = inner.host.client.published.iter().map(|p| p.json()).collect();
        assert_eq!(
            payloads,
            vec![
                json!({"state": "ON"}),
                json!({"humidity": 60}),
                json!({"humidity": 45}),
            ]
        );
    }

    #[tokio::test]
    async fn test_command_for_unknown_entity() {
        let (mut integration, _rx) = setup(discovery_only()).await;

        let err = integration
            .handle_command(ToIntegrationMessage::HumidifierSetHumidity {
                entity_id: "humidifier.missing".to_string(),
                humidity: 45,
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "entity not found: humidifier.missing");
    }

    #[tokio::test]
    async fn test_shutdown_removes_entities() {
        let (mut integration, mut rx) = setup(config(
            r#"
            broker = "localhost"
            discovery = false

            [[humidifier]]
            command_topic = "h/cmd"
            state_topic = "h/state"
            "#,
        ))
        .await;
        drain(&mut rx);

        integration.shutdown().await.unwrap();

        assert!(matches!(
            &drain(&mut rx)[..],
            [FromIntegrationMessage::EntityRemoved { .. }]
        ));
        let inner = integration.inner.lock().await;
        assert!(inner.humidifiers.is_empty());
        assert_eq!(inner.host.client.unsubscriptions, vec!["h/state".to_string()]);
    }
}
