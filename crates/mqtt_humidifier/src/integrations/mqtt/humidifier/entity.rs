use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::warn;

use super::config::HumidifierConfig;
use crate::engine::DeviceInfo;
use crate::engine::EntityInfo;
use crate::engine::HumidifierState;
use crate::integrations::mqtt::attributes::JsonAttributes;
use crate::integrations::mqtt::availability::Availability;
use crate::integrations::mqtt::client::MqttClient;
use crate::integrations::mqtt::device_info::DeviceInfoProvider;
use crate::integrations::mqtt::discovery::DiscoveryData;
use crate::integrations::mqtt::discovery::DiscoveryHash;
use crate::integrations::mqtt::discovery::DiscoveryUpdate;
use crate::integrations::mqtt::error::MqttError;
use crate::integrations::mqtt::host::MqttHost;
use crate::integrations::mqtt::subscription::SubscriptionState;
use crate::integrations::mqtt::subscription::TopicMap;
use crate::integrations::mqtt::subscription::TopicRole;
use crate::integrations::mqtt::subscription::topic_map;
use crate::integrations::mqtt::template::Extractor;

/// Value extractors, resolved once per configuration
#[derive(Debug, Clone, Default, PartialEq)]
struct Extractors {
    state: Extractor,
    /// No template option feeds this one, so it is always the identity
    humidity: Extractor,
}

/// Humidifier entity backed by an MQTT state topic and command topic.
///
/// The state topic carries JSON with optional `state` and `humidity` keys;
/// commands are published as small JSON documents on the command topic.
#[derive(Debug)]
pub struct MqttHumidifier {
    entity_id: String,
    /// Fixed at construction; discovery updates never change it
    unique_id: Option<String>,
    config: HumidifierConfig,
    extractors: Extractors,
    supported_features: u32,

    is_on: bool,
    humidity: Option<Value>,
    sub_state: SubscriptionState,

    availability: Availability,
    attributes: JsonAttributes,
    discovery: DiscoveryUpdate,
    device: DeviceInfoProvider,
}

impl MqttHumidifier {
    pub fn new(
        entity_id: String,
        config: HumidifierConfig,
        discovery_data: Option<DiscoveryData>,
    ) -> Self {
        let mut humidifier = Self {
            entity_id,
            unique_id: config.unique_id.clone(),
            availability: Availability::new(config.availability.clone()),
            attributes: JsonAttributes::new(config.attributes.clone()),
            discovery: DiscoveryUpdate::new(discovery_data),
            device: DeviceInfoProvider::new(config.device.clone()),
            config: config.clone(),
            extractors: Extractors::default(),
            supported_features: 0,
            is_on: false,
            humidity: None,
            sub_state: SubscriptionState::default(),
        };
        humidifier.setup_from_config(config);
        humidifier
    }

    fn setup_from_config(&mut self, config: HumidifierConfig) {
        self.extractors = Extractors {
            state: Extractor::from_template(config.state_value_template.as_ref()),
            humidity: Extractor::Identity,
        };
        self.supported_features = 0;
        self.config = config;
    }

    /// Subscribe everything once the entity is attached to the host
    pub async fn added_to_host<C: MqttClient>(
        &mut self,
        host: &mut MqttHost<C>,
    ) -> Result<(), MqttError> {
        self.attributes
            .subscribe(host, &self.entity_id, self.config.qos)
            .await?;
        self.availability
            .subscribe(host, &self.entity_id, self.config.qos)
            .await?;
        self.subscribe_topics(host).await
    }

    /// Topics this entity itself listens on. The command topic is publish-only
    /// and the humidity handler is not wired to any topic.
    fn topics(&self) -> TopicMap {
        topic_map([(
            TopicRole::StateTopic,
            self.config.state_topic.clone(),
            self.config.qos,
        )])
    }

    async fn subscribe_topics<C: MqttClient>(
        &mut self,
        host: &mut MqttHost<C>,
    ) -> Result<(), MqttError> {
        let topics = self.topics();
        host.subscribe_topics(&self.entity_id, &mut self.sub_state, topics)
            .await
    }

    /// Handle a message delivered for `role`.
    ///
    /// Returns whether the entity must be re-rendered.
    pub fn handle_message(&mut self, role: &TopicRole, payload: &str) -> Result<bool, MqttError> {
        match role {
            TopicRole::StateTopic => {
                self.state_received(payload)?;
                Ok(true)
            }
            TopicRole::HumidityTopic => {
                self.humidity_received(payload);
                Ok(true)
            }
            TopicRole::Availability(index) => Ok(self.availability.handle_message(*index, payload)),
            TopicRole::JsonAttributesTopic => Ok(self.attributes.handle_message(payload)),
        }
    }

    fn state_received(&mut self, payload: &str) -> Result<(), MqttError> {
        let payload = self.extractors.state.extract(payload);
        let value: Value = serde_json::from_str(&payload).map_err(MqttError::PayloadParse)?;
        let Value::Object(fields) = value else {
            return Err(MqttError::PayloadNotObject(payload));
        };

        if let Some(state) = fields.get("state") {
            if state.as_str() == Some(self.config.payload_on.as_str()) {
                self.is_on = true;
            } else if state.as_str() == Some(self.config.payload_off.as_str()) {
                self.is_on = false;
            } else {
                debug!("{}: ignoring unknown state {}", self.entity_id, state);
            }
        }
        if let Some(humidity) = fields.get("humidity") {
            self.humidity = Some(humidity.clone());
        }

        Ok(())
    }

    fn humidity_received(&mut self, payload: &str) {
        self.humidity = Some(Value::String(self.extractors.humidity.extract(payload)));
    }

    /// Turn the humidifier on, then set the target humidity if one is given.
    pub async fn turn_on<C: MqttClient>(
        &self,
        host: &mut MqttHost<C>,
        humidity: Option<i64>,
    ) -> Result<(), MqttError> {
        let payload = json!({ "state": self.config.payload_on });
        self.publish(host, &payload).await?;

        if let Some(humidity) = humidity {
            self.set_humidity(host, humidity).await?;
        }
        Ok(())
    }

    pub async fn set_humidity<C: MqttClient>(
        &self,
        host: &mut MqttHost<C>,
        humidity: i64,
    ) -> Result<(), MqttError> {
        let payload = json!({ "humidity": humidity });
        self.publish(host, &payload).await
    }

    async fn publish<C: MqttClient>(
        &self,
        host: &mut MqttHost<C>,
        payload: &Value,
    ) -> Result<(), MqttError> {
        host.publish(
            &self.config.command_topic,
            &payload.to_string(),
            self.config.qos,
            self.config.retain,
        )
        .await
    }

    /// Reconfigure from a changed discovery payload.
    ///
    /// The payload is validated before anything is applied.
    pub async fn discovery_update<C: MqttClient>(
        &mut self,
        host: &mut MqttHost<C>,
        payload: Map<String, Value>,
    ) -> Result<(), MqttError> {
        let config = HumidifierConfig::from_value(Value::Object(payload.clone()))?;

        self.setup_from_config(config.clone());
        self.attributes
            .discovery_update(host, &self.entity_id, config.attributes, config.qos)
            .await?;
        self.availability
            .discovery_update(host, &self.entity_id, config.availability, config.qos)
            .await?;
        self.device.update(config.device);
        self.discovery.set_payload(payload);
        self.subscribe_topics(host).await
    }

    /// Release all subscriptions before the entity is dropped.
    ///
    /// Every capability is cleaned up even if an earlier one fails; failures
    /// are logged. Returns the discovery hash the host must forget, if any.
    pub async fn will_remove<C: MqttClient>(
        &mut self,
        host: &mut MqttHost<C>,
    ) -> Option<DiscoveryHash> {
        let results = [
            host.unsubscribe_topics(&self.entity_id, &mut self.sub_state).await,
            self.attributes.cleanup(host, &self.entity_id).await,
            self.availability.cleanup(host, &self.entity_id).await,
        ];
        for e in results.into_iter().filter_map(Result::err) {
            warn!("{}: failed to release subscriptions: {}", self.entity_id, e);
        }
        self.discovery.take_hash()
    }

    /// Payload of the discovery message the entity was last configured from
    pub fn discovery_payload(&self) -> Option<&Map<String, Value>> {
        self.discovery.data().map(|data| &data.payload)
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.unique_id.as_deref()
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    pub fn humidity(&self) -> Option<&Value> {
        self.humidity.as_ref()
    }

    /// Same cell as [`Self::humidity`]: the device reports a single value
    pub fn target_humidity(&self) -> Option<&Value> {
        self.humidity.as_ref()
    }

    pub fn should_poll(&self) -> bool {
        false
    }

    pub fn available(&self) -> bool {
        self.availability.available()
    }

    pub fn extra_state_attributes(&self) -> &Map<String, Value> {
        self.attributes.attributes()
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device.device_info()
    }

    pub fn supported_features(&self) -> u32 {
        self.supported_features
    }

    /// Render the entity for the engine
    pub fn state(&self) -> HumidifierState {
        HumidifierState {
            name: self.name().to_string(),
            unique_id: self.unique_id().map(str::to_string),
            is_on: self.is_on(),
            humidity: self.humidity().cloned(),
            target_humidity: self.target_humidity().cloned(),
            available: self.available(),
            attributes: self.extra_state_attributes().clone(),
            supported_features: self.supported_features(),
        }
    }

    pub fn entity_info(&self) -> EntityInfo {
        EntityInfo {
            name: self.name().to_string(),
            unique_id: self.unique_id.clone(),
            device: self.device_info().cloned(),
        }
    }
}

#[cfg(test)]
impl MqttHumidifier {
    pub fn discovery_hash(&self) -> Option<&DiscoveryHash> {
        self.discovery.data().map(|data| &data.hash)
    }
}
