use serde_json::Map;
use serde_json::Value;
use tracing::warn;

use super::client::MqttClient;
use super::client::Qos;
use super::error::MqttError;
use super::host::MqttHost;
use super::subscription::SubscriptionState;
use super::subscription::TopicRole;
use super::subscription::topic_map;
use super::template::Extractor;

/// Attributes an entity manages itself; never taken from the attributes topic
const BLOCKED_ATTRIBUTES: &[&str] = &[
    "assumed_state",
    "available_modes",
    "device_class",
    "entity_picture",
    "friendly_name",
    "icon",
    "name",
    "state",
    "supported_features",
    "unit_of_measurement",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributesConfig {
    pub topic: Option<String>,
    pub extractor: Extractor,
}

/// Extra state attributes read from a JSON attributes topic
#[derive(Debug, Default)]
pub struct JsonAttributes {
    config: AttributesConfig,
    attributes: Map<String, Value>,
    sub_state: SubscriptionState,
}

impl JsonAttributes {
    pub fn new(config: AttributesConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub async fn subscribe<C: MqttClient>(
        &mut self,
        host: &mut MqttHost<C>,
        owner: &str,
        qos: Qos,
    ) -> Result<(), MqttError> {
        let topics = topic_map([(TopicRole::JsonAttributesTopic, self.config.topic.clone(), qos)]);
        host.subscribe_topics(owner, &mut self.sub_state, topics).await
    }

    /// Replace the attribute map from a payload. Returns whether the map was
    /// replaced; bad payloads are logged and leave it alone.
    pub fn handle_message(&mut self, payload: &str) -> bool {
        let value = self.config.extractor.extract(payload);
        match serde_json::from_str::<Value>(&value) {
            Ok(Value::Object(map)) => {
                self.attributes = map
                    .into_iter()
                    .filter(|(key, _)| !BLOCKED_ATTRIBUTES.contains(&key.as_str()))
                    .collect();
                true
            }
            Ok(_) => {
                warn!("JSON attributes payload is not an object: {}", value);
                false
            }
            Err(e) => {
                warn!("Erroneous JSON attributes payload {:?}: {}", value, e);
                false
            }
        }
    }

    pub async fn discovery_update<C: MqttClient>(
        &mut self,
        host: &mut MqttHost<C>,
        owner: &str,
        config: AttributesConfig,
        qos: Qos,
    ) -> Result<(), MqttError> {
        self.config = config;
        self.subscribe(host, owner, qos).await
    }

    pub async fn cleanup<C: MqttClient>(
        &mut self,
        host: &mut MqttHost<C>,
        owner: &str,
    ) -> Result<(), MqttError> {
        host.unsubscribe_topics(owner, &mut self.sub_state).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::integrations::mqtt::client::MockMqttClient;
    use crate::integrations::mqtt::template::Template;

    fn attributes(template: Option<&str>) -> JsonAttributes {
        JsonAttributes::new(AttributesConfig {
            topic: Some("h/attrs".to_string()),
            extractor: Extractor::from_template(
                template.map(|t| Template::parse(t).unwrap()).as_ref(),
            ),
        })
    }

    #[test]
    fn test_object_replaces_attributes() {
        let mut attrs = attributes(None);

        assert!(attrs.handle_message(r#"{"water_level": 3, "filter": "ok"}"#));
        assert!(attrs.handle_message(r#"{"water_level": 2}"#));

        assert_eq!(Value::Object(attrs.attributes().clone()), json!({"water_level": 2}));
    }

    #[test]
    fn test_blocked_keys_are_dropped() {
        let mut attrs = attributes(None);
        attrs.handle_message(r#"{"name": "x", "state": "ON", "icon": "mdi:x", "mode": "auto"}"#);

        assert_eq!(Value::Object(attrs.attributes().clone()), json!({"mode": "auto"}));
    }

    #[test]
    fn test_bad_payloads_are_ignored() {
        let mut attrs = attributes(None);
        attrs.handle_message(r#"{"mode": "auto"}"#);

        assert!(!attrs.handle_message("not-json"));
        assert!(!attrs.handle_message("[1, 2]"));
        assert_eq!(attrs.attributes().len(), 1);
    }

    #[test]
    fn test_template_selects_attributes() {
        let mut attrs = attributes(Some("{{ value_json.attrs | tojson }}"));
        attrs.handle_message(r#"{"attrs": {"mode": "sleep"}, "other": 1}"#);

        assert_eq!(Value::Object(attrs.attributes().clone()), json!({"mode": "sleep"}));
    }

    #[tokio::test]
    async fn test_unconfigured_topic_does_not_subscribe() {
        let mut host = MqttHost::new(MockMqttClient::new());
        let mut attrs = JsonAttributes::new(AttributesConfig::default());

        attrs.subscribe(&mut host, "humidifier.a", Qos::AtMostOnce).await.unwrap();

        assert!(host.client.subscriptions.is_empty());
    }
}
