//! Availability tracking.
//!
//! An entity may list one or more availability topics. Each topic reports
//! the device as available or not; the configured mode combines them into a
//! single flag.

use serde::Deserialize;
use tracing::debug;

use super::client::MqttClient;
use super::client::Qos;
use super::error::MqttError;
use super::host::MqttHost;
use super::subscription::SubscriptionState;
use super::subscription::TopicRole;
use super::subscription::topic_map;
use super::template::Extractor;
use super::template::Template;
use super::topic::valid_subscribe_topic;

pub const DEFAULT_PAYLOAD_AVAILABLE: &str = "online";
pub const DEFAULT_PAYLOAD_NOT_AVAILABLE: &str = "offline";

pub fn default_payload_available() -> String {
    DEFAULT_PAYLOAD_AVAILABLE.to_string()
}

pub fn default_payload_not_available() -> String {
    DEFAULT_PAYLOAD_NOT_AVAILABLE.to_string()
}

/// How several availability topics are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvailabilityMode {
    /// Available only when every topic says so
    All,
    /// Available when at least one topic says so
    Any,
    /// The most recent message on any topic wins
    #[default]
    Latest,
}

/// One entry of the `availability` list
#[derive(Debug, Clone, Deserialize)]
pub struct AvailabilityEntry {
    pub topic: String,

    #[serde(default = "default_payload_available")]
    pub payload_available: String,

    #[serde(default = "default_payload_not_available")]
    pub payload_not_available: String,

    pub value_template: Option<Template>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AvailabilityTopic {
    pub topic: String,
    pub payload_available: String,
    pub payload_not_available: String,
    pub extractor: Extractor,
}

impl TryFrom<AvailabilityEntry> for AvailabilityTopic {
    type Error = String;

    fn try_from(entry: AvailabilityEntry) -> Result<Self, Self::Error> {
        valid_subscribe_topic(&entry.topic)?;
        Ok(Self {
            extractor: Extractor::from_template(entry.value_template.as_ref()),
            topic: entry.topic,
            payload_available: entry.payload_available,
            payload_not_available: entry.payload_not_available,
        })
    }
}

/// Resolved availability configuration of an entity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AvailabilityConfig {
    pub topics: Vec<AvailabilityTopic>,
    pub mode: AvailabilityMode,
}

impl AvailabilityConfig {
    /// Combine the single-topic shorthand and the list form.
    ///
    /// The two forms are mutually exclusive.
    pub fn from_schema(
        availability_topic: Option<String>,
        availability_template: Option<Template>,
        payload_available: String,
        payload_not_available: String,
        availability: Option<Vec<AvailabilityEntry>>,
        mode: AvailabilityMode,
    ) -> Result<Self, String> {
        let topics = match (availability_topic, availability) {
            (Some(_), Some(_)) => {
                return Err(
                    "availability_topic and availability are mutually exclusive".to_string(),
                );
            }
            (Some(topic), None) => vec![AvailabilityTopic::try_from(AvailabilityEntry {
                topic,
                payload_available,
                payload_not_available,
                value_template: availability_template,
            })?],
            (None, Some(entries)) => entries
                .into_iter()
                .map(AvailabilityTopic::try_from)
                .collect::<Result<_, _>>()?,
            (None, None) => Vec::new(),
        };

        Ok(Self { topics, mode })
    }
}

/// Availability capability held by an entity
#[derive(Debug, Default)]
pub struct Availability {
    config: AvailabilityConfig,
    /// Last reported availability per topic, same order as `config.topics`
    available: Vec<bool>,
    latest: bool,
    sub_state: SubscriptionState,
}

impl Availability {
    pub fn new(config: AvailabilityConfig) -> Self {
        let available = vec![false; config.topics.len()];
        Self {
            config,
            available,
            latest: false,
            sub_state: SubscriptionState::default(),
        }
    }

    pub fn available(&self) -> bool {
        if self.config.topics.is_empty() {
            return true;
        }
        match self.config.mode {
            AvailabilityMode::All => self.available.iter().all(|a| *a),
            AvailabilityMode::Any => self.available.iter().any(|a| *a),
            AvailabilityMode::Latest => self.latest,
        }
    }

    pub async fn subscribe<C: MqttClient>(
        &mut self,
        host: &mut MqttHost<C>,
        owner: &str,
        qos: Qos,
    ) -> Result<(), MqttError> {
        let topics = topic_map(
            self.config
                .topics
                .iter()
                .enumerate()
                .map(|(i, t)| (TopicRole::Availability(i), Some(t.topic.clone()), qos)),
        );
        host.subscribe_topics(owner, &mut self.sub_state, topics).await
    }

    /// Apply an availability message. Returns whether the entity must be
    /// re-rendered.
    pub fn handle_message(&mut self, index: usize, payload: &str) -> bool {
        let Some(topic) = self.config.topics.get(index) else {
            return false;
        };

        let value = topic.extractor.extract(payload);
        let available = if value == topic.payload_available {
            true
        } else if value == topic.payload_not_available {
            false
        } else {
            debug!(
                "Ignoring availability payload {:?} on {}",
                value, topic.topic
            );
            return false;
        };

        self.available[index] = available;
        self.latest = available;
        true
    }

    /// Replace the configuration, keeping known state of unchanged topics.
    pub async fn discovery_update<C: MqttClient>(
        &mut self,
        host: &mut MqttHost<C>,
        owner: &str,
        config: AvailabilityConfig,
        qos: Qos,
    ) -> Result<(), MqttError> {
        self.available = config
            .topics
            .iter()
            .map(|new| {
                self.config
                    .topics
                    .iter()
                    .position(|old| old.topic == new.topic)
                    .is_some_and(|i| self.available[i])
            })
            .collect();
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
    use super::*;
    use crate::integrations::mqtt::client::MockMqttClient;

    fn entry(topic: &str) -> AvailabilityEntry {
        AvailabilityEntry {
            topic: topic.to_string(),
            payload_available: default_payload_available(),
            payload_not_available: default_payload_not_available(),
            value_template: None,
        }
    }

    fn config(topics: &[&str], mode: AvailabilityMode) -> AvailabilityConfig {
        AvailabilityConfig::from_schema(
            None,
            None,
            default_payload_available(),
            default_payload_not_available(),
            Some(topics.iter().map(|t| entry(t)).collect()),
            mode,
        )
        .unwrap()
    }

    #[test]
    fn test_no_topics_is_always_available() {
        let availability = Availability::new(AvailabilityConfig::default());
        assert!(availability.available());
    }

    #[test]
    fn test_single_topic_shorthand() {
        let config = AvailabilityConfig::from_schema(
            Some("h/status".to_string()),
            None,
            "up".to_string(),
            "down".to_string(),
            None,
            AvailabilityMode::Latest,
        )
        .unwrap();
        let mut availability = Availability::new(config);
        assert!(!availability.available());

        assert!(availability.handle_message(0, "up"));
        assert!(availability.available());

        assert!(!availability.handle_message(0, "online"));
        assert!(availability.available());

        assert!(availability.handle_message(0, "down"));
        assert!(!availability.available());
    }

    #[test]
    fn test_topic_and_list_are_exclusive() {
        let result = AvailabilityConfig::from_schema(
            Some("h/status".to_string()),
            None,
            default_payload_available(),
            default_payload_not_available(),
            Some(vec![entry("h/other")]),
            AvailabilityMode::Latest,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_modes() {
        let mut all = Availability::new(config(&["a", "b"], AvailabilityMode::All));
        let mut any = Availability::new(config(&["a", "b"], AvailabilityMode::Any));
        let mut latest = Availability::new(config(&["a", "b"], AvailabilityMode::Latest));

        for availability in [&mut all, &mut any, &mut latest] {
            availability.handle_message(0, "online");
        }
        assert!(!all.available());
        assert!(any.available());
        assert!(latest.available());

        for availability in [&mut all, &mut any, &mut latest] {
            availability.handle_message(1, "online");
            availability.handle_message(0, "offline");
        }
        assert!(!all.available());
        assert!(any.available());
        assert!(!latest.available());
    }

    #[test]
    fn test_value_template() {
        let config = AvailabilityConfig::from_schema(
            None,
            None,
            default_payload_available(),
            default_payload_not_available(),
            Some(vec![AvailabilityEntry {
                value_template: Some(Template::parse("{{ value_json.status }}").unwrap()),
                ..entry("h/status")
            }]),
            AvailabilityMode::Latest,
        )
        .unwrap();
        let mut availability = Availability::new(config);

        availability.handle_message(0, r#"{"status": "online"}"#);
        assert!(availability.available());
    }

    #[tokio::test]
    async fn test_discovery_update_keeps_state_of_unchanged_topics() {
        let mut host = MqttHost::new(MockMqttClient::new());
        let mut availability = Availability::new(config(&["a", "b"], AvailabilityMode::All));
        availability
            .subscribe(&mut host, "humidifier.a", Qos::AtMostOnce)
            .await
            .unwrap();
        availability.handle_message(0, "online");
        availability.handle_message(1, "online");

        availability
            .discovery_update(
                &mut host,
                "humidifier.a",
                config(&["b", "c"], AvailabilityMode::All),
                Qos::AtMostOnce,
            )
            .await
            .unwrap();

        assert!(!availability.available());
        availability.handle_message(1, "online");
        assert!(availability.available());
        assert_eq!(host.client.unsubscriptions, vec!["a".to_string()]);
        assert!(host.subscriptions.is_subscribed("c"));
    }

    #[tokio::test]
    async fn test_cleanup_unsubscribes() {
        let mut host = MqttHost::new(MockMqttClient::new());
        let mut availability = Availability::new(config(&["a"], AvailabilityMode::Latest));
        availability
            .subscribe(&mut host, "humidifier.a", Qos::AtLeastOnce)
            .await
            .unwrap();
        assert_eq!(host.client.subscriptions, vec![("a".to_string(), Qos::AtLeastOnce)]);

        availability.cleanup(&mut host, "humidifier.a").await.unwrap();
        assert_eq!(host.client.unsubscriptions, vec!["a".to_string()]);
    }
}
