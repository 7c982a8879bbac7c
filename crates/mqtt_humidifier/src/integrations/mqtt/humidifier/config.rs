use serde::Deserialize;
use serde_json::Value;

use crate::engine::DeviceInfo;
use crate::integrations::mqtt::attributes::AttributesConfig;
use crate::integrations::mqtt::availability::AvailabilityConfig;
use crate::integrations::mqtt::availability::AvailabilityEntry;
use crate::integrations::mqtt::availability::AvailabilityMode;
use crate::integrations::mqtt::availability::default_payload_available;
use crate::integrations::mqtt::availability::default_payload_not_available;
use crate::integrations::mqtt::client::Qos;
use crate::integrations::mqtt::error::MqttError;
use crate::integrations::mqtt::template::Extractor;
use crate::integrations::mqtt::template::Template;
use crate::integrations::mqtt::topic::valid_publish_topic;
use crate::integrations::mqtt::topic::valid_subscribe_topic;

pub const DEFAULT_NAME: &str = "MQTT Humidifier";
pub const DEFAULT_PAYLOAD_ON: &str = "ON";
pub const DEFAULT_PAYLOAD_OFF: &str = "OFF";

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_payload_on() -> String {
    DEFAULT_PAYLOAD_ON.to_string()
}

fn default_payload_off() -> String {
    DEFAULT_PAYLOAD_OFF.to_string()
}

/// Humidifier configuration as written by the user or a discovery payload
#[derive(Debug, Deserialize)]
struct RawHumidifierConfig {
    #[serde(default = "default_name")]
    name: String,

    command_topic: String,
    state_topic: Option<String>,

    #[serde(default)]
    optimistic: bool,

    #[serde(default = "default_payload_on")]
    payload_on: String,

    #[serde(default = "default_payload_off")]
    payload_off: String,

    state_value_template: Option<Template>,

    #[serde(default)]
    qos: Qos,

    #[serde(default)]
    retain: bool,

    unique_id: Option<String>,
    device: Option<DeviceInfo>,

    availability_topic: Option<String>,
    availability_template: Option<Template>,
    availability: Option<Vec<AvailabilityEntry>>,

    #[serde(default = "default_payload_available")]
    payload_available: String,

    #[serde(default = "default_payload_not_available")]
    payload_not_available: String,

    #[serde(default)]
    availability_mode: AvailabilityMode,

    json_attributes_topic: Option<String>,
    json_attributes_template: Option<Template>,
}

/// Validated humidifier configuration.
///
/// Replaced wholesale on every discovery update.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawHumidifierConfig")]
pub struct HumidifierConfig {
    pub name: String,
    pub command_topic: String,
    pub state_topic: Option<String>,
    /// Accepted for compatibility; state is only ever taken from the broker
    pub optimistic: bool,
    pub payload_on: String,
    pub payload_off: String,
    pub state_value_template: Option<Template>,
    pub qos: Qos,
    pub retain: bool,
    pub unique_id: Option<String>,
    pub device: Option<DeviceInfo>,
    pub availability: AvailabilityConfig,
    pub attributes: AttributesConfig,
}

impl TryFrom<RawHumidifierConfig> for HumidifierConfig {
    type Error = String;

    fn try_from(raw: RawHumidifierConfig) -> Result<Self, Self::Error> {
        valid_publish_topic(&raw.command_topic)?;
        if let Some(topic) = &raw.state_topic {
            valid_subscribe_topic(topic)?;
        }
        if let Some(topic) = &raw.json_attributes_topic {
            valid_subscribe_topic(topic)?;
        }

        let availability = AvailabilityConfig::from_schema(
            raw.availability_topic,
            raw.availability_template,
            raw.payload_available,
            raw.payload_not_available,
            raw.availability,
            raw.availability_mode,
        )?;

        let attributes = AttributesConfig {
            topic: raw.json_attributes_topic,
            extractor: Extractor::from_template(raw.json_attributes_template.as_ref()),
        };

        Ok(Self {
            name: raw.name,
            command_topic: raw.command_topic,
            state_topic: raw.state_topic,
            optimistic: raw.optimistic,
            payload_on: raw.payload_on,
            payload_off: raw.payload_off,
            state_value_template: raw.state_value_template,
            qos: raw.qos,
            retain: raw.retain,
            unique_id: raw.unique_id,
            device: raw.device,
            availability,
            attributes,
        })
    }
}

impl HumidifierConfig {
    /// Validate an already expanded discovery payload
    pub fn from_value(value: Value) -> Result<Self, MqttError> {
        serde_json::from_value(value).map_err(MqttError::InvalidConfig)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = HumidifierConfig::from_value(json!({"command_topic": "h/cmd"})).unwrap();

        assert_eq!(config.name, "MQTT Humidifier");
        assert_eq!(config.payload_on, "ON");
        assert_eq!(config.payload_off, "OFF");
        assert_eq!(config.state_topic, None);
        assert_eq!(config.qos, Qos::AtMostOnce);
        assert!(!config.optimistic);
        assert!(!config.retain);
        assert!(config.availability.topics.is_empty());
        assert_eq!(config.attributes.extractor, Extractor::Identity);
    }

    #[test]
    fn test_full_config() {
        let config = HumidifierConfig::from_value(json!({
            "name": "Bedroom",
            "command_topic": "h/cmd",
            "state_topic": "h/state",
            "state_value_template": "{{ value_json.humidifier | tojson }}",
            "payload_on": "1",
            "payload_off": "0",
            "qos": 2,
            "retain": true,
            "unique_id": "hum01",
            "device": {"identifiers": "hum01", "sw_version": 12},
            "availability_topic": "h/status",
            "payload_available": "up",
            "json_attributes_topic": "h/attrs",
        }))
        .unwrap();

        assert_eq!(config.qos, Qos::ExactlyOnce);
        assert!(config.state_value_template.is_some());
        assert_eq!(config.device.unwrap().sw_version.as_deref(), Some("12"));
        assert_eq!(config.availability.topics[0].topic, "h/status");
        assert_eq!(config.availability.topics[0].payload_available, "up");
        assert_eq!(config.attributes.topic.as_deref(), Some("h/attrs"));
    }

    #[test]
    fn test_missing_command_topic() {
        let err = HumidifierConfig::from_value(json!({"state_topic": "h/state"})).unwrap_err();
        assert!(matches!(err, MqttError::InvalidConfig(_)));
        assert!(err.to_string().contains("command_topic"));
    }

    #[test]
    fn test_invalid_topics() {
        for value in [
            json!({"command_topic": "h/+/cmd"}),
            json!({"command_topic": ""}),
            json!({"command_topic": "h/cmd", "state_topic": "h/#/state"}),
            json!({"command_topic": "h/cmd", "json_attributes_topic": "h/a+"}),
        ] {
            assert!(
                HumidifierConfig::from_value(value.clone()).is_err(),
                "accepted {}",
                value
            );
        }
    }

    #[test]
    fn test_invalid_template_and_qos() {
        assert!(
            HumidifierConfig::from_value(json!({
                "command_topic": "h/cmd",
                "state_value_template": "{{ value | explode }}",
            }))
            .is_err()
        );
        assert!(
            HumidifierConfig::from_value(json!({"command_topic": "h/cmd", "qos": 3})).is_err()
        );
    }

    #[test]
    fn test_availability_forms_are_exclusive() {
        let err = HumidifierConfig::from_value(json!({
            "command_topic": "h/cmd",
            "availability_topic": "h/status",
            "availability": [{"topic": "h/other"}],
        }))
        .unwrap_err();

        insta::assert_snapshot!(
            err.to_string(),
            @"invalid humidifier configuration: availability_topic and availability are mutually exclusive"
        );
    }
}
