use serde::Deserialize;

use super::humidifier::HumidifierConfig;

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("mqtt-humidifier-{}", hostname)
}

fn default_discovery() -> bool {
    true
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

/// Configuration for the MQTT integration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// MQTT broker hostname or IP address
    pub broker: String,

    /// MQTT broker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// MQTT client ID (default: "mqtt-humidifier-<hostname>")
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Whether to listen for discovery messages
    #[serde(default = "default_discovery")]
    pub discovery: bool,

    /// Discovery prefix (default: "homeassistant")
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,

    /// Optional username for authentication
    pub username: Option<String>,

    /// Optional password for authentication
    pub password: Option<String>,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Statically configured humidifiers
    #[serde(default, rename = "humidifier")]
    pub humidifiers: Vec<HumidifierConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str(r#"broker = "192.168.1.100""#).unwrap();

        assert_eq!(config.broker, "192.168.1.100");
        assert_eq!(config.port, 1883);
        assert!(config.client_id.starts_with("mqtt-humidifier-"));
        assert!(config.discovery);
        assert_eq!(config.discovery_prefix, "homeassistant");
        assert_eq!(config.keep_alive_secs, 30);
        assert!(config.humidifiers.is_empty());
    }

    #[test]
    fn test_static_humidifiers() {
        let config: Config = toml::from_str(
            r#"
            broker = "localhost"
            client_id = "test"
            discovery = false

            [[humidifier]]
            name = "Bedroom"
            command_topic = "bedroom/humidifier/set"
            state_topic = "bedroom/humidifier"

            [[humidifier]]
            command_topic = "office/humidifier/set"
            qos = 1
            "#,
        )
        .unwrap();

        assert!(!config.discovery);
        assert_eq!(config.humidifiers.len(), 2);
        assert_eq!(config.humidifiers[0].name, "Bedroom");
        assert_eq!(config.humidifiers[1].name, "MQTT Humidifier");
        assert_eq!(config.humidifiers[1].state_topic, None);
    }

    #[test]
    fn test_invalid_static_humidifier_rejects_config() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            broker = "localhost"

            [[humidifier]]
            command_topic = "office/+/set"
            "#,
        );

        assert!(result.is_err());
    }
}
