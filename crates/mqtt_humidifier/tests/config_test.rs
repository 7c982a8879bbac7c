use std::fs;

use mqtt_humidifier::Config;
use mqtt_humidifier::ConfigError;
use mqtt_humidifier::LogLevel;
use tempfile::TempDir;

#[test]
fn test_load_full_config() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("mqtt_humidifier.toml");

    fs::write(
        &path,
        r#"
        [logging]
        level = "debug"

        [api]
        listen = "0.0.0.0"
        port = 9000

        [integrations.mqtt]
        broker = "mqtt.local"
        client_id = "humidifier-bridge"
        discovery_prefix = "hass"

        [[integrations.mqtt.humidifier]]
        name = "Bedroom"
        command_topic = "bedroom/humidifier/set"
        state_topic = "bedroom/humidifier"
        state_value_template = "{{ value_json.state }}"
        unique_id = "bedroom-hum"
        payload_on = "1"
        payload_off = "0"
        "#,
    )
    .unwrap();

    let config = Config::from_file(&path).unwrap();

    assert_eq!(config.logging.level, LogLevel::Debug);
    assert!(config.api.enabled);
    assert_eq!(config.api.listen, "0.0.0.0");
    assert_eq!(config.api.port, 9000);

    let mqtt = config.integrations.mqtt.unwrap();
    assert_eq!(mqtt.broker, "mqtt.local");
    assert_eq!(mqtt.port, 1883);
    assert_eq!(mqtt.client_id, "humidifier-bridge");
    assert!(mqtt.discovery);
    assert_eq!(mqtt.discovery_prefix, "hass");

    assert_eq!(mqtt.humidifiers.len(), 1);
    let humidifier = &mqtt.humidifiers[0];
    assert_eq!(humidifier.name, "Bedroom");
    assert_eq!(humidifier.command_topic, "bedroom/humidifier/set");
    assert_eq!(humidifier.state_topic.as_deref(), Some("bedroom/humidifier"));
    assert!(humidifier.state_value_template.is_some());
    assert_eq!(humidifier.unique_id.as_deref(), Some("bedroom-hum"));
    assert_eq!(humidifier.payload_on, "1");
    assert_eq!(humidifier.payload_off, "0");
}

#[test]
fn test_missing_file_is_io_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("missing.toml");

    let err = Config::from_file(&path).unwrap_err();

    assert!(matches!(err, ConfigError::Io { path: p, .. } if p == path));
}

#[test]
fn test_invalid_humidifier_is_parse_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bad.toml");

    fs::write(
        &path,
        r#"
        [integrations.mqtt]
        broker = "localhost"

        [[integrations.mqtt.humidifier]]
        name = "No command topic"
        "#,
    )
    .unwrap();

    let err = Config::from_file(&path).unwrap_err();

    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().contains("bad.toml"));
}
