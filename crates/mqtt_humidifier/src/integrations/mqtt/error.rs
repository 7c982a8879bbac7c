//! MQTT integration error types.

/// Errors raised by the MQTT integration and the entities it hosts.
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// The MQTT client has not been connected yet.
    #[error("MQTT client not connected")]
    NotConnected,

    /// The rumqttc client rejected a request.
    #[error("MQTT client error")]
    Client(#[source] rumqttc::ClientError),

    /// A configuration block failed schema validation.
    #[error("invalid humidifier configuration: {0}")]
    InvalidConfig(#[source] serde_json::Error),

    /// An inbound payload was not valid UTF-8.
    #[error("MQTT payload is not valid UTF-8")]
    PayloadEncoding(#[source] std::str::Utf8Error),

    /// Failed to parse an incoming MQTT payload as JSON.
    #[error("failed to parse MQTT payload")]
    PayloadParse(#[source] serde_json::Error),

    /// An incoming payload parsed as JSON but was not an object.
    #[error("MQTT payload is not a JSON object: {0}")]
    PayloadNotObject(String),

    /// A command addressed an entity this integration does not own.
    #[error("entity not found: {0}")]
    EntityNotFound(String),

    /// Another entity already claimed this unique id.
    #[error("unique id {0} is already in use")]
    DuplicateUniqueId(String),
}
