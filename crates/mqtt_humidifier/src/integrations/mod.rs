#[cfg(feature = "integration_mqtt")]
mod mqtt;

#[cfg(feature = "integration_mqtt")]
pub use mqtt::HumidifierConfig;
#[cfg(feature = "integration_mqtt")]
pub use mqtt::MqttConfig;
#[cfg(feature = "integration_mqtt")]
pub use mqtt::MqttError;
