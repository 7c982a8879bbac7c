pub mod api;
pub mod config;
mod engine;
mod integrations;

pub use config::Config;
pub use config::ConfigError;
pub use config::LogLevel;
pub use engine::Device;
pub use engine::DeviceInfo;
pub use engine::Engine;
pub use engine::HumidifierState;
pub use engine::State;
#[cfg(feature = "integration_mqtt")]
pub use integrations::HumidifierConfig;
#[cfg(feature = "integration_mqtt")]
pub use integrations::MqttConfig;
#[cfg(feature = "integration_mqtt")]
pub use integrations::MqttError;
