mod attributes;
mod availability;
mod client;
mod config;
mod device_info;
mod discovery;
mod dispatcher;
mod error;
mod host;
mod humidifier;
#[allow(clippy::module_inception)]
mod mqtt;
mod subscription;
mod template;
mod topic;

use anyhow::Context;
pub use config::Config as MqttConfig;
pub use error::MqttError;
pub use humidifier::HumidifierConfig;
use linkme::distributed_slice;
pub use mqtt::MqttIntegration;

use crate::engine;

#[distributed_slice(engine::INTEGRATION_REGISTRY)]
fn init_mqtt(ctx: &engine::IntegrationContext) -> engine::IntegrationFactoryResult {
    let Some(mqtt_config) = &ctx.config.integrations.mqtt else {
        return Ok(None);
    };

    let client = client::RumqttcClient::new(mqtt_config).context("Failed to create MQTT client")?;
    Ok(Some(Box::new(MqttIntegration::new(client, mqtt_config))))
}
