//! Humidifier platform: owns every MQTT humidifier entity.

mod config;
mod entity;

use std::collections::BTreeMap;

pub use config::HumidifierConfig;
pub use entity::MqttHumidifier;
use serde_json::Value;
use tracing::info;

use super::client::MqttClient;
use super::discovery::DiscoveryData;
use super::discovery::DiscoveryHash;
use super::discovery::DiscoveryRegistry;
use super::error::MqttError;
use super::host::MqttHost;

/// Component name used in discovery topics and entity ids
pub const DOMAIN: &str = "humidifier";

/// Lower-case a display name into an entity id object part.
fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug.to_string()
    }
}

#[derive(Debug, Default)]
pub struct HumidifierPlatform {
    entities: BTreeMap<String, MqttHumidifier>,
}

impl HumidifierPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_id: &str) -> Option<&MqttHumidifier> {
        self.entities.get(entity_id)
    }

    pub fn get_mut(&mut self, entity_id: &str) -> Option<&mut MqttHumidifier> {
        self.entities.get_mut(entity_id)
    }

    pub fn entity_ids(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    /// Pick a free entity id derived from the display name
    fn new_entity_id(&self, name: &str) -> String {
        let base = format!("{}.{}", DOMAIN, slugify(name));
        let mut candidate = base.clone();
        let mut n = 2;
        while self.entities.contains_key(&candidate) {
            candidate = format!("{}_{}", base, n);
            n += 1;
        }
        candidate
    }

    /// Create an entity and attach it to the host. Returns its entity id.
    pub async fn add_entity<C: MqttClient>(
        &mut self,
        host: &mut MqttHost<C>,
        config: HumidifierConfig,
        discovery_data: Option<DiscoveryData>,
    ) -> Result<String, MqttError> {
        if let Some(unique_id) = &config.unique_id {
            if self
                .entities
                .values()
                .any(|e| e.unique_id() == Some(unique_id.as_str()))
            {
                return Err(MqttError::DuplicateUniqueId(unique_id.clone()));
            }
        }

        let entity_id = self.new_entity_id(&config.name);
        let mut humidifier = MqttHumidifier::new(entity_id.clone(), config, discovery_data);

        if let Err(e) = humidifier.added_to_host(host).await {
            // Give back whatever was subscribed before the failure
            humidifier.will_remove(host).await;
            return Err(e);
        }
        info!("Added humidifier entity: {}", humidifier.entity_id());
        self.entities.insert(entity_id.clone(), humidifier);

        Ok(entity_id)
    }

    /// Set up an entity from a new discovery payload.
    ///
    /// If the hash got bound while this payload was queued, the existing
    /// entity is updated instead. If creating the entity fails, the discovery
    /// hash is cleared, so the next config message for it is treated as new
    /// again.
    pub async fn discover<C: MqttClient>(
        &mut self,
        host: &mut MqttHost<C>,
        registry: &mut DiscoveryRegistry,
        data: DiscoveryData,
    ) -> Result<String, MqttError> {
        let hash = data.hash.clone();
        if let Some(entity_id) = registry.entity_for(&hash).map(str::to_string) {
            // Created while this payload was queued; catch up if it changed
            let entity = self
                .entities
                .get_mut(&entity_id)
                .ok_or_else(|| MqttError::EntityNotFound(entity_id.clone()))?;
            if entity.discovery_payload() != Some(&data.payload) {
                entity.discovery_update(host, data.payload).await?;
            }
            return Ok(entity_id);
        }

        let result = match HumidifierConfig::from_value(Value::Object(data.payload.clone())) {
            Ok(config) => self.add_entity(host, config, Some(data)).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(entity_id) => {
                registry.bind(&hash, &entity_id);
                Ok(entity_id)
            }
            Err(e) => {
                registry.clear(&hash);
                Err(e)
            }
        }
    }

    /// Detach and drop an entity.
    ///
    /// Returns the discovery hash it was created from, if any. Failures to
    /// release subscriptions are logged and do not stop the removal.
    pub async fn remove_entity<C: MqttClient>(
        &mut self,
        host: &mut MqttHost<C>,
        entity_id: &str,
    ) -> Result<Option<DiscoveryHash>, MqttError> {
        let Some(mut humidifier) = self.entities.remove(entity_id) else {
            return Err(MqttError::EntityNotFound(entity_id.to_string()));
        };

        let hash = humidifier.will_remove(host).await;
        info!("Removed humidifier entity: {}", entity_id);
        Ok(hash)
    }
}

#[cfg(test)]
impl HumidifierPlatform {
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
