//! Type-safe message system for the engine
//!
//! Messages are split by direction to enforce correct usage at compile time:
//! - `FromIntegrationMessage`: Events from integrations to the engine
//! - `ToIntegrationMessage`: Commands from the engine to integrations

use super::device::DeviceInfo;
use super::state::HumidifierState;

/// Static description of an entity, sent once when it is registered.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityInfo {
    pub name: String,
    pub unique_id: Option<String>,
    pub device: Option<DeviceInfo>,
}

/// Messages FROM integrations TO the engine (events/state updates)
#[derive(Debug, Clone)]
pub enum FromIntegrationMessage {
    /// An entity was added, either from static config or discovery
    EntityDiscovered {
        entity_id: String,
        integration_name: String,
        info: EntityInfo,
    },

    /// An entity was removed (empty discovery payload, shutdown)
    EntityRemoved { entity_id: String },

    /// A humidifier asked to be re-rendered
    HumidifierStateChanged {
        entity_id: String,
        state: HumidifierState,
    },
}

/// Messages FROM the engine TO integrations (commands)
#[derive(Debug, Clone, PartialEq)]
pub enum ToIntegrationMessage {
    /// Turn a humidifier on, optionally with a target humidity
    HumidifierTurnOn {
        entity_id: String,
        humidity: Option<i64>,
    },

    /// Set a humidifier's target humidity
    HumidifierSetHumidity { entity_id: String, humidity: i64 },
}

impl ToIntegrationMessage {
    /// The entity this command is addressed to, used for routing.
    pub fn entity_id(&self) -> &str {
        match self {
            Self::HumidifierTurnOn { entity_id, .. } => entity_id,
            Self::HumidifierSetHumidity { entity_id, .. } => entity_id,
        }
    }
}
