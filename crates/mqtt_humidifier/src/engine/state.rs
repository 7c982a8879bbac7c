use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use super::device::Device;

/// Rendered state of a humidifier entity.
///
/// This is what the engine stores every time an integration asks for the
/// entity to be re-rendered.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HumidifierState {
    /// Display name
    pub name: String,

    /// Unique identifier, if the entity was configured with one
    pub unique_id: Option<String>,

    /// Whether the humidifier is on
    pub is_on: bool,

    /// Last humidity value received, stored exactly as it arrived
    pub humidity: Option<serde_json::Value>,

    /// Humidity the device is trying to reach (same cell as `humidity`)
    pub target_humidity: Option<serde_json::Value>,

    /// Whether the availability tracker considers the device reachable
    pub available: bool,

    /// Extra attributes received on the JSON attributes topic
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,

    /// Supported feature bitmask
    pub supported_features: u32,
}

/// Centralized snapshot of the entire engine state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct State {
    pub humidifiers: BTreeMap<String, HumidifierState>,
    pub devices: BTreeMap<String, Device>,
}
