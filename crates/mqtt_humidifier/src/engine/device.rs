use serde::Deserialize;
use serde::Serialize;

/// Deserialize a version field that can be a string or a number.
///
/// Devices often report `sw_version`/`hw_version` as bare numbers even though
/// the device block defines them as strings.
fn deserialize_version<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    struct Version;

    impl<'de> de::Visitor<'de> for Version {
        type Value = Option<String>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("string, number, or null")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }
    }

    deserializer.deserialize_any(Version)
}

/// Deserialize `identifiers`, which may be a single string or a list.
fn deserialize_one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// Device block attached to an entity configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct DeviceInfo {
    /// Identifiers of the device (a single string is accepted)
    #[serde(default, deserialize_with = "deserialize_one_or_many")]
    pub identifiers: Vec<String>,

    /// Connections as `[type, value]` pairs, e.g. `["mac", "02:5b:26:a8:dc:12"]`
    #[serde(default)]
    pub connections: Vec<(String, String)>,

    pub name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,

    #[serde(default, deserialize_with = "deserialize_version")]
    pub sw_version: Option<String>,

    #[serde(default, deserialize_with = "deserialize_version")]
    pub hw_version: Option<String>,

    pub suggested_area: Option<String>,

    /// Identifier of a device that routes messages for this one
    pub via_device: Option<String>,

    pub configuration_url: Option<String>,
}

impl DeviceInfo {
    /// A device block is only usable when it identifies the device somehow.
    pub fn is_identifiable(&self) -> bool {
        !self.identifiers.is_empty() || !self.connections.is_empty()
    }

    /// Registry key for this device: first identifier, else first connection.
    pub fn registry_id(&self) -> Option<String> {
        self.identifiers.first().cloned().or_else(|| {
            self.connections
                .first()
                .map(|(kind, value)| format!("{}:{}", kind, value))
        })
    }
}

/// A device in the registry.
///
/// A device groups one or more entities that were configured with the same
/// device block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub id: String,
    pub info: DeviceInfo,
    pub entity_ids: Vec<String>,
}

impl Device {
    /// Create a registry entry from a device block, if it is identifiable.
    pub fn from_info(info: &DeviceInfo) -> Option<Self> {
        Some(Self {
            id: info.registry_id()?,
            info: info.clone(),
            entity_ids: Vec::new(),
        })
    }

    pub fn add_entity(&mut self, entity_id: String) {
        if !self.entity_ids.contains(&entity_id) {
            self.entity_ids.push(entity_id);
        }
    }

    /// Detach an entity. Returns true when the device has no entities left.
    pub fn remove_entity(&mut self, entity_id: &str) -> bool {
        self.entity_ids.retain(|id| id != entity_id);
        self.entity_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_info_accepts_single_identifier_and_int_versions() {
        let info: DeviceInfo = serde_json::from_str(
            r#"{"identifiers": "hum01", "name": "Humidifier", "sw_version": 12, "hw_version": "rev2"}"#,
        )
        .unwrap();

        assert_eq!(info.identifiers, vec!["hum01".to_string()]);
        assert_eq!(info.sw_version.as_deref(), Some("12"));
        assert_eq!(info.hw_version.as_deref(), Some("rev2"));
        assert!(info.is_identifiable());
    }

    #[test]
    fn test_device_info_accepts_float_versions() {
        let info: DeviceInfo =
            serde_json::from_str(r#"{"identifiers": ["hum01"], "sw_version": 1.2, "hw_version": null}"#)
                .unwrap();

        assert_eq!(info.sw_version.as_deref(), Some("1.2"));
        assert_eq!(info.hw_version, None);
    }

    #[test]
    fn test_registry_id_falls_back_to_connection() {
        let info: DeviceInfo =
            serde_json::from_str(r#"{"connections": [["mac", "02:5b:26:a8:dc:12"]]}"#).unwrap();

        assert_eq!(info.registry_id().as_deref(), Some("mac:02:5b:26:a8:dc:12"));
    }

    #[test]
    fn test_unidentifiable_device_has_no_registry_entry() {
        let info = DeviceInfo {
            name: Some("Nameless".to_string()),
            ..Default::default()
        };

        assert!(!info.is_identifiable());
        assert!(Device::from_info(&info).is_none());
    }

    #[test]
    fn test_device_entity_membership() {
        let info = DeviceInfo {
            identifiers: vec!["hum01".to_string()],
            ..Default::default()
        };
        let mut device = Device::from_info(&info).unwrap();

        device.add_entity("humidifier.bedroom".to_string());
        device.add_entity("humidifier.bedroom".to_string());
        assert_eq!(device.entity_ids.len(), 1);

        assert!(device.remove_entity("humidifier.bedroom"));
    }
}
