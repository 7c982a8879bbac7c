use std::collections::HashMap;
use std::fmt;

use serde_json::Map;
use serde_json::Value;

use super::error::MqttError;

/// Topic base placeholder that discovery payloads may use in topic values
const TOPIC_BASE: char = '~';

/// Abbreviated entity configuration keys accepted in discovery payloads
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("avty", "availability"),
    ("avty_mode", "availability_mode"),
    ("avty_t", "availability_topic"),
    ("avty_tpl", "availability_template"),
    ("cmd_t", "command_topic"),
    ("dev", "device"),
    ("json_attr_t", "json_attributes_topic"),
    ("json_attr_tpl", "json_attributes_template"),
    ("obj_id", "object_id"),
    ("opt", "optimistic"),
    ("pl_avail", "payload_available"),
    ("pl_not_avail", "payload_not_available"),
    ("pl_off", "payload_off"),
    ("pl_on", "payload_on"),
    ("ret", "retain"),
    ("stat_t", "state_topic"),
    ("stat_val_tpl", "state_value_template"),
    ("uniq_id", "unique_id"),
];

/// Abbreviated keys inside the `device` block
const DEVICE_ABBREVIATIONS: &[(&str, &str)] = &[
    ("cns", "connections"),
    ("cu", "configuration_url"),
    ("hw", "hw_version"),
    ("ids", "identifiers"),
    ("mdl", "model"),
    ("mf", "manufacturer"),
    ("sa", "suggested_area"),
    ("sw", "sw_version"),
];

/// Abbreviated keys inside each `availability` entry
const AVAILABILITY_ABBREVIATIONS: &[(&str, &str)] = &[
    ("pl_avail", "payload_available"),
    ("pl_not_avail", "payload_not_available"),
    ("t", "topic"),
    ("val_tpl", "value_template"),
];

/// Components of a discovery topic
///
/// Topic format: {prefix}/{component}/[{node_id}/]{object_id}/config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryTopic {
    pub component: String,
    pub node_id: Option<String>,
    pub object_id: String,
}

impl DiscoveryTopic {
    /// Identifier of the discovered entity within its component
    pub fn discovery_id(&self) -> String {
        match &self.node_id {
            Some(node_id) => format!("{} {}", node_id, self.object_id),
            None => self.object_id.clone(),
        }
    }

    pub fn hash(&self) -> DiscoveryHash {
        DiscoveryHash {
            component: self.component.clone(),
            discovery_id: self.discovery_id(),
        }
    }
}

/// Key identifying a discovered entity across config messages
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveryHash {
    pub component: String,
    pub discovery_id: String,
}

impl fmt::Display for DiscoveryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.component, self.discovery_id)
    }
}

/// Discovery metadata kept by entities created from discovery
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryData {
    pub hash: DiscoveryHash,
    pub topic: String,
    pub payload: Map<String, Value>,
}

/// Parse a discovery topic
///
/// Example: homeassistant/humidifier/0x00124b001234abcd/humidifier/config
pub fn parse_discovery_topic(topic: &str, prefix: &str) -> Option<DiscoveryTopic> {
    let without_prefix = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let parts: Vec<&str> = without_prefix.split('/').collect();

    let valid_id = |s: &str| {
        !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    };

    let (component, node_id, object_id) = match parts.as_slice() {
        [component, object_id, "config"] => (*component, None, *object_id),
        [component, node_id, object_id, "config"] => (*component, Some(*node_id), *object_id),
        _ => return None,
    };

    if !valid_id(component) || !valid_id(object_id) || !node_id.map_or(true, valid_id) {
        return None;
    }

    Some(DiscoveryTopic {
        component: component.to_string(),
        node_id: node_id.map(str::to_string),
        object_id: object_id.to_string(),
    })
}

/// Topic filters covering both discovery topic layouts for a component.
///
/// `+` matches exactly one level, so the layouts with and without a node id
/// need separate filters.
pub fn discovery_subscription_topics(prefix: &str, component: &str) -> Vec<String> {
    vec![
        format!("{}/{}/+/config", prefix, component),
        format!("{}/{}/+/+/config", prefix, component),
    ]
}

fn expand_keys(map: Map<String, Value>, table: &[(&str, &str)]) -> Map<String, Value> {
    map.into_iter()
        .map(|(key, value)| {
            let key = table
                .iter()
                .find(|(short, _)| *short == key)
                .map(|(_, long)| long.to_string())
                .unwrap_or(key);
            (key, value)
        })
        .collect()
}

fn apply_topic_base(value: &mut Value, base: &str) {
    if let Value::String(topic) = value {
        if let Some(rest) = topic.strip_prefix(TOPIC_BASE) {
            *topic = format!("{}{}", base, rest);
        }
        if let Some(rest) = topic.strip_suffix(TOPIC_BASE) {
            *topic = format!("{}{}", rest, base);
        }
    }
}

/// Expand a discovery payload into a full configuration mapping.
///
/// Abbreviated keys are expanded (including inside `device` and each
/// `availability` entry) and the `~` topic base is substituted into every
/// `*topic` value.
pub fn expand_payload(payload: Value) -> Result<Map<String, Value>, MqttError> {
    let map = match payload {
        Value::Object(map) => map,
        other => return Err(MqttError::PayloadNotObject(other.to_string())),
    };

    let mut map = expand_keys(map, ABBREVIATIONS);

    if let Some(Value::Object(device)) = map.remove("device") {
        map.insert(
            "device".to_string(),
            Value::Object(expand_keys(device, DEVICE_ABBREVIATIONS)),
        );
    }

    if let Some(Value::Array(entries)) = map.get_mut("availability") {
        for entry in entries.iter_mut() {
            if let Value::Object(obj) = entry {
                *obj = expand_keys(std::mem::take(obj), AVAILABILITY_ABBREVIATIONS);
            }
        }
    }

    if let Some(Value::String(base)) = map.remove("~") {
        for (key, value) in map.iter_mut() {
            if key.ends_with("topic") {
                apply_topic_base(value, &base);
            }
        }
        if let Some(Value::Array(entries)) = map.get_mut("availability") {
            for entry in entries.iter_mut() {
                if let Some(topic) = entry.get_mut("topic") {
                    apply_topic_base(topic, &base);
                }
            }
        }
    }

    Ok(map)
}

/// What to do with a discovery message
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryAction {
    /// Not seen before (or still pending): hand it to the platform
    Add,
    /// Known entity with a changed payload
    Update { entity_id: String },
    /// Known entity, identical payload
    Unchanged { entity_id: String },
    /// Empty payload; `entity_id` is None when nothing was ever created
    Remove { entity_id: Option<String> },
}

#[derive(Debug)]
struct DiscoveryEntry {
    entity_id: Option<String>,
    payload: Map<String, Value>,
}

/// Bookkeeping of discovery hashes seen so far
#[derive(Debug, Default)]
pub struct DiscoveryRegistry {
    entries: HashMap<DiscoveryHash, DiscoveryEntry>,
}

impl DiscoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a discovery message and decide what it means.
    ///
    /// `payload` is None for an empty (removal) message.
    pub fn process(
        &mut self,
        hash: &DiscoveryHash,
        payload: Option<&Map<String, Value>>,
    ) -> DiscoveryAction {
        let Some(payload) = payload else {
            let entity_id = self.entries.remove(hash).and_then(|e| e.entity_id);
            return DiscoveryAction::Remove { entity_id };
        };

        match self.entries.get_mut(hash) {
            Some(DiscoveryEntry {
                entity_id: Some(entity_id),
                payload: known,
            }) => {
                if known == payload {
                    DiscoveryAction::Unchanged {
                        entity_id: entity_id.clone(),
                    }
                } else {
                    *known = payload.clone();
                    DiscoveryAction::Update {
                        entity_id: entity_id.clone(),
                    }
                }
            }
            Some(pending) => {
                pending.payload = payload.clone();
                DiscoveryAction::Add
            }
            None => {
                self.entries.insert(
                    hash.clone(),
                    DiscoveryEntry {
                        entity_id: None,
                        payload: payload.clone(),
                    },
                );
                DiscoveryAction::Add
            }
        }
    }

    /// Associate a discovery hash with the entity created for it
    pub fn bind(&mut self, hash: &DiscoveryHash, entity_id: &str) {
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.entity_id = Some(entity_id.to_string());
        }
    }

    pub fn entity_for(&self, hash: &DiscoveryHash) -> Option<&str> {
        self.entries.get(hash).and_then(|e| e.entity_id.as_deref())
    }

    /// Forget a hash, so the next config message is treated as new
    pub fn clear(&mut self, hash: &DiscoveryHash) {
        self.entries.remove(hash);
    }
}

/// Discovery capability of an entity.
///
/// Entities created from static configuration carry no discovery data.
#[derive(Debug, Default)]
pub struct DiscoveryUpdate {
    data: Option<DiscoveryData>,
}

impl DiscoveryUpdate {
    pub fn new(data: Option<DiscoveryData>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> Option<&DiscoveryData> {
        self.data.as_ref()
    }

    /// Record the payload of an accepted update
    pub fn set_payload(&mut self, payload: Map<String, Value>) {
        if let Some(data) = &mut self.data {
            data.payload = payload;
        }
    }

    /// Stop tracking discovery, returning the hash the host must forget
    pub fn take_hash(&mut self) -> Option<DiscoveryHash> {
        self.data.take().map(|d| d.hash)
    }
}
