//! Capability maps and negotiation
//!
//! Some peers reject empty-object capability fields as a type-validation
//! error, so an empty entry in configuration means "omit this field" and is
//! never sent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Capability declaration: top-level capability name to its settings object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityMap(BTreeMap<String, Value>);

impl CapabilityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, settings: Value) -> Self {
        self.0.insert(name.into(), settings);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, settings: Value) -> Option<Value> {
        self.0.insert(name.into(), settings)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Overlay `other` onto this map; entries in `other` replace same-named ones.
    pub fn merged(&self, other: &CapabilityMap) -> CapabilityMap {
        let mut merged = self.clone();
        for (name, settings) in &other.0 {
            merged.0.insert(name.clone(), settings.clone());
        }
        merged
    }

    /// JSON object form, as sent on the wire.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<String, Value>>(),
        )
    }
}

impl FromIterator<(String, Value)> for CapabilityMap {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// True for settings that carry no information: `null`, `{}` or `[]`.
fn is_empty_settings(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Prepares outgoing capability maps and parses the peer's.
pub struct CapabilityNegotiator;

impl CapabilityNegotiator {
    /// Local capability map to send: empty entries are dropped entirely.
    pub fn prepare(configured: &CapabilityMap) -> CapabilityMap {
        configured
            .0
            .iter()
            .filter(|(name, settings)| {
                let keep = !is_empty_settings(settings);
                if !keep {
                    debug!(capability = %name, "Omitting empty capability");
                }
                keep
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Peer capability map from the handshake result.
    ///
    /// Empty objects are kept as-is (`{"tools": {}}` means "supports tools");
    /// only `null` fields and non-object payloads are discarded.
    pub fn parse_peer(value: &Value) -> CapabilityMap {
        match value {
            Value::Object(map) => map
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => CapabilityMap::default(),
        }
    }
}
