//! Cached attribute state and state-update events
//!
//! Each device carries a [`StateMap`]: the last known value of every
//! logical attribute. Decoded responses and reports merge into it; it is
//! only dropped together with the device.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::device::DeviceId;

/// Mapping from attribute name to last known value
///
/// Merging is monotonic: incoming keys overwrite, absent keys are
/// preserved. The map is never cleared during normal operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateMap(HashMap<String, Value>);

impl StateMap {
    /// Create an empty state map
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge another map into this one (incoming keys win)
    pub fn merge(&mut self, other: StateMap) {
        self.0.extend(other.0);
    }

    /// Look up an attribute value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Set one attribute value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Whether any attribute is present
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over attribute entries
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Attribute names present in the map
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl From<HashMap<String, Value>> for StateMap {
    fn from(map: HashMap<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for StateMap {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for StateMap {
    type Item = (String, Value);
    type IntoIter = std::collections::hash_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// State delta pushed to the accessory layer for an unsolicited report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateUpdate {
    /// Device the delta belongs to
    pub device: DeviceId,
    /// Attributes that changed, already merged into the cache
    pub delta: StateMap,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_overwrites_and_preserves() {
        let mut state = StateMap::new();
        state.insert("state", "ON");
        state.insert("brightness", 120);

        let mut delta = StateMap::new();
        delta.insert("brightness", 254);
        delta.insert("color_temp", 370);

        state.merge(delta);

        assert_eq!(state.get("state"), Some(&json!("ON")));
        assert_eq!(state.get("brightness"), Some(&json!(254)));
        assert_eq!(state.get("color_temp"), Some(&json!(370)));
        assert_eq!(state.len(), 3);
    }

    #[test]
    fn test_from_iterator() {
        let state: StateMap = [("state".to_string(), json!("OFF"))].into_iter().collect();
        assert_eq!(state.get("state"), Some(&json!("OFF")));
    }

    #[test]
    fn test_serde_transparent() {
        let mut state = StateMap::new();
        state.insert("humidity", 55.5);

        let text = serde_json::to_string(&state).unwrap();
        assert_eq!(text, r#"{"humidity":55.5}"#);

        let back: StateMap = serde_json::from_str(&text).unwrap();
        assert_eq!(back, state);
    }
}
