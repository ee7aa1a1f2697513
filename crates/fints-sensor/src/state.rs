//! Sensor state store
//!
//! Holds the latest state of every sensor, keyed by entity id.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// State value of a sensor whose last update failed
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// Entity domain of all sensors
pub const SENSOR_DOMAIN: &str = "sensor";

/// State of a sensor at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorState {
    pub entity_id: String,
    /// Native value as a string, or `unavailable`
    pub state: String,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
    /// When the value last changed
    pub last_changed: DateTime<Utc>,
    /// When the value was last written, changed or not
    pub last_updated: DateTime<Utc>,
}

impl SensorState {
    pub fn is_available(&self) -> bool {
        self.state != STATE_UNAVAILABLE
    }
}

/// Slugify a name for use in an entity id
pub fn slugify(name: &str) -> String {
    let mut result = String::new();
    for c in name.chars() {
        if c.is_alphanumeric() {
            result.extend(c.to_lowercase());
        } else if !result.is_empty() && !result.ends_with('_') {
            result.push('_');
        }
    }
    let slug = result.trim_end_matches('_');
    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug.to_string()
    }
}

/// Latest states of all sensors
#[derive(Debug, Default)]
pub struct StateStore {
    states: DashMap<String, SensorState>,
    /// Entity ids handed out, including ones without a state yet
    reserved: DashMap<String, ()>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an entity id for a sensor name
    ///
    /// Returns `sensor.<slug>`, or `sensor.<slug>_2`, `_3`, ... when taken.
    pub fn register(&self, name: &str) -> String {
        let preferred = format!("{}.{}", SENSOR_DOMAIN, slugify(name));
        let mut candidate = preferred.clone();
        let mut tries = 1;
        loop {
            match self.reserved.entry(candidate.clone()) {
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(());
                    debug!(entity_id = %candidate, "Registered sensor");
                    return candidate;
                }
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    tries += 1;
                    candidate = format!("{}_{}", preferred, tries);
                }
            }
        }
    }

    /// Write a state, keeping `last_changed` if the value is unchanged
    #[instrument(skip(self, state, attributes))]
    pub fn set(
        &self,
        entity_id: &str,
        state: impl Into<String>,
        attributes: HashMap<String, serde_json::Value>,
    ) -> SensorState {
        let now = Utc::now();
        let state = state.into();
        let last_changed = match self.states.get(entity_id) {
            Some(old) if old.state == state => old.last_changed,
            _ => now,
        };

        let new_state = SensorState {
            entity_id: entity_id.to_string(),
            state,
            attributes,
            last_changed,
            last_updated: now,
        };
        self.reserved.insert(entity_id.to_string(), ());
        self.states.insert(entity_id.to_string(), new_state.clone());
        new_state
    }

    pub fn get(&self, entity_id: &str) -> Option<SensorState> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    /// State value, or None if the sensor has none
    pub fn get_state(&self, entity_id: &str) -> Option<String> {
        self.states.get(entity_id).map(|s| s.state.clone())
    }

    /// Drop a sensor's state and release its entity id
    pub fn remove(&self, entity_id: &str) -> Option<SensorState> {
        self.reserved.remove(entity_id);
        self.states.remove(entity_id).map(|(_, s)| s)
    }

    pub fn entity_ids(&self) -> Vec<String> {
        self.reserved.iter().map(|r| r.key().clone()).collect()
    }

    pub fn all(&self) -> Vec<SensorState> {
        self.states.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Sparkasse - DE02 1203"), "sparkasse_de02_1203");
        assert_eq!(slugify("Depot Größe"), "depot_größe");
        assert_eq!(slugify("  --  "), "unnamed");
    }

    #[test]
    fn test_register_adds_suffix_on_collision() {
        let store = StateStore::new();

        assert_eq!(store.register("Giro"), "sensor.giro");
        assert_eq!(store.register("Giro"), "sensor.giro_2");
        assert_eq!(store.register("giro"), "sensor.giro_3");
    }

    #[test]
    fn test_remove_releases_entity_id() {
        let store = StateStore::new();
        let id = store.register("Giro");
        store.set(&id, "1.00", HashMap::new());

        assert!(store.remove(&id).is_some());
        assert!(store.is_empty());
        assert_eq!(store.register("Giro"), "sensor.giro");
    }

    #[test]
    fn test_last_changed_kept_for_same_value() {
        let store = StateStore::new();
        let first = store.set("sensor.giro", "10.00", HashMap::new());
        let attrs = HashMap::from([("account".to_string(), json!("DE02"))]);
        let second = store.set("sensor.giro", "10.00", attrs.clone());

        assert_eq!(second.last_changed, first.last_changed);
        assert!(second.last_updated >= first.last_updated);
        assert_eq!(second.attributes, attrs);

        let third = store.set("sensor.giro", STATE_UNAVAILABLE, HashMap::new());
        assert!(!third.is_available());
        assert!(third.last_changed >= second.last_updated);
    }
}
