//! Persisted runtime settings.
//!
//! A flat typed key-value store (string / integer / boolean) backed by a
//! JSON file. Absent keys receive their defaults on first start. Values are
//! edited remotely over HTTP; whoever writes is responsible for announcing
//! [`crate::events::BusEvent::SettingsChanged`].

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::RwLock;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

pub mod keys {
    pub const MQTT_ENABLED: &str = "mqttEnabled";
    pub const MQTT_BROKER: &str = "mqttBroker";
    pub const MQTT_PORT: &str = "mqttPort";
    pub const MQTT_USERNAME: &str = "mqttUsername";
    pub const MQTT_PASSWORD: &str = "mqttPassword";
    pub const MQTT_CLIENT_ID: &str = "mqttDeviceId";

    pub const AUTOMATIC_BRIGHTNESS: &str = "automaticBrightness";
    pub const BRIGHTNESS: &str = "brightness";
    pub const MIN_BRIGHTNESS: &str = "minBrightness";

    pub const SCREEN_SAVER_ENABLED: &str = "screenSaver";
    pub const SCREEN_SAVER_DELAY: &str = "screenSaverDelay";
    pub const SCREEN_SAVER_MIN_BRIGHTNESS: &str = "screenSaverMinBrightness";
    pub const WAKE_ON_PROXIMITY: &str = "wakeOnProximity";

    pub const WATCHDOG_ENABLED: &str = "watchdogEnabled";
    pub const WATCHDOG_TARGET: &str = "watchdogTarget";
    pub const WATCHDOG_INTERVAL: &str = "watchdogInterval";

    pub const HTTP_SERVER_ENABLED: &str = "httpServer";
    pub const DEBUG_KEYS: &str = "debugKeys";
}

/// A single stored value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl From<bool> for SettingValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for SettingValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// Default value for every known key
pub fn defaults() -> Vec<(&'static str, SettingValue)> {
    vec![
        (keys::MQTT_ENABLED, false.into()),
        (keys::MQTT_BROKER, "".into()),
        (keys::MQTT_PORT, SettingValue::Int(1883)),
        (keys::MQTT_USERNAME, "".into()),
        (keys::MQTT_PASSWORD, "".into()),
        (keys::MQTT_CLIENT_ID, "".into()),
        (keys::AUTOMATIC_BRIGHTNESS, true.into()),
        (keys::BRIGHTNESS, SettingValue::Int(255)),
        (keys::MIN_BRIGHTNESS, SettingValue::Int(48)),
        (keys::SCREEN_SAVER_ENABLED, true.into()),
        (keys::SCREEN_SAVER_DELAY, SettingValue::Int(45)),
        (keys::SCREEN_SAVER_MIN_BRIGHTNESS, SettingValue::Int(10)),
        (keys::WAKE_ON_PROXIMITY, false.into()),
        (keys::WATCHDOG_ENABLED, false.into()),
        (keys::WATCHDOG_TARGET, "".into()),
        (keys::WATCHDOG_INTERVAL, SettingValue::Int(10)),
        (keys::HTTP_SERVER_ENABLED, true.into()),
        (keys::DEBUG_KEYS, false.into()),
    ]
}

fn default_for(key: &str) -> Option<SettingValue> {
    defaults()
        .into_iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to access settings file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to decode settings: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct SettingsStore {
    /// Backing file; `None` keeps everything in memory
    path: Option<PathBuf>,
    values: RwLock<BTreeMap<String, SettingValue>>,
}

impl SettingsStore {
    /// Open the store at `path`, creating it with defaults if absent
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let contents =
                std::fs::read_to_string(&path).map_err(|e| SettingsError::Io(path.clone(), e))?;
            if contents.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&contents)?
            }
        } else {
            BTreeMap::new()
        };

        let store = Self {
            path: Some(path),
            values: RwLock::new(values),
        };
        if store.apply_defaults() {
            store.persist()?;
        }
        Ok(store)
    }

    /// A store that is never written to disk
    pub fn in_memory() -> Self {
        let store = Self {
            path: None,
            values: RwLock::new(BTreeMap::new()),
        };
        store.apply_defaults();
        store
    }

    /// Insert defaults for missing keys, returning whether anything changed
    fn apply_defaults(&self) -> bool {
        let mut values = self.write();
        let mut changed = false;
        for (key, value) in defaults() {
            if !values.contains_key(key) {
                values.insert(key.to_string(), value);
                changed = true;
            }
        }
        changed
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, SettingValue>> {
        self.values.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, SettingValue>> {
        self.values.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, key: &str) -> Option<SettingValue> {
        self.read().get(key).cloned().or_else(|| default_for(key))
    }

    pub fn get_bool(&self, key: &str) -> bool {
        match self.lookup(key) {
            Some(SettingValue::Bool(v)) => v,
            other => {
                warn!("Setting {} is not a boolean: {:?}", key, other);
                matches!(default_for(key), Some(SettingValue::Bool(true)))
            }
        }
    }

    pub fn get_int(&self, key: &str) -> i64 {
        match self.lookup(key) {
            Some(SettingValue::Int(v)) => v,
            other => {
                warn!("Setting {} is not an integer: {:?}", key, other);
                match default_for(key) {
                    Some(SettingValue::Int(v)) => v,
                    _ => 0,
                }
            }
        }
    }

    pub fn get_string(&self, key: &str) -> String {
        match self.lookup(key) {
            Some(SettingValue::String(v)) => v,
            Some(other) => {
                warn!("Setting {} is not a string: {:?}", key, other);
                String::new()
            }
            None => String::new(),
        }
    }

    /// Snapshot of every stored value, sorted by key
    pub fn all(&self) -> BTreeMap<String, SettingValue> {
        self.read().clone()
    }

    pub fn set(&self, key: &str, value: impl Into<SettingValue>) -> Result<(), SettingsError> {
        self.write().insert(key.to_string(), value.into());
        self.persist()
    }

    /// Merge a batch of values and persist once
    pub fn update(&self, values: BTreeMap<String, SettingValue>) -> Result<(), SettingsError> {
        {
            let mut current = self.write();
            for (key, value) in values {
                debug!("Setting {} = {:?}", key, value);
                current.insert(key, value);
            }
        }
        self.persist()
    }

    fn persist(&self) -> Result<(), SettingsError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(&*self.read())?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SettingsError::Io(path.clone(), e))?;
        }
        std::fs::write(path, json).map_err(|e| SettingsError::Io(path.clone(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_applied() {
        let store = SettingsStore::in_memory();
        assert!(!store.get_bool(keys::MQTT_ENABLED));
        assert_eq!(store.get_int(keys::MQTT_PORT), 1883);
        assert_eq!(store.get_int(keys::MIN_BRIGHTNESS), 48);
        assert_eq!(store.get_string(keys::MQTT_BROKER), "");
        assert!(store.get_bool(keys::AUTOMATIC_BRIGHTNESS));
    }

    #[test]
    fn test_open_creates_file_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let store = SettingsStore::open(&path).unwrap();
        assert_eq!(store.get_int(keys::SCREEN_SAVER_DELAY), 45);

        let written: BTreeMap<String, SettingValue> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.get(keys::MQTT_PORT), Some(&SettingValue::Int(1883)));
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::open(&path).unwrap();
        store.set(keys::MQTT_BROKER, "tcp://broker.lan").unwrap();
        store.set(keys::MQTT_ENABLED, true).unwrap();
        drop(store);

        let store = SettingsStore::open(&path).unwrap();
        assert_eq!(store.get_string(keys::MQTT_BROKER), "tcp://broker.lan");
        assert!(store.get_bool(keys::MQTT_ENABLED));
    }

    #[test]
    fn test_existing_values_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"brightness": 100, "custom": "x"}"#).unwrap();

        let store = SettingsStore::open(&path).unwrap();
        assert_eq!(store.get_int(keys::BRIGHTNESS), 100);
        assert_eq!(store.get_string("custom"), "x");
        assert_eq!(store.get_int(keys::MIN_BRIGHTNESS), 48);
    }

    #[test]
    fn test_type_mismatch_falls_back_to_default() {
        let store = SettingsStore::in_memory();
        store.set(keys::MQTT_PORT, "not a number").unwrap();
        assert_eq!(store.get_int(keys::MQTT_PORT), 1883);
    }

    #[test]
    fn test_update_merges_batch() {
        let store = SettingsStore::in_memory();
        let mut batch = BTreeMap::new();
        batch.insert(keys::MQTT_USERNAME.to_string(), SettingValue::from("user"));
        batch.insert(keys::WAKE_ON_PROXIMITY.to_string(), SettingValue::from(true));
        store.update(batch).unwrap();

        assert_eq!(store.get_string(keys::MQTT_USERNAME), "user");
        assert!(store.get_bool(keys::WAKE_ON_PROXIMITY));
        assert!(store.all().contains_key(keys::DEBUG_KEYS));
    }
}
