//! Key-value configuration store.
//!
//! Settings and channel credentials live under dotted string keys
//! (`notifications.battery_low`, `email.smtp_host`, ...). Typed views such as
//! `EmailConfig::from_store` read from a [`ConfigStore`] rather than owning
//! their own persistence.

use std::path::Path;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info};

use super::events::{ConfigEventBroadcaster, ConfigUpdateEvent};
use crate::{Error, Result};

/// Environment prefix for configuration overrides.
pub const ENV_PREFIX: &str = "ROVER_ALERT__";

/// Key-value configuration collaborator.
pub trait ConfigStore: Send + Sync {
    /// Get the raw value of a key.
    fn get(&self, key: &str) -> Option<String>;

    /// Set a key.
    fn set(&self, key: &str, value: String);

    /// Remove a key, returning its previous value.
    fn remove(&self, key: &str) -> Option<String>;

    /// Keys starting with `prefix`, sorted.
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;
}

/// Typed accessors over any [`ConfigStore`].
pub trait ConfigStoreExt: ConfigStore {
    /// Non-empty trimmed string value.
    fn get_string(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        let Some(raw) = self.get_string(key) else {
            return Ok(None);
        };
        match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(Error::config(format!(
                "Invalid boolean for {}: {}",
                key, raw
            ))),
        }
    }

    fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        let Some(raw) = self.get_string(key) else {
            return Ok(None);
        };
        raw.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::config(format!("Invalid number for {}: {} ({})", key, raw, e)))
    }

    fn get_u16(&self, key: &str) -> Result<Option<u16>> {
        match self.get_u64(key)? {
            Some(v) => u16::try_from(v)
                .map(Some)
                .map_err(|_| Error::config(format!("Value for {} out of range: {}", key, v))),
            None => Ok(None),
        }
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        match self.get_u64(key)? {
            Some(v) => u32::try_from(v)
                .map(Some)
                .map_err(|_| Error::config(format!("Value for {} out of range: {}", key, v))),
            None => Ok(None),
        }
    }

    fn get_usize(&self, key: &str) -> Result<Option<usize>> {
        match self.get_u64(key)? {
            Some(v) => usize::try_from(v)
                .map(Some)
                .map_err(|_| Error::config(format!("Value for {} out of range: {}", key, v))),
            None => Ok(None),
        }
    }

    /// Milliseconds stored as an integer.
    fn get_duration_ms(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self.get_u64(key)?.map(Duration::from_millis))
    }

    /// Comma-separated list; empty entries are dropped.
    fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl<T: ConfigStore + ?Sized> ConfigStoreExt for T {}

/// In-memory [`ConfigStore`] that broadcasts every write.
#[derive(Default)]
pub struct MemoryConfigStore {
    values: DashMap<String, String>,
    events: ConfigEventBroadcaster,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from `(key, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new();
        for (k, v) in pairs {
            store.values.insert(k.into(), v.into());
        }
        store
    }

    /// Load a JSON document, flattening nested objects into dotted keys.
    pub fn load_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let store = Self::new();
        let count = store.merge_json_str(&raw)?;
        info!(path = %path.display(), keys = count, "Loaded configuration file");
        Ok(store)
    }

    /// Merge a JSON document into the store. Returns the number of keys written.
    pub fn merge_json_str(&self, raw: &str) -> Result<usize> {
        let value: Value = serde_json::from_str(raw)?;
        if !value.is_object() {
            return Err(Error::config("Configuration root must be a JSON object"));
        }

        let mut flat = Vec::new();
        flatten_json("", &value, &mut flat);
        let count = flat.len();
        for (k, v) in flat {
            self.values.insert(k, v);
        }
        self.events.publish(ConfigUpdateEvent::Reloaded);
        Ok(count)
    }

    /// Apply `ROVER_ALERT__SECTION__KEY=value` style overrides from the
    /// process environment. Returns the number of keys written.
    pub fn apply_env_overrides(&self) -> usize {
        self.apply_overrides(std::env::vars())
    }

    /// Apply overrides from an arbitrary `(name, value)` source.
    pub fn apply_overrides<I>(&self, vars: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut applied = 0;
        for (name, value) in vars {
            let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            let key = rest.to_ascii_lowercase().replace("__", ".");
            debug!(key = %key, "Applying configuration override from environment");
            self.set(&key, value);
            applied += 1;
        }
        applied
    }

    /// Subscribe to write notifications.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ConfigUpdateEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone())
    }

    fn set(&self, key: &str, value: String) {
        self.values.insert(key.to_string(), value);
        self.events.publish(ConfigUpdateEvent::KeyChanged {
            key: key.to_string(),
        });
    }

    fn remove(&self, key: &str) -> Option<String> {
        let removed = self.values.remove(key).map(|(_, v)| v);
        if removed.is_some() {
            self.events.publish(ConfigUpdateEvent::KeyRemoved {
                key: key.to_string(),
            });
        }
        removed
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .values
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }
}

fn flatten_json(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", prefix, k)
                };
                flatten_json(&key, v, out);
            }
        }
        Value::Array(items) => {
            let joined: Vec<String> = items.iter().map(alert_template::stringify).collect();
            out.push((prefix.to_string(), joined.join(",")));
        }
        Value::Null => {}
        scalar => out.push((prefix.to_string(), alert_template::stringify(scalar))),
    }
}
