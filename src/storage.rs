//! JSON persistence helpers for the `./data` directory.
//!
//! Every persisted file is plain JSON (zones are YAML, handled in zones.rs).
//! Load failures are logged and degrade to defaults; save failures are
//! logged and never propagate into the device path.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

/// Root for all persisted gateway state.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if let Err(e) = std::fs::create_dir_all(&root) {
            tracing::warn!("Could not create data dir {:?}: {}", root, e);
        }
        Self { root }
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    /// Load a JSON file, returning `T::default()` when absent or unreadable.
    pub fn load_json<T: DeserializeOwned + Default>(&self, file: &str) -> T {
        load_json(&self.path(file))
    }

    pub fn save_json<T: Serialize>(&self, file: &str, data: &T) {
        save_json(&self.path(file), data);
    }
}

pub fn load_json<T: DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Failed to parse {:?}: {} — using defaults", path, e);
                T::default()
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read {:?}: {} — using defaults", path, e);
            T::default()
        }
    }
}

pub fn save_json<T: Serialize>(path: &Path, data: &T) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let payload = match serde_json::to_string_pretty(data) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("Failed to serialise {:?}: {}", path, e);
            return;
        }
    };
    if let Err(e) = std::fs::write(path, payload) {
        tracing::error!("Failed to save {:?}: {}", path, e);
    }
}

/// Replace values that cannot be represented on the wire with an error stub
/// instead of failing the whole payload. Non-finite floats are the one JSON
/// landmine a sensor can produce.
pub fn sanitise_value(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return json!({"error": "serialization_failed", "type": "non_finite_float"});
                }
            }
            Value::Number(n)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sanitise_value).collect()),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k, sanitise_value(v));
            }
            Value::Object(out)
        }
        other => other,
    }
}

/// Sanitise a whole state map for publication.
pub fn sanitise_state(state: &Map<String, Value>) -> Map<String, Value> {
    state
        .iter()
        .map(|(k, v)| (k.clone(), sanitise_value(v.clone())))
        .collect()
}
