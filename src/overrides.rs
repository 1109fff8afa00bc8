//! Attribute override definitions for devices no built-in handler covers.
//!
//! Two matching levels: model definitions (`"model|manufacturer"` keys,
//! manufacturer wildcarded on fallback) and per-IEEE mappings. The generic
//! fallback handler consults these to turn opaque cluster attributes into
//! named, scaled state fields and discovery entities.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::ieee::Ieee;
use crate::storage::DataDir;

const OVERRIDES_FILE: &str = "device_overrides.json";

/// Metadata for known manufacturer-specific clusters.
#[derive(Debug, Clone, Copy)]
pub struct ManufacturerProfile {
    pub name: &'static str,
    pub manufacturer_code: u16,
    pub requires_mfr_code: bool,
}

pub fn manufacturer_profile(cluster_id: u16) -> Option<ManufacturerProfile> {
    let profile = match cluster_id {
        0xFCC0 => ManufacturerProfile { name: "Aqara Opple", manufacturer_code: 0x115F, requires_mfr_code: true },
        0xFCB7 => ManufacturerProfile { name: "Opple Extended", manufacturer_code: 0x115F, requires_mfr_code: true },
        0xEF00 => ManufacturerProfile { name: "Tuya Private", manufacturer_code: 0x1002, requires_mfr_code: false },
        0xE001 => ManufacturerProfile { name: "Tuya Private 2", manufacturer_code: 0x1002, requires_mfr_code: false },
        0xFC00 => ManufacturerProfile { name: "Philips Private", manufacturer_code: 0x100B, requires_mfr_code: true },
        0xFC03 => ManufacturerProfile { name: "Philips Private 2", manufacturer_code: 0x100B, requires_mfr_code: true },
        0xFC7C => ManufacturerProfile { name: "IKEA Private", manufacturer_code: 0x117C, requires_mfr_code: true },
        0xFC01 => ManufacturerProfile { name: "Schneider/Legrand Private", manufacturer_code: 0x105E, requires_mfr_code: true },
        0xFC11 => ManufacturerProfile { name: "Sonoff Private", manufacturer_code: 0x1286, requires_mfr_code: true },
        _ => return None,
    };
    Some(profile)
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AttributeMapping {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterDefinition {
    /// `"0xABCD"` attribute id -> mapping.
    #[serde(default)]
    pub attributes: HashMap<String, AttributeMapping>,
    /// `"0xAB"` command id -> mapping.
    #[serde(default)]
    pub commands: HashMap<String, AttributeMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelDefinition {
    /// `"0xABCD"` cluster id -> definition.
    #[serde(default)]
    pub clusters: HashMap<String, ClusterDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IeeeOverride {
    /// `cluster_xxxx_attr_yyyy` raw key -> mapping.
    #[serde(default)]
    pub cluster_mappings: HashMap<String, AttributeMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct OverridesFile {
    #[serde(default)]
    definitions: HashMap<String, ModelDefinition>,
    #[serde(default)]
    ieee_overrides: HashMap<String, IeeeOverride>,
}

#[derive(Debug)]
pub struct OverrideManager {
    data: DataDir,
    inner: RwLock<OverridesFile>,
}

pub fn raw_attr_key(cluster_id: u16, attr_id: u16) -> String {
    format!("cluster_{cluster_id:04x}_attr_{attr_id:04x}")
}

impl OverrideManager {
    pub fn load(data: DataDir) -> Self {
        let file: OverridesFile = data.load_json(OVERRIDES_FILE);
        if !file.definitions.is_empty() || !file.ieee_overrides.is_empty() {
            tracing::info!(
                "Loaded {} model definitions, {} IEEE overrides",
                file.definitions.len(),
                file.ieee_overrides.len()
            );
        }
        Self { data, inner: RwLock::new(file) }
    }

    fn save(&self, file: &OverridesFile) {
        self.data.save_json(OVERRIDES_FILE, file);
    }

    fn make_key(model: &str, manufacturer: &str) -> String {
        format!("{}|{}", model.trim(), manufacturer.trim())
    }

    pub fn definition(&self, model: &str, manufacturer: &str) -> Option<ModelDefinition> {
        let inner = self.inner.read().expect("overrides lock");
        if let Some(defn) = inner.definitions.get(&Self::make_key(model, manufacturer)) {
            return Some(defn.clone());
        }
        // Manufacturer wildcard fallback.
        inner
            .definitions
            .iter()
            .find(|(k, _)| k.split('|').next() == Some(model.trim()))
            .map(|(_, v)| v.clone())
    }

    /// IEEE-level mapping wins over model-level.
    pub fn attribute_mapping(
        &self,
        ieee: &Ieee,
        model: &str,
        manufacturer: &str,
        cluster_id: u16,
        attr_id: u16,
    ) -> Option<AttributeMapping> {
        let raw_key = raw_attr_key(cluster_id, attr_id);
        {
            let inner = self.inner.read().expect("overrides lock");
            if let Some(ovr) = inner.ieee_overrides.get(ieee.as_str()) {
                if let Some(mapping) = ovr.cluster_mappings.get(&raw_key) {
                    return Some(mapping.clone());
                }
            }
        }
        self.definition(model, manufacturer).and_then(|defn| {
            defn.clusters
                .get(&format!("0x{cluster_id:04X}"))
                .and_then(|c| c.attributes.get(&format!("0x{attr_id:04X}")).cloned())
        })
    }

    pub fn command_mapping(
        &self,
        model: &str,
        manufacturer: &str,
        cluster_id: u16,
        command_id: u8,
    ) -> Option<AttributeMapping> {
        self.definition(model, manufacturer).and_then(|defn| {
            defn.clusters
                .get(&format!("0x{cluster_id:04X}"))
                .and_then(|c| c.commands.get(&format!("0x{command_id:02X}")).cloned())
        })
    }

    pub fn add_definition(&self, model: &str, manufacturer: &str, definition: ModelDefinition) {
        let mut inner = self.inner.write().expect("overrides lock");
        inner.definitions.insert(Self::make_key(model, manufacturer), definition);
        self.save(&inner);
    }

    pub fn remove_definition(&self, model: &str, manufacturer: &str) -> bool {
        let mut inner = self.inner.write().expect("overrides lock");
        let removed = inner.definitions.remove(&Self::make_key(model, manufacturer)).is_some();
        if removed {
            self.save(&inner);
        }
        removed
    }

    pub fn set_ieee_mapping(&self, ieee: &Ieee, raw_key: &str, mapping: AttributeMapping) {
        let mut inner = self.inner.write().expect("overrides lock");
        inner
            .ieee_overrides
            .entry(ieee.to_string())
            .or_default()
            .cluster_mappings
            .insert(raw_key.to_string(), mapping);
        self.save(&inner);
    }

    pub fn remove_ieee_mapping(&self, ieee: &Ieee, raw_key: &str) -> bool {
        let mut inner = self.inner.write().expect("overrides lock");
        let mut removed = false;
        if let Some(ovr) = inner.ieee_overrides.get_mut(ieee.as_str()) {
            removed = ovr.cluster_mappings.remove(raw_key).is_some();
            if ovr.cluster_mappings.is_empty() {
                inner.ieee_overrides.remove(ieee.as_str());
            }
        }
        if removed {
            self.save(&inner);
        }
        removed
    }
}
