//! Fallback handler for clusters nothing else claims.
//!
//! With an override definition (model-level or per-IEEE) attributes map
//! to named, scaled fields and contribute discovery entities. Without
//! one, values land under opaque `cluster_XXXX_attr_YYYY` keys that stay
//! out of MQTT payloads.

use serde_json::{json, Value};

use super::{
    round2, value_to_f64, ClusterHandler, DiscoveryEntity, HandlerContext, StateDelta,
};
use crate::overrides::{manufacturer_profile, raw_attr_key};

pub struct GenericHandler {
    ctx: HandlerContext,
}

impl GenericHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }

    fn is_manufacturer_cluster(&self) -> bool {
        self.ctx.cluster >= 0xFC00 || manufacturer_profile(self.ctx.cluster).is_some()
    }
}

impl ClusterHandler for GenericHandler {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn configurable(&self) -> bool {
        !self.is_manufacturer_cluster()
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        let mapping = self.ctx.overrides.as_ref().and_then(|ovr| {
            ovr.attribute_mapping(
                &self.ctx.ieee,
                self.ctx.model.as_deref().unwrap_or_default(),
                self.ctx.manufacturer.as_deref().unwrap_or_default(),
                self.ctx.cluster,
                attr_id,
            )
        });

        if let Some(mapping) = mapping {
            let scaled = match (mapping.scale, value_to_f64(value)) {
                (Some(scale), Some(raw)) if scale != 1.0 => json!(round2(raw / scale)),
                _ => value.clone(),
            };
            tracing::info!(
                "[{}] Generic (mapped): 0x{:04X}/0x{:04X} -> {} = {}",
                self.ctx.ieee,
                self.ctx.cluster,
                attr_id,
                mapping.name,
                scaled
            );
            delta.insert(mapping.name, scaled);
            return;
        }

        // Manufacturer-aware prefix for known ecosystems, opaque key
        // otherwise. Neither reaches MQTT.
        let key = match manufacturer_profile(self.ctx.cluster) {
            Some(profile) => format!(
                "{}_0x{attr_id:04x}",
                profile.name.to_lowercase().replace(' ', "_")
            ),
            None => raw_attr_key(self.ctx.cluster, attr_id),
        };
        delta.insert(key, value.clone());
    }

    fn cluster_command(&self, _tsn: u8, command_id: u8, _payload: &[u8], delta: &mut StateDelta) {
        let mapping = self.ctx.overrides.as_ref().and_then(|ovr| {
            ovr.command_mapping(
                self.ctx.model.as_deref().unwrap_or_default(),
                self.ctx.manufacturer.as_deref().unwrap_or_default(),
                self.ctx.cluster,
                command_id,
            )
        });
        let key = match mapping {
            Some(mapping) => mapping.name,
            None => format!("cluster_{:04x}_cmd_{:02x}", self.ctx.cluster, command_id),
        };
        delta.insert(key, json!(true));
    }

    fn discovery(&self) -> Vec<DiscoveryEntity> {
        let Some(overrides) = self.ctx.overrides.as_ref() else { return Vec::new() };
        let Some(defn) = overrides.definition(
            self.ctx.model.as_deref().unwrap_or_default(),
            self.ctx.manufacturer.as_deref().unwrap_or_default(),
        ) else {
            return Vec::new();
        };

        let cluster_key = format!("0x{:04X}", self.ctx.cluster);
        let Some(cluster_def) = defn.clusters.get(&cluster_key) else { return Vec::new() };

        cluster_def
            .attributes
            .values()
            .map(|attr| {
                let mut config = json!({
                    "name": attr.name.replace('_', " "),
                    "value_template": format!("{{{{ value_json.{} }}}}", attr.name),
                    "state_class": "measurement",
                });
                if let Some(device_class) = &attr.device_class {
                    config["device_class"] = json!(device_class);
                }
                if let Some(unit) = &attr.unit {
                    config["unit_of_measurement"] = json!(unit);
                }
                DiscoveryEntity { component: "sensor", object_id: attr.name.clone(), config }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::handlers::test_context;
    use crate::overrides::{AttributeMapping, OverrideManager};
    use crate::storage::DataDir;

    #[test]
    fn unmapped_attribute_gets_opaque_key() {
        let handler = GenericHandler::create(test_context(0x0B06));
        let mut delta = StateDelta::new();
        handler.attribute_updated(0x0001, &json!(42), &mut delta);
        assert_eq!(delta["cluster_0b06_attr_0001"], json!(42));
    }

    #[test]
    fn manufacturer_cluster_uses_profile_prefix() {
        let handler = GenericHandler::create(test_context(0xFC00));
        let mut delta = StateDelta::new();
        handler.attribute_updated(0x0031, &json!(1), &mut delta);
        assert_eq!(delta["philips_private_0x0031"], json!(1));
        assert!(!handler.configurable());
    }

    #[test]
    fn override_mapping_renames_and_scales() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = Arc::new(OverrideManager::load(DataDir::new(dir.path())));
        let mut ctx = test_context(0x0408);
        overrides.set_ieee_mapping(
            &ctx.ieee,
            &raw_attr_key(0x0408, 0x0000),
            AttributeMapping { name: "soil_moisture".into(), scale: Some(100.0), ..Default::default() },
        );
        ctx.overrides = Some(overrides);

        let handler = GenericHandler::create(ctx);
        let mut delta = StateDelta::new();
        handler.attribute_updated(0x0000, &json!(4250), &mut delta);
        assert_eq!(delta["soil_moisture"], json!(42.5));
    }
}
