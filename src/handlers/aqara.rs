//! Aqara/Xiaomi handlers: the manufacturer cluster (0xFCC0, reads gated
//! by the Xiaomi manufacturer code) and Multistate Input button events.

use serde_json::{json, Value};

use super::{
    value_to_f64, value_to_u64, ClusterHandler, DiscoveryEntity, HandlerContext, PollAttribute,
    StateDelta,
};

// ── Aqara manufacturer cluster (0xFCC0) ─────────────────

// A handful of plainly-typed attributes; the 0x00F7 struct blob is left
// to the vendor stack.
const ATTR_CHIP_TEMPERATURE: u16 = 0x0003;
const ATTR_POWER_OUTAGE_COUNT: u16 = 0x0002;
const ATTR_DETECTION_INTERVAL: u16 = 0x0102;

pub struct AqaraHandler {
    ctx: HandlerContext,
}

impl AqaraHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for AqaraHandler {
    fn name(&self) -> &'static str {
        "aqara"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn configurable(&self) -> bool {
        // Manufacturer cluster: no standard binding, reads need the
        // manufacturer code which the driver applies from the profile.
        false
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        match attr_id {
            ATTR_CHIP_TEMPERATURE => {
                if let Some(raw) = value_to_f64(value) {
                    delta.insert("device_temperature".into(), json!(raw));
                }
            }
            ATTR_POWER_OUTAGE_COUNT => {
                if let Some(raw) = value_to_u64(value) {
                    delta.insert("power_outage_count_raw".into(), json!(raw));
                }
            }
            ATTR_DETECTION_INTERVAL => {
                if let Some(raw) = value_to_u64(value) {
                    delta.insert("motion_timeout".into(), json!(raw));
                }
            }
            _ => {
                delta.insert(format!("aqara_0x{attr_id:04x}_raw"), value.clone());
            }
        }
    }

    fn pollable_attributes(&self) -> Vec<PollAttribute> {
        vec![PollAttribute { attr: ATTR_CHIP_TEMPERATURE, name: "device_temperature".into() }]
    }
}

// ── Multistate Input (0x0012) ───────────────────────────

const ATTR_PRESENT_VALUE: u16 = 0x0055;

fn action_name(v: u64) -> String {
    match v {
        0 => "hold".to_string(),
        1 => "single".to_string(),
        2 => "double".to_string(),
        3 => "triple".to_string(),
        4 => "quadruple".to_string(),
        16 => "hold".to_string(),
        17 => "release".to_string(),
        18 => "shake".to_string(),
        255 => "release".to_string(),
        other => format!("action_{other}"),
    }
}

pub struct MultistateInputHandler {
    ctx: HandlerContext,
}

impl MultistateInputHandler {
    pub fn create(ctx: HandlerContext) -> Box<dyn ClusterHandler> {
        Box::new(Self { ctx })
    }
}

impl ClusterHandler for MultistateInputHandler {
    fn name(&self) -> &'static str {
        "multistate_input"
    }

    fn cluster_id(&self) -> u16 {
        self.ctx.cluster
    }

    fn attribute_updated(&self, attr_id: u16, value: &Value, delta: &mut StateDelta) {
        if attr_id == ATTR_PRESENT_VALUE {
            if let Some(raw) = value_to_u64(value) {
                delta.insert("multistate_value".into(), json!(raw));
                // Button presses are edge events; `action` is on the
                // always-report list so repeats still propagate.
                delta.insert("action".into(), json!(action_name(raw)));
            }
        }
    }

    fn discovery(&self) -> Vec<DiscoveryEntity> {
        vec![DiscoveryEntity {
            component: "sensor",
            object_id: "action".into(),
            config: json!({
                "name": "Action",
                "value_template": "{{ value_json.action }}",
                "icon": "mdi:gesture-double-tap",
            }),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::cluster_id as cid;
    use crate::handlers::test_context;

    #[test]
    fn button_press_maps_to_action() {
        let handler = MultistateInputHandler::create(test_context(cid::MULTISTATE_INPUT));
        let mut delta = StateDelta::new();
        handler.attribute_updated(ATTR_PRESENT_VALUE, &json!(2), &mut delta);
        assert_eq!(delta["action"], json!("double"));
        assert_eq!(delta["multistate_value"], json!(2));
    }

    #[test]
    fn unknown_aqara_attr_stays_internal() {
        let handler = AqaraHandler::create(test_context(cid::AQARA_MANUFACTURER));
        let mut delta = StateDelta::new();
        handler.attribute_updated(0x0144, &json!(3), &mut delta);
        // The _raw suffix keeps it out of MQTT payloads.
        assert!(delta.contains_key("aqara_0x0144_raw"));
    }
}
